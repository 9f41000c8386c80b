use cd_common::model::EventRecord;

/// The durable append-only log (the events table, spec §3/§4.5). Writes are
/// best-effort async: a slow or failing sink must never block fan-out to
/// live subscribers.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, record: EventRecord) -> cd_common::Result<()>;
}

/// Used by tests and by callers that only care about fan-out.
#[derive(Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl LogSink for NullSink {
    async fn append(&self, _record: EventRecord) -> cd_common::Result<()> {
        Ok(())
    }
}

/// Records every append in order, for assertions in tests (spec §8 S5:
/// "persistent log contains all 1000").
#[derive(Default)]
pub struct RecordingSink {
    records: tokio::sync::Mutex<Vec<EventRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<EventRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl LogSink for RecordingSink {
    async fn append(&self, record: EventRecord) -> cd_common::Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}
