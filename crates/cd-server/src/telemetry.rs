//! A `tracing_subscriber::Layer` that turns `tracing` events emitted from
//! inside a `#[instrument(fields(deployment_id = ...))]` /
//! `#[instrument(fields(build_id = ...))]` span into `EventRecord`s on the
//! Event Broker -- the same aspect-oriented idea as the teacher's
//! `DeployLayer`/`LogRecorder` pair in `deployer/src/deployment/deploy_layer.rs`,
//! adapted to this workspace's two resource kinds instead of one `State` enum.
//!
//! `Layer::on_event` is synchronous, so it never calls `EventBroker::publish`
//! directly; it hands the captured log off through an unbounded channel to
//! a spawned task, exactly as `Persistence::from_pool` moves `Log`s from a
//! non-async thread onto an async one.

use cd_broker::EventBroker;
use cd_common::model::{EventKind, ResourceType, Severity};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct BrokerLog {
    pub resource_type: ResourceType,
    pub resource_ref: ulid::Ulid,
    pub severity: Severity,
    pub fields: Value,
}

pub struct BrokerLayer {
    sender: UnboundedSender<BrokerLog>,
}

impl BrokerLayer {
    /// Spawns the consumer task and returns the layer to register. The
    /// returned `JoinHandle` is not awaited by callers; it lives for the
    /// process's lifetime, same as `EventBroker::spawn_heartbeat`.
    pub fn new(broker: EventBroker) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BrokerLog>();
        tokio::spawn(async move {
            while let Some(log) = receiver.recv().await {
                broker
                    .publish(
                        log.resource_type,
                        log.resource_ref,
                        EventKind::Log,
                        log.severity,
                        log.fields,
                    )
                    .await;
            }
        });
        Self { sender }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResourceScope {
    resource_type: ResourceType,
    resource_ref: ulid::Ulid,
}

impl<S> Layer<S> for BrokerLayer
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = ResourceVisitor::default();
        attrs.record(&mut visitor);
        if let Some(scope) = visitor.into_scope() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(scope);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };

        for span in scope.from_root() {
            let extensions = span.extensions();
            let Some(resource) = extensions.get::<ResourceScope>() else {
                continue;
            };

            let mut visitor = JsonVisitor::default();
            event.record(&mut visitor);

            let _ = self.sender.send(BrokerLog {
                resource_type: resource.resource_type,
                resource_ref: resource.resource_ref,
                severity: severity_from(event.metadata().level()),
                fields: Value::Object(visitor.0),
            });
            return;
        }
    }
}

fn severity_from(level: &tracing::Level) -> Severity {
    match *level {
        tracing::Level::ERROR => Severity::Critical,
        tracing::Level::WARN => Severity::Warning,
        tracing::Level::INFO => Severity::Info,
        tracing::Level::DEBUG | tracing::Level::TRACE => Severity::Debug,
    }
}

#[derive(Default)]
struct ResourceVisitor {
    deployment_id: Option<String>,
    build_id: Option<String>,
}

impl ResourceVisitor {
    fn into_scope(self) -> Option<ResourceScope> {
        if let Some(raw) = self.deployment_id {
            return Some(ResourceScope {
                resource_type: ResourceType::Deployment,
                resource_ref: raw.parse().ok()?,
            });
        }
        if let Some(raw) = self.build_id {
            return Some(ResourceScope {
                resource_type: ResourceType::Build,
                resource_ref: raw.parse().ok()?,
            });
        }
        None
    }
}

impl Visit for ResourceVisitor {
    // `#[instrument(fields(deployment_id = %msg.deployment_id))]` records
    // through `record_debug` (tracing wraps `%`-prefixed values in a
    // Debug-via-Display adapter), so that is the path that matters here;
    // `record_str` is kept for callers that pass a plain string field.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "deployment_id" => self.deployment_id = Some(rendered),
            "build_id" => self.build_id = Some(rendered),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "deployment_id" => self.deployment_id = Some(value.to_string()),
            "build_id" => self.build_id = Some(value.to_string()),
            _ => {}
        }
    }
}

#[derive(Default)]
struct JsonVisitor(serde_json::Map<String, Value>);

impl Visit for JsonVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }
}
