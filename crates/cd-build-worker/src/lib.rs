pub mod builder;
pub mod framework;
pub mod message;
pub mod scratch;
pub mod source;
pub mod worker;

pub use message::BuildTriggered;
pub use worker::{BuildOutcome, BuildWorker, BuildWorkerConfig};
