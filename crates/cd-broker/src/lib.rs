pub mod broker;
pub mod sink;
pub mod subscriber;

pub use broker::{EventBroker, ResourceKey};
pub use sink::{LogSink, NullSink, RecordingSink};
pub use subscriber::{Subscriber, SubscriberHandle};
