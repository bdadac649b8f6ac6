pub mod forwarder;
pub mod queue;
pub mod types;

pub use forwarder::{ClusterForwarder, ClusterTransport, LoopbackTransport, MqttTransport};
pub use queue::{AlertEvent, AlertQueue};
pub use types::{
    Confidence, CorrelationType, Insight, MetricSnapshot, Notification, NotificationBuilder,
    NotificationEntry, NotificationStatus, Severity, WatcherFindings,
};
