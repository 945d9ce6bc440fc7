pub mod detector;
pub mod monitor;
pub mod publisher;
pub mod types;

pub use detector::InterruptionDetector;
pub use monitor::DimmerMonitor;
pub use publisher::{CommandPublisher, PublisherConfig};
pub use types::{DimmerState, DimmerTopics, InterruptionEvent, InterruptionReason, MqttConnectionState};
