pub mod types;
pub mod worker;

pub use types::{DeviceEvent, DeviceEventKind, QueueMetrics, Request};
pub use worker::{QueueBuilder, QueueHandle};
