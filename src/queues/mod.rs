//! Per-stream sensor queues and the ordered merge the fusion worker reads from.

pub mod blocking;
pub mod merge;

pub use blocking::{BlockingQueue, Wakeup};
pub use merge::{QueueDepths, SensorMerger, SensorQueues, Timestamped};
