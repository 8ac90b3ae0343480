use thiserror::Error;

/// Sensor queue failures surfaced to producers and the worker
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue has been shut down")]
    Shutdown,

    #[error("timed out waiting for queue space")]
    TimedOut,
}

/// Factor graph smoother failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmootherError {
    #[error("smoother has not been initialized with a prior")]
    NotInitialized,

    #[error("smoother is already initialized")]
    AlreadyInitialized,

    #[error("epoch timestamp {next} does not follow previous epoch {previous}")]
    NonMonotonicEpoch { previous: f64, next: f64 },

    #[error("preintegration window [{start}, {end}] does not match epoch window [{expected_start}, {expected_end}]")]
    WindowMismatch {
        start: f64,
        end: f64,
        expected_start: f64,
        expected_end: f64,
    },

    #[error("invalid covariance for {0}")]
    InvalidCovariance(&'static str),

    #[error("normal equations are singular")]
    Singular,

    #[error("solution diverged: {0}")]
    Diverged(String),
}

/// Top-level estimator errors
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("smoother error: {0}")]
    Smoother(#[from] SmootherError),

    #[error("failed to spawn fusion worker: {0}")]
    Spawn(std::io::Error),

    #[error("fusion worker panicked")]
    WorkerPanicked,
}

impl SmootherError {
    /// Failures caused by the epoch's own data; resubmitting the same window fails again
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            SmootherError::InvalidCovariance(_) | SmootherError::Singular | SmootherError::Diverged(_)
        )
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
pub type SmootherResult<T> = Result<T, SmootherError>;
pub type EstimatorResult<T> = Result<T, EstimatorError>;
