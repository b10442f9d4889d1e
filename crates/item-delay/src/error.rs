use thiserror::Error;

/// Errors produced while parsing an update interval or computing a check time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelayError {
    #[error("Invalid update interval: empty value")]
    Empty,

    #[error("Invalid update interval \"{0}\"")]
    InvalidDuration(String),

    #[error("Invalid update interval \"{0}\": must not exceed one day")]
    TooLong(String),

    #[error("Invalid flexible interval \"{0}\"")]
    InvalidFlexible(String),

    #[error("Invalid interval \"{0}\": scheduling intervals are not supported")]
    SchedulingUnsupported(String),

    #[error("Invalid update interval: delay is zero and no flexible interval is set")]
    ZeroDelay,

    #[error("Cannot compute next check: no active update interval")]
    NoActiveInterval,
}
