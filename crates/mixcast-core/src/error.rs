// crates/mixcast-core/src/error.rs
//
// The public error taxonomy. Setup paths return MixError directly; once a
// stream is running, fatal conditions reach the user exactly once as a
// Stop { code, msg } signal instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MixError {
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    #[error("unusable endpoint: {0}")]
    BadPath(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("stream rejected: {0}")]
    InvalidStream(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("encoder failure: {0}")]
    EncodeError(String),

    #[error("gpu allocation failed: {0}")]
    OutOfResources(String),

    #[error("stage surface is already mapped")]
    MappingBusy,
}

/// Result code carried by the `Stop` output signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCode {
    Success,
    BadPath,
    ConnectFailed,
    InvalidStream,
    Disconnected,
    NoSpace,
    EncodeError,
}

impl From<&MixError> for StopCode {
    fn from(err: &MixError) -> Self {
        match err {
            MixError::BadPath(_) => StopCode::BadPath,
            MixError::ConnectFailed(_) => StopCode::ConnectFailed,
            MixError::InvalidStream(_) => StopCode::InvalidStream,
            MixError::Disconnected(_) => StopCode::Disconnected,
            MixError::NoSpace => StopCode::NoSpace,
            MixError::EncodeError(_) => StopCode::EncodeError,
            // Setup-only kinds; if one escapes into a running stream,
            // report it as a disconnect rather than inventing a code.
            MixError::BadConfig(_) | MixError::OutOfResources(_) | MixError::MappingBusy => {
                StopCode::Disconnected
            }
        }
    }
}
