//! Error types for the instance runtime.
//!
//! Wraps engine errors together with the runtime's own failure cases and
//! converts them into `tonic::Status` with a code that matches the engine's
//! error kind.
//!
//! ## Error Cases
//! - `ChannelError`: a worker channel closed or a reply was dropped.
//! - `ServiceShutdown`: a request arrived while the runtime was draining.
//! - `Sequence`: the coordinator rejected or failed the operation.

use gapless::ErrorKind;
use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The runtime is shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Failure reported by the coordinator.
    #[error(transparent)]
    Sequence(#[from] gapless::Error),
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => Status::internal(format!("Channel error: {context}")),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::Sequence(e) => {
                let code = match e.kind() {
                    ErrorKind::InvalidRequest => Code::InvalidArgument,
                    ErrorKind::StoreUnavailable => Code::Unavailable,
                    ErrorKind::ConflictRetryExhausted => Code::Aborted,
                    ErrorKind::InvalidState => Code::FailedPrecondition,
                    ErrorKind::NotFound => Code::NotFound,
                    ErrorKind::CorruptedData => Code::DataLoss,
                };
                Status::new(code, format!("[{}] {e}", e.kind()))
            }
        }
    }
}
