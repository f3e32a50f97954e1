use crate::member::MemberId;
use thiserror::Error;

/// Errors surfaced by the SWIM core and by host callbacks.
///
/// `TimedOut` doubles as the reply code handed to `send_reply` when a staged
/// indirect ping expires; the normal time-budget exits of
/// [`progress`](crate::SwimContext::progress) are *not* errors and are
/// reported through [`ProgressStatus`](crate::ProgressStatus) instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("member {0} is not known")]
    NotFound(MemberId),

    #[error("entry already present")]
    Already,

    #[error("timed out")]
    TimedOut,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("callback not supported: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SwimError>;
