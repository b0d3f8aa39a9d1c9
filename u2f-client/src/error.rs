use thiserror::Error;
use u2f_hid::ReportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Hid(#[from] u2f_hid::Error),

    #[error("No requests to issue")]
    NoRequests,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("Key handle of {0} bytes is longer than allowed")]
    KeyHandleTooLong(usize),
}

impl Error {
    /// True if the device was physically disconnected and should be forgotten.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Error::Hid(err) if err.is_device_gone())
    }
}

impl From<ReportError> for Error {
    fn from(err: ReportError) -> Self {
        Error::Hid(err.into())
    }
}
