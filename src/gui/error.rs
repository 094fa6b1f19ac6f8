use std::{error::Error, fmt::Display, sync::mpsc};

/// Anything that can go wrong while the terminal UI is up.
#[derive(Debug)]
pub enum RangerGuiError {
    /// Terminal setup, drawing or input failed
    IOError(std::io::Error),
    /// The worker thread went away before we could tell it to stop
    MPSCSendError,
    /// The worker thread went away without handing back its result
    MPSCRecvError(mpsc::RecvError),
    /// The worker thread panicked
    JoinError,
}

impl Display for RangerGuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl Error for RangerGuiError {}

impl From<std::io::Error> for RangerGuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl<T> From<mpsc::SendError<T>> for RangerGuiError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::MPSCSendError
    }
}

impl From<mpsc::RecvError> for RangerGuiError {
    fn from(value: mpsc::RecvError) -> Self {
        Self::MPSCRecvError(value)
    }
}
