//! Protocol errors

use thiserror::Error;

/// Errors that can occur on the serial link.
///
/// Any of these ends the current session; the operator re-initializes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Not connected to test stand")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A malformed inbound line. Recovered locally: logged and discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("empty line")]
    Empty,

    #[error("line exceeds {0} bytes")]
    TooLong(usize),

    #[error("line is not valid UTF-8")]
    NotText,

    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("field {index} is not numeric: '{token}'")]
    NotNumeric { index: usize, token: String },
}
