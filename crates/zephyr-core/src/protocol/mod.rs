//! Serial Protocol Communication
//!
//! Implements the test stand's newline-delimited ASCII protocol: outbound
//! command lines, inbound telemetry and status lines.

mod codec;
pub mod commands;
mod error;
pub mod frame;
pub mod serial;
mod transport;

pub use commands::{ActiveCommand, Command};
pub use error::{FrameError, ProtocolError};
pub use frame::{decode, Frame, StatusMessage};
pub use serial::{list_ports, PortInfo};
pub use transport::{ConnectionConfig, Inbound, LineTransport, StandStream};

/// Default baud rate of the stand firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default serial read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default time to wait after opening the port (the Arduino resets on open)
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// Default time to wait for a mode acknowledgement
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;

/// Maximum accepted inbound line length
pub const MAX_LINE_LENGTH: usize = 1024;
