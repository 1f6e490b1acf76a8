//! Device-level error kinds, per spec §7. `UnsupportedIoWidth` and
//! `FlashProtocolViolation` are steady-state and handled at the device
//! boundary (guest-visible `0xFF` / ignored write, plus a log line); they
//! are defined here so callers can match on them explicitly rather than
//! stringly-typed errors. `TransientIoError` wraps a client-socket
//! `io::Error` at the exact point it's logged (`serial.rs`'s
//! accept/broadcast/pull_byte paths), so the log line carries a typed
//! error rather than a bare `Display` of the underlying `io::Error`.

use thiserror::Error;

#[remain::sorted]
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("configuration failure: {0}")]
    ConfigurationFailure(String),

    #[error("unrecognized JEDEC command sequence")]
    FlashProtocolViolation,

    #[error("address range insert overlaps an existing entry")]
    OverlappingRange,

    #[error("client socket error: {0}")]
    TransientIoError(#[source] std::io::Error),

    #[error("io width {0} is not implemented for this device")]
    UnsupportedIoWidth(u32),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
