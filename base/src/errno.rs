//! Thin wrapper over the last `errno`, mirroring crosvm's `base::errno`.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(i32);

impl Error {
    /// Constructs an `Error` from the last OS error reported by libc.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    pub fn errno(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::from_raw_os_error(e.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns `Err(Error::last())`, for use as the tail expression after a
/// failed libc call.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}
