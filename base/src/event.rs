//! An eventfd-backed notifier, used both as the reactor's internal shutdown
//! notifier and as the IRQ/resample pair the UART binds to the hypervisor's
//! interrupt routing. Mirrors crosvm's `base::Event`.

use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use crate::descriptor::AsRawDescriptor;
use crate::descriptor::FromRawDescriptor;
use crate::descriptor::RawDescriptor;
use crate::descriptor::SafeDescriptor;
use crate::errno::errno_result;
use crate::errno::Result;

#[derive(Debug, Clone)]
pub struct Event {
    descriptor: SafeDescriptor,
}

impl Event {
    /// Creates a new event notifier, initially unsignaled.
    pub fn new() -> Result<Event> {
        // Safe because this doesn't modify any memory and we check the
        // return value.
        let ret = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if ret < 0 {
            return errno_result();
        }

        // Safe because we uniquely own the new descriptor.
        Ok(Event {
            descriptor: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
        })
    }

    /// Signals the event, waking anyone blocked in `wait`/polling on it.
    pub fn signal(&self) -> Result<()> {
        self.write_count(1)
    }

    /// Writes an arbitrary count to the underlying eventfd counter.
    pub fn write_count(&self, value: u64) -> Result<()> {
        // Safe because we pass a valid buffer of the expected size and
        // check the return value.
        let ret = unsafe {
            libc::write(
                self.descriptor.as_raw_descriptor(),
                &value as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until the event is signaled, then clears it.
    pub fn wait(&self) -> Result<()> {
        let mut value: u64 = 0;
        loop {
            // Safe because we pass a valid buffer of the expected size and
            // check the return value.
            let ret = unsafe {
                libc::read(
                    self.descriptor.as_raw_descriptor(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                let err = crate::errno::Error::last();
                if err.errno() == libc::EAGAIN {
                    continue;
                }
                return Err(err);
            }
            return Ok(());
        }
    }

    /// Clears a pending signal without blocking, returning whether one was
    /// pending.
    pub fn try_clear(&self) -> Result<bool> {
        let mut value: u64 = 0;
        // Safe because we pass a valid buffer of the expected size.
        let ret = unsafe {
            libc::read(
                self.descriptor.as_raw_descriptor(),
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = crate::errno::Error::last();
            if err.errno() == libc::EAGAIN {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }

    pub fn try_clone(&self) -> Result<Event> {
        Ok(Event {
            descriptor: self.descriptor.clone(),
        })
    }
}

impl AsRawDescriptor for Event {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor.as_raw_descriptor()
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor.as_raw_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_and_wait_roundtrip() {
        let event = Event::new().unwrap();
        event.signal().unwrap();
        event.wait().unwrap();
        assert!(!event.try_clear().unwrap());
    }

    #[test]
    fn try_clear_reports_absence() {
        let event = Event::new().unwrap();
        assert!(!event.try_clear().unwrap());
    }
}
