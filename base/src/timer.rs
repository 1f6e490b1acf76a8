//! A timerfd-backed one-shot/periodic timer, used by the UART to debounce
//! read/write interrupt storms (spec §5 "Timeouts": 1 ms rearm). Mirrors
//! crosvm's `base::Timer`.

use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::descriptor::AsRawDescriptor;
use crate::descriptor::FromRawDescriptor;
use crate::descriptor::RawDescriptor;
use crate::descriptor::SafeDescriptor;
use crate::errno::errno_result;
use crate::errno::Result;

fn duration_to_timespec(dur: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_nsec: dur.subsec_nanos() as libc::c_long,
    }
}

pub struct Timer {
    descriptor: SafeDescriptor,
}

impl Timer {
    pub fn new() -> Result<Timer> {
        // Safe because this doesn't modify any memory and we check the
        // return value.
        let ret = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        Ok(Timer {
            // Safe because we uniquely own the new descriptor.
            descriptor: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
        })
    }

    /// Arms the timer to expire once after `dur`, canceling any pending
    /// expiration and any repeating interval.
    pub fn reset_oneshot(&mut self, dur: Duration) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(dur),
        };
        // Safe because `spec` is a valid, live local and we check the
        // return value.
        let ret = unsafe {
            libc::timerfd_settime(self.descriptor.as_raw_descriptor(), 0, &spec, ptr::null_mut())
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(Duration::ZERO),
        };
        // Safe because `spec` is a valid, live local and we check the
        // return value.
        let ret = unsafe {
            libc::timerfd_settime(self.descriptor.as_raw_descriptor(), 0, &spec, ptr::null_mut())
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Reads and discards the expiration counter, leaving the descriptor
    /// non-readable until the next expiration.
    pub fn mark_waited(&mut self) -> Result<()> {
        let mut count: u64 = 0;
        // Safe because we pass a valid buffer of the expected size.
        let ret = unsafe {
            libc::read(
                self.descriptor.as_raw_descriptor(),
                &mut count as *mut u64 as *mut libc::c_void,
                mem::size_of_val(&count),
            )
        };
        if ret < 0 {
            let err = crate::errno::Error::last();
            if err.errno() == libc::EAGAIN {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl AsRawDescriptor for Timer {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor.as_raw_descriptor()
    }
}

impl std::os::unix::io::AsRawFd for Timer {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor.as_raw_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait_context::EventToken;
    use crate::wait_context::EventType;
    use crate::wait_context::WaitContext;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct Token;
    impl EventToken for Token {
        fn as_raw_token(&self) -> u64 {
            0
        }
        fn from_raw_token(_: u64) -> Self {
            Token
        }
    }

    #[test]
    fn oneshot_expires() {
        let mut timer = Timer::new().unwrap();
        timer.reset_oneshot(Duration::from_millis(1)).unwrap();

        let ctx: WaitContext<Token> = WaitContext::new().unwrap();
        ctx.add(&timer, EventType::READ, Token).unwrap();
        let triggered = ctx.wait_timeout(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(triggered.len(), 1);
        timer.mark_waited().unwrap();
    }
}
