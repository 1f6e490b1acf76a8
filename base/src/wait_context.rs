//! The event reactor's readiness multiplexer: a cooperative, epoll-backed
//! wait context generic over an application-chosen token type. Mirrors
//! crosvm's `base::sys::unix::wait_context::WaitContext`.
//!
//! `WaitContext` itself only exposes add/modify/delete/wait — it does not
//! own a background thread. `devices::bus::EventReactor` layers the worker
//! thread, handler table, and shutdown notifier described in spec §4.2 on
//! top of this.

use std::marker::PhantomData;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::descriptor::AsRawDescriptor;
use crate::descriptor::FromRawDescriptor;
use crate::descriptor::RawDescriptor;
use crate::descriptor::SafeDescriptor;
use crate::errno::errno_result;
use crate::errno::Result;

/// Readiness flags observed on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventType(u32);

impl EventType {
    pub const NONE: EventType = EventType(0);
    pub const READ: EventType = EventType(libc::EPOLLIN as u32);
    pub const WRITE: EventType = EventType(libc::EPOLLOUT as u32);
    pub const ERROR: EventType = EventType(libc::EPOLLERR as u32 | libc::EPOLLHUP as u32);

    fn raw(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EventType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventType {
    type Output = EventType;
    fn bitor(self, rhs: EventType) -> EventType {
        EventType(self.0 | rhs.0)
    }
}

/// A value an owner attaches to a descriptor so it can identify which
/// descriptor fired when `wait()` returns. Implement this for whatever enum
/// or struct distinguishes a device's watched descriptors from each other.
pub trait EventToken: Clone {
    fn as_raw_token(&self) -> u64;
    fn from_raw_token(data: u64) -> Self;
}

// Blanket impl for the common case of a token that is just a descriptor.
impl EventToken for RawFd {
    fn as_raw_token(&self) -> u64 {
        *self as u64
    }
    fn from_raw_token(data: u64) -> Self {
        data as RawFd
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TriggeredEvent<T: EventToken> {
    pub token: T,
    pub event_type: EventType,
}

/// An epoll instance plus the descriptor->token table needed to reconstruct
/// `EventToken`s from raw epoll events. Duplicate `add` calls on the same
/// descriptor replace the previous token, matching the original
/// `EventLoop::addEvent` behavior noted in spec §4.2.
pub struct WaitContext<T: EventToken> {
    epoll: SafeDescriptor,
    _token: PhantomData<T>,
}

impl<T: EventToken> WaitContext<T> {
    pub fn new() -> Result<WaitContext<T>> {
        // Safe because this doesn't modify any memory and we check the
        // return value.
        let ret = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        Ok(WaitContext {
            // Safe because we uniquely own the new descriptor.
            epoll: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
            _token: PhantomData,
        })
    }

    pub fn add(&self, fd: &dyn AsRawDescriptor, events: EventType, token: T) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, Some(token))
            .or_else(|_| self.ctl(libc::EPOLL_CTL_MOD, fd, events, Some(token)))
    }

    pub fn modify(&self, fd: &dyn AsRawDescriptor, events: EventType, token: T) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, Some(token))
    }

    pub fn delete(&self, fd: &dyn AsRawDescriptor) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventType::NONE, None)
    }

    fn ctl(
        &self,
        op: i32,
        fd: &dyn AsRawDescriptor,
        events: EventType,
        token: Option<T>,
    ) -> Result<()> {
        let mut event = libc::epoll_event {
            events: events.raw(),
            u64: token.map(|t| t.as_raw_token()).unwrap_or(0),
        };
        // Safe because `event` is a valid, live local and we check the
        // return value.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_descriptor(),
                op,
                fd.as_raw_descriptor(),
                &mut event,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until at least one watched descriptor is ready, or `timeout`
    /// elapses (`None` blocks forever).
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<Vec<TriggeredEvent<T>>> {
        let mut events: [libc::epoll_event; 64] = unsafe { mem::zeroed() };
        let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

        // Safe because `events` has room for the count we pass and we
        // check the return value.
        let ret = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_descriptor(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if ret < 0 {
            return errno_result();
        }

        Ok(events[..ret as usize]
            .iter()
            .map(|e| TriggeredEvent {
                token: T::from_raw_token(e.u64),
                event_type: EventType(e.events),
            })
            .collect())
    }

    pub fn wait(&self) -> Result<Vec<TriggeredEvent<T>>> {
        self.wait_timeout(None)
    }

    /// Duplicates the underlying epoll descriptor. Per spec §4.2, cloned
    /// contexts share one kernel-side epoll instance (and therefore one
    /// background worker) while each owner only ever registers and tears
    /// down its own descriptors.
    pub fn try_clone(&self) -> Result<WaitContext<T>> {
        Ok(WaitContext {
            epoll: self.epoll.clone(),
            _token: PhantomData,
        })
    }
}

impl<T: EventToken> AsRawDescriptor for WaitContext<T> {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.epoll.as_raw_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct Token(u64);

    impl EventToken for Token {
        fn as_raw_token(&self) -> u64 {
            self.0
        }
        fn from_raw_token(data: u64) -> Self {
            Token(data)
        }
    }

    #[test]
    fn wait_reports_signaled_event() {
        let ctx: WaitContext<Token> = WaitContext::new().unwrap();
        let event = Event::new().unwrap();
        ctx.add(&event, EventType::READ, Token(42)).unwrap();
        event.signal().unwrap();

        let triggered = ctx.wait().unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].token, Token(42));
        assert!(triggered[0].event_type.contains(EventType::READ));
    }

    #[test]
    fn delete_stops_reporting() {
        let ctx: WaitContext<Token> = WaitContext::new().unwrap();
        let event = Event::new().unwrap();
        ctx.add(&event, EventType::READ, Token(1)).unwrap();
        ctx.delete(&event).unwrap();
        event.signal().unwrap();

        let triggered = ctx.wait_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(triggered.is_empty());
    }
}
