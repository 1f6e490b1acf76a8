//! The event reactor (spec §4.2): a single background thread multiplexing
//! readiness across host descriptors and dispatching per-descriptor
//! closures. Built on `base::WaitContext`, which only provides the raw
//! epoll primitives; this module adds the handler table, the worker thread,
//! and the duplicate-owner sharing rule from spec §3 "EventLoop state" /
//! "Shared state rule".
//!
//! A `Reactor` may be cheaply duplicated (`try_clone`) so that several
//! device owners share one worker thread. Each clone tracks only the
//! descriptors *it* registered and removes only those on drop; the
//! underlying epoll instance and worker are torn down only when the
//! original (root) reactor is dropped.

use std::collections::HashMap;
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use base::descriptor::AsRawDescriptor;
use base::event::Event;
use base::wait_context::EventType;
use base::wait_context::WaitContext;
use parking_lot::Mutex;

pub type Handler = Box<dyn FnMut(EventType) + Send>;

struct Shared {
    wait_ctx: WaitContext<RawFd>,
    handlers: Mutex<HashMap<RawFd, Handler>>,
    shutdown: Event,
}

pub struct Reactor {
    shared: Arc<Shared>,
    owned: Mutex<HashSet<RawFd>>,
    worker: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn new() -> base::errno::Result<Reactor> {
        let wait_ctx = WaitContext::new()?;
        let shutdown = Event::new()?;
        wait_ctx.add(&shutdown, EventType::READ, shutdown.as_raw_descriptor())?;

        let shared = Arc::new(Shared {
            wait_ctx,
            handlers: Mutex::new(HashMap::new()),
            shutdown,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || Reactor::run(worker_shared));

        Ok(Reactor {
            shared,
            owned: Mutex::new(HashSet::new()),
            worker: Some(worker),
        })
    }

    fn run(shared: Arc<Shared>) {
        let shutdown_token = shared.shutdown.as_raw_descriptor();
        loop {
            let events = match shared.wait_ctx.wait() {
                Ok(events) => events,
                Err(e) => {
                    log::error!("event reactor wait failed, exiting: {}", e);
                    return;
                }
            };

            for triggered in events {
                if triggered.token == shutdown_token {
                    return;
                }
                let mut handlers = shared.handlers.lock();
                if let Some(handler) = handlers.get_mut(&triggered.token) {
                    handler(triggered.event_type);
                }
            }
        }
    }

    /// Returns a handle sharing this reactor's worker thread and epoll
    /// instance. The clone's own descriptors are torn down independently
    /// when it is dropped.
    pub fn try_clone(&self) -> base::errno::Result<Reactor> {
        Ok(Reactor {
            shared: self.shared.clone(),
            owned: Mutex::new(HashSet::new()),
            worker: None,
        })
    }

    /// Registers `fd` for `events`, invoking `handler` with the observed
    /// readiness mask whenever it fires. Registering an already-watched
    /// descriptor replaces its handler (documented behavior, spec §4.2).
    pub fn add_event(
        &self,
        descriptor: &dyn AsRawDescriptor,
        events: EventType,
        handler: Handler,
    ) -> base::errno::Result<()> {
        let fd = descriptor.as_raw_descriptor();
        self.shared.wait_ctx.add(descriptor, events, fd)?;
        self.shared.handlers.lock().insert(fd, handler);
        self.owned.lock().insert(fd);
        Ok(())
    }

    pub fn modify_event(
        &self,
        descriptor: &dyn AsRawDescriptor,
        events: EventType,
    ) -> base::errno::Result<()> {
        let fd = descriptor.as_raw_descriptor();
        self.shared.wait_ctx.modify(descriptor, events, fd)
    }

    pub fn remove_event(&self, descriptor: &dyn AsRawDescriptor) {
        let fd = descriptor.as_raw_descriptor();
        let _ = self.shared.wait_ctx.delete(descriptor);
        self.shared.handlers.lock().remove(&fd);
        self.owned.lock().remove(&fd);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let owned: Vec<RawFd> = self.owned.lock().drain().collect();
        for fd in owned {
            self.shared.handlers.lock().remove(&fd);
            // Best-effort: the descriptor itself may already be closed by
            // its owning device, in which case EPOLL_CTL_DEL legitimately
            // fails and there is nothing further to clean up.
            let _ = self.shared.wait_ctx.delete(&RawFdRef(fd));
        }

        if let Some(worker) = self.worker.take() {
            let _ = self.shared.shutdown.signal();
            let _ = worker.join();
        }
    }
}

/// Wraps a bare `RawFd` so `WaitContext::delete` can be called with just the
/// descriptor number during teardown, after the original owner may already
/// be gone.
struct RawFdRef(RawFd);
impl AsRawDescriptor for RawFdRef {
    fn as_raw_descriptor(&self) -> base::descriptor::RawDescriptor {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn handler_fires_on_signal() {
        let reactor = Reactor::new().unwrap();
        let event = Event::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let event_for_handler = event.try_clone().unwrap();
        reactor
            .add_event(
                &event,
                EventType::READ,
                Box::new(move |_| {
                    let _ = event_for_handler.try_clear();
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        event.signal().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_shares_worker_and_owns_independently() {
        let root = Reactor::new().unwrap();
        let clone = root.try_clone().unwrap();

        let event = Event::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let event_for_handler = event.try_clone().unwrap();
        clone
            .add_event(
                &event,
                EventType::READ,
                Box::new(move |_| {
                    let _ = event_for_handler.try_clear();
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        event.signal().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Dropping the clone removes only its own descriptor; the root (and
        // its worker thread) keeps running.
        drop(clone);
        drop(root);
    }
}
