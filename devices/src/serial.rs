//! The 16450 UART (spec §4.3): one port bound to a host Unix stream socket,
//! with 16450-style interrupt-control/line-control/modem-control registers,
//! an edge-triggered IRQ/refresh notifier pair, and reactor-driven client
//! I/O. Generalized from `original_source/Serial.{hpp,cpp}`, which models a
//! single always-open client with no interrupt machinery; the interest-mask
//! coalescing and IRQ arbitration here follow the fuller description in the
//! design notes rather than the original file.

use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base::descriptor::AsRawDescriptor;
use base::descriptor::RawDescriptor;
use base::event::Event;
use base::timer::Timer;
use base::wait_context::EventType;
use hypervisor::VmHandle;
use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::error::Result;
use crate::pio::PioDevice;
use crate::reactor::Reactor;

const IER_READ_AVAILABLE: u8 = 1 << 0;
const IER_WRITE_EMPTY: u8 = 1 << 1;

const ISR_WRITE_EMPTY: u8 = 0x02;
const ISR_READ_AVAILABLE: u8 = 0x04;
const ISR_NONE: u8 = 0x01;

const LCR_DLAB: u8 = 1 << 7;

/// An edge-triggered IRQ line: one eventfd the device writes to raise the
/// line, paired with a resample eventfd the hypervisor writes to once the
/// guest has serviced it, so the device can re-assert if the condition
/// still holds.
pub struct IrqEdge {
    irq_evt: Event,
    resample_evt: Event,
}

impl IrqEdge {
    pub fn new() -> base::errno::Result<IrqEdge> {
        Ok(IrqEdge {
            irq_evt: Event::new()?,
            resample_evt: Event::new()?,
        })
    }

    fn trigger(&self) -> base::errno::Result<()> {
        self.irq_evt.signal()
    }

    /// The descriptor signaled to raise the guest interrupt line; bound to
    /// a GSI via `VmHandle::register_irqfd`.
    pub fn irq_descriptor(&self) -> &Event {
        &self.irq_evt
    }

    /// The descriptor the hypervisor writes to acknowledge service; the
    /// VM loop wires this to the reactor so the device can resample.
    pub fn resample_descriptor(&self) -> &Event {
        &self.resample_evt
    }
}

#[derive(Default)]
struct Registers {
    dlab: bool,
    divisor: u16,
    interrupt_enable: u8,
    line_control: u8,
    modem_control: u8,
    scratch: u8,
    readable: bool,
    writable: bool,
    read_interrupt_flag: bool,
    write_interrupt_flag: bool,
}

impl Registers {
    fn read_interrupt_enabled(&self) -> bool {
        self.interrupt_enable & IER_READ_AVAILABLE != 0
    }

    fn write_interrupt_enabled(&self) -> bool {
        self.interrupt_enable & IER_WRITE_EMPTY != 0
    }

    fn any_interrupt_pending(&self) -> bool {
        self.read_interrupt_flag || self.write_interrupt_flag
    }

    fn interest_mask(&self) -> EventType {
        let mut mask = EventType::ERROR;
        if !self.read_interrupt_flag {
            mask = mask | EventType::READ;
        }
        if !self.write_interrupt_flag {
            mask = mask | EventType::WRITE;
        }
        mask
    }
}

struct Shared {
    registers: Mutex<Registers>,
    clients: Mutex<Vec<UnixStream>>,
    irq: IrqEdge,
    reactor: Reactor,
    read_timer: Mutex<Timer>,
    write_timer: Mutex<Timer>,
}

impl Shared {
    /// Raises the IRQ line iff no interrupt is currently outstanding for
    /// this device (spec §4.3 "Interrupt arbitration").
    fn maybe_raise(&self, registers: &Registers) {
        if registers.any_interrupt_pending() {
            if let Err(e) = self.irq.trigger() {
                log::warn!("uart irq trigger failed: {}", e);
            }
        }
    }

    fn apply_interest(&self) {
        let mask = self.registers.lock().interest_mask();
        for client in self.clients.lock().iter() {
            if let Err(e) = self.reactor.modify_event(client, mask) {
                log::warn!("uart client interest update failed: {}", e);
            }
        }
    }

    fn broadcast(&self, byte: u8) {
        let mut clients = self.clients.lock();
        clients.retain_mut(|client| match std::io::Write::write_all(client, &[byte]) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("uart client write failed, dropping: {}", DeviceError::TransientIoError(e));
                false
            }
        });
    }

    /// Pulls one byte from the first client with data available.
    fn pull_byte(&self) -> Option<u8> {
        let mut clients = self.clients.lock();
        for client in clients.iter_mut() {
            let mut byte = [0u8; 1];
            match std::io::Read::read(client, &mut byte) {
                Ok(1) => return Some(byte[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::debug!("uart client read failed: {}", DeviceError::TransientIoError(e));
                    continue;
                }
            }
        }
        None
    }
}

/// A single 16450 UART port.
pub struct Serial {
    shared: Arc<Shared>,
}

impl Serial {
    /// Binds a listening socket at `path`, begins serving connections
    /// through `reactor`, and binds the port's IRQ edge pair to guest
    /// system interrupt `gsi` on `vm` (spec §4.3 "IRQ edge pair"). Returns
    /// `Err` if the socket cannot be created, bound, or set to listen
    /// (spec §4.3 "Failure"), or if the irqfd binding fails.
    pub fn start(path: &Path, reactor: Reactor, vm: &dyn VmHandle, gsi: u32) -> Result<Serial> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("bind {}: {}", path.display(), e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("nonblocking: {}", e)))?;

        let irq = IrqEdge::new().map_err(|e| DeviceError::ConfigurationFailure(format!("irq event: {}", e)))?;
        let read_timer = Timer::new().map_err(|e| DeviceError::ConfigurationFailure(format!("read timer: {}", e)))?;
        let write_timer = Timer::new().map_err(|e| DeviceError::ConfigurationFailure(format!("write timer: {}", e)))?;

        vm.register_irqfd(irq.irq_descriptor(), irq.resample_descriptor(), gsi)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("register irqfd for gsi {}: {}", gsi, e)))?;

        let shared = Arc::new(Shared {
            registers: Mutex::new(Registers::default()),
            clients: Mutex::new(Vec::new()),
            irq,
            reactor,
            read_timer: Mutex::new(read_timer),
            write_timer: Mutex::new(write_timer),
        });

        Serial::register_timers(&shared)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("timer registration: {}", e)))?;
        Serial::register_resample(&shared)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("resample registration: {}", e)))?;
        Serial::register_listener(&shared, listener)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("listener registration: {}", e)))?;

        Ok(Serial { shared })
    }

    fn register_timers(shared: &Arc<Shared>) -> base::errno::Result<()> {
        let for_read = shared.clone();
        let read_timer_descriptor = RawFdHandle(shared.read_timer.lock().as_raw_descriptor());
        shared.reactor.add_event(
            &read_timer_descriptor,
            EventType::READ,
            Box::new(move |_| {
                let _ = for_read.read_timer.lock().mark_waited();
                let mut registers = for_read.registers.lock();
                registers.read_interrupt_flag = false;
                let enabled_and_true = registers.read_interrupt_enabled() && registers.readable;
                if enabled_and_true {
                    registers.read_interrupt_flag = true;
                }
                for_read.maybe_raise(&registers);
                drop(registers);
                for_read.apply_interest();
            }),
        )?;

        let for_write = shared.clone();
        let write_timer_descriptor = RawFdHandle(shared.write_timer.lock().as_raw_descriptor());
        shared.reactor.add_event(
            &write_timer_descriptor,
            EventType::READ,
            Box::new(move |_| {
                let _ = for_write.write_timer.lock().mark_waited();
                let mut registers = for_write.registers.lock();
                registers.write_interrupt_flag = false;
                let enabled_and_true = registers.write_interrupt_enabled() && registers.writable;
                if enabled_and_true {
                    registers.write_interrupt_flag = true;
                }
                for_write.maybe_raise(&registers);
                drop(registers);
                for_write.apply_interest();
            }),
        )?;
        Ok(())
    }

    /// Re-asserts the line on resample (spec §4.3: the hypervisor signals
    /// this once the guest has serviced a level-triggered IRQ, so a still-
    /// pending condition can be raised again).
    fn register_resample(shared: &Arc<Shared>) -> base::errno::Result<()> {
        let for_resample = shared.clone();
        shared.reactor.add_event(
            shared.irq.resample_descriptor(),
            EventType::READ,
            Box::new(move |_| {
                let _ = for_resample.irq.resample_descriptor().try_clear();
                let registers = for_resample.registers.lock();
                for_resample.maybe_raise(&registers);
            }),
        )
    }

    fn register_listener(shared: &Arc<Shared>, listener: UnixListener) -> base::errno::Result<()> {
        let listener_fd = RawFdHandle(listener.as_raw_fd());
        let for_accept = shared.clone();
        // The listener itself must outlive the closure.
        let listener = Arc::new(listener);
        let listener_for_closure = listener.clone();
        shared.reactor.add_event(
            &listener_fd,
            EventType::READ,
            Box::new(move |_| match listener_for_closure.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("uart client nonblocking failed: {}", DeviceError::TransientIoError(e));
                        return;
                    }
                    Serial::register_client(&for_accept, stream);
                }
                Err(e) => log::debug!("uart accept failed: {}", DeviceError::TransientIoError(e)),
            }),
        )?;
        // `listener` is kept alive only through the closure's `Arc` clone;
        // drop the local binding now that registration has succeeded.
        drop(listener);
        Ok(())
    }

    fn register_client(shared: &Arc<Shared>, stream: UnixStream) {
        let fd = RawFdHandle(stream.as_raw_fd());
        let mask = shared.registers.lock().interest_mask();
        let for_event = shared.clone();
        let result = shared.reactor.add_event(
            &fd,
            mask,
            Box::new(move |events| Serial::handle_client_event(&for_event, events)),
        );
        match result {
            Ok(()) => shared.clients.lock().push(stream),
            Err(e) => log::warn!("uart client registration failed: {}", e),
        }
    }

    fn handle_client_event(shared: &Arc<Shared>, events: EventType) {
        if events.contains(EventType::ERROR) {
            return;
        }
        let mut registers = shared.registers.lock();
        if events.contains(EventType::READ) {
            registers.readable = true;
        }
        if events.contains(EventType::WRITE) {
            registers.writable = true;
        }
        // Mirror the IER-write arbitration (iowrite8 offset 1): newly
        // readable/writable state must raise immediately, not wait for the
        // next debounce timer tick to happen to catch it.
        if registers.read_interrupt_enabled() && registers.readable {
            registers.read_interrupt_flag = true;
        }
        if registers.write_interrupt_enabled() && registers.writable {
            registers.write_interrupt_flag = true;
        }
        shared.maybe_raise(&registers);
        drop(registers);
        shared.apply_interest();
    }
}

/// Wraps a bare descriptor for reactor registration of objects (timers,
/// listeners) that aren't themselves `AsRawDescriptor`.
struct RawFdHandle(RawFd);
impl AsRawDescriptor for RawFdHandle {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.0
    }
}

impl PioDevice for Serial {
    fn iowrite8(&mut self, offset: u64, data: u8) -> Result<()> {
        let mut registers = self.shared.registers.lock();
        match offset & 0x7 {
            0 => {
                if registers.dlab {
                    registers.divisor = (registers.divisor & 0xFF00) | data as u16;
                } else {
                    registers.writable = false;
                    registers.write_interrupt_flag = true;
                    drop(registers);
                    self.shared.broadcast(data);
                    let _ = self.shared.write_timer.lock().reset_oneshot(Duration::from_millis(1));
                    self.shared.apply_interest();
                }
            }
            1 => {
                if registers.dlab {
                    registers.divisor = (registers.divisor & 0x00FF) | ((data as u16) << 8);
                } else {
                    let previously_pending = registers.any_interrupt_pending();
                    registers.interrupt_enable = data & 0x0F;
                    if !previously_pending {
                        let should_raise = (registers.read_interrupt_enabled() && registers.readable)
                            || (registers.write_interrupt_enabled() && registers.writable);
                        if should_raise {
                            if registers.read_interrupt_enabled() && registers.readable {
                                registers.read_interrupt_flag = true;
                            }
                            if registers.write_interrupt_enabled() && registers.writable {
                                registers.write_interrupt_flag = true;
                            }
                            self.shared.maybe_raise(&registers);
                        }
                    }
                    drop(registers);
                    self.shared.apply_interest();
                }
            }
            2 => {}
            3 => {
                registers.line_control = data;
                registers.dlab = data & LCR_DLAB != 0;
            }
            4 => registers.modem_control = data & 0x1F,
            5 | 6 => {}
            7 => registers.scratch = data,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn ioread8(&mut self, offset: u64) -> Result<u8> {
        let mut registers = self.shared.registers.lock();
        let value = match offset & 0x7 {
            0 => {
                if registers.dlab {
                    (registers.divisor & 0xFF) as u8
                } else {
                    registers.readable = false;
                    registers.read_interrupt_flag = false;
                    drop(registers);
                    let byte = self.shared.pull_byte().unwrap_or(0);
                    let _ = self.shared.read_timer.lock().reset_oneshot(Duration::from_millis(1));
                    self.shared.apply_interest();
                    return Ok(byte);
                }
            }
            1 => {
                if registers.dlab {
                    (registers.divisor >> 8) as u8
                } else {
                    registers.interrupt_enable
                }
            }
            2 => {
                let value = if registers.read_interrupt_flag {
                    ISR_READ_AVAILABLE
                } else if registers.write_interrupt_flag {
                    ISR_WRITE_EMPTY
                } else {
                    ISR_NONE
                };
                // Write-empty is cleared on read (edge acknowledgement);
                // read-available is cleared only by the data register read.
                registers.write_interrupt_flag = false;
                value
            }
            3 => registers.line_control,
            4 => registers.modem_control,
            5 | 6 => 0,
            7 => registers.scratch,
            _ => unreachable!(),
        };
        drop(registers);
        self.shared.apply_interest();
        Ok(value)
    }
}
