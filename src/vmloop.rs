//! The VM main loop (spec §4.9): the single thread that owns the VCPU run
//! cycle and dispatches every guest exit into the device model. All memory
//! reprogramming (A20 transitions, flash product-ID unmap/remap) happens
//! here, never on the reactor thread (spec §5).

use std::sync::Arc;

use anyhow::Result;
use devices::Bus;
use devices::IoSize;
use hypervisor::GuestAddress;
use hypervisor::VcpuExit;
use hypervisor::VcpuHandle;
use hypervisor::VmHandle;

use crate::memory::MemoryLayout;
use devices::flash::FlashMemoryWindow;
use devices::flash::JedecFlash;

const FLASH_MMIO_BASE: u64 = 0x0340_0000;
const FLASH_MMIO_SIZE: u64 = crate::memory::FLASH_SIZE as u64;

const A20_GATE_PORT: u64 = 0x92;

/// The flash window at `0x03400000` is never installed as a KVM memory
/// region (see `memory::MemoryLayout`), so every access already traps
/// here regardless of product-ID state; this hook exists only to trace
/// the transition for diagnostics (spec §4.8).
pub struct LoggingFlashWindow;

impl FlashMemoryWindow for LoggingFlashWindow {
    fn unmap_flash_region(&mut self) {
        log::debug!("jedec flash: entering product-id window");
    }

    fn remap_flash_region(&mut self) {
        log::debug!("jedec flash: leaving product-id window");
    }
}

pub struct VmLoop {
    vm: Arc<dyn VmHandle>,
    vcpu: Box<dyn VcpuHandle>,
    bus: Bus,
    flash: JedecFlash,
    memory: MemoryLayout,
    a20_port_value: u8,
}

impl VmLoop {
    pub fn new(
        vm: Arc<dyn VmHandle>,
        vcpu: Box<dyn VcpuHandle>,
        bus: Bus,
        flash: JedecFlash,
        memory: MemoryLayout,
    ) -> VmLoop {
        VmLoop {
            vm,
            vcpu,
            bus,
            flash,
            memory,
            a20_port_value: 0,
        }
    }

    /// Runs until `Hlt`/`Shutdown` or the process-wide exit flag is set.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if base::signal::exit_requested() {
                log::info!("exit requested, stopping VM loop");
                return Ok(());
            }

            let exit = match self.vcpu.run() {
                Ok(exit) => exit,
                Err(e) => {
                    log::error!("vcpu run failed: {}", e);
                    return Err(e.into());
                }
            };

            match exit {
                VcpuExit::IoIn { port, size } => self.handle_io_in(port, size),
                VcpuExit::IoOut { port, size, data } => self.handle_io_out(port, size, data),
                VcpuExit::MmioRead { address, size } => self.handle_mmio_read(address, size),
                VcpuExit::MmioWrite { address, size, data } => self.handle_mmio_write(address, size, data),
                VcpuExit::Hlt => {
                    log::info!("guest halted");
                    return Ok(());
                }
                VcpuExit::Debug => {
                    let ip = self.vcpu.instruction_pointer().unwrap_or(0);
                    log::debug!("single-step at rip={:#x}", ip);
                }
                VcpuExit::Shutdown => {
                    log::info!("guest requested shutdown");
                    return Ok(());
                }
                VcpuExit::InternalError => {
                    anyhow::bail!("hypervisor reported an internal error");
                }
            }

            self.sync_a20();
        }
    }

    fn handle_io_in(&mut self, port: u16, size: u32) {
        let Some(io_size) = IoSize::from_bytes(size as usize) else {
            log::warn!("ignoring io read of unsupported size {} at port {:#x}", size, port);
            return;
        };
        if let Some((offset, device)) = self.bus.find(port as u64) {
            let _ = device.lock().pio_read(offset, io_size);
        } else {
            log::debug!("unhandled io read at port {:#x}", port);
        }
    }

    fn handle_io_out(&mut self, port: u16, size: u32, data: [u8; 8]) {
        let Some(io_size) = IoSize::from_bytes(size as usize) else {
            log::warn!("ignoring io write of unsupported size {} at port {:#x}", size, port);
            return;
        };
        let value = u64::from_le_bytes(data);
        if let Some((offset, device)) = self.bus.find(port as u64) {
            device.lock().pio_write(offset, io_size, value);
        } else {
            log::debug!("unhandled io write at port {:#x} value {:#x}", port, value);
        }

        if port == A20_GATE_PORT {
            self.a20_port_value = value as u8;
        }
    }

    fn handle_mmio_read(&mut self, address: u64, size: u32) {
        if (FLASH_MMIO_BASE..FLASH_MMIO_BASE + FLASH_MMIO_SIZE).contains(&address) && size == 1 {
            let _ = self.flash.read((address - FLASH_MMIO_BASE) as u32);
        } else {
            log::debug!("unhandled mmio read at {:#x} size {}", address, size);
        }
    }

    fn handle_mmio_write(&mut self, address: u64, size: u32, data: [u8; 8]) {
        if (FLASH_MMIO_BASE..FLASH_MMIO_BASE + FLASH_MMIO_SIZE).contains(&address) && size == 1 {
            if let Err(e) = self.flash.write((address - FLASH_MMIO_BASE) as u32, data[0]) {
                log::warn!("flash write rejected: {}", e);
            }
        } else {
            log::debug!("unhandled mmio write at {:#x} size {}", address, size);
        }
    }

    /// Reprograms the RAM-wrap alias if the A20 register's enable bit
    /// (bit 1) has changed since the last check (spec §4.9).
    fn sync_a20(&mut self) {
        let enabled = self.a20_port_value & (1 << 1) != 0;
        if let Err(e) = self.memory.set_a20(self.vm.as_ref(), enabled) {
            log::error!("failed to reprogram A20 wrap region: {}", e);
        }
    }
}

/// The guest-physical address a read-only flash view must present while
/// the flash window is mapped (the product-ID trick temporarily removes
/// it; spec §4.8, §4.9).
pub fn flash_window_guest_addr() -> GuestAddress {
    GuestAddress(FLASH_MMIO_BASE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::a20::A20Gate;
    use devices::misc::PostCode;
    use hypervisor::fake::FakeVcpu;
    use hypervisor::fake::FakeVm;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct NullWindow;
    impl FlashMemoryWindow for NullWindow {
        fn unmap_flash_region(&mut self) {}
        fn remap_flash_region(&mut self) {}
    }

    fn make_loop(exits: Vec<VcpuExit>) -> VmLoop {
        let vm = FakeVm::new();
        let memory = MemoryLayout::new(&vm, vec![0u8; crate::memory::FLASH_SIZE]).unwrap();
        let mut bus = Bus::new();
        bus.insert(devices::AddressRange::new(0x80, 1), Arc::new(Mutex::new(PostCode))).unwrap();
        bus.insert(devices::AddressRange::new(0x92, 1), Arc::new(Mutex::new(A20Gate::new()))).unwrap();
        let flash = JedecFlash::new(vec![0xFF; crate::memory::FLASH_SIZE], Box::new(NullWindow));
        let vcpu = Box::new(FakeVcpu::new(exits));
        VmLoop::new(Arc::new(vm), vcpu, bus, flash, memory)
    }

    #[test]
    fn halt_exit_stops_the_loop() {
        let mut vm_loop = make_loop(vec![VcpuExit::Hlt]);
        vm_loop.run().unwrap();
    }

    #[test]
    fn post_code_write_is_dispatched_through_the_bus() {
        let mut vm_loop = make_loop(vec![
            VcpuExit::IoOut {
                port: 0x80,
                size: 1,
                data: [0x42, 0, 0, 0, 0, 0, 0, 0],
            },
            VcpuExit::Hlt,
        ]);
        vm_loop.run().unwrap();
    }

    #[test]
    fn unhandled_port_does_not_panic() {
        let mut vm_loop = make_loop(vec![VcpuExit::IoIn { port: 0x1234, size: 1 }, VcpuExit::Hlt]);
        vm_loop.run().unwrap();
    }
}
