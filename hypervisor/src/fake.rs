//! Test doubles for `VmHandle`/`VcpuHandle`, so the VM main loop and device
//! model can be exercised without `/dev/kvm` (SPEC_FULL §3.4 "Test
//! tooling"). A `FakeVcpu` replays a fixed, caller-supplied sequence of
//! exits; a `FakeVm` just tracks which memory slots are currently mapped.

use std::collections::HashMap;
use std::sync::Mutex;

use base::event::Event;

use crate::Error;
use crate::GuestAddress;
use crate::MemoryMapping;
use crate::Result;
use crate::VcpuExit;
use crate::VcpuHandle;
use crate::VmHandle;

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    guest_addr: GuestAddress,
    read_only: bool,
}

#[derive(Default)]
pub struct FakeVm {
    slots: Mutex<HashMap<u32, SlotEntry>>,
    irq_chip_created: Mutex<bool>,
    registered_gsis: Mutex<Vec<u32>>,
}

impl FakeVm {
    pub fn new() -> FakeVm {
        FakeVm::default()
    }

    /// Whether `slot` is currently mapped, for test assertions.
    pub fn slot_mapped(&self, slot: u32) -> bool {
        self.slots.lock().unwrap().contains_key(&slot)
    }

    pub fn slot_guest_addr(&self, slot: u32) -> Option<GuestAddress> {
        self.slots.lock().unwrap().get(&slot).map(|e| e.guest_addr)
    }

    pub fn irq_chip_created(&self) -> bool {
        *self.irq_chip_created.lock().unwrap()
    }

    /// GSIs registered via `register_irqfd`, in call order, for test
    /// assertions.
    pub fn registered_gsis(&self) -> Vec<u32> {
        self.registered_gsis.lock().unwrap().clone()
    }
}

impl VmHandle for FakeVm {
    fn set_memory_region(
        &self,
        slot: u32,
        _mapping: &MemoryMapping,
        _host_offset: usize,
        _size: usize,
        guest_addr: GuestAddress,
        read_only: bool,
    ) -> Result<()> {
        self.slots.lock().unwrap().insert(slot, SlotEntry { guest_addr, read_only });
        Ok(())
    }

    fn remove_memory_region(&self, slot: u32) -> Result<()> {
        self.slots.lock().unwrap().remove(&slot);
        Ok(())
    }

    fn create_vcpu(&self, _id: usize) -> Result<Box<dyn VcpuHandle>> {
        Ok(Box::new(FakeVcpu::new(Vec::new())))
    }

    fn create_irq_chip(&self) -> Result<()> {
        *self.irq_chip_created.lock().unwrap() = true;
        Ok(())
    }

    fn register_irqfd(&self, _irq_evt: &Event, _resample_evt: &Event, gsi: u32) -> Result<()> {
        self.registered_gsis.lock().unwrap().push(gsi);
        Ok(())
    }
}

/// Replays `exits` in order, then returns `Shutdown` forever after.
pub struct FakeVcpu {
    exits: Vec<VcpuExit>,
    next: usize,
    instruction_pointer: u64,
}

impl FakeVcpu {
    pub fn new(exits: Vec<VcpuExit>) -> FakeVcpu {
        FakeVcpu {
            exits,
            next: 0,
            instruction_pointer: 0,
        }
    }

    pub fn set_instruction_pointer(&mut self, ip: u64) {
        self.instruction_pointer = ip;
    }
}

impl VcpuHandle for FakeVcpu {
    fn run(&mut self) -> Result<VcpuExit> {
        let exit = self.exits.get(self.next).copied().unwrap_or(VcpuExit::Shutdown);
        self.next += 1;
        if matches!(exit, VcpuExit::InternalError) {
            return Err(Error::Unsupported("simulated internal error"));
        }
        Ok(exit)
    }

    fn instruction_pointer(&self) -> Result<u64> {
        Ok(self.instruction_pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_replays_then_shuts_down() {
        let mut vcpu = FakeVcpu::new(vec![VcpuExit::Hlt]);
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Hlt);
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Shutdown);
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Shutdown);
    }

    #[test]
    fn vm_tracks_slot_mapping() {
        let vm = FakeVm::new();
        let mapping = MemoryMapping::new(4096).unwrap();
        vm.set_memory_region(3, &mapping, 0, 4096, GuestAddress(0x100000), false).unwrap();
        assert!(vm.slot_mapped(3));
        assert_eq!(vm.slot_guest_addr(3), Some(GuestAddress(0x100000)));
        vm.remove_memory_region(3).unwrap();
        assert!(!vm.slot_mapped(3));
    }

    #[test]
    fn vm_tracks_irq_chip_and_registered_gsis() {
        let vm = FakeVm::new();
        assert!(!vm.irq_chip_created());
        vm.create_irq_chip().unwrap();
        assert!(vm.irq_chip_created());

        let irq_evt = Event::new().unwrap();
        let resample_evt = Event::new().unwrap();
        vm.register_irqfd(&irq_evt, &resample_evt, 4).unwrap();
        assert_eq!(vm.registered_gsis(), vec![4]);
    }
}
