//! Guest memory layout (spec §6 "external interfaces", §4.9 "MMIO"):
//! the fixed set of memory slots this 386EX board exposes, mirroring the
//! layout `original_source/main.cpp` programs directly against
//! `KVM_SET_USER_MEMORY_REGION`.

use anyhow::Context;
use anyhow::Result;
use hypervisor::GuestAddress;
use hypervisor::MemoryMapping;
use hypervisor::VmHandle;

pub const RAM_SIZE: usize = 0xA_0000;
pub const FLASH_SIZE: usize = 0x8_0000;
const SHADOW_WINDOW_SIZE: usize = 0x1_0000;

const SLOT_RAM: u32 = 0;
const SLOT_ROM_DOS: u32 = 1;
const SLOT_BIOS: u32 = 2;
const SLOT_RAM_WRAP: u32 = 3;

const ROM_DOS_FLASH_OFFSET: usize = 0x6_0000;
const BIOS_FLASH_OFFSET: usize = 0x7_0000;

/// Owns the two host allocations (low RAM, the flash array) and programs
/// every guest-visible window into them.
pub struct MemoryLayout {
    pub ram: MemoryMapping,
    pub flash: MemoryMapping,
    a20_enabled: bool,
}

impl MemoryLayout {
    /// Allocates RAM and loads `flash_image` into a fresh flash mapping,
    /// then programs the RAM and BIOS/DOS shadow-window slots against `vm`.
    /// The linear flash array at `0x03400000` (spec §4.8 "JEDEC flash
    /// controller") is deliberately never installed as a KVM memory
    /// region: every access to it must trap so the JEDEC state machine and
    /// the product-ID unmap/remap trick can intercept it, rather than
    /// resolving silently against mapped memory.
    /// The RAM-wrap alias (spec §4.9 "A20 register") starts installed,
    /// matching the 386EX's power-on state (A20 gate disabled).
    pub fn new(vm: &dyn VmHandle, flash_image: Vec<u8>) -> Result<MemoryLayout> {
        anyhow::ensure!(
            flash_image.len() == FLASH_SIZE,
            "flash image must be exactly {:#x} bytes, got {:#x}",
            FLASH_SIZE,
            flash_image.len()
        );

        let ram = MemoryMapping::new(RAM_SIZE).context("allocate low RAM")?;
        let mut flash = MemoryMapping::new(FLASH_SIZE).context("allocate flash array")?;
        flash.as_mut_slice().copy_from_slice(&flash_image);

        vm.set_memory_region(SLOT_RAM, &ram, 0, RAM_SIZE, GuestAddress(0), false)
            .context("map low RAM")?;
        vm.set_memory_region(
            SLOT_ROM_DOS,
            &flash,
            ROM_DOS_FLASH_OFFSET,
            SHADOW_WINDOW_SIZE,
            GuestAddress(0xE_0000),
            false,
        )
        .context("map DOS ROM shadow")?;
        vm.set_memory_region(
            SLOT_BIOS,
            &flash,
            BIOS_FLASH_OFFSET,
            SHADOW_WINDOW_SIZE,
            GuestAddress(0xF_0000),
            false,
        )
        .context("map BIOS shadow")?;

        let mut layout = MemoryLayout {
            ram,
            flash,
            a20_enabled: false,
        };
        layout.set_a20(vm, false)?;
        Ok(layout)
    }

    /// Installs or removes the `0x100000` RAM-wrap alias per the A20 gate
    /// state (spec §4.9: "if it transitioned, reprogram the RAM-wrap
    /// memory region"). Idempotent if the state hasn't changed.
    pub fn set_a20(&mut self, vm: &dyn VmHandle, enabled: bool) -> Result<()> {
        if enabled == self.a20_enabled {
            return Ok(());
        }
        if enabled {
            vm.remove_memory_region(SLOT_RAM_WRAP).context("unmap RAM wrap")?;
        } else {
            vm.set_memory_region(SLOT_RAM_WRAP, &self.ram, 0, SHADOW_WINDOW_SIZE, GuestAddress(0x10_0000), false)
                .context("map RAM wrap")?;
        }
        self.a20_enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor::fake::FakeVm;

    #[test]
    fn power_on_state_maps_every_fixed_slot() {
        let vm = FakeVm::new();
        let layout = MemoryLayout::new(&vm, vec![0u8; FLASH_SIZE]).unwrap();
        assert!(vm.slot_mapped(SLOT_RAM));
        assert!(vm.slot_mapped(SLOT_ROM_DOS));
        assert!(vm.slot_mapped(SLOT_BIOS));
        assert!(vm.slot_mapped(SLOT_RAM_WRAP));
        drop(layout);
    }

    #[test]
    fn enabling_a20_unmaps_the_wrap_alias() {
        let vm = FakeVm::new();
        let mut layout = MemoryLayout::new(&vm, vec![0u8; FLASH_SIZE]).unwrap();
        layout.set_a20(&vm, true).unwrap();
        assert!(!vm.slot_mapped(SLOT_RAM_WRAP));
        layout.set_a20(&vm, false).unwrap();
        assert!(vm.slot_mapped(SLOT_RAM_WRAP));
    }

    #[test]
    fn rejects_wrong_sized_flash_image() {
        let vm = FakeVm::new();
        assert!(MemoryLayout::new(&vm, vec![0u8; 16]).is_err());
    }
}
