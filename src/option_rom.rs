//! The option-ROM guest window (spec §6 "Option ROM", §4.9 "virtual-disk
//! LBA window"): a fixed, read-only slot at guest `0xC8000` that normally
//! presents the static `--option-rom` image, and that `VirtualDisk` can
//! reprogram on demand to present a 512-byte sector of the backing disk
//! image instead (spec §6 "virtual disk").

use std::os::unix::io::RawFd;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use devices::virtual_disk::DiskWindow;
use hypervisor::GuestAddress;
use hypervisor::MemoryMapping;
use hypervisor::VmHandle;

const SLOT_OPTION_ROM: u32 = 4;
const OPTION_ROM_GUEST_ADDR: u64 = 0xC_8000;
pub const OPTION_ROM_SIZE: usize = 0x2000;
const PAGE_SIZE: u64 = 0x1000;

/// Owns the option-ROM slot. Installed over the static `--option-rom`
/// image by `new`; `DiskWindow::map_sector` replaces it with a disk-backed
/// page whenever `VirtualDisk`'s control register strobes "update mapping".
pub struct OptionRomWindow {
    vm: Arc<dyn VmHandle>,
    mapping: MemoryMapping,
}

impl OptionRomWindow {
    /// Loads `image` (exactly `OPTION_ROM_SIZE` bytes) and maps it
    /// read-only at `0xC8000`.
    pub fn new(vm: Arc<dyn VmHandle>, image: Vec<u8>) -> Result<OptionRomWindow> {
        anyhow::ensure!(
            image.len() == OPTION_ROM_SIZE,
            "option rom image must be exactly {:#x} bytes, got {:#x}",
            OPTION_ROM_SIZE,
            image.len()
        );
        let mut mapping = MemoryMapping::new(OPTION_ROM_SIZE).context("allocate option rom")?;
        mapping.as_mut_slice().copy_from_slice(&image);
        vm.set_memory_region(SLOT_OPTION_ROM, &mapping, 0, OPTION_ROM_SIZE, GuestAddress(OPTION_ROM_GUEST_ADDR), true)
            .context("map option rom")?;
        Ok(OptionRomWindow { vm, mapping })
    }
}

impl DiskWindow for OptionRomWindow {
    fn map_sector(&mut self, disk_fd: RawFd, byte_offset: u64, length: usize) -> std::io::Result<()> {
        let page_offset = byte_offset - (byte_offset % PAGE_SIZE);
        let intra_page = (byte_offset - page_offset) as usize;
        let mapping = MemoryMapping::from_file(disk_fd, page_offset, PAGE_SIZE as usize)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.vm
            .set_memory_region(SLOT_OPTION_ROM, &mapping, intra_page, length, GuestAddress(OPTION_ROM_GUEST_ADDR), true)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.mapping = mapping;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor::fake::FakeVm;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn installs_static_image_read_only_at_0xc8000() {
        let fake = Arc::new(FakeVm::new());
        let vm: Arc<dyn VmHandle> = fake.clone();
        let _window = OptionRomWindow::new(vm, vec![0xABu8; OPTION_ROM_SIZE]).unwrap();
        assert!(fake.slot_mapped(SLOT_OPTION_ROM));
        assert_eq!(fake.slot_guest_addr(SLOT_OPTION_ROM), Some(GuestAddress(OPTION_ROM_GUEST_ADDR)));
    }

    #[test]
    fn rejects_wrong_sized_image() {
        let fake = Arc::new(FakeVm::new());
        let vm: Arc<dyn VmHandle> = fake.clone();
        assert!(OptionRomWindow::new(vm, vec![0u8; 4]).is_err());
    }

    #[test]
    fn map_sector_reprograms_the_same_slot_from_disk() {
        let fake = Arc::new(FakeVm::new());
        let vm: Arc<dyn VmHandle> = fake.clone();
        let mut window = OptionRomWindow::new(vm, vec![0u8; OPTION_ROM_SIZE]).unwrap();

        let mut disk = tempfile::tempfile().unwrap();
        disk.write_all(&[0u8; 4096]).unwrap();

        window.map_sector(disk.as_raw_fd(), 512, 512).unwrap();
        assert!(fake.slot_mapped(SLOT_OPTION_ROM));
        assert_eq!(fake.slot_guest_addr(SLOT_OPTION_ROM), Some(GuestAddress(OPTION_ROM_GUEST_ADDR)));
    }
}
