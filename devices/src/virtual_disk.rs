//! The optional virtual-disk LBA window (spec §4.9 "MMIO ... virtual-disk
//! LBA window", SPEC_FULL §6): a tiny PIO register pair that lets guest
//! firmware page 512-byte-aligned sectors of a backing disk image into the
//! option-ROM guest window on demand. Compiled in unconditionally but only
//! ever registered on the bus when a backing disk path is configured.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use crate::error::DeviceError;
use crate::error::Result;
use crate::pio::PioDevice;

const SECTOR_SIZE: u64 = 512;
const CONTROL_UPDATE_MAPPING: u32 = 1 << 0;

/// Hook the VM loop implements to actually `mmap` a sector range from the
/// backing disk descriptor into the option-ROM guest window.
pub trait DiskWindow: Send {
    fn map_sector(&mut self, disk_fd: RawFd, byte_offset: u64, length: usize) -> std::io::Result<()>;
}

pub struct VirtualDisk {
    backing: File,
    window: Box<dyn DiskWindow>,
    lba: u32,
    control: u32,
}

impl VirtualDisk {
    pub fn new(backing: File, window: Box<dyn DiskWindow>) -> VirtualDisk {
        VirtualDisk {
            backing,
            window,
            lba: 0,
            control: 0,
        }
    }

    fn update_mapping(&mut self) -> Result<()> {
        let byte_offset = self.lba as u64 * SECTOR_SIZE;
        self.window
            .map_sector(self.backing.as_raw_fd(), byte_offset, SECTOR_SIZE as usize)
            .map_err(|e| DeviceError::ConfigurationFailure(format!("mmap sector at lba {}: {}", self.lba, e)))
    }
}

impl PioDevice for VirtualDisk {
    fn iowrite32(&mut self, offset: u64, data: u32) -> Result<()> {
        match offset & 0x7 {
            0 => self.lba = data,
            4 => {
                self.control = data;
                if data & CONTROL_UPDATE_MAPPING != 0 {
                    self.update_mapping()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn ioread32(&mut self, offset: u64) -> Result<u32> {
        Ok(match offset & 0x7 {
            0 => self.lba,
            4 => self.control,
            _ => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWindow {
        last_offset: Option<u64>,
    }
    impl DiskWindow for Arc<Mutex<RecordingWindow>> {
        fn map_sector(&mut self, _disk_fd: RawFd, byte_offset: u64, _length: usize) -> std::io::Result<()> {
            self.lock().unwrap().last_offset = Some(byte_offset);
            Ok(())
        }
    }

    #[test]
    fn control_strobe_maps_sector_at_lba_times_512() {
        let file = tempfile::tempfile().unwrap();
        let recorder = Arc::new(Mutex::new(RecordingWindow::default()));
        let mut disk = VirtualDisk::new(file, Box::new(recorder.clone()));

        disk.iowrite32(0, 4).unwrap(); // lba = 4
        disk.iowrite32(4, CONTROL_UPDATE_MAPPING).unwrap();

        assert_eq!(recorder.lock().unwrap().last_offset, Some(4 * SECTOR_SIZE));
    }

    #[test]
    fn registers_roundtrip_without_strobe() {
        let file = tempfile::tempfile().unwrap();
        let recorder = Arc::new(Mutex::new(RecordingWindow::default()));
        let mut disk = VirtualDisk::new(file, Box::new(recorder));

        disk.iowrite32(0, 7).unwrap();
        assert_eq!(disk.ioread32(0).unwrap(), 7);
        assert_eq!(disk.ioread32(4).unwrap(), 0);
    }
}
