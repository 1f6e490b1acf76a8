//! Trivial fixed-value PIO handlers (spec §4.11, supplemented from
//! `original_source/main.cpp`'s static `ioHandlerTable`). Each of these
//! exists purely so guest firmware probing for expected hardware IDs gets
//! the answer it expects; none of them has internal state worth modeling
//! beyond the one byte the original table hard-codes.

use crate::error::Result;
use crate::pio::PioDevice;

macro_rules! fixed_read_device {
    ($name:ident, $value:expr) => {
        #[derive(Debug, Default)]
        pub struct $name;

        impl PioDevice for $name {
            fn ioread8(&mut self, _offset: u64) -> Result<u8> {
                Ok($value)
            }
        }
    };
}

fixed_read_device!(Keyboard, 0x00);
fixed_read_device!(ProductCode, 0x01);
fixed_read_device!(OptionCode, 0x00);
fixed_read_device!(JumperRegister, 0x02);
fixed_read_device!(ManufacturerSpecific, 0x00);
fixed_read_device!(Port1Pin, 0x80);

/// Port `0x80`: the BIOS POST-code sink. Write-only; every byte written is
/// logged at `info!` so progress can be traced without a debugger attached
/// (spec scenario S1).
#[derive(Debug, Default)]
pub struct PostCode;

impl PioDevice for PostCode {
    fn iowrite8(&mut self, _offset: u64, data: u8) -> Result<()> {
        log::info!("POST CODE: {:02x}", data);
        Ok(())
    }
}

/// Port `0xF834`: the 386EX "Timer Control Register" latch. Plain
/// read/write storage with no side effects; actual PIT channel behavior
/// lives entirely in `devices::pit::Pit`.
#[derive(Debug, Default)]
pub struct TimerConfiguration {
    value: u8,
}

impl PioDevice for TimerConfiguration {
    fn iowrite8(&mut self, _offset: u64, data: u8) -> Result<()> {
        self.value = data;
        Ok(())
    }

    fn ioread8(&mut self, _offset: u64) -> Result<u8> {
        Ok(self.value)
    }
}

/// Port `0x72`: the LCD controller stub. No display is emulated; accesses
/// are only logged so unexpected guest probing is visible in traces.
#[derive(Debug, Default)]
pub struct Lcd;

impl PioDevice for Lcd {
    fn iowrite8(&mut self, offset: u64, data: u8) -> Result<()> {
        log::debug!("lcd stub write: offset={:#x} data={:#04x}", offset, data);
        Ok(())
    }

    fn ioread8(&mut self, offset: u64) -> Result<u8> {
        log::debug!("lcd stub read: offset={:#x}", offset);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_value_devices_ignore_offset() {
        let mut keyboard = Keyboard;
        assert_eq!(keyboard.ioread8(0).unwrap(), 0x00);
        assert_eq!(keyboard.ioread8(4).unwrap(), 0x00);

        let mut jumper = JumperRegister;
        assert_eq!(jumper.ioread8(0).unwrap(), 0x02);
    }

    #[test]
    fn timer_configuration_latch_roundtrips() {
        let mut latch = TimerConfiguration::default();
        latch.iowrite8(0, 0x5A).unwrap();
        assert_eq!(latch.ioread8(0).unwrap(), 0x5A);
    }

    #[test]
    fn lcd_stub_reads_zero() {
        let mut lcd = Lcd;
        assert_eq!(lcd.ioread8(1).unwrap(), 0);
    }
}
