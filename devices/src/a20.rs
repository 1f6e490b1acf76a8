//! The A20 gate register (port `0x92`, spec §4.9/§8.9). Unlike the rest of
//! `devices::misc`, this register's bit 1 is consulted by the VM loop after
//! every I/O exit to decide whether the RAM-wrap alias at `0x100000` should
//! be mapped or unmapped; the device itself only tracks the bit.

use crate::error::Result;
use crate::pio::PioDevice;

const A20_ENABLE_BIT: u8 = 1 << 1;

#[derive(Debug, Default)]
pub struct A20Gate {
    register: u8,
}

impl A20Gate {
    pub fn new() -> A20Gate {
        A20Gate::default()
    }

    /// Whether the A20 line is currently enabled (guest sees the full
    /// 21-bit address space rather than the 8086 wraparound alias).
    pub fn enabled(&self) -> bool {
        self.register & A20_ENABLE_BIT != 0
    }
}

impl PioDevice for A20Gate {
    fn iowrite8(&mut self, _offset: u64, data: u8) -> Result<()> {
        self.register = data;
        Ok(())
    }

    fn ioread8(&mut self, _offset: u64) -> Result<u8> {
        Ok(self.register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_reflects_bit_one() {
        let mut gate = A20Gate::new();
        assert!(!gate.enabled());
        gate.iowrite8(0, A20_ENABLE_BIT).unwrap();
        assert!(gate.enabled());
    }

    #[test]
    fn other_bits_are_preserved_but_ignored_by_enabled() {
        let mut gate = A20Gate::new();
        gate.iowrite8(0, 0xFD).unwrap(); // all bits but bit 1
        assert!(!gate.enabled());
        assert_eq!(gate.ioread8(0).unwrap(), 0xFD);
    }
}
