//! The programmable interval timer (spec §4.4, §3 "PIT channel state"):
//! three 16-bit countdown channels driven off a monotonic clock and a
//! shared prescaler, with the classic 8254 mode/access/latch/readback
//! sub-protocol. Generalized from `original_source/Timer.{hpp,cpp}`.

use std::time::Duration;
use std::time::Instant;

use crate::error::Result;
use crate::pio::PioDevice;
use crate::prescaler::PrescalerSubscriber;

/// 25 MHz source clock.
const SOURCE_CLOCK_PERIOD_NS: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    InterruptOnTerminalCount,
    HardwareRetriggerableOneShot,
    RateGenerator,
    SquareWaveGenerator,
    SoftwareTriggeredStrobe,
    HardwareTriggeredStrobe,
}

impl OperatingMode {
    fn from_bits(bits: u8) -> OperatingMode {
        // Modes 6 and 7 alias modes 2 and 3 on real 8254/82C54 hardware.
        match bits & 0x7 {
            0 => OperatingMode::InterruptOnTerminalCount,
            1 => OperatingMode::HardwareRetriggerableOneShot,
            2 | 6 => OperatingMode::RateGenerator,
            3 | 7 => OperatingMode::SquareWaveGenerator,
            4 => OperatingMode::SoftwareTriggeredStrobe,
            _ => OperatingMode::HardwareTriggeredStrobe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    LatchCountValue,
    LowByteOnly,
    HighByteOnly,
    LowByteHighByte,
}

impl AccessMode {
    fn from_bits(bits: u8) -> AccessMode {
        match bits & 0x3 {
            0 => AccessMode::LatchCountValue,
            1 => AccessMode::LowByteOnly,
            2 => AccessMode::HighByteOnly,
            _ => AccessMode::LowByteHighByte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    Binary,
    Bcd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteSelect {
    Low,
    High,
    Status,
}

struct ChannelState {
    last_record: Instant,
    value: u16,
    latch: u16,
    reload: u16,
    pending_load: bool,
    waiting_for_load: bool,
    output_state: bool,
    access_mode: AccessMode,
    operating_mode: OperatingMode,
    number_format: NumberFormat,
    write_byte: ByteSelect,
    access_byte: ByteSelect,
    latched: bool,
}

impl ChannelState {
    fn new(now: Instant) -> ChannelState {
        ChannelState {
            last_record: now,
            value: 0,
            latch: 0,
            reload: 0,
            pending_load: false,
            waiting_for_load: true,
            output_state: false,
            access_mode: AccessMode::LowByteHighByte,
            operating_mode: OperatingMode::InterruptOnTerminalCount,
            number_format: NumberFormat::Binary,
            write_byte: ByteSelect::Low,
            access_byte: ByteSelect::Low,
            latched: false,
        }
    }
}

pub struct Pit {
    prescaler: u16,
    channels: [ChannelState; 3],
}

impl Pit {
    pub fn new() -> Pit {
        let now = Instant::now();
        Pit {
            prescaler: 2,
            channels: [ChannelState::new(now), ChannelState::new(now), ChannelState::new(now)],
        }
    }

    fn tick_period(&self) -> Duration {
        Duration::from_nanos(SOURCE_CLOCK_PERIOD_NS * self.prescaler.max(1) as u64)
    }

    /// Advances every channel's countdown by the elapsed host time since its
    /// last resolution, wrapping through `(reload + 1)` on overflow. Called
    /// lazily on every register access and on prescaler change (spec §4.4).
    fn resolve_timers(&mut self) {
        let now = Instant::now();
        let tick_period = self.tick_period();
        for channel in &mut self.channels {
            if channel.waiting_for_load {
                continue;
            }

            let elapsed = now.saturating_duration_since(channel.last_record);
            channel.last_record = now;
            let ticks = (elapsed.as_nanos() / tick_period.as_nanos().max(1)) as u64;

            if ticks > channel.value as u64 {
                let remaining = ticks - channel.value as u64;
                let modulus = channel.reload as u64 + 1;
                let remaining = remaining % modulus;
                channel.value = (channel.reload as u64 - remaining) as u16;
                channel.pending_load = false;
            } else {
                channel.value -= ticks as u16;
            }
        }
    }

    fn write_register(&mut self, index: usize, value: u8) {
        let channel = &mut self.channels[index];
        channel.pending_load = true;
        let current_reload = channel.reload;

        match channel.write_byte {
            ByteSelect::Low => {
                channel.reload = match channel.number_format {
                    NumberFormat::Binary => (current_reload & 0xFF00) | value as u16,
                    NumberFormat::Bcd => current_reload - (current_reload % 100) + value as u16,
                };
                if channel.access_mode == AccessMode::LowByteHighByte {
                    channel.write_byte = ByteSelect::High;
                } else if channel.waiting_for_load {
                    channel.waiting_for_load = false;
                    channel.pending_load = false;
                    channel.value = channel.reload;
                    channel.last_record = Instant::now();
                }
            }
            ByteSelect::High => {
                channel.reload = match channel.number_format {
                    NumberFormat::Binary => (current_reload & 0x00FF) | ((value as u16) << 8),
                    NumberFormat::Bcd => 100 * value as u16 + (current_reload % 100),
                };
                if channel.access_mode == AccessMode::LowByteHighByte {
                    channel.write_byte = ByteSelect::Low;
                }
                if channel.waiting_for_load {
                    channel.waiting_for_load = false;
                    channel.pending_load = false;
                    channel.value = channel.reload;
                    channel.last_record = Instant::now();
                }
            }
            ByteSelect::Status => unreachable!("channel write_byte is never Status"),
        }
    }

    fn read_register(&mut self, index: usize) -> u8 {
        self.resolve_timers();
        let channel = &mut self.channels[index];
        let value = if channel.latched { channel.latch } else { channel.value };

        let result = match channel.access_byte {
            ByteSelect::Low => match channel.number_format {
                NumberFormat::Binary => (value & 0xFF) as u8,
                NumberFormat::Bcd => (value % 100) as u8,
            },
            ByteSelect::High => match channel.number_format {
                NumberFormat::Binary => ((value >> 8) & 0xFF) as u8,
                NumberFormat::Bcd => (value / 100) as u8,
            },
            ByteSelect::Status => {
                let number_format = matches!(channel.number_format, NumberFormat::Bcd) as u8;
                let operating_mode = match channel.operating_mode {
                    OperatingMode::InterruptOnTerminalCount => 0,
                    OperatingMode::HardwareRetriggerableOneShot => 1,
                    OperatingMode::RateGenerator => 2,
                    OperatingMode::SquareWaveGenerator => 3,
                    OperatingMode::SoftwareTriggeredStrobe => 4,
                    OperatingMode::HardwareTriggeredStrobe => 5,
                };
                let access_mode = match channel.access_mode {
                    AccessMode::LatchCountValue => 0,
                    AccessMode::LowByteOnly => 1,
                    AccessMode::HighByteOnly => 2,
                    AccessMode::LowByteHighByte => 3,
                };
                let pending_load = (channel.pending_load || channel.waiting_for_load) as u8;
                let output_state = channel.output_state as u8;
                number_format | (operating_mode << 1) | (access_mode << 4) | (pending_load << 6) | (output_state << 7)
            }
        };

        match channel.access_byte {
            ByteSelect::Low => {
                if channel.access_mode == AccessMode::LowByteOnly {
                    channel.latched = false;
                } else {
                    channel.access_byte = ByteSelect::High;
                }
            }
            ByteSelect::High => {
                channel.latched = false;
                if channel.access_mode != AccessMode::HighByteOnly {
                    channel.access_byte = ByteSelect::Low;
                }
            }
            ByteSelect::Status => {
                channel.access_byte = if channel.access_mode == AccessMode::HighByteOnly {
                    ByteSelect::High
                } else {
                    ByteSelect::Low
                };
            }
        }

        result
    }

    fn write_command(&mut self, command: u8) {
        self.resolve_timers();
        let channel_select = (command >> 6) & 0x3;

        if channel_select == 3 {
            // Readback command.
            let read_channel = [command & 0x2 != 0, command & 0x4 != 0, command & 0x8 != 0];
            let latch_status = command & 0x20 != 0;
            let latch_count = command & 0x10 != 0;

            for (i, channel) in self.channels.iter_mut().enumerate() {
                if !read_channel[i] {
                    continue;
                }
                channel.access_byte = if !latch_status {
                    ByteSelect::Status
                } else if channel.access_mode == AccessMode::HighByteOnly {
                    ByteSelect::High
                } else {
                    ByteSelect::Low
                };

                if !latch_count {
                    channel.latch = channel.value;
                    channel.latched = true;
                }
            }
            return;
        }

        let index = channel_select as usize;
        let access_mode = AccessMode::from_bits((command >> 4) & 0x3);

        if access_mode == AccessMode::LatchCountValue {
            let channel = &mut self.channels[index];
            channel.latch = channel.value;
            channel.latched = true;
            return;
        }

        let channel = &mut self.channels[index];
        channel.access_mode = access_mode;
        channel.operating_mode = OperatingMode::from_bits((command >> 1) & 0x7);
        channel.number_format = if command & 1 != 0 { NumberFormat::Bcd } else { NumberFormat::Binary };
        channel.waiting_for_load = true;

        match access_mode {
            AccessMode::LowByteHighByte | AccessMode::LowByteOnly => {
                channel.access_byte = ByteSelect::Low;
                channel.write_byte = ByteSelect::Low;
            }
            AccessMode::HighByteOnly => {
                channel.access_byte = ByteSelect::High;
                channel.write_byte = ByteSelect::High;
            }
            AccessMode::LatchCountValue => unreachable!(),
        }
    }
}

impl Default for Pit {
    fn default() -> Self {
        Pit::new()
    }
}

impl PrescalerSubscriber for Pit {
    fn set_prescaler(&mut self, prescaler: u16) {
        self.resolve_timers();
        self.prescaler = prescaler;
    }
}

impl PioDevice for Pit {
    // Only the 8-bit interface is implemented, per spec §4.4.
    fn iowrite8(&mut self, address: u64, data: u8) -> Result<()> {
        // Corrected per the redesign flag: the original C++ wrote
        // `address & 0x3 == 0x03`, which under precedence is
        // `address & (0x3 == 0x03)` = `address & 1`.
        if (address & 0x3) == 0x03 {
            self.write_command(data);
        } else {
            self.write_register((address & 0x3) as usize, data);
        }
        Ok(())
    }

    fn ioread8(&mut self, address: u64) -> Result<u8> {
        if (address & 0x3) == 0x03 {
            Ok(0)
        } else {
            Ok(self.read_register((address & 0x3) as usize))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn countdown_decreases_with_elapsed_ticks() {
        let mut pit = Pit::new();
        pit.set_prescaler(2);

        // command: channel 0, access LowHigh, mode 2, binary = 0x34
        pit.iowrite8(3, 0x34).unwrap();
        pit.iowrite8(0, 0x00).unwrap();
        pit.iowrite8(0, 0x80).unwrap(); // reload = 0x8000

        sleep(Duration::from_millis(1));

        let low = pit.ioread8(0).unwrap();
        let high = pit.ioread8(0).unwrap();
        let value = (high as u16) << 8 | low as u16;
        assert!(value < 0x8000);
        assert!(value > 0x8000 - 20_000);
    }

    #[test]
    fn latch_isolates_value_until_fully_read() {
        let mut pit = Pit::new();
        pit.iowrite8(3, 0x34).unwrap();
        pit.iowrite8(0, 0x00).unwrap();
        pit.iowrite8(0, 0x10).unwrap(); // reload = 0x1000

        // Latch command for channel 0 (access field = LatchCountValue = 00).
        pit.iowrite8(3, 0x00).unwrap();
        let low_before = pit.ioread8(0).unwrap();
        sleep(Duration::from_millis(1));
        let low_after = pit.ioread8(0).unwrap();
        assert_eq!(low_before, low_after);
    }

    #[test]
    fn bcd_reload_wraps_modulo_100_per_byte() {
        let mut pit = Pit::new();
        // command: channel 0, LowHigh, mode 0, BCD = 0x31
        pit.iowrite8(3, 0x31).unwrap();
        pit.iowrite8(0, 50).unwrap();
        pit.iowrite8(0, 12).unwrap();
        assert_eq!(pit.channels[0].reload, 1250);
    }

    #[test]
    fn status_byte_reports_configured_modes() {
        let mut pit = Pit::new();
        pit.iowrite8(3, 0x34).unwrap(); // channel 0, LowHigh, mode 2, binary
        pit.iowrite8(0, 0).unwrap();
        pit.iowrite8(0, 1).unwrap();

        // Readback command: channel 0, latch status, don't latch count.
        pit.iowrite8(3, 0xE2).unwrap();
        let status = pit.ioread8(0).unwrap();
        assert_eq!(status & 0x1, 0); // binary
        assert_eq!((status >> 1) & 0x7, 2); // rate generator
        assert_eq!((status >> 4) & 0x3, 3); // LowByteHighByte
    }
}
