//! The 386EX clock prescaler (spec §4.7): a broadcast 16-bit register that
//! distributes a divisor to subscribers (the PIT). Generalized from
//! `original_source/i386EXClockPrescaler.{hpp,cpp}`, which held a fixed
//! `std::vector<std::shared_ptr<Prescalable>>`; here subscribers are held
//! behind `Weak` so a torn-down PIT doesn't keep the prescaler alive.

use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::error::Result;
use crate::pio::PioDevice;

/// Implemented by any device whose tick rate depends on the shared
/// prescaler divisor (in practice, only `Pit`).
pub trait PrescalerSubscriber: Send {
    fn set_prescaler(&mut self, prescaler: u16);
}

pub struct ClockPrescaler {
    prescaler: u16,
    subscribers: Vec<Weak<Mutex<dyn PrescalerSubscriber>>>,
}

impl ClockPrescaler {
    pub fn new() -> ClockPrescaler {
        ClockPrescaler {
            prescaler: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Weak<Mutex<dyn PrescalerSubscriber>>) {
        self.subscribers.push(subscriber);
    }

    fn broadcast(&self) {
        // The hardware register stores "divisor - 2"; subscribers receive
        // the adjusted, actual divisor.
        let adjusted = self.prescaler.wrapping_add(2);
        for subscriber in &self.subscribers {
            if let Some(subscriber) = subscriber.upgrade() {
                subscriber.lock().set_prescaler(adjusted);
            }
        }
    }
}

impl Default for ClockPrescaler {
    fn default() -> Self {
        ClockPrescaler::new()
    }
}

impl PioDevice for ClockPrescaler {
    fn iowrite8(&mut self, offset: u64, data: u8) -> Result<()> {
        let shift = (offset & 1) * 8;
        let mask = 0xFFu16 << shift;
        self.prescaler = (self.prescaler & !mask) | ((data as u16) << shift);
        self.broadcast();
        Ok(())
    }

    fn iowrite16(&mut self, _offset: u64, data: u16) -> Result<()> {
        self.prescaler = data;
        self.broadcast();
        Ok(())
    }

    fn ioread8(&mut self, offset: u64) -> Result<u8> {
        Ok(((self.prescaler >> ((offset & 1) * 8)) & 0xFF) as u8)
    }

    fn ioread16(&mut self, _offset: u64) -> Result<u16> {
        Ok(self.prescaler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(u16);
    impl PrescalerSubscriber for Recorder {
        fn set_prescaler(&mut self, prescaler: u16) {
            self.0 = prescaler;
        }
    }

    #[test]
    fn broadcast_adds_two_to_raw_register() {
        let mut prescaler = ClockPrescaler::new();
        let recorder: Arc<Mutex<dyn PrescalerSubscriber>> = Arc::new(Mutex::new(Recorder(0)));
        prescaler.subscribe(Arc::downgrade(&recorder));

        prescaler.iowrite16(0, 5).unwrap();
        assert_eq!(recorder.lock().0, 7);
    }

    #[test]
    fn byte_writes_update_respective_half() {
        let mut prescaler = ClockPrescaler::new();
        prescaler.iowrite8(0, 0xCD).unwrap();
        prescaler.iowrite8(1, 0xAB).unwrap();
        assert_eq!(prescaler.ioread16(0).unwrap(), 0xABCD);
    }

    #[test]
    fn dropped_subscriber_is_silently_skipped() {
        let mut prescaler = ClockPrescaler::new();
        {
            let recorder: Arc<Mutex<dyn PrescalerSubscriber>> = Arc::new(Mutex::new(Recorder(0)));
            prescaler.subscribe(Arc::downgrade(&recorder));
        }
        // recorder has been dropped; broadcasting must not panic.
        prescaler.iowrite16(0, 1).unwrap();
    }
}
