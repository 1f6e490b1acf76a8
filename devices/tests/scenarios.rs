//! End-to-end scenarios exercising several devices together through a
//! single `Bus`, the way the VM loop dispatches real guest exits (spec §8).

use std::io::Read as _;
use std::io::Write as _;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use devices::a20::A20Gate;
use devices::chipselect::ChipSelectUnit;
use devices::cmos::Rtc;
use devices::flash::FlashMemoryWindow;
use devices::flash::JedecFlash;
use devices::misc::PostCode;
use devices::pio::PioDevice;
use devices::pit::Pit;
use devices::reactor::Reactor;
use devices::serial::Serial;
use devices::AddressRange;
use devices::Bus;
use devices::IoSize;
use hypervisor::fake::FakeVm;
use parking_lot::Mutex;

fn write8(bus: &Bus, port: u64, value: u8) {
    let (offset, device) = bus.find(port).expect("device registered at port");
    device.lock().pio_write(offset, IoSize::Byte, value as u64);
}

fn read8(bus: &Bus, port: u64) -> u8 {
    let (offset, device) = bus.find(port).expect("device registered at port");
    device.lock().pio_read(offset, IoSize::Byte) as u8
}

/// S1: a POST code write through the bus reaches the device without
/// requiring any other peripheral to be present.
#[test]
fn post_code_dispatches_through_bus() {
    let mut bus = Bus::new();
    bus.insert(AddressRange::new(0x80, 1), Arc::new(Mutex::new(PostCode))).unwrap();
    write8(&bus, 0x80, 0x42);
}

/// S3: PIT channel 0 counts down after being armed through the bus exactly
/// as it would when driven by repeated guest `outb`/`inb` exits.
#[test]
fn pit_channel_counts_down_through_bus() {
    let mut bus = Bus::new();
    bus.insert(AddressRange::new(0x40, 4), Arc::new(Mutex::new(Pit::new()))).unwrap();

    write8(&bus, 0x43, 0x34); // channel 0, LowHigh, mode 2, binary
    write8(&bus, 0x40, 0x00);
    write8(&bus, 0x40, 0x80); // reload = 0x8000

    std::thread::sleep(std::time::Duration::from_millis(1));

    let low = read8(&bus, 0x40) as u16;
    let high = read8(&bus, 0x40) as u16;
    let value = (high << 8) | low;
    assert!(value < 0x8000);
}

/// S6: RTC register A and the century register are reachable through the
/// shared index/data pair at 0x70/0x71.
#[test]
fn rtc_index_data_pair_resolves_through_bus() {
    let mut bus = Bus::new();
    bus.insert(AddressRange::new(0x70, 2), Arc::new(Mutex::new(Rtc::new()))).unwrap();

    write8(&bus, 0x70, 0x0A);
    let _register_a = read8(&bus, 0x71);

    write8(&bus, 0x70, 0x32);
    let century = read8(&bus, 0x71);
    // BCD-encoded century for any year in this millennium starts with 0x2_.
    assert_eq!(century & 0xF0, 0x20);
}

/// S5 (configuration half): the BIOS-flash chip-select unit (index 7) is
/// pre-seeded to decode the same window the A20 gate's wrap alias would
/// otherwise shadow, and coexists on the bus with the gate itself.
#[test]
fn chip_select_and_a20_gate_coexist_on_bus() {
    let mut bus = Bus::new();
    bus.insert(AddressRange::new(0x92, 1), Arc::new(Mutex::new(A20Gate::new()))).unwrap();
    bus.insert(
        AddressRange::new(0xF400 + 7 * 8, 8),
        Arc::new(Mutex::new(ChipSelectUnit::with_registers(0xFFFF, 0xFF6F, 0xFFFF, 0xFFFF))),
    )
    .unwrap();

    write8(&bus, 0x92, 0x02);
    assert_eq!(read8(&bus, 0x92), 0x02);

    let (offset, device) = bus.find(0xF400 + 7 * 8).unwrap();
    assert_eq!(device.lock().pio_read(offset, IoSize::Word) as u16, 0xFF6F);
}

/// S2: a byte written to the data register by the guest reaches a
/// connected host socket, and a byte written by the host client becomes
/// readable through the same register, exactly as the bus would dispatch
/// a real guest `outb`/`inb` exit against the UART.
#[test]
fn uart_bytes_round_trip_through_bus_and_host_socket() {
    let path = std::env::temp_dir().join(format!("ts3100vmm-scenario-s2-{}-{}", std::process::id(), line!()));
    let _ = std::fs::remove_file(&path);

    let reactor = Reactor::new().unwrap();
    let vm = FakeVm::new();
    let serial = Serial::start(&path, reactor, &vm, 4).unwrap();

    let mut bus = Bus::new();
    bus.insert(AddressRange::new(0x3f8, 8), Arc::new(Mutex::new(serial))).unwrap();

    let mut client = UnixStream::connect(&path).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    write8(&bus, 0x3f8, b'Q');
    std::thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(buf[0], b'Q');

    client.write_all(&[b'R']).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(read8(&bus, 0x3f8), b'R');

    let _ = std::fs::remove_file(&path);
}

struct NullFlashWindow;
impl FlashMemoryWindow for NullFlashWindow {
    fn unmap_flash_region(&mut self) {}
    fn remap_flash_region(&mut self) {}
}

/// S4: the JEDEC unlock sequence followed by a byte-program command
/// writes the backing array exactly as BIOS flashing code would drive it
/// (the flash controller is addressed directly by a relative offset
/// rather than through a `Bus`, matching the VM loop's own MMIO
/// dispatch, which never routes flash accesses through `Bus`).
#[test]
fn jedec_unlock_and_program_sequence_updates_backing_array() {
    let mut flash = JedecFlash::new(vec![0xFFu8; 0x10000], Box::new(NullFlashWindow));

    flash.write(0x555, 0xAA).unwrap();
    flash.write(0x2AA, 0x55).unwrap();
    flash.write(0x555, 0xA0).unwrap();
    flash.write(0x10, 0x7E).unwrap();

    assert_eq!(flash.read(0x10), 0x7E);
}
