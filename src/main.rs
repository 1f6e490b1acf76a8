//! Entry point: parses arguments, stands up the hypervisor, wires every
//! device onto the bus, and runs the VM loop until the guest halts or
//! `SIGINT` is observed. Mirrors the shape of crosvm's `main.rs` ->
//! `run_config` split, trimmed to this board's fixed device set.

mod config;
mod memory;
mod option_rom;
mod vmloop;

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use parking_lot::Mutex;

use devices::a20::A20Gate;
use devices::chipselect::ChipSelectUnit;
use devices::cmos::Rtc;
use devices::flash::JedecFlash;
use devices::misc::JumperRegister;
use devices::misc::Keyboard;
use devices::misc::Lcd;
use devices::misc::ManufacturerSpecific;
use devices::misc::OptionCode;
use devices::misc::Port1Pin;
use devices::misc::PostCode;
use devices::misc::ProductCode;
use devices::misc::TimerConfiguration;
use devices::pit::Pit;
use devices::prescaler::ClockPrescaler;
use devices::reactor::Reactor;
use devices::serial::Serial;
use devices::virtual_disk::VirtualDisk;
use devices::AddressRange;
use devices::Bus;
use hypervisor::VmHandle;

use crate::memory::MemoryLayout;
use crate::option_rom::OptionRomWindow;
use crate::vmloop::LoggingFlashWindow;
use crate::vmloop::VmLoop;

const COM_BASES: [u16; 4] = [0x3f8, 0x2f8, 0x3e8, 0x2e8];
const COM_GSIS: [u32; 4] = [4, 5, 6, 7];
const CHIP_SELECT_BASE: u64 = 0xF400;
const CHIP_SELECT_UNIT_SPAN: u64 = 8;
const VIRTUAL_DISK_BASE: u64 = 0xF870;

fn main() -> Result<()> {
    let args: config::Args = argh::from_env();

    base::syslog::init(base::syslog::LogConfig {
        default_level: base::syslog::level_for_verbosity(args.verbose),
    });
    base::signal::install_exit_handler().context("install SIGINT handler")?;

    let flash_image = read_exact_file(&args.flash, memory::FLASH_SIZE)
        .with_context(|| format!("read flash image {}", args.flash.display()))?;

    let vm = make_vm()?;
    let memory = MemoryLayout::new(vm.as_ref(), flash_image.clone()).context("set up guest memory")?;
    let vcpu = vm.create_vcpu(0).context("create vcpu")?;
    vm.create_irq_chip().context("create irq chip")?;

    let reactor = Reactor::new().context("start event reactor")?;
    let mut bus = Bus::new();

    for (index, base_port) in COM_BASES.iter().enumerate() {
        let serial = Serial::start(
            args.com_path(index),
            reactor.try_clone().context("clone reactor")?,
            vm.as_ref(),
            COM_GSIS[index],
        )
        .with_context(|| format!("start COM{}", index + 1))?;
        bus.insert(AddressRange::new(*base_port as u64, 8), Arc::new(Mutex::new(serial)))
            .with_context(|| format!("register COM{}", index + 1))?;
    }

    let pit = Arc::new(Mutex::new(Pit::new()));
    bus.insert(AddressRange::new(0x40, 4), pit.clone()).context("register PIT")?;

    let mut prescaler = ClockPrescaler::new();
    prescaler.subscribe(Arc::downgrade(&pit));
    bus.insert(AddressRange::new(0xF804, 2), Arc::new(Mutex::new(prescaler))).context("register prescaler")?;

    bus.insert(AddressRange::new(0x60, 5), Arc::new(Mutex::new(Keyboard))).context("register keyboard")?;

    let rtc_nvram = std::fs::read(&args.rtc_nvram).unwrap_or_default();
    let mut rtc = Rtc::new();
    rtc.load_nvram(&rtc_nvram);
    let rtc = Arc::new(Mutex::new(rtc));
    bus.insert(AddressRange::new(0x70, 2), rtc.clone()).context("register rtc")?;

    bus.insert(AddressRange::new(0x72, 2), Arc::new(Mutex::new(Lcd))).context("register lcd")?;
    bus.insert(AddressRange::new(0x74, 1), Arc::new(Mutex::new(ProductCode))).context("register product code")?;
    bus.insert(AddressRange::new(0x75, 1), Arc::new(Mutex::new(OptionCode))).context("register option code")?;
    bus.insert(AddressRange::new(0x77, 1), Arc::new(Mutex::new(JumperRegister))).context("register jumper register")?;
    bus.insert(AddressRange::new(0x80, 1), Arc::new(Mutex::new(PostCode))).context("register post code")?;
    bus.insert(AddressRange::new(0x92, 1), Arc::new(Mutex::new(A20Gate::new()))).context("register a20 gate")?;
    bus.insert(AddressRange::new(0x198, 8), Arc::new(Mutex::new(ManufacturerSpecific)))
        .context("register manufacturer-specific")?;

    // Index 7 is pre-seeded to decode the BIOS flash shadow window, matching
    // the original board's fixed chip-select configuration.
    for index in 0..8u64 {
        let unit = if index == 7 {
            ChipSelectUnit::with_registers(0xFFFF, 0xFF6F, 0xFFFF, 0xFFFF)
        } else {
            ChipSelectUnit::new()
        };
        let range = AddressRange::new(CHIP_SELECT_BASE + index * CHIP_SELECT_UNIT_SPAN, CHIP_SELECT_UNIT_SPAN);
        bus.insert(range, Arc::new(Mutex::new(unit))).with_context(|| format!("register chip-select unit {}", index))?;
    }

    bus.insert(AddressRange::new(0xF834, 1), Arc::new(Mutex::new(TimerConfiguration::default())))
        .context("register timer configuration")?;
    bus.insert(AddressRange::new(0xF860, 1), Arc::new(Mutex::new(Port1Pin))).context("register port1 pin")?;

    if let Some(disk_path) = &args.disk {
        let option_rom_image = read_exact_file(&args.option_rom, option_rom::OPTION_ROM_SIZE)
            .with_context(|| format!("read option rom image {}", args.option_rom.display()))?;
        let window = OptionRomWindow::new(vm.clone(), option_rom_image).context("install option rom window")?;
        let disk_file = File::open(disk_path).with_context(|| format!("open disk image {}", disk_path.display()))?;
        let disk = VirtualDisk::new(disk_file, Box::new(window));
        bus.insert(AddressRange::new(VIRTUAL_DISK_BASE, 8), Arc::new(Mutex::new(disk)))
            .context("register virtual disk")?;
    }

    let flash = JedecFlash::new(flash_image, Box::new(LoggingFlashWindow));

    let mut vm_loop = VmLoop::new(vm, vcpu, bus, flash, memory);
    let result = vm_loop.run();

    if let Err(e) = persist_rtc_nvram(&args.rtc_nvram, &rtc) {
        log::warn!("failed to persist RTC NVRAM: {}", e);
    }

    result
}

#[cfg(feature = "kvm")]
fn make_vm() -> Result<Arc<dyn VmHandle>> {
    Ok(Arc::new(hypervisor::kvm::KvmVm::new().context("open /dev/kvm")?))
}

#[cfg(not(feature = "kvm"))]
fn make_vm() -> Result<Arc<dyn VmHandle>> {
    anyhow::bail!("this build was compiled without the kvm feature; no hypervisor backend is available")
}

fn read_exact_file(path: &std::path::Path, expected_len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    anyhow::ensure!(
        buf.len() == expected_len,
        "flash image must be exactly {:#x} bytes, got {:#x}",
        expected_len,
        buf.len()
    );
    Ok(buf)
}

fn persist_rtc_nvram(path: &std::path::Path, rtc: &Arc<Mutex<Rtc>>) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(rtc.lock().nvram())
}
