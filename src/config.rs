//! Command-line configuration (spec §6, SPEC_FULL §3.3). Mirrors the
//! teacher's `argh`-derived `RunCommand` in shape, trimmed to the single
//! flat set of flags this emulator needs.

use std::path::PathBuf;

use argh::FromArgs;

/// Run the 386EX single-board-computer emulator.
#[derive(FromArgs, Debug)]
pub struct Args {
    /// path to the flash image backing BIOS/DOS/product-ID reads
    #[argh(option, default = "PathBuf::from(\"roms/flash.bin\")")]
    pub flash: PathBuf,

    /// path to the RTC NVRAM backing file
    #[argh(option, default = "PathBuf::from(\"/tmp/3100.rtc.bin\")")]
    pub rtc_nvram: PathBuf,

    /// host socket path for COM1
    #[argh(option, default = "PathBuf::from(\"/tmp/3100.com1.socket\")")]
    pub com1: PathBuf,

    /// host socket path for COM2
    #[argh(option, default = "PathBuf::from(\"/tmp/3100.com2.socket\")")]
    pub com2: PathBuf,

    /// host socket path for COM3
    #[argh(option, default = "PathBuf::from(\"/tmp/3100.com3.socket\")")]
    pub com3: PathBuf,

    /// host socket path for COM4
    #[argh(option, default = "PathBuf::from(\"/tmp/3100.com4.socket\")")]
    pub com4: PathBuf,

    /// backing file for the optional virtual-disk LBA window
    #[argh(option)]
    pub disk: Option<PathBuf>,

    /// option ROM image mapped at 0xC8000 when `--disk` is given
    #[argh(option, default = "PathBuf::from(\"roms/virtual-disk/option.rom\")")]
    pub option_rom: PathBuf,

    /// increase log verbosity (repeatable)
    #[argh(switch, short = 'v')]
    pub verbose: u8,
}

impl Args {
    pub fn com_path(&self, port: usize) -> &std::path::Path {
        match port {
            0 => &self.com1,
            1 => &self.com2,
            2 => &self.com3,
            _ => &self.com4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_paths() {
        let args = Args::from_args(&["ts3100vmm"], &[]).unwrap();
        assert_eq!(args.flash, PathBuf::from("roms/flash.bin"));
        assert_eq!(args.rtc_nvram, PathBuf::from("/tmp/3100.rtc.bin"));
        assert_eq!(args.com1, PathBuf::from("/tmp/3100.com1.socket"));
        assert!(args.disk.is_none());
    }

    #[test]
    fn verbose_counts_repetitions() {
        let args = Args::from_args(&["ts3100vmm"], &["-v", "-v"]).unwrap();
        assert_eq!(args.verbose, 2);
    }
}
