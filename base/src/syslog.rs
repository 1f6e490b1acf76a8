//! Logging initialization, trimmed down from crosvm's `base::syslog` to a
//! single `env_logger`-backed sink: every device and the VM loop log
//! through the `log` facade rather than `eprintln!`/`printf`.

use std::io::Write;

use log::LevelFilter;

#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub default_level: LevelFilter,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            default_level: LevelFilter::Info,
        }
    }
}

/// Initializes the global logger. Honors `RUST_LOG` if set; otherwise falls
/// back to `config.default_level`. Safe to call once at process start.
pub fn init(config: LogConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.default_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        )
    });
    // init() panics if called twice; that's acceptable for a
    // single-process-start call site.
    let _ = builder.try_init();
}

/// Raises the default level by `extra_verbosity` steps (each `-v` on the
/// command line), clamping at `Trace`.
pub fn level_for_verbosity(extra_verbosity: u8) -> LevelFilter {
    let levels = [
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];
    levels[(extra_verbosity as usize).min(levels.len() - 1)]
}
