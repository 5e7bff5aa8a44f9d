//! Command-line flags shared by the host and emulator binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::bitstream::BitstreamLoader;
use crate::config::{BringupConfig, ConfigError, DEFAULT_STRESS_HALF_PERIOD};
use crate::telemetry::DEFAULT_STABLE_RUN;

/// Bring-up timing and the optional bitstream image.
#[derive(Clone, Debug, Args)]
pub struct BringupArgs {
    /// FPGA bitstream to verify and program. Without it the flash check is
    /// skipped and boards only get the power and smoke tests.
    pub bitstream: Option<PathBuf>,

    /// Delay between ticks, in milliseconds.
    #[arg(long, default_value_t = 100, env = "SIGNTEST_TICK_MS")]
    pub tick_ms: u64,

    /// Consecutive samples before a signal counts as stable (1-64).
    #[arg(long, default_value_t = DEFAULT_STABLE_RUN, env = "SIGNTEST_STABLE_RUN")]
    pub stable_run: usize,

    /// Pause after a failed tick, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub fault_pause_ms: u64,

    /// Wait between FPGA boot and the smoke test, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub boot_settle_ms: u64,

    /// Ticks per half of the power-cycle stress loop.
    #[arg(long, default_value_t = DEFAULT_STRESS_HALF_PERIOD)]
    pub stress_half_period: u32,
}

impl BringupArgs {
    /// Validated machine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] raised by the setters.
    pub fn config(&self) -> Result<BringupConfig, ConfigError> {
        Ok(BringupConfig::new()
            .with_tick_interval(Duration::from_millis(self.tick_ms))?
            .with_stable_run(self.stable_run)?
            .with_stress_half_period(self.stress_half_period)?
            .with_fault_pause(Duration::from_millis(self.fault_pause_ms))
            .with_boot_settle(Duration::from_millis(self.boot_settle_ms)))
    }

    /// Loader for the bitstream argument, if one was given.
    #[must_use]
    pub fn loader(&self) -> Option<BitstreamLoader> {
        self.bitstream.as_ref().map(BitstreamLoader::new)
    }
}
