//! Timing and debounce knobs for the bring-up loop.

use core::time::Duration;

use thiserror::Error;

use crate::telemetry::{DEFAULT_STABLE_RUN, STATUS_HISTORY_CAPACITY};

/// Default delay between ticks; bounds both sampling cadence and key latency.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a faulted tick before the machine restarts.
pub const DEFAULT_FAULT_PAUSE: Duration = Duration::from_secs(2);

/// Delay between entering `FpgaActive` and sending the smoke-test image.
pub const DEFAULT_BOOT_SETTLE: Duration = Duration::from_secs(1);

/// Ticks spent in each half of the power-cycle stress loop.
pub const DEFAULT_STRESS_HALF_PERIOD: u32 = 40;

/// Largest run that still leaves room for the doubled device-loss window.
pub const MAX_STABLE_RUN: usize = STATUS_HISTORY_CAPACITY / 2;

/// Rejected configuration values.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("stable run must be between 1 and {max}, got {value}")]
    StableRun { value: usize, max: usize },
    #[error("tick interval must be non-zero")]
    ZeroTickInterval,
    #[error("stress half-period must be non-zero")]
    ZeroStressHalfPeriod,
}

/// Runtime configuration for [`crate::machine::BringupMachine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BringupConfig {
    pub tick_interval: Duration,
    /// Consecutive samples required before a predicate counts as stable.
    pub stable_run: usize,
    pub fault_pause: Duration,
    pub boot_settle: Duration,
    pub stress_half_period: u32,
}

impl BringupConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            stable_run: DEFAULT_STABLE_RUN,
            fault_pause: DEFAULT_FAULT_PAUSE,
            boot_settle: DEFAULT_BOOT_SETTLE,
            stress_half_period: DEFAULT_STRESS_HALF_PERIOD,
        }
    }

    /// Sets the tick interval.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroTickInterval`] for a zero duration.
    pub const fn with_tick_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        self.tick_interval = interval;
        Ok(self)
    }

    /// Sets the debounce run length.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::StableRun`] unless `1 <= run <= MAX_STABLE_RUN`.
    pub const fn with_stable_run(mut self, run: usize) -> Result<Self, ConfigError> {
        if run == 0 || run > MAX_STABLE_RUN {
            return Err(ConfigError::StableRun {
                value: run,
                max: MAX_STABLE_RUN,
            });
        }
        self.stable_run = run;
        Ok(self)
    }

    #[must_use]
    pub const fn with_fault_pause(mut self, pause: Duration) -> Self {
        self.fault_pause = pause;
        self
    }

    #[must_use]
    pub const fn with_boot_settle(mut self, settle: Duration) -> Self {
        self.boot_settle = settle;
        self
    }

    /// Sets the stress loop half-period in ticks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroStressHalfPeriod`] for zero.
    pub const fn with_stress_half_period(mut self, ticks: u32) -> Result<Self, ConfigError> {
        if ticks == 0 {
            return Err(ConfigError::ZeroStressHalfPeriod);
        }
        self.stress_half_period = ticks;
        Ok(self)
    }

    /// Run length used by the device-loss override.
    #[must_use]
    pub const fn device_loss_run(&self) -> usize {
        self.stable_run * 2
    }
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self::new()
    }
}
