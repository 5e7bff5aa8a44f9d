//! Status telemetry decoded from the test board, plus the rolling history the
//! state machine uses to debounce noisy sense and power-good signals.
//!
//! The board answers `ReadStatus` with a fixed 7-byte reply: three 14-bit ADC
//! readings (little-endian, expressed as a fraction of the 3.3 V reference)
//! followed by a flags byte carrying the sense pins and the PROG button.
//! Every predicate on [`StatusSample`] is a pure function of the sample; the
//! only temporal logic lives in [`StatusHistory::is_stable`].

use core::fmt;

use heapless::HistoryBuf;
use thiserror::Error;
use winnow::binary::le_u16;
use winnow::prelude::*;
use winnow::token::any;

/// Canonical timestamp units for status samples (microseconds since the clock epoch).
pub type TimestampMicros = u64;

/// Number of samples retained for stability checks and debugging.
pub const STATUS_HISTORY_CAPACITY: usize = 128;

/// Default debounce run length (about half a second at the 100 ms tick).
pub const DEFAULT_STABLE_RUN: usize = 5;

/// ADC reference voltage.
pub const ADC_REFERENCE_VOLTS: f32 = 3.3;

/// Full-scale ADC code (14 bits).
pub const ADC_FULL_SCALE: u16 = 0x3FFF;

/// Input rail threshold for the soft-on phase.
pub const SOFT_ON_MIN_VIN: f32 = 3.0;

/// Allowed deviation of a regulated rail from nominal.
pub const RAIL_TOLERANCE: f32 = 0.05;

const SENSE1_BIT: u8 = 1 << 0;
const SENSE2_BIT: u8 = 1 << 1;
const BUTTON_BIT: u8 = 1 << 2;

/// Voltage rails measured by the test board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rail {
    /// Board input supply, measured through a 1/3 divider.
    Vin,
    /// 3.3 V regulated rail, measured through a 1/2 divider.
    Rail3v3,
    /// 1.2 V regulated rail, measured through a 1/2 divider.
    Rail1v2,
}

impl Rail {
    /// Resistor divider ratio between the rail and the ADC pin.
    #[must_use]
    pub const fn divider(self) -> f32 {
        match self {
            Rail::Vin => 3.0,
            Rail::Rail3v3 | Rail::Rail1v2 => 2.0,
        }
    }

    /// Nominal voltage for regulated rails.
    #[must_use]
    pub const fn nominal(self) -> Option<f32> {
        match self {
            Rail::Vin => None,
            Rail::Rail3v3 => Some(3.3),
            Rail::Rail1v2 => Some(1.2),
        }
    }

    /// Converts a raw ADC code into volts on this rail.
    #[must_use]
    pub fn volts(self, raw: u16) -> f32 {
        ADC_REFERENCE_VOLTS * (f32::from(raw) / f32::from(ADC_FULL_SCALE)) * self.divider()
    }

    /// Converts volts on this rail back into the nearest ADC code, saturating at full scale.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn raw(self, volts: f32) -> u16 {
        let code = (volts / self.divider() / ADC_REFERENCE_VOLTS) * f32::from(ADC_FULL_SCALE);
        code.round().clamp(0.0, f32::from(ADC_FULL_SCALE)) as u16
    }
}

/// Errors raised while decoding a raw status reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum StatusDecodeError {
    #[error("status reply truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// One decoded status reply.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StatusSample {
    pub raw: [u8; StatusSample::RAW_LEN],
    pub vin: f32,
    pub v3v3: f32,
    pub v1v2: f32,
    /// `true` when SENSE1 reads 0 (board inserted).
    pub sense1: bool,
    /// `true` when SENSE2 reads 0 (board inserted).
    pub sense2: bool,
    /// `true` while the PROG button on the test board is held.
    pub button: bool,
    pub captured_at: TimestampMicros,
}

struct RawStatus {
    vin: u16,
    rail_3v3: u16,
    rail_1v2: u16,
    flags: u8,
}

fn raw_status(input: &mut &[u8]) -> winnow::Result<RawStatus> {
    let (vin, rail_3v3, rail_1v2, flags) = (le_u16, le_u16, le_u16, any).parse_next(input)?;
    Ok(RawStatus {
        vin,
        rail_3v3,
        rail_1v2,
        flags,
    })
}

impl StatusSample {
    /// Size of the `ReadStatus` reply.
    pub const RAW_LEN: usize = 7;

    /// Decodes a raw reply captured at `captured_at`. Trailing bytes are ignored.
    pub fn decode(raw: &[u8], captured_at: TimestampMicros) -> Result<Self, StatusDecodeError> {
        let truncated = StatusDecodeError::Truncated {
            expected: Self::RAW_LEN,
            actual: raw.len(),
        };
        let mut input = raw;
        let fields = raw_status(&mut input).map_err(|_| truncated)?;

        let mut bytes = [0u8; Self::RAW_LEN];
        bytes.copy_from_slice(&raw[..Self::RAW_LEN]);

        Ok(Self {
            raw: bytes,
            vin: Rail::Vin.volts(fields.vin),
            v3v3: Rail::Rail3v3.volts(fields.rail_3v3),
            v1v2: Rail::Rail1v2.volts(fields.rail_1v2),
            sense1: fields.flags & SENSE1_BIT == 0,
            sense2: fields.flags & SENSE2_BIT == 0,
            button: fields.flags & BUTTON_BIT != 0,
            captured_at,
        })
    }

    /// Builds the raw reply the firmware would send for the given readings.
    #[must_use]
    pub fn encode(
        vin: f32,
        v3v3: f32,
        v1v2: f32,
        sense1: bool,
        sense2: bool,
        button: bool,
    ) -> [u8; Self::RAW_LEN] {
        let mut raw = [0u8; Self::RAW_LEN];
        raw[0..2].copy_from_slice(&Rail::Vin.raw(vin).to_le_bytes());
        raw[2..4].copy_from_slice(&Rail::Rail3v3.raw(v3v3).to_le_bytes());
        raw[4..6].copy_from_slice(&Rail::Rail1v2.raw(v1v2).to_le_bytes());

        let mut flags = 0;
        if !sense1 {
            flags |= SENSE1_BIT;
        }
        if !sense2 {
            flags |= SENSE2_BIT;
        }
        if button {
            flags |= BUTTON_BIT;
        }
        raw[6] = flags;
        raw
    }

    /// Both sense pins report a seated board.
    #[must_use]
    pub fn both_sensed(&self) -> bool {
        self.sense1 && self.sense2
    }

    /// Neither sense pin reports a board.
    #[must_use]
    pub fn device_gone(&self) -> bool {
        !(self.sense1 || self.sense2)
    }

    /// Soft-on phase complete: the current-limited input rail has come up.
    #[must_use]
    pub fn soft_on_ok(&self) -> bool {
        self.vin > SOFT_ON_MIN_VIN
    }

    /// Both regulated rails are within tolerance.
    #[must_use]
    pub fn power_ok(&self) -> bool {
        within_tolerance(3.3, self.v3v3) && within_tolerance(1.2, self.v1v2)
    }
}

impl fmt::Display for StatusSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VIN:{:.2}V,3V3:{:.2}V,1V2:{:.2}V,S{}{}",
            self.vin,
            self.v3v3,
            self.v1v2,
            if self.sense1 { 't' } else { 'f' },
            if self.sense2 { 't' } else { 'f' },
        )
    }
}

/// Symmetric ratio test: 5 % high and 5 % low are treated alike.
fn within_tolerance(expected: f32, actual: f32) -> bool {
    let ratio = actual / expected;
    let deviation = if ratio < 1.0 { 1.0 - ratio } else { ratio - 1.0 };
    deviation < RAIL_TOLERANCE
}

/// Bounded FIFO of the most recent status samples.
#[derive(Clone)]
pub struct StatusHistory {
    ring: HistoryBuf<StatusSample, STATUS_HISTORY_CAPACITY>,
}

impl StatusHistory {
    /// Creates an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
        }
    }

    /// Appends a sample, evicting the oldest once the ring is full.
    pub fn push(&mut self, sample: StatusSample) {
        self.ring.write(sample);
    }

    /// Drops every stored sample.
    pub fn clear(&mut self) {
        self.ring = HistoryBuf::new();
    }

    /// Returns the most recent sample, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&StatusSample> {
        self.ring.recent()
    }

    /// Returns the number of samples currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no samples are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Iterates from the newest sample back to the oldest.
    pub fn newest_first(&self) -> impl Iterator<Item = &StatusSample> + '_ {
        let slice = self.ring.as_slice();
        let len = slice.len();
        let recent = self.ring.recent_index().unwrap_or(0);
        (0..len).map(move |offset| &slice[(recent + len - offset) % len])
    }

    /// Iterates from the oldest sample to the newest.
    pub fn oldest_first(&self) -> impl Iterator<Item = &StatusSample> + '_ {
        self.ring.oldest_ordered()
    }

    /// Returns `true` when the `run` most recent samples all satisfy `predicate`.
    ///
    /// Fewer than `run` samples is never stable. Only the newest `run` samples
    /// are inspected.
    pub fn is_stable<P>(&self, predicate: P, run: usize) -> bool
    where
        P: Fn(&StatusSample) -> bool,
    {
        if run == 0 || self.len() < run {
            return false;
        }
        self.newest_first().take(run).all(predicate)
    }
}

impl Default for StatusHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sense1: bool, sense2: bool, at: TimestampMicros) -> StatusSample {
        let raw = StatusSample::encode(5.0, 3.3, 1.2, sense1, sense2, false);
        StatusSample::decode(&raw, at).unwrap()
    }

    #[test]
    fn full_scale_code_on_half_divider_reads_six_point_six() {
        assert_eq!(Rail::Rail3v3.volts(ADC_FULL_SCALE), 6.6);
        assert_eq!(Rail::Rail1v2.volts(ADC_FULL_SCALE), 6.6);
        assert_eq!(Rail::Vin.volts(0), 0.0);
    }

    #[test]
    fn decodes_little_endian_readings_and_inverted_sense_bits() {
        let raw = [0xFF, 0x3F, 0x00, 0x20, 0x00, 0x00, 0b0000_0010];
        let decoded = StatusSample::decode(&raw, 42).unwrap();

        assert!((decoded.vin - 9.9).abs() < 1e-4);
        assert!((decoded.v3v3 - 3.3 * (f32::from(0x2000u16) / 16383.0) * 2.0).abs() < 1e-6);
        assert_eq!(decoded.v1v2, 0.0);
        assert!(decoded.sense1);
        assert!(!decoded.sense2);
        assert!(!decoded.button);
        assert_eq!(decoded.captured_at, 42);
        assert_eq!(decoded.raw, raw);
    }

    #[test]
    fn short_reply_is_rejected() {
        let err = StatusSample::decode(&[0, 0, 0, 0, 0, 0], 0).unwrap_err();
        assert_eq!(
            err,
            StatusDecodeError::Truncated {
                expected: 7,
                actual: 6
            }
        );
    }

    #[test]
    fn button_bit_is_active_high() {
        let raw = StatusSample::encode(0.0, 0.0, 0.0, false, false, true);
        let decoded = StatusSample::decode(&raw, 0).unwrap();
        assert!(decoded.button);
        assert!(decoded.device_gone());
    }

    #[test]
    fn sensed_and_gone_are_mutually_exclusive() {
        for (s1, s2) in [(false, false), (false, true), (true, false), (true, true)] {
            let decoded = sample(s1, s2, 0);
            assert!(!(decoded.both_sensed() && decoded.device_gone()));
        }
        assert!(sample(true, true, 0).both_sensed());
        assert!(sample(false, false, 0).device_gone());
        let half = sample(true, false, 0);
        assert!(!half.both_sensed() && !half.device_gone());
    }

    #[test]
    fn tolerance_is_symmetric_around_nominal() {
        let high = StatusSample::decode(&StatusSample::encode(5.0, 3.3 * 1.04, 1.2, true, true, false), 0)
            .unwrap();
        let low = StatusSample::decode(&StatusSample::encode(5.0, 3.3 * 0.96, 1.2, true, true, false), 0)
            .unwrap();
        let out = StatusSample::decode(&StatusSample::encode(5.0, 3.3, 1.2 * 0.94, true, true, false), 0)
            .unwrap();

        assert!(high.power_ok());
        assert!(low.power_ok());
        assert!(!out.power_ok());
    }

    #[test]
    fn soft_on_threshold() {
        let below = StatusSample::decode(&StatusSample::encode(2.9, 0.0, 0.0, true, true, false), 0)
            .unwrap();
        let above = StatusSample::decode(&StatusSample::encode(3.2, 0.0, 0.0, true, true, false), 0)
            .unwrap();
        assert!(!below.soft_on_ok());
        assert!(above.soft_on_ok());
    }

    #[test]
    fn stability_requires_full_run() {
        let mut history = StatusHistory::new();
        for at in 0..4 {
            history.push(sample(true, true, at));
            assert!(!history.is_stable(StatusSample::both_sensed, DEFAULT_STABLE_RUN));
        }
        history.push(sample(true, true, 4));
        assert!(history.is_stable(StatusSample::both_sensed, DEFAULT_STABLE_RUN));
        assert!(!history.is_stable(|_| true, DEFAULT_STABLE_RUN + 1));
    }

    #[test]
    fn a_single_glitch_breaks_stability() {
        let mut history = StatusHistory::new();
        for at in 0..10 {
            history.push(sample(true, true, at));
        }
        history.push(sample(false, true, 10));
        assert!(!history.is_stable(StatusSample::both_sensed, DEFAULT_STABLE_RUN));

        for at in 11..15 {
            history.push(sample(true, true, at));
        }
        assert!(!history.is_stable(StatusSample::both_sensed, DEFAULT_STABLE_RUN));
        history.push(sample(true, true, 15));
        assert!(history.is_stable(StatusSample::both_sensed, DEFAULT_STABLE_RUN));
    }

    #[test]
    fn history_evicts_oldest_and_keeps_order_after_wrap() {
        let mut history = StatusHistory::new();
        let total = STATUS_HISTORY_CAPACITY as u64 + 10;
        for at in 0..total {
            history.push(sample(true, true, at));
        }

        assert_eq!(history.len(), STATUS_HISTORY_CAPACITY);
        assert_eq!(history.latest().map(|s| s.captured_at), Some(total - 1));

        let newest: Vec<_> = history.newest_first().take(3).map(|s| s.captured_at).collect();
        assert_eq!(newest, vec![total - 1, total - 2, total - 3]);

        let oldest = history.oldest_first().next().map(|s| s.captured_at);
        assert_eq!(oldest, Some(10));
    }

    #[test]
    fn clear_resets_history() {
        let mut history = StatusHistory::new();
        for at in 0..6 {
            history.push(sample(false, false, at));
        }
        history.clear();
        assert!(history.is_empty());
        assert!(!history.is_stable(StatusSample::device_gone, 1));
    }
}
