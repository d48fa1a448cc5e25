#![cfg_attr(not(test), no_std)]

pub mod filter;

pub use filter::{AdaptiveFilter, ChannelState, Phase};

/// Returned by numeric threshold queries for a channel index outside the filter
pub const THRESHOLD_SENTINEL: f32 = -1.0;
/// Returned by raw value queries for a channel index outside the filter
pub const TOUCH_VALUE_SENTINEL: i32 = -1;

/// Source of raw capacitive readings
///
/// A touch lowers the raw value. Reads are expected to be fast and bounded, and
/// are treated as infallible: a driver that fails to complete an acquisition
/// should report a value that reads as "not touched" (e.g. its max count).
pub trait TouchSensor {
    /// Identifies one electrode to the driver
    type Channel: Copy;

    fn read(&mut self, channel: Self::Channel) -> u16;
}

/// Millisecond time source and blocking delay
pub trait Clock {
    /// Free-running, wrapping millisecond counter
    fn now_ms(&self) -> u32;
    /// Block for at least `ms` milliseconds. Only used during calibration.
    fn delay_ms(&mut self, ms: u32);
}

/// Configuration for an adaptive touch filter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterConfig {
    /// Spacing of calibration samples, in ms. Also the unit of the steady-state
    /// step size, so it should match the `update` cadence.
    pub sample_period_ms: u32,
    /// Length of the bootstrap phase after calibration, in ms
    pub init_duration_ms: u32,
    /// Time constant of the steady-state drift, in ms
    pub filter_period_ms: u32,
    /// Value in [0, 1]. Setting it through the filter scales `factor` and
    /// `offset` by `1 - sensitivity`.
    pub sensitivity: f32,
    /// Number of deviations below the baseline required to detect a touch
    pub factor: f32,
    /// Fixed margin below the baseline required to detect a touch. Also speeds up
    /// bootstrap convergence.
    pub offset: f32,
    /// Number of samples averaged into the initial deviation estimate
    pub num_init_samples: u32,
}

impl FilterConfig {
    const fn default() -> Self {
        Self {
            sample_period_ms: 10,
            init_duration_ms: 5000,
            filter_period_ms: 10000,
            sensitivity: 0.0,
            factor: 6.0,
            offset: 20.0,
            num_init_samples: 20,
        }
    }

    const fn extended() -> Self {
        Self {
            sensitivity: 0.5,
            factor: 12.0,
            offset: 40.0,
            ..Self::default()
        }
    }
}

pub const DEFAULT_FILTER_CONFIG: FilterConfig = FilterConfig::default();
/// Wider margins intended to be narrowed with `set_sensitivity`
pub const EXTENDED_FILTER_CONFIG: FilterConfig = FilterConfig::extended();

pub(crate) fn clamp_sensitivity(sensitivity: f32) -> f32 {
    if sensitivity.is_nan() {
        0.0
    } else {
        sensitivity.clamp(0.0, 1.0)
    }
}
