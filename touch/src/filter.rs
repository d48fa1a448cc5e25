//! Adaptive baseline filter for capacitive touch channels.
//!
//! Each channel tracks a resting level (`baseline`) and a typical noise amplitude
//! (`deviation`). A channel is touched while its raw value sits below
//! `baseline - factor * deviation - offset`.
//!
//! After a blocking calibration, the filter runs in two phases. During the
//! bootstrap phase, both estimates move a fixed fraction of the way towards each
//! new sample, so they converge quickly from their single-sample seed. After
//! that, they move by a constant step per update. The step is small enough that
//! a touch lasting a few seconds is not absorbed into the baseline, while slow
//! drift from temperature or humidity still is.

use libm::fabsf;
use log::{debug, info, trace};

use crate::{
    clamp_sensitivity, Clock, FilterConfig, TouchSensor, DEFAULT_FILTER_CONFIG,
    THRESHOLD_SENTINEL, TOUCH_VALUE_SENTINEL,
};

/// Which update rule the filter applies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// `initialize` has not run yet; updates are ignored
    Uncalibrated,
    /// Proportional correction, for `init_duration_ms` after calibration
    Bootstrap,
    /// Fixed-step drift tracking
    Steady,
}

/// Filter state for a single channel
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelState {
    /// Estimate of the untouched raw value
    pub baseline: f32,
    /// Estimate of the typical absolute deviation from `baseline` when untouched
    pub deviation: f32,
    /// Steady-state step applied to `baseline`, fixed at calibration
    pub step_baseline: f32,
    /// Steady-state step applied to `deviation`, fixed at calibration
    pub step_deviation: f32,
    /// Most recent raw reading
    pub raw: u16,
}

impl ChannelState {
    pub fn threshold(&self, config: &FilterConfig) -> f32 {
        self.baseline - config.factor * self.deviation - config.offset
    }

    pub fn touched(&self, config: &FilterConfig) -> bool {
        (self.raw as f32) < self.threshold(config)
    }

    fn calibrate(&mut self, reference: u16, total_deviation: f32, config: &FilterConfig) {
        self.baseline = reference as f32;
        self.deviation = if config.num_init_samples > 0 {
            total_deviation / config.num_init_samples as f32
        } else {
            0.0
        };

        if config.filter_period_ms > 0 {
            let sample_period = config.sample_period_ms as f32;
            let filter_period = config.filter_period_ms as f32;
            self.step_baseline = self.baseline * sample_period / filter_period;
            self.step_deviation = self.deviation * sample_period / filter_period;
        } else {
            self.step_baseline = 0.0;
            self.step_deviation = 0.0;
        }
    }

    /// Move both estimates `gain` of the way towards the new sample
    fn bootstrap(&mut self, value: u16, gain: f32) {
        let diff = value as f32 - self.baseline;
        self.baseline += gain * diff;
        self.deviation += gain * (fabsf(diff) - self.deviation);
    }

    fn track(&mut self, value: u16) {
        let value = value as f32;
        let diff = value - self.baseline;

        if value > self.baseline {
            self.baseline += self.step_baseline;
        } else {
            self.baseline -= self.step_baseline;
        }

        if diff * diff > self.deviation * self.deviation {
            self.deviation += self.step_deviation;
        } else {
            // Never step below zero
            self.deviation -= self.step_deviation.min(self.deviation);
        }
    }
}

/// Touch detector for `N` channels read from one sensor
///
/// The channel list is fixed at construction; queries take an index into it.
/// Out-of-range indices never panic and return a sentinel instead.
pub struct AdaptiveFilter<S: TouchSensor, C: Clock, const N: usize> {
    sensor: S,
    clock: C,
    channels: [S::Channel; N],
    state: [ChannelState; N],
    config: FilterConfig,
    start_ms: Option<u32>,
    steady: bool,
}

impl<S: TouchSensor, C: Clock, const N: usize> AdaptiveFilter<S, C, N> {
    /// Create an uncalibrated filter. `initialize` must be called before the
    /// filter produces meaningful results.
    pub fn new(sensor: S, clock: C, channels: [S::Channel; N], config: Option<FilterConfig>) -> Self {
        let mut config = config.unwrap_or(DEFAULT_FILTER_CONFIG);
        config.sensitivity = clamp_sensitivity(config.sensitivity);
        Self {
            sensor,
            clock,
            channels,
            state: [ChannelState::default(); N],
            config,
            start_ms: None,
            steady: false,
        }
    }

    /// Calibrate every channel, blocking for `N * num_init_samples * sample_period_ms`.
    ///
    /// The first reading of each channel becomes its baseline, and the mean absolute
    /// difference of the following `num_init_samples` readings becomes its deviation.
    /// The channels must not be touched meanwhile. Calling this again recalibrates
    /// from scratch and restarts the bootstrap phase.
    pub fn initialize(&mut self) {
        let config = self.config;

        for i in 0..N {
            let channel = self.channels[i];
            let reference = self.sensor.read(channel);
            let mut last = reference;
            let mut total_deviation = 0.0;

            for _ in 0..config.num_init_samples {
                last = self.sensor.read(channel);
                total_deviation += fabsf(last as f32 - reference as f32);
                self.clock.delay_ms(config.sample_period_ms);
            }

            let state = &mut self.state[i];
            state.calibrate(reference, total_deviation, &config);
            state.raw = last;
            debug!(
                "touch ch{}: baseline {} deviation {} steps {}/{}",
                i, state.baseline, state.deviation, state.step_baseline, state.step_deviation
            );
        }

        self.start_ms = Some(self.clock.now_ms());
        self.steady = false;
        info!("touch calibrated {} channels", N);
    }

    /// Read every channel and advance its estimates
    ///
    /// Should be called every `sample_period_ms`. Returns the phase that was
    /// applied.
    pub fn update(&mut self) -> Phase {
        let phase = self.phase();
        match phase {
            Phase::Uncalibrated => return phase,
            Phase::Steady if !self.steady => {
                self.steady = true;
                info!("touch filter entering steady state");
            }
            _ => {}
        }

        let gain = match phase {
            Phase::Bootstrap => Some(self.bootstrap_gain()),
            _ => None,
        };
        for i in 0..N {
            let value = self.sensor.read(self.channels[i]);
            let state = &mut self.state[i];
            state.raw = value;
            match gain {
                Some(gain) => state.bootstrap(value, gain),
                None => state.track(value),
            }
            trace!("touch ch{}: raw {} baseline {} deviation {}", i, value, state.baseline, state.deviation);
        }

        phase
    }

    pub fn phase(&self) -> Phase {
        match self.start_ms {
            None => Phase::Uncalibrated,
            // Latched so that a wrap of the millisecond counter cannot re-enter bootstrap
            Some(_) if self.steady => Phase::Steady,
            Some(start) => {
                if self.clock.now_ms().wrapping_sub(start) < self.config.init_duration_ms {
                    Phase::Bootstrap
                } else {
                    Phase::Steady
                }
            }
        }
    }

    /// Only meaningful in bootstrap, where `init_duration_ms` is non-zero
    fn bootstrap_gain(&self) -> f32 {
        let gain = (self.config.offset + 2.0 * self.config.sample_period_ms as f32)
            / self.config.init_duration_ms as f32;
        gain.clamp(0.0, 1.0)
    }

    /// True if the latest reading of `channel` is below its threshold
    pub fn is_touched(&self, channel: usize) -> bool {
        self.state
            .get(channel)
            .map_or(false, |state| state.touched(&self.config))
    }

    /// Take a fresh reading of `channel`, then compare it against its threshold
    pub fn poll_touched(&mut self, channel: usize) -> bool {
        match self.sample(channel) {
            Some(_) => self.is_touched(channel),
            None => false,
        }
    }

    /// `baseline - factor * deviation - offset`, or `THRESHOLD_SENTINEL` for an
    /// invalid channel
    pub fn threshold(&self, channel: usize) -> f32 {
        self.state
            .get(channel)
            .map_or(THRESHOLD_SENTINEL, |state| state.threshold(&self.config))
    }

    /// Latest raw reading, or `TOUCH_VALUE_SENTINEL` for an invalid channel
    pub fn touch_value(&self, channel: usize) -> i32 {
        self.state
            .get(channel)
            .map_or(TOUCH_VALUE_SENTINEL, |state| state.raw as i32)
    }

    /// Take a fresh reading of `channel` and return it, or `TOUCH_VALUE_SENTINEL`
    /// for an invalid channel
    pub fn read_touch_value(&mut self, channel: usize) -> i32 {
        self.sample(channel).map_or(TOUCH_VALUE_SENTINEL, i32::from)
    }

    fn sample(&mut self, channel: usize) -> Option<u16> {
        let id = *self.channels.get(channel)?;
        let value = self.sensor.read(id);
        self.state[channel].raw = value;
        Some(value)
    }

    pub fn channel_state(&self, channel: usize) -> Option<&ChannelState> {
        self.state.get(channel)
    }

    pub fn channels(&self) -> &[S::Channel; N] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        N
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    /// Give back the sensor and clock
    pub fn release(self) -> (S, C) {
        (self.sensor, self.clock)
    }

    /// Clamp `sensitivity` to [0, 1], then scale the current `factor` and `offset`
    /// by `1 - sensitivity`.
    ///
    /// The scaling applies to the values in effect at the time of the call, so
    /// repeated calls compound: setting 0.5 twice leaves a quarter of the
    /// starting margins. Reset `factor` and `offset` first to get an absolute
    /// setting.
    pub fn set_sensitivity(&mut self, sensitivity: f32) {
        let sensitivity = clamp_sensitivity(sensitivity);
        self.config.sensitivity = sensitivity;
        self.config.factor *= 1.0 - sensitivity;
        self.config.offset *= 1.0 - sensitivity;
    }

    pub fn sensitivity(&self) -> f32 {
        self.config.sensitivity
    }

    /// Does not affect step sizes until the next `initialize`
    pub fn set_sample_period_ms(&mut self, sample_period_ms: u32) {
        self.config.sample_period_ms = sample_period_ms;
    }

    pub fn sample_period_ms(&self) -> u32 {
        self.config.sample_period_ms
    }

    pub fn set_init_duration_ms(&mut self, init_duration_ms: u32) {
        self.config.init_duration_ms = init_duration_ms;
    }

    pub fn init_duration_ms(&self) -> u32 {
        self.config.init_duration_ms
    }

    /// Does not affect step sizes until the next `initialize`
    pub fn set_filter_period_ms(&mut self, filter_period_ms: u32) {
        self.config.filter_period_ms = filter_period_ms;
    }

    pub fn filter_period_ms(&self) -> u32 {
        self.config.filter_period_ms
    }

    pub fn set_factor(&mut self, factor: f32) {
        self.config.factor = factor;
    }

    pub fn factor(&self) -> f32 {
        self.config.factor
    }

    pub fn set_offset(&mut self, offset: f32) {
        self.config.offset = offset;
    }

    pub fn offset(&self) -> f32 {
        self.config.offset
    }

    pub fn set_num_init_samples(&mut self, num_init_samples: u32) {
        self.config.num_init_samples = num_init_samples;
    }

    pub fn num_init_samples(&self) -> u32 {
        self.config.num_init_samples
    }
}
