//! Trigger engine - detects trigger conditions and computes capture windows
//!
//! State machine:
//! - Idle: waiting for a sample at or above the level (soft trigger) or for
//!   any sample at all (hard trigger, the device gates delivery itself)
//! - Armed: collecting until the window is complete
//! - Complete: a [`TriggerWindow`] is emitted, the engine returns to idle
//!   (or stops waiting in single-shot mode)
//!
//! Sample indices live in a circular buffer of `buffer_len` slots, so the
//! completion test works on the wrapped distance from the start index.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::decoder::SampleEvent;
use crate::transport::Capabilities;

/// Captured time span around a trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerWindow {
    /// Window start in microseconds
    pub from_us: f64,
    /// Window end in microseconds
    pub to_us: f64,
    /// Buffer index at which the trigger armed
    pub start_index: u64,
    /// Buffer index at which the window completed
    pub end_index: u64,
}

impl TriggerWindow {
    pub fn duration_us(&self) -> f64 {
        self.to_us - self.from_us
    }
}

/// Result of a completed trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerCompletion {
    pub window: TriggerWindow,
    /// Single-shot hard trigger fired: the transport must be stopped
    pub stop_transport: bool,
}

/// Samples in a window of `length_ms` at the given sampling period
pub fn window_size(length_ms: f64, sampling_period_us: f64) -> u64 {
    (length_ms * 1000.0 / sampling_period_us).floor().max(0.0) as u64
}

/// Trigger engine
#[derive(Debug, Clone)]
pub struct TriggerEngine {
    level_ua: f32,
    window_size: u64,
    shifted_index: u64,
    sampling_period_us: f64,
    buffer_len: u64,
    hard_trigger: bool,
    single_shot: bool,
    waiting: bool,
    start_index: Option<u64>,
    windows_emitted: u64,
}

impl TriggerEngine {
    pub fn new(config: &TriggerConfig, sampling_period_us: f64, caps: &Capabilities) -> Self {
        let window_size = window_size(config.length_ms, sampling_period_us);
        if window_size >= config.buffer_len {
            warn!(
                window_size,
                buffer_len = config.buffer_len,
                "Trigger window does not fit the buffer, soft triggers never complete"
            );
        }
        let shifted_index = if caps.pre_post_trigger {
            window_size / 2 + (config.offset_us / sampling_period_us).ceil().max(0.0) as u64
        } else {
            0
        };
        Self {
            level_ua: config.level_ua,
            window_size,
            shifted_index,
            sampling_period_us,
            buffer_len: config.buffer_len.max(1),
            hard_trigger: caps.hard_trigger,
            single_shot: config.single_shot,
            waiting: true,
            start_index: None,
            windows_emitted: 0,
        }
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn shifted_index(&self) -> u64 {
        self.shifted_index
    }

    pub fn is_armed(&self) -> bool {
        self.start_index.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted
    }

    pub fn set_level(&mut self, level_ua: f32) {
        self.level_ua = level_ua;
    }

    /// Wait for the next trigger (after a single-shot window)
    pub fn rearm(&mut self) {
        self.waiting = true;
        self.start_index = None;
    }

    /// Drop any window in progress and stop waiting
    pub fn cancel(&mut self) {
        self.waiting = false;
        self.start_index = None;
    }

    /// Feed one sample at buffer position `index`
    pub fn process(&mut self, sample: &SampleEvent, index: u64) -> Option<TriggerCompletion> {
        if !self.waiting {
            return None;
        }
        let index = index % self.buffer_len;

        let start = match self.start_index {
            Some(start) => start,
            None => {
                let fire = self.hard_trigger
                    || sample.value.map_or(false, |v| v >= self.level_ua);
                if !fire {
                    return None;
                }
                debug!(index, value = ?sample.value, "Trigger armed");
                self.start_index = Some(index);
                index
            }
        };

        let elapsed = (index + self.buffer_len - start) % self.buffer_len;
        let complete = if self.hard_trigger {
            sample.end_of_burst
        } else {
            elapsed >= self.window_size
        };
        if !complete {
            return None;
        }

        let from_us = (start as f64 - self.shifted_index as f64) * self.sampling_period_us;
        let window = TriggerWindow {
            from_us,
            to_us: from_us + elapsed as f64 * self.sampling_period_us,
            start_index: start,
            end_index: index,
        };
        self.start_index = None;
        self.windows_emitted += 1;

        let stop_transport = self.single_shot && self.hard_trigger;
        if self.single_shot {
            self.waiting = false;
        }
        info!(
            from_us = window.from_us,
            to_us = window.to_us,
            single_shot = self.single_shot,
            "Trigger window complete"
        );

        Some(TriggerCompletion {
            window,
            stop_transport,
        })
    }
}
