// Copyright 2026 xspress-streamer contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hardware abstraction for the detector readout.
//!
//! The real SDK binding lives outside this crate; anything that can produce
//! frames behind the [`FrameSource`] capability plugs into the engine. The
//! built-in [`SimSource`] generates synthetic spectra at a configured rate
//! and is both the default source and the test stand-in.

use std::time::{Duration, Instant};

use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::SourceError;
use crate::frame::{ChannelScalars, ExposureConfig};

/// Simulated acquisition clock rate, ticks per second. The Xspress3 family
/// timestamps frames with an 80 MHz clock.
pub const ACQ_CLOCK_HZ: u64 = 80_000_000;

/// A frame as delivered by the hardware, before the engine assigns an index.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub spectral_data: Array2<u32>,
    pub scalars: Vec<ChannelScalars>,
    /// Acquisition-clock tick count at capture.
    pub timestamp: u64,
}

/// Outcome of one bounded fetch.
#[derive(Debug)]
pub enum Fetch {
    Frame(RawFrame),
    /// No frame became available within the timeout. Not an error; the
    /// acquisition may be gated or waiting for a trigger.
    Timeout,
}

/// Blocking "fetch next frame or time out" capability over the detector.
///
/// `fetch` must return within roughly the given timeout; `stop` must be safe
/// to call after a fault. Implementations run on the engine's dedicated
/// thread, so they may block internally but never indefinitely.
pub trait FrameSource: Send {
    fn start(&mut self, exposure: &ExposureConfig) -> Result<(), SourceError>;

    fn stop(&mut self);

    fn fetch(&mut self, timeout: Duration) -> Result<Fetch, SourceError>;
}

/// Synthetic frame source producing deterministic pseudo-spectra.
///
/// Frames become available at a fixed period; `fetch` sleeps until the next
/// frame is due or the timeout expires, mirroring a blocking SDK call.
pub struct SimSource {
    channels: usize,
    bins: usize,
    frame_period: Duration,
    rng: SmallRng,
    started_at: Option<Instant>,
    produced: u64,
    frame_time_s: f64,
}

impl SimSource {
    pub fn new(channels: usize, bins: usize, frame_period: Duration) -> Self {
        Self::with_seed(channels, bins, frame_period, 0x5a17)
    }

    pub fn with_seed(channels: usize, bins: usize, frame_period: Duration, seed: u64) -> Self {
        Self {
            channels,
            bins,
            frame_period,
            rng: SmallRng::seed_from_u64(seed),
            started_at: None,
            produced: 0,
            frame_time_s: 0.001,
        }
    }

    fn synth_frame(&mut self) -> RawFrame {
        let peak = self.bins / 3;
        let spectral_data = Array2::from_shape_fn((self.channels, self.bins), |(c, b)| {
            // A broad peak per channel plus uniform background noise.
            let distance = (b as i64 - (peak + c * 7) as i64).unsigned_abs();
            let signal = 1000u32.saturating_sub((distance * distance / 4) as u32);
            signal + self.rng.gen_range(0..20)
        });
        let scalars = (0..self.channels)
            .map(|c| {
                let all_events: f64 = spectral_data.row(c).iter().map(|&v| v as f64).sum();
                let dtc = 1.0 + self.rng.gen_range(0.0..0.05);
                ChannelScalars {
                    all_events,
                    all_good: all_events * 0.97,
                    clock_ticks: self.frame_time_s * ACQ_CLOCK_HZ as f64,
                    total_ticks: self.frame_time_s * ACQ_CLOCK_HZ as f64,
                    reset_ticks: self.rng.gen_range(0.0..100.0),
                    dead_time_correction: dtc,
                    output_count_rate: all_events / self.frame_time_s,
                    event_width: 6.0,
                }
            })
            .collect();
        // Tick count advances by one frame period per frame.
        let ticks_per_frame =
            (self.frame_period.as_secs_f64() * ACQ_CLOCK_HZ as f64) as u64;
        let timestamp = (self.produced + 1) * ticks_per_frame.max(1);
        RawFrame {
            spectral_data,
            scalars,
            timestamp,
        }
    }
}

impl FrameSource for SimSource {
    fn start(&mut self, exposure: &ExposureConfig) -> Result<(), SourceError> {
        self.frame_time_s = exposure.frame_time_s;
        self.started_at = Some(Instant::now());
        self.produced = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.started_at = None;
    }

    fn fetch(&mut self, timeout: Duration) -> Result<Fetch, SourceError> {
        let started_at = self
            .started_at
            .ok_or_else(|| SourceError::new("fetch before start"))?;
        let next_due = self.frame_period * (self.produced as u32 + 1);
        let elapsed = started_at.elapsed();
        if elapsed < next_due {
            let wait = next_due - elapsed;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(Fetch::Timeout);
            }
            std::thread::sleep(wait);
        }
        let frame = self.synth_frame();
        self.produced += 1;
        Ok(Fetch::Frame(frame))
    }
}
