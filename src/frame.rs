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

// Data model shared by the engine, the wire protocol and the writer.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Per-channel scalar quantities read out alongside each histogram.
///
/// `dead_time_correction` is the multiplicative factor compensating for
/// detector inactive periods; the rest are raw counters from the card.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelScalars {
    pub all_events: f64,
    pub all_good: f64,
    pub clock_ticks: f64,
    pub total_ticks: f64,
    pub reset_ticks: f64,
    pub dead_time_correction: f64,
    pub output_count_rate: f64,
    pub event_width: f64,
}

impl ChannelScalars {
    /// Column order of [`Self::to_row`], persisted as a dataset attribute.
    pub const COLUMNS: [&'static str; 8] = [
        "all_events",
        "all_good",
        "clock_ticks",
        "total_ticks",
        "reset_ticks",
        "dead_time_correction",
        "output_count_rate",
        "event_width",
    ];

    pub fn to_row(&self) -> [f64; 8] {
        [
            self.all_events,
            self.all_good,
            self.clock_ticks,
            self.total_ticks,
            self.reset_ticks,
            self.dead_time_correction,
            self.output_count_rate,
            self.event_width,
        ]
    }
}

/// One acquisition tick's payload. Immutable once produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Strictly increasing by 1 within a session, assigned by the engine in
    /// source delivery order.
    pub index: u64,
    /// Histogram matrix, channels x energy bins.
    pub spectral_data: Array2<u32>,
    pub scalars: Vec<ChannelScalars>,
    /// Acquisition-clock tick count at capture. Hardware-sourced, monotonic,
    /// not wall-clock.
    pub timestamp: u64,
}

impl Frame {
    pub fn channels(&self) -> usize {
        self.spectral_data.nrows()
    }

    pub fn bins(&self) -> usize {
        self.spectral_data.ncols()
    }

    /// Raw little-endian payload bytes as sent on the data channel.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.spectral_data.len() * 4);
        for v in self.spectral_data.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Rebuild the histogram matrix from wire payload bytes.
    pub fn matrix_from_payload(
        payload: &[u8],
        channels: usize,
        bins: usize,
    ) -> Result<Array2<u32>, String> {
        if payload.len() != channels * bins * 4 {
            return Err(format!(
                "payload is {} bytes, expected {} for {}x{} u32",
                payload.len(),
                channels * bins * 4,
                channels,
                bins
            ));
        }
        let values: Vec<u32> = payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Array2::from_shape_vec((channels, bins), values).map_err(|e| e.to_string())
    }
}

/// Per-frame exposure/trigger parameters, forwarded to the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureConfig {
    pub frame_time_s: f64,
    pub n_triggers: u32,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            frame_time_s: 0.001,
            n_triggers: 1,
        }
    }
}

impl ExposureConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.frame_time_s.is_finite() || self.frame_time_s <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "frame_time_s must be > 0, got {}",
                self.frame_time_s
            )));
        }
        if self.n_triggers == 0 {
            return Err(EngineError::InvalidConfig(
                "n_triggers must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for one bounded acquisition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum frame count. The session buffer never wraps; reaching this
    /// ends the run.
    pub capacity: usize,
    pub exposure: ExposureConfig,
    /// Target file for writing receivers, forwarded in the series header.
    /// `None` streams without saving.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "capacity must be > 0".to_string(),
            ));
        }
        self.exposure.validate()
    }
}
