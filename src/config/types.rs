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

// Configuration types for the streamer and its receivers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distribution::BackpressurePolicy;
use crate::engine::EngineOptions;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamerConfig {
    #[serde(default)]
    pub zenoh: ZenohConfig,
    #[serde(default)]
    pub streamer: StreamerSettings,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub writer: WriterSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Zenoh session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZenohConfig {
    #[serde(default = "default_mode")]
    pub mode: String, // "peer", "client", or "router"

    #[serde(default)]
    pub connect: Option<EndpointsConfig>,

    #[serde(default)]
    pub listen: Option<EndpointsConfig>,
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: None,
            listen: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointsConfig {
    pub endpoints: Vec<String>,
}

impl ZenohConfig {
    /// Build a zenoh session config from the YAML section.
    pub fn to_session_config(&self) -> anyhow::Result<zenoh::Config> {
        let mut config = zenoh::Config::default();

        config
            .insert_json5("mode", &format!("\"{}\"", self.mode))
            .map_err(|e| anyhow::anyhow!("Invalid zenoh mode: {}", e))?;

        if let Some(connect) = &self.connect {
            config
                .insert_json5("connect/endpoints", &serde_json::to_string(&connect.endpoints)?)
                .map_err(|e| anyhow::anyhow!("Invalid connect endpoints: {}", e))?;
        }

        if let Some(listen) = &self.listen {
            config
                .insert_json5("listen/endpoints", &serde_json::to_string(&listen.endpoints)?)
                .map_err(|e| anyhow::anyhow!("Invalid listen endpoints: {}", e))?;
        }

        Ok(config)
    }
}

/// Streamer-specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamerSettings {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// First segment of every key: `{prefix}/data/{device_id}` etc.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on one blocking fetch from the frame source.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// One wait slice when the outbound queue is full.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Bound on the control handshake with the acquisition thread.
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Outbound queue depth between the engine and the publisher thread.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            key_prefix: default_key_prefix(),
            fetch_timeout_ms: default_fetch_timeout(),
            publish_timeout_ms: default_publish_timeout(),
            control_timeout_ms: default_control_timeout(),
            backpressure: BackpressurePolicy::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl StreamerSettings {
    pub fn data_key(&self) -> String {
        format!("{}/data/{}", self.key_prefix, self.device_id)
    }

    pub fn monitor_key(&self) -> String {
        format!("{}/monitor/{}", self.key_prefix, self.device_id)
    }

    pub fn control_key(&self) -> String {
        format!("{}/control/{}", self.key_prefix, self.device_id)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            control_timeout: Duration::from_millis(self.control_timeout_ms),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Frame source selection. Only the simulator ships with this crate; the
/// SDK binding plugs in behind the same trait.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: String, // "sim"

    #[serde(default = "default_channels")]
    pub channels: usize,

    #[serde(default = "default_bins")]
    pub bins: usize,

    #[serde(default = "default_frame_period")]
    pub frame_period_us: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            channels: default_channels(),
            bins: default_bins(),
            frame_period_us: default_frame_period(),
        }
    }
}

/// Settings for the writing receiver.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Depth of the queue between the subscriber and the writer thread;
    /// frames beyond it are dropped and counted.
    #[serde(default = "default_writer_queue")]
    pub queue_capacity: usize,

    #[serde(default = "default_flush_every")]
    pub flush_every_frames: u64,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            queue_capacity: default_writer_queue(),
            flush_every_frames: default_flush_every(),
        }
    }
}

impl WriterSettings {
    pub fn writer_config(&self) -> crate::writer::WriterConfig {
        crate::writer::WriterConfig {
            output_dir: self.output_dir.clone().into(),
            flush_every_frames: self.flush_every_frames,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_mode() -> String {
    "peer".to_string()
}
fn default_device_id() -> String {
    "xspress3-01".to_string()
}
fn default_key_prefix() -> String {
    "xspress".to_string()
}
fn default_fetch_timeout() -> u64 {
    100
}
fn default_publish_timeout() -> u64 {
    50
}
fn default_control_timeout() -> u64 {
    2000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_source_kind() -> String {
    "sim".to_string()
}
fn default_channels() -> usize {
    4
}
fn default_bins() -> usize {
    4096
}
fn default_frame_period() -> u64 {
    1000
}
fn default_output_dir() -> String {
    "./data".to_string()
}
fn default_writer_queue() -> usize {
    4096
}
fn default_flush_every() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
