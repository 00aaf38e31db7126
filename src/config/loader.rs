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

// Configuration loader with environment variable substitution

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StreamerConfig> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let content = Self::substitute_env_vars(&content);

        let config: StreamerConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${DEVICE_ID:-xspress3-01} -> xspress3-01 (if DEVICE_ID not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").unwrap();

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    if let Some(default) = default_value {
                        default.to_string()
                    } else {
                        // Keep original if no default and var not found
                        format!("${{{}}}", var_name)
                    }
                }
            }
        })
        .to_string()
    }

    /// Validate configuration
    fn validate(config: &StreamerConfig) -> Result<()> {
        if config.streamer.device_id.is_empty() {
            bail!("streamer.device_id cannot be empty");
        }

        if config.streamer.key_prefix.is_empty() {
            bail!("streamer.key_prefix cannot be empty");
        }

        if config.streamer.queue_capacity == 0 {
            bail!("streamer.queue_capacity must be > 0");
        }

        if config.streamer.fetch_timeout_ms == 0 {
            bail!("streamer.fetch_timeout_ms must be > 0");
        }

        if config.streamer.control_timeout_ms == 0 {
            bail!("streamer.control_timeout_ms must be > 0");
        }

        match config.source.kind.as_str() {
            "sim" => {}
            unknown => bail!("Unknown source kind: '{}'. Supported: sim", unknown),
        }

        if config.source.channels == 0 {
            bail!("source.channels must be > 0");
        }

        if config.source.bins == 0 {
            bail!("source.bins must be > 0");
        }

        if config.source.frame_period_us == 0 {
            bail!("source.frame_period_us must be > 0");
        }

        if config.writer.queue_capacity == 0 {
            bail!("writer.queue_capacity must be > 0");
        }

        if config.writer.flush_every_frames == 0 {
            bail!("writer.flush_every_frames must be > 0");
        }

        Ok(())
    }
}
