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

use thiserror::Error;

use crate::protocol::EngineState;

/// Errors returned by engine control operations.
///
/// Only `Hardware` is fatal to a running session; everything else rejects the
/// offending call and leaves the engine where it was.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("command '{command}' not valid in state {state}")]
    InvalidState {
        command: &'static str,
        state: EngineState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    /// The bounded control handshake expired. The acquisition thread is
    /// either gone or wedged; status will tell which.
    #[error("control request timed out")]
    ControlTimeout,
}

/// Hard failure from the frame source. Timeouts are not errors, they come
/// back as [`crate::source::Fetch::Timeout`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("frame source failure: {0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<SourceError> for EngineError {
    fn from(e: SourceError) -> Self {
        EngineError::Hardware(e.0)
    }
}
