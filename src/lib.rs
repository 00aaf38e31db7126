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

// Acquisition and distribution pipeline for Xspress3 fluorescence detectors
//
// This crate streams per-frame MCA spectra and scalar diagnostics from a
// detector readout to downstream consumers over Zenoh:
// - Drives the readout through a configure/start/stop state machine
// - Retains every frame of the active session in an in-memory buffer
// - Publishes frames in acquisition order on a data key
// - Answers latest-frame queries for live monitoring
// - Writes sessions incrementally to HDF5 in a standalone receiver

pub mod buffer;
pub mod config;
pub mod control;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod protocol;
pub mod source;
pub mod writer;

// Re-export main types
pub use buffer::{BufferError, SessionBuffer};
pub use config::{load_config, load_config_with_env, StreamerConfig};
pub use control::ControlInterface;
pub use distribution::{spawn_publisher, BackpressurePolicy, ChannelSink, FrameSink};
pub use engine::{AcquisitionEngine, EngineHandle, EngineOptions};
pub use error::{EngineError, SourceError};
pub use frame::{ChannelScalars, ExposureConfig, Frame, SessionConfig};
pub use monitor::{MonitorCache, MonitorServer, MonitorSnapshot};
pub use protocol::{
    ControlCommand, ControlRequest, ControlResponse, EngineState, FrameHeader, MonitorReply,
    SeriesEnd, SeriesStart, StatusReport, StreamMessage,
};
pub use source::{Fetch, FrameSource, SimSource};
pub use writer::{spawn_writer, WriterConfig, WriterStats, WritingReceiver};
