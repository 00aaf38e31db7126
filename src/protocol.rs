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

//! Wire protocol for the data and monitor channels, plus the JSON control
//! surface.
//!
//! Every message on the data channel is self-contained: a 4-byte
//! little-endian header length, a JSON header tagged with `htype`, then the
//! raw spectral payload bytes (row-major little-endian u32). A receiver
//! reconstructs a frame from one message with no cross-message state.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{ChannelScalars, ExposureConfig, Frame};

/// Acquisition engine states as visible on the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Armed,
    Running,
    Draining,
    Faulted,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Armed => "armed",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message truncated: {0}")]
    Truncated(String),

    #[error("bad message header: {0}")]
    BadHeader(#[from] serde_json::Error),

    #[error("payload is {actual} bytes, header announces {expected}")]
    PayloadSize { expected: usize, actual: usize },
}

/// Start-of-series marker, sent once per session before any frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesStart {
    pub session_id: String,
    pub capacity: usize,
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

/// Header of one frame message. The spectral payload follows as raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub session_id: String,
    pub frame_index: u64,
    pub channels: usize,
    pub bins: usize,
    pub timestamp: u64,
    pub scalars: Vec<ChannelScalars>,
}

/// End-of-series marker. `fault` is set when the session ended in `Faulted`,
/// so receivers can finalize their output either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEnd {
    pub session_id: String,
    pub frames_acquired: u64,
    pub frames_dropped: u64,
    #[serde(default)]
    pub fault: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "htype", rename_all = "snake_case")]
enum StreamHeader {
    SeriesStart(SeriesStart),
    Frame(FrameHeader),
    SeriesEnd(SeriesEnd),
}

/// One unit on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    SeriesStart(SeriesStart),
    Frame { header: FrameHeader, payload: Bytes },
    SeriesEnd(SeriesEnd),
}

impl StreamMessage {
    pub fn from_frame(session_id: &str, frame: &Frame) -> Self {
        StreamMessage::Frame {
            header: FrameHeader {
                session_id: session_id.to_string(),
                frame_index: frame.index,
                channels: frame.channels(),
                bins: frame.bins(),
                timestamp: frame.timestamp,
                scalars: frame.scalars.clone(),
            },
            payload: Bytes::from(frame.payload_bytes()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            StreamMessage::SeriesStart(s) => {
                encode_parts(&StreamHeader::SeriesStart(s.clone()), &[])
            }
            StreamMessage::Frame { header, payload } => {
                encode_parts(&StreamHeader::Frame(header.clone()), payload)
            }
            StreamMessage::SeriesEnd(s) => encode_parts(&StreamHeader::SeriesEnd(s.clone()), &[]),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (header, payload): (StreamHeader, Bytes) = decode_parts(buf)?;
        match header {
            StreamHeader::SeriesStart(s) => Ok(StreamMessage::SeriesStart(s)),
            StreamHeader::Frame(h) => {
                let expected = h.channels * h.bins * 4;
                if payload.len() != expected {
                    return Err(WireError::PayloadSize {
                        expected,
                        actual: payload.len(),
                    });
                }
                Ok(StreamMessage::Frame { header: h, payload })
            }
            StreamHeader::SeriesEnd(s) => Ok(StreamMessage::SeriesEnd(s)),
        }
    }
}

/// Reply on the monitor channel: the most recent frame, or an explicit
/// empty marker when nothing has been acquired yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "htype", rename_all = "snake_case")]
pub enum MonitorHeader {
    Empty,
    Snapshot {
        session_id: String,
        frame_index: u64,
        channels: usize,
        bins: usize,
        timestamp: u64,
        scalars: Vec<ChannelScalars>,
        frames_acquired: u64,
        frames_dropped: u64,
    },
}

/// A decoded monitor reply, payload empty for [`MonitorHeader::Empty`].
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReply {
    pub header: MonitorHeader,
    pub payload: Bytes,
}

impl MonitorReply {
    pub fn empty() -> Self {
        Self {
            header: MonitorHeader::Empty,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_parts(&self.header, &self.payload)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (header, payload) = decode_parts(buf)?;
        Ok(Self { header, payload })
    }
}

fn encode_parts<T: Serialize>(header: &T, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header_bytes = serde_json::to_vec(header)?;
    let mut out = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode_parts<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, Bytes), WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated("missing length prefix".to_string()));
    }
    let header_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < header_len {
        return Err(WireError::Truncated(format!(
            "header announces {} bytes, {} available",
            header_len,
            rest.len()
        )));
    }
    let header: T = serde_json::from_slice(&rest[..header_len])?;
    Ok((header, Bytes::copy_from_slice(&rest[header_len..])))
}

/// Command types for the control queryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Configure,
    Start,
    Stop,
    Reset,
    Status,
}

/// Request message for control operations. Configuration fields are only
/// read for `configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: ControlCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_triggers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
}

impl ControlRequest {
    pub fn bare(command: ControlCommand) -> Self {
        Self {
            command,
            capacity: None,
            frame_time_s: None,
            n_triggers: None,
            filename: None,
            overwrite: None,
        }
    }
}

/// Point-in-time engine status as reported on the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: EngineState,
    pub frames_acquired: u64,
    pub frames_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Response message for control operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub status: StatusReport,
}

impl ControlResponse {
    pub fn ok(status: StatusReport) -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
            status,
        }
    }

    pub fn error(message: impl Into<String>, status: StatusReport) -> Self {
        Self {
            success: false,
            message: message.into(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use ndarray::Array2;

    fn test_frame(index: u64) -> Frame {
        Frame {
            index,
            spectral_data: Array2::from_shape_fn((2, 4), |(c, b)| (c * 10 + b) as u32),
            scalars: vec![ChannelScalars::default(); 2],
            timestamp: 100 + index,
        }
    }

    #[test]
    fn frame_message_round_trip() {
        let frame = test_frame(7);
        let msg = StreamMessage::from_frame("sess-1", &frame);
        let wire = msg.encode().unwrap();
        match StreamMessage::decode(&wire).unwrap() {
            StreamMessage::Frame { header, payload } => {
                assert_eq!(header.frame_index, 7);
                assert_eq!(header.channels, 2);
                assert_eq!(header.bins, 4);
                assert_eq!(header.timestamp, 107);
                let matrix = Frame::matrix_from_payload(&payload, 2, 4).unwrap();
                assert_eq!(matrix, frame.spectral_data);
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
    }

    #[test]
    fn series_markers_round_trip() {
        let start = StreamMessage::SeriesStart(SeriesStart {
            session_id: "s".to_string(),
            capacity: 10,
            exposure: ExposureConfig::default(),
            filename: Some("/tmp/run.h5".to_string()),
            overwrite: true,
        });
        let wire = start.encode().unwrap();
        assert_eq!(StreamMessage::decode(&wire).unwrap(), start);

        let end = StreamMessage::SeriesEnd(SeriesEnd {
            session_id: "s".to_string(),
            frames_acquired: 10,
            frames_dropped: 0,
            fault: None,
        });
        let wire = end.encode().unwrap();
        assert_eq!(StreamMessage::decode(&wire).unwrap(), end);
    }

    #[test]
    fn truncated_message_rejected() {
        assert!(matches!(
            StreamMessage::decode(&[1, 0]),
            Err(WireError::Truncated(_))
        ));
        // Length prefix pointing past the end of the buffer.
        let mut wire = StreamMessage::SeriesStart(SeriesStart {
            session_id: "s".to_string(),
            capacity: 1,
            exposure: ExposureConfig::default(),
            filename: None,
            overwrite: false,
        })
        .encode()
        .unwrap();
        wire.truncate(8);
        assert!(matches!(
            StreamMessage::decode(&wire),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn payload_size_mismatch_rejected() {
        let frame = test_frame(0);
        let msg = StreamMessage::from_frame("s", &frame);
        let mut wire = msg.encode().unwrap();
        wire.pop();
        assert!(matches!(
            StreamMessage::decode(&wire),
            Err(WireError::PayloadSize { .. })
        ));
    }

    #[test]
    fn monitor_reply_round_trip() {
        let reply = MonitorReply {
            header: MonitorHeader::Snapshot {
                session_id: "s".to_string(),
                frame_index: 9,
                channels: 2,
                bins: 4,
                timestamp: 109,
                scalars: vec![ChannelScalars::default(); 2],
                frames_acquired: 10,
                frames_dropped: 0,
            },
            payload: Bytes::from(test_frame(9).payload_bytes()),
        };
        let wire = reply.encode().unwrap();
        assert_eq!(MonitorReply::decode(&wire).unwrap(), reply);

        let wire = MonitorReply::empty().encode().unwrap();
        assert_eq!(
            MonitorReply::decode(&wire).unwrap().header,
            MonitorHeader::Empty
        );
    }

    #[test]
    fn control_request_serialization() {
        let req = ControlRequest {
            command: ControlCommand::Configure,
            capacity: Some(100),
            frame_time_s: Some(0.001),
            n_triggers: Some(1),
            filename: Some("/data/run42.h5".to_string()),
            overwrite: Some(false),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, ControlCommand::Configure);
        assert_eq!(back.capacity, Some(100));

        // Bare commands need only the command field.
        let back: ControlRequest = serde_json::from_str(r#"{"command":"status"}"#).unwrap();
        assert_eq!(back.command, ControlCommand::Status);
        assert!(back.capacity.is_none());
    }

    #[test]
    fn engine_state_serialization() {
        assert_eq!(
            serde_json::to_string(&EngineState::Draining).unwrap(),
            "\"draining\""
        );
        assert_eq!(EngineState::Faulted.to_string(), "faulted");
    }
}
