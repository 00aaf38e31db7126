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

use ndarray::Array2;
use xspress_streamer::frame::{ChannelScalars, ExposureConfig, Frame};
use xspress_streamer::protocol::{
    ControlCommand, ControlRequest, ControlResponse, EngineState, MonitorReply, SeriesEnd,
    SeriesStart, StatusReport, StreamMessage,
};

fn make_frame(index: u64) -> Frame {
    Frame {
        index,
        spectral_data: Array2::from_shape_fn((4, 64), |(c, b)| (index as usize + c * b) as u32),
        scalars: vec![
            ChannelScalars {
                all_events: 1000.0 + index as f64,
                all_good: 970.0,
                clock_ticks: 80_000.0,
                total_ticks: 80_000.0,
                reset_ticks: 12.0,
                dead_time_correction: 1.03,
                output_count_rate: 1_000_000.0,
                event_width: 6.0,
            };
            4
        ],
        timestamp: (index + 1) * 80_000,
    }
}

#[test]
fn test_full_series_over_the_wire() {
    // Encode an entire session the way the publisher sends it, then decode
    // message by message the way a receiver with no prior state would.
    let start = StreamMessage::SeriesStart(SeriesStart {
        session_id: "run-42".to_string(),
        capacity: 3,
        exposure: ExposureConfig {
            frame_time_s: 0.001,
            n_triggers: 1,
        },
        filename: Some("/data/run42.h5".to_string()),
        overwrite: false,
    });
    let mut wire: Vec<Vec<u8>> = vec![start.encode().unwrap()];
    for i in 0..3 {
        wire.push(
            StreamMessage::from_frame("run-42", &make_frame(i))
                .encode()
                .unwrap(),
        );
    }
    wire.push(
        StreamMessage::SeriesEnd(SeriesEnd {
            session_id: "run-42".to_string(),
            frames_acquired: 3,
            frames_dropped: 0,
            fault: None,
        })
        .encode()
        .unwrap(),
    );

    let decoded: Vec<StreamMessage> = wire
        .iter()
        .map(|buf| StreamMessage::decode(buf).unwrap())
        .collect();

    match &decoded[0] {
        StreamMessage::SeriesStart(s) => {
            assert_eq!(s.session_id, "run-42");
            assert_eq!(s.capacity, 3);
            assert_eq!(s.filename.as_deref(), Some("/data/run42.h5"));
        }
        other => panic!("expected series start, got {:?}", other),
    }
    for (i, msg) in decoded[1..4].iter().enumerate() {
        match msg {
            StreamMessage::Frame { header, payload } => {
                assert_eq!(header.frame_index, i as u64);
                assert_eq!(header.session_id, "run-42");
                let matrix =
                    Frame::matrix_from_payload(payload, header.channels, header.bins).unwrap();
                assert_eq!(matrix, make_frame(i as u64).spectral_data);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }
    match &decoded[4] {
        StreamMessage::SeriesEnd(e) => {
            assert_eq!(e.frames_acquired, 3);
            assert!(e.fault.is_none());
        }
        other => panic!("expected series end, got {:?}", other),
    }
}

#[test]
fn test_each_message_is_self_contained() {
    // A receiver that joins late and sees only frame 7 can still rebuild it.
    let frame = make_frame(7);
    let wire = StreamMessage::from_frame("run-42", &frame).encode().unwrap();
    match StreamMessage::decode(&wire).unwrap() {
        StreamMessage::Frame { header, payload } => {
            assert_eq!(header.frame_index, 7);
            assert_eq!(header.channels, 4);
            assert_eq!(header.bins, 64);
            assert_eq!(header.scalars.len(), 4);
            assert_eq!(payload.len(), 4 * 64 * 4);
        }
        other => panic!("expected frame, got {:?}", other),
    }
}

#[test]
fn test_frame_headers_carry_scalars() {
    let frame = make_frame(0);
    let wire = StreamMessage::from_frame("s", &frame).encode().unwrap();
    match StreamMessage::decode(&wire).unwrap() {
        StreamMessage::Frame { header, .. } => {
            assert_eq!(header.scalars[0].all_events, 1000.0);
            assert_eq!(header.scalars[0].dead_time_correction, 1.03);
        }
        other => panic!("expected frame, got {:?}", other),
    }
}

#[test]
fn test_htype_tags_on_the_wire() {
    let wire = StreamMessage::SeriesStart(SeriesStart {
        session_id: "s".to_string(),
        capacity: 1,
        exposure: ExposureConfig::default(),
        filename: None,
        overwrite: false,
    })
    .encode()
    .unwrap();
    let header_len = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
    let header: serde_json::Value = serde_json::from_slice(&wire[4..4 + header_len]).unwrap();
    assert_eq!(header["htype"], "series_start");

    let wire = StreamMessage::from_frame("s", &make_frame(0)).encode().unwrap();
    let header_len = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
    let header: serde_json::Value = serde_json::from_slice(&wire[4..4 + header_len]).unwrap();
    assert_eq!(header["htype"], "frame");
}

#[test]
fn test_monitor_empty_reply_is_explicit() {
    let wire = MonitorReply::empty().encode().unwrap();
    let header_len = u32::from_le_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
    let header: serde_json::Value = serde_json::from_slice(&wire[4..4 + header_len]).unwrap();
    assert_eq!(header["htype"], "empty");
    assert_eq!(wire.len(), 4 + header_len);
}

#[test]
fn test_control_response_flattens_status() {
    let response = ControlResponse::ok(StatusReport {
        state: EngineState::Armed,
        frames_acquired: 0,
        frames_dropped: 0,
        session_id: Some("run-42".to_string()),
        fault: None,
    });
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
    // Status fields sit at the top level of the reply, not nested.
    assert_eq!(json["success"], true);
    assert_eq!(json["state"], "armed");
    assert_eq!(json["session_id"], "run-42");
    assert!(json.get("status").is_none());
    assert!(json.get("fault").is_none());
}

#[test]
fn test_control_request_unknown_command_rejected() {
    let result: Result<ControlRequest, _> =
        serde_json::from_str(r#"{"command":"explode"}"#);
    assert!(result.is_err());

    let request: ControlRequest = serde_json::from_str(r#"{"command":"reset"}"#).unwrap();
    assert_eq!(request.command, ControlCommand::Reset);
}
