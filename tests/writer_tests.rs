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

use hdf5::types::VarLenUnicode;
use ndarray::Array2;
use xspress_streamer::frame::{ChannelScalars, ExposureConfig, Frame};
use xspress_streamer::protocol::{SeriesEnd, SeriesStart, StreamMessage};
use xspress_streamer::writer::{enqueue, WriterConfig, WriterStats, WritingReceiver};

const CHANNELS: usize = 2;
const BINS: usize = 32;

fn series_start(session_id: &str, filename: Option<String>, overwrite: bool) -> StreamMessage {
    StreamMessage::SeriesStart(SeriesStart {
        session_id: session_id.to_string(),
        capacity: 100,
        exposure: ExposureConfig {
            frame_time_s: 0.002,
            n_triggers: 1,
        },
        filename,
        overwrite,
    })
}

fn frame_msg(session_id: &str, index: u64) -> StreamMessage {
    let frame = Frame {
        index,
        spectral_data: Array2::from_elem((CHANNELS, BINS), index as u32),
        scalars: vec![
            ChannelScalars {
                all_events: 100.0 * index as f64,
                dead_time_correction: 1.01,
                ..Default::default()
            };
            CHANNELS
        ],
        timestamp: (index + 1) * 160_000,
    };
    StreamMessage::from_frame(session_id, &frame)
}

fn series_end(session_id: &str, acquired: u64, fault: Option<String>) -> StreamMessage {
    StreamMessage::SeriesEnd(SeriesEnd {
        session_id: session_id.to_string(),
        frames_acquired: acquired,
        frames_dropped: 0,
        fault,
    })
}

fn receiver(dir: &std::path::Path) -> WritingReceiver {
    WritingReceiver::new(WriterConfig {
        output_dir: dir.to_path_buf(),
        flush_every_frames: 2,
    })
}

fn read_str_attr(group: &hdf5::Group, name: &str) -> String {
    group
        .attr(name)
        .unwrap()
        .read_scalar::<VarLenUnicode>()
        .unwrap()
        .to_string()
}

#[test]
fn test_complete_session_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    for i in 0..6 {
        receiver.handle(frame_msg("s1", i)).unwrap();
    }
    receiver.handle(series_end("s1", 6, None)).unwrap();

    let file = hdf5::File::open(&path).unwrap();
    let group = file.group("entry/instrument/xspress3").unwrap();

    let data = group.dataset("data").unwrap();
    assert_eq!(data.shape(), vec![6, CHANNELS, BINS]);
    let read = data.read_dyn::<u32>().unwrap();
    assert_eq!(read[[0, 0, 0]], 0);
    assert_eq!(read[[5, 1, 31]], 5);

    let scalars = group.dataset("scalars").unwrap();
    assert_eq!(scalars.shape(), vec![6, CHANNELS, 8]);
    let read = scalars.read_dyn::<f64>().unwrap();
    assert_eq!(read[[3, 0, 0]], 300.0); // all_events of frame 3
    assert_eq!(
        read_str_attr_on_dataset(&scalars, "columns"),
        ChannelScalars::COLUMNS.join(",")
    );

    let timestamps = group.dataset("timestamps").unwrap();
    let ts = timestamps.read_1d::<u64>().unwrap();
    assert_eq!(ts.len(), 6);
    for w in ts.as_slice().unwrap().windows(2) {
        assert!(w[1] > w[0]);
    }

    let gaps = group.dataset("gaps").unwrap();
    assert_eq!(gaps.shape(), vec![0]);

    assert_eq!(read_str_attr(&group, "session_id"), "s1");
    assert_eq!(
        group
            .attr("frames_acquired")
            .unwrap()
            .read_scalar::<u64>()
            .unwrap(),
        6
    );
    assert_eq!(
        group.attr("capacity").unwrap().read_scalar::<u64>().unwrap(),
        100
    );
    assert!(group.attr("fault").is_err());
}

fn read_str_attr_on_dataset(ds: &hdf5::Dataset, name: &str) -> String {
    ds.attr(name)
        .unwrap()
        .read_scalar::<VarLenUnicode>()
        .unwrap()
        .to_string()
}

#[test]
fn test_gaps_recorded_not_padded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gappy.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    for i in [0u64, 1, 2, 5, 6] {
        receiver.handle(frame_msg("s1", i)).unwrap();
    }
    receiver.handle(series_end("s1", 7, None)).unwrap();

    assert_eq!(receiver.stats().gaps(), 2);

    let file = hdf5::File::open(&path).unwrap();
    let group = file.group("entry/instrument/xspress3").unwrap();
    // Received frames are written contiguously; the gap lives in its own
    // dataset rather than as zero padding.
    let data = group.dataset("data").unwrap();
    assert_eq!(data.shape(), vec![5, CHANNELS, BINS]);
    let gaps = group.dataset("gaps").unwrap().read_1d::<u64>().unwrap();
    assert_eq!(gaps.as_slice().unwrap(), &[3, 4]);
}

#[test]
fn test_single_missed_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("one-gap.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    for i in (0..10).filter(|&i| i != 5) {
        receiver.handle(frame_msg("s1", i)).unwrap();
    }
    receiver.handle(series_end("s1", 10, None)).unwrap();

    assert_eq!(receiver.stats().frames_written(), 9);
    assert_eq!(receiver.stats().gaps(), 1);

    let file = hdf5::File::open(&path).unwrap();
    let group = file.group("entry/instrument/xspress3").unwrap();
    assert_eq!(group.dataset("data").unwrap().shape()[0], 9);
    let gaps = group.dataset("gaps").unwrap().read_1d::<u64>().unwrap();
    assert_eq!(gaps.as_slice().unwrap(), &[5]);
}

#[test]
fn test_duplicate_frames_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    for i in [0u64, 1, 1, 2] {
        receiver.handle(frame_msg("s1", i)).unwrap();
    }
    receiver.handle(series_end("s1", 3, None)).unwrap();

    let file = hdf5::File::open(&path).unwrap();
    let data = file.dataset("entry/instrument/xspress3/data").unwrap();
    assert_eq!(data.shape(), vec![3, CHANNELS, BINS]);
}

#[test]
fn test_faulted_session_still_finalized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faulted.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    for i in 0..3 {
        receiver.handle(frame_msg("s1", i)).unwrap();
    }
    receiver
        .handle(series_end("s1", 3, Some("detector link lost".to_string())))
        .unwrap();

    let file = hdf5::File::open(&path).unwrap();
    let group = file.group("entry/instrument/xspress3").unwrap();
    assert_eq!(group.dataset("data").unwrap().shape()[0], 3);
    assert_eq!(read_str_attr(&group, "fault"), "detector link lost");
}

#[test]
fn test_new_series_finalizes_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.h5");
    let second = dir.path().join("second.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(first.display().to_string()), false))
        .unwrap();
    receiver.handle(frame_msg("s1", 0)).unwrap();
    // The end marker for s1 was lost; a new series must not leave the old
    // file open or corrupt.
    receiver
        .handle(series_start("s2", Some(second.display().to_string()), false))
        .unwrap();
    receiver.handle(frame_msg("s2", 0)).unwrap();
    receiver.handle(series_end("s2", 1, None)).unwrap();

    let file = hdf5::File::open(&first).unwrap();
    assert_eq!(
        file.dataset("entry/instrument/xspress3/data")
            .unwrap()
            .shape()[0],
        1
    );
    let file = hdf5::File::open(&second).unwrap();
    assert_eq!(
        file.dataset("entry/instrument/xspress3/data")
            .unwrap()
            .shape()[0],
        1
    );
}

#[test]
fn test_existing_file_never_clobbered_without_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    std::fs::write(&path, b"precious").unwrap();
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    receiver.handle(frame_msg("s1", 0)).unwrap();
    receiver.handle(series_end("s1", 1, None)).unwrap();

    // Original content untouched, session written next to it.
    assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    assert!(dir.path().join("run_.h5").exists());
}

#[test]
fn test_overwrite_replaces_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    std::fs::write(&path, b"old").unwrap();
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), true))
        .unwrap();
    receiver.handle(frame_msg("s1", 0)).unwrap();
    receiver.handle(series_end("s1", 1, None)).unwrap();

    assert!(!dir.path().join("run_.h5").exists());
    let file = hdf5::File::open(&path).unwrap();
    assert_eq!(
        file.dataset("entry/instrument/xspress3/data")
            .unwrap()
            .shape()[0],
        1
    );
}

#[test]
fn test_frames_for_other_sessions_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.h5");
    let mut receiver = receiver(dir.path());

    receiver
        .handle(series_start("s1", Some(path.display().to_string()), false))
        .unwrap();
    receiver.handle(frame_msg("s1", 0)).unwrap();
    receiver.handle(frame_msg("stale-session", 7)).unwrap();
    receiver.handle(series_end("s1", 1, None)).unwrap();

    let file = hdf5::File::open(&path).unwrap();
    assert_eq!(
        file.dataset("entry/instrument/xspress3/data")
            .unwrap()
            .shape()[0],
        1
    );
    assert_eq!(receiver.stats().frames_written(), 1);
}

#[test]
fn test_frames_before_any_series_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = receiver(dir.path());
    // A late joiner sees frames before any header; they are skipped, not
    // an error.
    receiver.handle(frame_msg("s1", 4)).unwrap();
    assert_eq!(receiver.stats().frames_written(), 0);
}

#[test]
fn test_queue_overflow_drops_and_counts() {
    let (tx, rx) = crossbeam::channel::bounded(2);
    let stats = WriterStats::default();

    for i in 0..5 {
        assert!(enqueue(frame_msg("s1", i), &tx, &stats));
    }
    // Two slots, five frames: the overflow is counted, never silent.
    assert_eq!(stats.frames_dropped(), 3);
    assert_eq!(rx.try_iter().count(), 2);
}

#[test]
fn test_markers_wait_for_queue_space() {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let stats = WriterStats::default();

    assert!(enqueue(frame_msg("s1", 0), &tx, &stats));
    let drainer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        rx.iter().collect::<Vec<_>>()
    });
    // The queue is full, but the end marker blocks for space rather than
    // being shed like a frame would be.
    assert!(enqueue(series_end("s1", 1, None), &tx, &stats));
    drop(tx);
    let received = drainer.join().unwrap();
    assert_eq!(received.len(), 2);
    assert!(matches!(received[1], StreamMessage::SeriesEnd(_)));
    assert_eq!(stats.frames_dropped(), 0);
}

#[test]
fn test_enqueue_reports_writer_gone() {
    let (tx, rx) = crossbeam::channel::bounded(1);
    let stats = WriterStats::default();
    drop(rx);

    assert!(!enqueue(frame_msg("s1", 0), &tx, &stats));
    assert!(!enqueue(series_end("s1", 0, None), &tx, &stats));
    // A vanished writer is not a drop; nothing is counted.
    assert_eq!(stats.frames_dropped(), 0);
}

#[test]
fn test_default_filename_from_session_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = receiver(dir.path());

    receiver.handle(series_start("run-77", None, false)).unwrap();
    receiver.handle(frame_msg("run-77", 0)).unwrap();
    receiver.handle(series_end("run-77", 1, None)).unwrap();

    assert!(dir.path().join("run-77.h5").exists());
}
