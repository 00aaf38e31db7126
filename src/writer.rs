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

//! Writing receiver: an ordinary data-channel subscriber that appends each
//! frame to a growing HDF5 file.
//!
//! The zenoh-facing forwarder pushes decoded messages into a bounded queue;
//! a dedicated writer thread drains it. When the queue saturates, frames
//! are dropped and counted, never blocking the publisher: the writer is a
//! best-effort consumer. Index gaps are recorded in the file, and periodic
//! flushes keep the file structurally valid even if the run dies mid-way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, Group};
use ndarray::{s, Array2};
use tracing::{debug, info, warn};
use zenoh::Session;

use crate::frame::{ChannelScalars, Frame};
use crate::protocol::{FrameHeader, SeriesEnd, SeriesStart, StreamMessage};

const SCALAR_COLUMNS: usize = 8;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Fallback directory when the series header carries no filename.
    pub output_dir: PathBuf,
    /// Flush cadence; the file stays valid after an abnormal end.
    pub flush_every_frames: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            flush_every_frames: 50,
        }
    }
}

/// Observability counters, shared with whoever spawned the writer.
#[derive(Default)]
pub struct WriterStats {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    gaps: AtomicU64,
    rate_fps: AtomicU64,
}

impl WriterStats {
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Most recent achieved write rate, frames per second.
    pub fn rate_fps(&self) -> u64 {
        self.rate_fps.load(Ordering::Relaxed)
    }

    pub fn count_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// One session's growing file. Datasets are created on the first frame,
/// once the payload shape is known, and extended frame by frame.
struct SessionFile {
    file: hdf5::File,
    group: Group,
    data: Option<Dataset>,
    scalars: Option<Dataset>,
    timestamps: Option<Dataset>,
    gaps: Option<Dataset>,
    session_id: String,
    channels: usize,
    bins: usize,
    rows: usize,
    gap_rows: usize,
    expected_index: u64,
    flush_every: u64,
}

impl SessionFile {
    fn create(config: &WriterConfig, start: &SeriesStart) -> Result<Self> {
        let mut path = match &start.filename {
            Some(name) => PathBuf::from(name),
            None => config
                .output_dir
                .join(format!("{}.h5", start.session_id)),
        };
        if !start.overwrite {
            path = declash(path);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let file = hdf5::File::create(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        let group = file
            .create_group("entry")?
            .create_group("instrument")?
            .create_group("xspress3")?;

        write_str_attr(&group, "session_id", &start.session_id)?;
        write_str_attr(&group, "start_time", &chrono::Utc::now().to_rfc3339())?;
        group
            .new_attr::<u64>()
            .create("capacity")?
            .write_scalar(&(start.capacity as u64))?;
        group
            .new_attr::<f64>()
            .create("frame_time_s")?
            .write_scalar(&start.exposure.frame_time_s)?;
        group
            .new_attr::<u32>()
            .create("n_triggers")?
            .write_scalar(&start.exposure.n_triggers)?;

        info!(
            "Writing session {} to {}",
            start.session_id,
            path.display()
        );
        Ok(Self {
            file,
            group,
            data: None,
            scalars: None,
            timestamps: None,
            gaps: None,
            session_id: start.session_id.clone(),
            channels: 0,
            bins: 0,
            rows: 0,
            gap_rows: 0,
            expected_index: 0,
            flush_every: config.flush_every_frames.max(1),
        })
    }

    fn ensure_datasets(&mut self, channels: usize, bins: usize) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        self.channels = channels;
        self.bins = bins;
        self.data = Some(
            self.group
                .new_dataset::<u32>()
                .shape((0.., channels, bins))
                .chunk((1, channels, bins))
                .create("data")?,
        );
        let scalars = self
            .group
            .new_dataset::<f64>()
            .shape((0.., channels, SCALAR_COLUMNS))
            .chunk((1, channels, SCALAR_COLUMNS))
            .create("scalars")?;
        write_str_attr(
            &scalars,
            "columns",
            &ChannelScalars::COLUMNS.join(","),
        )?;
        self.scalars = Some(scalars);
        self.timestamps = Some(
            self.group
                .new_dataset::<u64>()
                .shape((0..,))
                .chunk((1024,))
                .create("timestamps")?,
        );
        self.gaps = Some(
            self.group
                .new_dataset::<u64>()
                .shape((0..,))
                .chunk((1024,))
                .create("gaps")?,
        );
        Ok(())
    }

    fn record_gap(&mut self, missing: std::ops::Range<u64>) -> Result<u64> {
        let count = missing.end - missing.start;
        warn!(
            "Gap in data stream: frames {}..{} missing",
            missing.start, missing.end
        );
        if let Some(gaps) = &self.gaps {
            let indices: Vec<u64> = missing.collect();
            let start = self.gap_rows;
            gaps.resize(start + indices.len())?;
            gaps.write_slice(&indices[..], s![start..start + indices.len()])?;
            self.gap_rows += indices.len();
        }
        Ok(count)
    }

    /// Append one frame's payload, scalars and timestamp. Returns the
    /// number of missing indices detected before this frame.
    fn append(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<u64> {
        let matrix = Frame::matrix_from_payload(payload, header.channels, header.bins)
            .map_err(anyhow::Error::msg)?;
        self.ensure_datasets(header.channels, header.bins)?;
        if header.channels != self.channels || header.bins != self.bins {
            anyhow::bail!(
                "frame {} shape {}x{} does not match session shape {}x{}",
                header.frame_index,
                header.channels,
                header.bins,
                self.channels,
                self.bins
            );
        }
        if header.frame_index < self.expected_index {
            warn!(
                "Duplicate or reordered frame {} (expected {}), skipping",
                header.frame_index, self.expected_index
            );
            return Ok(0);
        }
        let gap = if header.frame_index > self.expected_index {
            self.record_gap(self.expected_index..header.frame_index)?
        } else {
            0
        };

        let row = self.rows;
        if let Some(data) = &self.data {
            data.resize((row + 1, self.channels, self.bins))?;
            data.write_slice(&matrix, s![row, .., ..])?;
        }
        if let Some(scalars) = &self.scalars {
            let flat: Vec<f64> = header
                .scalars
                .iter()
                .flat_map(|sc| sc.to_row())
                .collect();
            let arr = Array2::from_shape_vec((self.channels, SCALAR_COLUMNS), flat)
                .context("scalar block shape mismatch")?;
            scalars.resize((row + 1, self.channels, SCALAR_COLUMNS))?;
            scalars.write_slice(&arr, s![row, .., ..])?;
        }
        if let Some(timestamps) = &self.timestamps {
            let ts = [header.timestamp];
            timestamps.resize(row + 1)?;
            timestamps.write_slice(&ts[..], s![row..row + 1])?;
        }
        self.rows += 1;
        self.expected_index = header.frame_index + 1;

        if self.rows as u64 % self.flush_every == 0 {
            self.file.flush()?;
        }
        Ok(gap)
    }

    fn finalize(self, end: Option<&SeriesEnd>) -> Result<()> {
        if let Some(end) = end {
            self.group
                .new_attr::<u64>()
                .create("frames_acquired")?
                .write_scalar(&end.frames_acquired)?;
            if let Some(fault) = &end.fault {
                write_str_attr(&self.group, "fault", fault)?;
            }
        }
        self.file.flush()?;
        info!(
            "Finalized session {}: {} frames written",
            self.session_id, self.rows
        );
        Ok(())
    }
}

fn write_str_attr(loc: &hdf5::Location, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid attribute string: {:?}", e))?;
    loc.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

/// Append `_` before the extension until the name is free, so an existing
/// run is never clobbered unless the header says so.
fn declash(path: PathBuf) -> PathBuf {
    let mut path = path;
    while path.exists() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        let name = match path.extension() {
            Some(ext) => format!("{}_.{}", stem, ext.to_string_lossy()),
            None => format!("{}_", stem),
        };
        path.set_file_name(name);
    }
    path
}

/// Drains decoded stream messages into session files. One instance handles
/// any number of consecutive sessions.
pub struct WritingReceiver {
    config: WriterConfig,
    stats: Arc<WriterStats>,
    current: Option<SessionFile>,
}

impl WritingReceiver {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            stats: Arc::new(WriterStats::default()),
            current: None,
        }
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Process one message. Errors are reported to the caller but never
    /// terminate the receiver; a bad frame must not kill the run.
    pub fn handle(&mut self, msg: StreamMessage) -> Result<()> {
        match msg {
            StreamMessage::SeriesStart(start) => {
                if let Some(file) = self.current.take() {
                    warn!("New series before the previous one ended, finalizing old file");
                    file.finalize(None)?;
                }
                self.current = Some(SessionFile::create(&self.config, &start)?);
                Ok(())
            }
            StreamMessage::Frame { header, payload } => {
                let Some(file) = self.current.as_mut() else {
                    // Joined mid-run: no header seen, nothing to append to.
                    debug!("Frame {} without an open session, skipping", header.frame_index);
                    return Ok(());
                };
                if header.session_id != file.session_id {
                    debug!(
                        "Frame for session {} while writing {}, skipping",
                        header.session_id, file.session_id
                    );
                    return Ok(());
                }
                let gap = file.append(&header, &payload)?;
                if gap > 0 {
                    self.stats.gaps.fetch_add(gap, Ordering::Relaxed);
                }
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            StreamMessage::SeriesEnd(end) => {
                match self.current.take() {
                    Some(file) => file.finalize(Some(&end))?,
                    None => debug!("Series end for {} without an open file", end.session_id),
                }
                Ok(())
            }
        }
    }

    /// Writer thread body: drain the queue until the sending side closes,
    /// logging the achieved rate once per second.
    pub fn run(mut self, rx: Receiver<StreamMessage>) {
        let mut last_report = Instant::now();
        let mut frames_since_report = 0u64;
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(msg) => {
                    let is_frame = matches!(msg, StreamMessage::Frame { .. });
                    if let Err(e) = self.handle(msg) {
                        warn!("Writer error: {:#}", e);
                    } else if is_frame {
                        frames_since_report += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let elapsed = last_report.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let rate = (frames_since_report as f64 / elapsed.as_secs_f64()) as u64;
                self.stats.rate_fps.store(rate, Ordering::Relaxed);
                if frames_since_report > 0 {
                    info!(
                        "Writer: {} new frames ({} total, {} dropped, {} gap), {} fps",
                        frames_since_report,
                        self.stats.frames_written(),
                        self.stats.frames_dropped(),
                        self.stats.gaps(),
                        rate
                    );
                }
                frames_since_report = 0;
                last_report = Instant::now();
            }
        }
        if let Some(file) = self.current.take() {
            warn!("Stream closed mid-session, finalizing file");
            if let Err(e) = file.finalize(None) {
                warn!("Failed to finalize file: {:#}", e);
            }
        }
    }
}

/// Spawn the writer thread over a fresh bounded queue. Returns the queue's
/// sending side for the forwarder, the shared stats and the join handle.
pub fn spawn_writer(
    config: WriterConfig,
    queue_capacity: usize,
) -> (Sender<StreamMessage>, Arc<WriterStats>, JoinHandle<()>) {
    let (tx, rx) = crossbeam::channel::bounded(queue_capacity);
    let receiver = WritingReceiver::new(config);
    let stats = receiver.stats();
    let join = std::thread::Builder::new()
        .name("writer".to_string())
        .spawn(move || receiver.run(rx))
        .expect("failed to spawn writer thread");
    (tx, stats, join)
}

/// Queue one message for the writer thread. Frames are shed and counted
/// when the queue is full; series markers wait for space so a file is
/// always opened and finalized. Returns false once the writer is gone.
pub fn enqueue(msg: StreamMessage, tx: &Sender<StreamMessage>, stats: &WriterStats) -> bool {
    match &msg {
        StreamMessage::Frame { .. } => match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                stats.count_dropped();
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        },
        _ => tx.send(msg).is_ok(),
    }
}

/// Subscribe to the data channel and feed the writer queue via [`enqueue`].
pub async fn run_forwarder(
    session: Session,
    key: String,
    tx: Sender<StreamMessage>,
    stats: Arc<WriterStats>,
) -> Result<()> {
    let subscriber = session
        .declare_subscriber(&key)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("Writing receiver subscribed to '{}'", key);

    while let Ok(sample) = subscriber.recv_async().await {
        let bytes = sample.payload().to_bytes();
        let msg = match StreamMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Undecodable message on data channel: {}", e);
                continue;
            }
        };
        if !enqueue(msg, &tx, &stats) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declash_appends_underscore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        std::fs::write(&path, b"x").unwrap();
        let fresh = declash(path.clone());
        assert_eq!(fresh, dir.path().join("run_.h5"));
        std::fs::write(&fresh, b"x").unwrap();
        assert_eq!(declash(path), dir.path().join("run__.h5"));
    }

    #[test]
    fn declash_leaves_free_names_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.h5");
        assert_eq!(declash(path.clone()), path);
    }
}
