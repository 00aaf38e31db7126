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

//! Acquisition engine: a dedicated thread drives the frame source and fans
//! each frame out to the session buffer, the monitor cache and the
//! distribution channel.
//!
//! The control path talks to the thread only through a bounded command
//! channel with a reply handshake and a published status block, so
//! configure/start/stop/status stay responsive at any acquisition rate.
//! State machine: `Idle -> Armed -> Running -> Draining -> Idle`, with
//! `Faulted` reachable from `Armed`, `Running` and `Draining`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferError, SessionBuffer};
use crate::distribution::{FrameSink, PublishOutcome};
use crate::error::EngineError;
use crate::frame::{Frame, SessionConfig};
use crate::monitor::{MonitorCache, MonitorSnapshot};
use crate::protocol::{EngineState, SeriesEnd, SeriesStart, StatusReport, StreamMessage};
use crate::source::{Fetch, FrameSource};

/// How long the command loop sleeps between polls while not acquiring.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on one blocking fetch from the frame source.
    pub fetch_timeout: Duration,
    /// Bound on the control handshake with the acquisition thread.
    pub control_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(100),
            control_timeout: Duration::from_secs(2),
        }
    }
}

enum Command {
    Configure(SessionConfig, Sender<Result<(), EngineError>>),
    Start(Sender<Result<(), EngineError>>),
    Stop(Sender<Result<(), EngineError>>),
    Reset(Sender<Result<(), EngineError>>),
    Shutdown,
}

impl Command {
    fn is_stop(&self) -> bool {
        matches!(self, Command::Stop(_) | Command::Shutdown)
    }
}

struct Shared {
    state: AtomicU8,
    frames_acquired: AtomicU64,
    frames_dropped: AtomicU64,
    fault: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
}

const STATE_IDLE: u8 = 0;
const STATE_ARMED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_DRAINING: u8 = 3;
const STATE_FAULTED: u8 = 4;

fn state_to_u8(state: EngineState) -> u8 {
    match state {
        EngineState::Idle => STATE_IDLE,
        EngineState::Armed => STATE_ARMED,
        EngineState::Running => STATE_RUNNING,
        EngineState::Draining => STATE_DRAINING,
        EngineState::Faulted => STATE_FAULTED,
    }
}

fn state_from_u8(raw: u8) -> EngineState {
    match raw {
        STATE_ARMED => EngineState::Armed,
        STATE_RUNNING => EngineState::Running,
        STATE_DRAINING => EngineState::Draining,
        STATE_FAULTED => EngineState::Faulted,
        _ => EngineState::Idle,
    }
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            frames_acquired: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            fault: Mutex::new(None),
            session_id: Mutex::new(None),
        }
    }

    fn state(&self) -> EngineState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    fn set_fault(&self, message: Option<String>) {
        let mut guard = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        *guard = message;
    }

    fn fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_session_id(&self, id: Option<String>) {
        let mut guard = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
        *guard = id;
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Cloneable control handle to the acquisition thread. Every call is a
/// bounded handshake except `status`, which only reads published atomics.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<Command>,
    shared: Arc<Shared>,
    control_timeout: Duration,
}

impl EngineHandle {
    fn request(
        &self,
        make: impl FnOnce(Sender<Result<(), EngineError>>) -> Command,
    ) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(make(reply_tx))
            .map_err(|_| EngineError::ControlTimeout)?;
        match reply_rx.recv_timeout(self.control_timeout) {
            Ok(result) => result,
            Err(_) => Err(EngineError::ControlTimeout),
        }
    }

    /// Allocate a session of the requested capacity and arm the engine.
    /// Valid only in `Idle`.
    pub fn configure(&self, config: SessionConfig) -> Result<(), EngineError> {
        self.request(|reply| Command::Configure(config, reply))
    }

    /// Enter the acquisition loop. Valid only in `Armed`.
    pub fn start(&self) -> Result<(), EngineError> {
        self.request(Command::Start)
    }

    /// Request loop exit at the next iteration boundary. A no-op in `Idle`
    /// and `Faulted`.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop)
    }

    /// Clear a fault and return to `Idle`. Valid in `Faulted` and `Idle`.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.request(Command::Reset)
    }

    /// Lock-free view of the current state and counters.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.shared.state(),
            frames_acquired: self.shared.frames_acquired.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            session_id: self.shared.session_id(),
            fault: self.shared.fault(),
        }
    }

    /// Ask the acquisition thread to exit. Any active session is stopped
    /// and drained first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub struct AcquisitionEngine;

impl AcquisitionEngine {
    /// Spawn the dedicated acquisition thread and return its control
    /// handle. The thread exits on [`EngineHandle::shutdown`] or when every
    /// handle is dropped.
    pub fn spawn(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        monitor: Arc<MonitorCache>,
        options: EngineOptions,
    ) -> (EngineHandle, JoinHandle<()>) {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = bounded(16);
        let handle = EngineHandle {
            tx,
            shared: shared.clone(),
            control_timeout: options.control_timeout,
        };
        let mut worker = Worker {
            source,
            sink,
            monitor,
            shared,
            rx,
            pending: VecDeque::new(),
            session: None,
            options,
        };
        let join = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn acquisition thread");
        (handle, join)
    }
}

struct ActiveSession {
    id: String,
    config: SessionConfig,
    buffer: SessionBuffer,
}

struct Worker {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    monitor: Arc<MonitorCache>,
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    pending: VecDeque<Command>,
    session: Option<ActiveSession>,
    options: EngineOptions,
}

enum LoopOutcome {
    Continue,
    Shutdown,
}

impl Worker {
    fn run(&mut self) {
        info!("Acquisition thread up");
        loop {
            let cmd = match self.pending.pop_front() {
                Some(cmd) => cmd,
                None => match self.rx.recv_timeout(IDLE_POLL) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            match self.handle_command(cmd) {
                LoopOutcome::Continue => {}
                LoopOutcome::Shutdown => break,
            }
        }
        if self.shared.state() == EngineState::Running {
            self.finish_session(None);
        }
        info!("Acquisition thread down");
    }

    fn handle_command(&mut self, cmd: Command) -> LoopOutcome {
        let state = self.shared.state();
        match cmd {
            Command::Configure(config, reply) => {
                let result = self.do_configure(config, state);
                let _ = reply.send(result);
                LoopOutcome::Continue
            }
            Command::Start(reply) => {
                match self.do_start(state) {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        // The loop owns the thread until the session ends.
                        self.run_session()
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        LoopOutcome::Continue
                    }
                }
            }
            Command::Stop(reply) => {
                let result = match state {
                    EngineState::Armed => {
                        // Armed but not acquiring: nothing on the wire yet,
                        // just disarm.
                        self.session = None;
                        self.shared.set_session_id(None);
                        self.shared.set_state(EngineState::Idle);
                        info!("Disarmed");
                        Ok(())
                    }
                    // Idempotent no-ops; Faulted requires an explicit reset.
                    EngineState::Idle | EngineState::Faulted => Ok(()),
                    EngineState::Running | EngineState::Draining => Ok(()),
                };
                let _ = reply.send(result);
                LoopOutcome::Continue
            }
            Command::Reset(reply) => {
                let result = match state {
                    EngineState::Faulted | EngineState::Idle => {
                        self.session = None;
                        self.shared.set_fault(None);
                        self.shared.set_session_id(None);
                        self.shared.set_state(EngineState::Idle);
                        Ok(())
                    }
                    other => Err(EngineError::InvalidState {
                        command: "reset",
                        state: other,
                    }),
                };
                let _ = reply.send(result);
                LoopOutcome::Continue
            }
            Command::Shutdown => LoopOutcome::Shutdown,
        }
    }

    fn do_configure(
        &mut self,
        config: SessionConfig,
        state: EngineState,
    ) -> Result<(), EngineError> {
        if state != EngineState::Idle {
            return Err(EngineError::InvalidState {
                command: "configure",
                state,
            });
        }
        config.validate()?;
        let id = Uuid::new_v4().to_string();
        info!(
            "Configured session {} (capacity {}, frame_time {} s)",
            id, config.capacity, config.exposure.frame_time_s
        );
        self.session = Some(ActiveSession {
            id: id.clone(),
            buffer: SessionBuffer::new(config.capacity),
            config,
        });
        self.shared.frames_acquired.store(0, Ordering::Relaxed);
        self.shared.frames_dropped.store(0, Ordering::Relaxed);
        self.shared.set_fault(None);
        self.shared.set_session_id(Some(id));
        self.monitor.clear();
        self.shared.set_state(EngineState::Armed);
        Ok(())
    }

    fn do_start(&mut self, state: EngineState) -> Result<(), EngineError> {
        if state != EngineState::Armed {
            return Err(EngineError::InvalidState {
                command: "start",
                state,
            });
        }
        let header = match self.session.as_ref() {
            Some(session) => SeriesStart {
                session_id: session.id.clone(),
                capacity: session.config.capacity,
                exposure: session.config.exposure,
                filename: session.config.filename.clone(),
                overwrite: session.config.overwrite,
            },
            None => {
                return Err(EngineError::InvalidState {
                    command: "start",
                    state,
                })
            }
        };
        if let Err(e) = self.source.start(&header.exposure) {
            self.fault(e.0.clone());
            return Err(e.into());
        }
        let header = StreamMessage::SeriesStart(header);
        self.shared.set_state(EngineState::Running);
        if self.publish(header) == PublishOutcome::Dropped {
            warn!("Series start marker lost on the data channel");
        }
        info!("Acquisition started");
        Ok(())
    }

    /// The acquisition loop. Runs until stop, capacity reached or fault;
    /// commands are drained at every iteration boundary and an in-flight
    /// fetch always completes before the loop exits.
    fn run_session(&mut self) -> LoopOutcome {
        loop {
            let (stop, shutdown) = self.drain_commands();
            if stop || shutdown {
                self.finish_session(None);
                return if shutdown {
                    LoopOutcome::Shutdown
                } else {
                    LoopOutcome::Continue
                };
            }

            match self.source.fetch(self.options.fetch_timeout) {
                Ok(Fetch::Timeout) => continue,
                Ok(Fetch::Frame(raw)) => {
                    if self.accept_frame(raw) {
                        // Capacity reached: the expected end of a run.
                        self.finish_session(None);
                        return LoopOutcome::Continue;
                    }
                }
                Err(e) => {
                    error!("Frame source hard error: {}", e);
                    self.finish_session(Some(e.0));
                    return LoopOutcome::Continue;
                }
            }
        }
    }

    /// Append, fan out and count one frame. Returns true when the session
    /// buffer is full afterwards.
    fn accept_frame(&mut self, raw: crate::source::RawFrame) -> bool {
        let Some(session) = self.session.as_mut() else {
            return true;
        };
        let frame = Arc::new(Frame {
            index: session.buffer.len() as u64,
            spectral_data: raw.spectral_data,
            scalars: raw.scalars,
            timestamp: raw.timestamp,
        });
        match session.buffer.push(frame.clone()) {
            Ok(()) => {}
            Err(BufferError::Full { .. }) => return true,
            Err(e @ BufferError::IndexMismatch { .. }) => {
                // Cannot happen with engine-assigned indices; treat as a bug
                // rather than corrupt the stream.
                error!("Session buffer rejected frame: {}", e);
                return true;
            }
        }
        let acquired = self.shared.frames_acquired.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = session.id.clone();
        let full = session.buffer.is_full();

        self.monitor.update(MonitorSnapshot {
            session_id: session_id.clone(),
            frame: frame.clone(),
            frames_acquired: acquired,
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
        });

        let msg = StreamMessage::from_frame(&session_id, &frame);
        if self.publish(msg) == PublishOutcome::Dropped {
            let dropped = self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Frame {} dropped on the data channel ({} total)",
                frame.index, dropped
            );
        }
        debug!("Frame {} acquired", frame.index);
        full
    }

    /// Publish one message, keeping the command channel drained while
    /// back-pressured so stop stays responsive.
    fn publish(&mut self, msg: StreamMessage) -> PublishOutcome {
        let rx = &self.rx;
        let pending = &mut self.pending;
        let mut stop_seen = pending.iter().any(Command::is_stop);
        let mut stop_requested = move || {
            while let Ok(cmd) = rx.try_recv() {
                if cmd.is_stop() {
                    stop_seen = true;
                }
                pending.push_back(cmd);
            }
            stop_seen
        };
        self.sink.publish(msg, &mut stop_requested)
    }

    /// Drain queued control commands, replying to each. Returns
    /// (stop requested, shutdown requested).
    fn drain_commands(&mut self) -> (bool, bool) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.pending.push_back(cmd);
        }
        let mut stop = false;
        let mut shutdown = false;
        while let Some(cmd) = self.pending.pop_front() {
            match cmd {
                Command::Stop(reply) => {
                    stop = true;
                    let _ = reply.send(Ok(()));
                }
                Command::Shutdown => shutdown = true,
                Command::Configure(_, reply) => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        command: "configure",
                        state: self.shared.state(),
                    }));
                }
                Command::Start(reply) => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        command: "start",
                        state: self.shared.state(),
                    }));
                }
                Command::Reset(reply) => {
                    let _ = reply.send(Err(EngineError::InvalidState {
                        command: "reset",
                        state: self.shared.state(),
                    }));
                }
            }
        }
        (stop, shutdown)
    }

    /// Leave the acquisition loop: flush the end-of-series marker, stop the
    /// source and settle in `Idle` (or `Faulted` when a hard error ended
    /// the run).
    fn finish_session(&mut self, fault: Option<String>) {
        if let Some(msg) = fault.clone() {
            self.fault(msg);
        } else {
            self.shared.set_state(EngineState::Draining);
        }
        let acquired = self.shared.frames_acquired.load(Ordering::Relaxed);
        let dropped = self.shared.frames_dropped.load(Ordering::Relaxed);
        if let Some(session) = self.session.take() {
            let end = StreamMessage::SeriesEnd(SeriesEnd {
                session_id: session.id,
                frames_acquired: acquired,
                frames_dropped: dropped,
                fault: fault.clone(),
            });
            if self.publish(end) == PublishOutcome::Dropped {
                warn!("Series end marker lost on the data channel");
            }
        }
        self.source.stop();
        if fault.is_none() {
            self.shared.set_session_id(None);
            self.shared.set_state(EngineState::Idle);
            info!(
                "Session complete: {} frames acquired, {} dropped",
                acquired, dropped
            );
        }
    }

    fn fault(&mut self, message: String) {
        error!("Engine faulted: {}", message);
        self.shared.set_fault(Some(message));
        self.shared.set_state(EngineState::Faulted);
    }
}
