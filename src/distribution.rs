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

//! Low-latency distribution channel: the acquisition thread pushes into a
//! bounded queue, a dedicated publisher thread drains it onto zenoh.
//!
//! Delivery is in frame-index order to every connected subscriber; late
//! joiners get no replay. When the queue saturates the configured policy
//! applies: `block` paces the acquisition loop (the hardware rate is the
//! natural pacing signal), `drop` sheds the frame and counts it. Neither
//! ever drops silently, and the policy only ever sheds frames: series
//! markers wait for queue space.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zenoh::{Session, Wait};

use crate::protocol::StreamMessage;

/// Policy when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for queue space, re-checking the stop flag each timeout slice.
    #[default]
    Block,
    /// Shed the message after one timeout slice and count it.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Dropped,
}

/// Seam between the acquisition engine and the transport. Production uses
/// [`ChannelSink`]; tests substitute an in-memory collector.
pub trait FrameSink: Send {
    /// Publish one message. `stop_requested` is polled while waiting so a
    /// concurrent stop never waits on a saturated transport.
    fn publish(
        &mut self,
        msg: StreamMessage,
        stop_requested: &mut dyn FnMut() -> bool,
    ) -> PublishOutcome;
}

/// Bounded crossbeam-backed sink feeding the publisher thread.
pub struct ChannelSink {
    tx: Sender<StreamMessage>,
    policy: BackpressurePolicy,
    timeout: Duration,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the publisher thread (or
    /// a test harness).
    pub fn new(
        capacity: usize,
        policy: BackpressurePolicy,
        timeout: Duration,
    ) -> (Self, Receiver<StreamMessage>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                policy,
                timeout,
            },
            rx,
        )
    }
}

impl FrameSink for ChannelSink {
    fn publish(
        &mut self,
        msg: StreamMessage,
        stop_requested: &mut dyn FnMut() -> bool,
    ) -> PublishOutcome {
        // Series markers are must-deliver: a receiver that misses one loses
        // the whole session, so they wait for space under either policy.
        let droppable = matches!(msg, StreamMessage::Frame { .. })
            && self.policy == BackpressurePolicy::Drop;
        let mut pending = msg;
        loop {
            match self.tx.send_timeout(pending, self.timeout) {
                Ok(()) => return PublishOutcome::Sent,
                Err(SendTimeoutError::Timeout(back)) => {
                    if droppable {
                        debug!("Outbound queue full, dropping frame");
                        return PublishOutcome::Dropped;
                    }
                    if stop_requested() {
                        warn!("Stop requested while back-pressured, shedding message");
                        return PublishOutcome::Dropped;
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!("Publisher thread gone, message lost");
                    return PublishOutcome::Dropped;
                }
            }
        }
    }
}

/// Spawn the publisher thread: drains the sink queue onto a zenoh
/// publisher in order, one message at a time. Exits when the sending side
/// is dropped.
pub fn spawn_publisher(
    session: Session,
    key: String,
    rx: Receiver<StreamMessage>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("data-publisher".to_string())
        .spawn(move || {
            let publisher = match session.declare_publisher(key.clone()).wait() {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to declare data publisher on '{}': {}", key, e);
                    return;
                }
            };
            info!("Data channel publishing on '{}'", key);
            for msg in rx.iter() {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        // An unencodable message is a bug, not a stream error.
                        error!("Failed to encode stream message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = publisher.put(bytes).wait() {
                    warn!("Data publish failed: {}", e);
                }
            }
            debug!("Data publisher thread exiting");
        })
        .expect("failed to spawn publisher thread")
}
