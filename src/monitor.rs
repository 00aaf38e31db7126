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

//! Most-recent-frame cache and the on-demand monitor endpoint.
//!
//! The cache swap is a short mutex-guarded replace of an `Arc` snapshot, so
//! a live viewer polling at its own pace never slows the acquisition loop
//! and never observes a torn frame. Missed frames on this path are by
//! design; the data channel is the lossless one.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info, warn};
use zenoh::Session;

use crate::frame::Frame;
use crate::protocol::{MonitorHeader, MonitorReply};

/// The most recent frame plus session counters, replaced atomically on
/// every acquired frame.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub session_id: String,
    pub frame: Arc<Frame>,
    pub frames_acquired: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
pub struct MonitorCache {
    latest: Mutex<Option<MonitorSnapshot>>,
}

impl MonitorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new snapshot. Called from the acquisition thread once per
    /// frame; the critical section is a pointer-sized replace.
    pub fn update(&self, snapshot: MonitorSnapshot) {
        let mut guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(snapshot);
    }

    /// `None` until the first frame of the current session is acquired.
    pub fn latest(&self) -> Option<MonitorSnapshot> {
        let guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Called on configure so a new session never serves a stale frame.
    pub fn clear(&self) {
        let mut guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

impl MonitorSnapshot {
    pub fn to_reply(&self) -> MonitorReply {
        MonitorReply {
            header: MonitorHeader::Snapshot {
                session_id: self.session_id.clone(),
                frame_index: self.frame.index,
                channels: self.frame.channels(),
                bins: self.frame.bins(),
                timestamp: self.frame.timestamp,
                scalars: self.frame.scalars.clone(),
                frames_acquired: self.frames_acquired,
                frames_dropped: self.frames_dropped,
            },
            payload: Bytes::from(self.frame.payload_bytes()),
        }
    }
}

/// Serves `latest()` over a zenoh queryable, decoupled from the data
/// channel: a query only ever reads the cache.
pub struct MonitorServer {
    session: Session,
    cache: Arc<MonitorCache>,
    key: String,
}

impl MonitorServer {
    pub fn new(session: Session, cache: Arc<MonitorCache>, key: String) -> Self {
        Self {
            session,
            cache,
            key,
        }
    }

    /// Run the monitor endpoint (blocks until the session closes).
    pub async fn run(&self) -> Result<()> {
        let queryable = self
            .session
            .declare_queryable(&self.key)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        info!("Monitor endpoint listening on '{}'", self.key);

        while let Ok(query) = queryable.recv_async().await {
            let reply = match self.cache.latest() {
                Some(snapshot) => {
                    debug!(
                        "Monitor query answered with frame {}",
                        snapshot.frame.index
                    );
                    snapshot.to_reply()
                }
                None => MonitorReply::empty(),
            };
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode monitor reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = query.reply(query.key_expr().clone(), bytes).await {
                warn!("Failed to reply to monitor query: {}", e);
            }
        }

        Ok(())
    }
}
