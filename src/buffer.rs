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

use std::sync::Arc;

use thiserror::Error;

use crate::frame::Frame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Expected end-of-run condition, drives the Draining transition.
    #[error("session buffer full ({capacity} frames)")]
    Full { capacity: usize },

    /// A frame arrived with an index that is not the next append slot.
    /// Indicates an engine bug, never silently accepted.
    #[error("frame index {index} does not match next slot {expected}")]
    IndexMismatch { index: u64, expected: u64 },
}

/// Fixed-capacity in-memory store of frames for one acquisition run.
///
/// Never wraps or evicts; reaching capacity is the session's natural end,
/// not an overflow. Frames are shared as `Arc` so the monitor cache and the
/// distribution path never copy the histogram.
pub struct SessionBuffer {
    frames: Vec<Arc<Frame>>,
    capacity: usize,
}

impl SessionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append the next frame. The frame's index must equal the current
    /// length, which rules out duplicates and gaps by construction.
    pub fn push(&mut self, frame: Arc<Frame>) -> Result<(), BufferError> {
        if self.frames.len() >= self.capacity {
            return Err(BufferError::Full {
                capacity: self.capacity,
            });
        }
        let expected = self.frames.len() as u64;
        if frame.index != expected {
            return Err(BufferError::IndexMismatch {
                index: frame.index,
                expected,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn get(&self, index: u64) -> Option<&Arc<Frame>> {
        self.frames.get(index as usize)
    }

    pub fn last(&self) -> Option<&Arc<Frame>> {
        self.frames.last()
    }
}
