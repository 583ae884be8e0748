// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Consecutive-trigger threshold counter.
//!
//! Tracks how many trigger frames have been observed *in a row*. The count
//! resets to zero on any non-trigger frame rather than decrementing, so a
//! single flickering frame restarts the run. Used by the utterance segmenter
//! for both its start (speech) and end (hangover) thresholds.

/// Counts consecutive trigger observations against a threshold.
///
/// The threshold is bounded below by 1 frame.
#[derive(Debug, Clone)]
pub struct ConsecutiveTrigger {
    threshold: u32,
    count: u32,
}

impl ConsecutiveTrigger {
    /// Create a counter that fires after `threshold` consecutive triggers.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Create a counter whose threshold covers `duration_ms` of audio at
    /// `frame_len_ms` per frame, rounded up.
    pub fn from_duration(duration_ms: u32, frame_len_ms: u32) -> Self {
        let frame_len_ms = frame_len_ms.max(1);
        Self::new(duration_ms.div_ceil(frame_len_ms))
    }

    /// Record one frame. Returns `true` when the consecutive count has
    /// reached the threshold.
    pub fn observe(&mut self, triggered: bool) -> bool {
        if triggered {
            self.count += 1;
        } else {
            self.count = 0;
        }
        self.count >= self.threshold
    }

    /// Reset the consecutive count to zero.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Current consecutive count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Configured threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
