// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Paced RTP frame sender.
//!
//! [`PacedSender`] owns a soft-real-time tick task that emits exactly one
//! 20 ms mu-law frame per 20 ms of wall-clock time to an injected
//! `send_action` callback. When the outbound queue is empty it fills the
//! gap with silence frames so the RTP stream never starves. The tick
//! schedule is absolute (`expected_elapsed_ms` against a monotonic start
//! instant), so per-tick jitter is absorbed without drift.
//!
//! Producers enqueue from any task; the tick loop is the only consumer.
//! The single-slot frame filter is atomically replaceable and is how the
//! conversation controller ducks the bot's volume during barge-in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::codec::{is_mulaw_silence, mulaw_silence_frame, MULAW_FRAME_BYTES};

/// Tick period and therefore frame duration.
pub const TICK_MS: u64 = 20;

/// RTP timestamp units covered by one frame (8 kHz * 20 ms).
pub const RTP_UNITS_PER_FRAME: u32 = 160;

/// Outbound sink for paced frames: `(duration_rtp_units, frame_bytes)`.
pub type SendAction = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// A pure byte-to-byte frame transform installed in the filter slot.
///
/// Expected to return [`MULAW_FRAME_BYTES`] bytes for a
/// [`MULAW_FRAME_BYTES`]-byte input; anything else (or an error) sends the
/// frame unfiltered while keeping the filter installed.
pub type FrameFilter = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, FilterError> + Send + Sync>;

/// Error surfaced by a frame filter.
#[derive(Debug, thiserror::Error)]
#[error("frame filter failed: {0}")]
pub struct FilterError(pub String);

/// Errors from sender operations.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("invalid frame length: expected {MULAW_FRAME_BYTES} bytes, got {0}")]
    InvalidFrameLength(usize),
}

/// Lifecycle events emitted by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    /// All pending (non-silence) audio has been sent, or the buffer was
    /// reset while audio was pending.
    SendingComplete,
}

/// State shared between producers and the tick task.
struct Shared {
    queue: Mutex<VecDeque<Vec<u8>>>,
    filter: Mutex<Option<FrameFilter>>,
    has_audio_pending: AtomicBool,
}

/// Wall-clock paced 20 ms frame dispatcher.
pub struct PacedSender {
    shared: Arc<Shared>,
    send_action: SendAction,
    events_tx: mpsc::UnboundedSender<SenderEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SenderEvent>>>,
    run: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PacedSender {
    /// Create a sender that dispatches frames to `send_action`.
    pub fn new(send_action: SendAction) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                filter: Mutex::new(None),
                has_audio_pending: AtomicBool::new(false),
            }),
            send_action,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SenderEvent>> {
        self.events_rx.lock().expect("events_rx lock poisoned").take()
    }

    /// Start the tick task. A no-op when already running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.send_action),
            self.events_tx.clone(),
            cancel.clone(),
        ));
        *run = Some((cancel, handle));
        debug!("paced sender: started");
    }

    /// Stop the tick task and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let taken = self.run.lock().await.take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("paced sender: tick task join error: {e}");
            }
            debug!("paced sender: stopped");
        }
    }

    /// Enqueue one encoded frame of exactly [`MULAW_FRAME_BYTES`] bytes.
    pub fn enqueue(&self, frame: Vec<u8>) -> Result<(), SenderError> {
        if frame.len() != MULAW_FRAME_BYTES {
            return Err(SenderError::InvalidFrameLength(frame.len()));
        }
        if !is_mulaw_silence(&frame) {
            self.shared.has_audio_pending.store(true, Ordering::Release);
        }
        self.shared
            .queue
            .lock()
            .expect("queue lock poisoned")
            .push_back(frame);
        Ok(())
    }

    /// Enqueue an arbitrary mu-law byte buffer, split into
    /// [`MULAW_FRAME_BYTES`]-byte frames. A trailing partial frame is
    /// discarded.
    pub fn enqueue_chunk(&self, bytes: &[u8]) {
        let remainder = bytes.len() % MULAW_FRAME_BYTES;
        if remainder != 0 {
            debug!(
                dropped = remainder,
                "paced sender: discarding trailing partial frame"
            );
        }
        for frame in bytes.chunks_exact(MULAW_FRAME_BYTES) {
            // Length is exact by construction.
            let _ = self.enqueue(frame.to_vec());
        }
    }

    /// Drain the queue. Signals [`SenderEvent::SendingComplete`] when audio
    /// was pending. Safe to call any number of times.
    pub fn reset_buffer(&self) {
        let drained = {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        if drained > 0 {
            debug!(drained, "paced sender: buffer reset");
        }
        if self.shared.has_audio_pending.swap(false, Ordering::AcqRel) {
            let _ = self.events_tx.send(SenderEvent::SendingComplete);
        }
    }

    /// Install (or replace) the frame filter.
    pub fn apply_filter(&self, filter: FrameFilter) {
        *self.shared.filter.lock().expect("filter lock poisoned") = Some(filter);
    }

    /// Remove the frame filter. Safe to call any number of times.
    pub fn clear_filter(&self) {
        *self.shared.filter.lock().expect("filter lock poisoned") = None;
    }

    /// Whether queued frames remain. Silence filler ticks do not count.
    pub fn is_playing(&self) -> bool {
        !self.shared.queue.lock().expect("queue lock poisoned").is_empty()
    }
}

/// The soft-real-time tick loop: one frame per 20 ms against an absolute
/// schedule.
async fn tick_loop(
    shared: Arc<Shared>,
    send_action: SendAction,
    events_tx: mpsc::UnboundedSender<SenderEvent>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut expected_elapsed_ms: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (frame, queue_empty_after) = {
            let mut queue = shared.queue.lock().expect("queue lock poisoned");
            let frame = queue.pop_front();
            let empty = queue.is_empty();
            (frame, empty)
        };
        let from_queue = frame.is_some();
        let frame = frame.unwrap_or_else(mulaw_silence_frame);

        let outgoing = apply_filter_slot(&shared, &frame);
        (send_action)(RTP_UNITS_PER_FRAME, &outgoing);

        // Completion: the last queued non-silence frame has just gone out.
        if from_queue
            && queue_empty_after
            && !is_mulaw_silence(&frame)
            && shared.has_audio_pending.swap(false, Ordering::AcqRel)
        {
            let _ = events_tx.send(SenderEvent::SendingComplete);
        }

        expected_elapsed_ms += TICK_MS;
        let actual_elapsed_ms = started.elapsed().as_millis() as u64;
        if actual_elapsed_ms < expected_elapsed_ms {
            let wait = Duration::from_millis(expected_elapsed_ms - actual_elapsed_ms);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        } else {
            // Behind schedule: yield and catch up on the next iterations.
            tokio::task::yield_now().await;
        }
    }
}

/// Apply the current filter to one frame. A filter error or a wrong-length
/// result logs a warning and the frame goes out unfiltered; the filter
/// remains installed either way.
fn apply_filter_slot(shared: &Shared, frame: &[u8]) -> Vec<u8> {
    let filter = shared
        .filter
        .lock()
        .expect("filter lock poisoned")
        .clone();
    let Some(filter) = filter else {
        return frame.to_vec();
    };
    match filter(frame) {
        Ok(filtered) if filtered.len() == MULAW_FRAME_BYTES => filtered,
        Ok(filtered) => {
            warn!(
                len = filtered.len(),
                "paced sender: filter returned wrong frame length, sending unfiltered"
            );
            frame.to_vec()
        }
        Err(e) => {
            warn!("paced sender: filter failed ({e}), sending unfiltered");
            frame.to_vec()
        }
    }
}
