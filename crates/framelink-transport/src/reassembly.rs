//! Fragment → frame reassembly.
//!
//! A fixed pool of assembly slots, each sized for the largest expected frame,
//! plus a bounded ready queue of completed-slot indices. One producer task
//! (the receive loop) calls [`ReassemblyBuffer::process_fragment`]; one
//! consumer task pops finished frames with [`ReassemblyBuffer::get_frame`]
//! and returns the slot by dropping the [`AssembledFrame`] view.
//!
//! Slot lifecycle:
//!
//! ```text
//! ProducerFree ──first fragment──► ProducerUsed ──last fragment──► ConsumerFree
//!      ▲                                                               │
//!      └────────────────── AssembledFrame dropped ─────────────────────┘
//! ```
//!
//! Loss is by design: when every slot is busy, a fragment for a new frame
//! first cannibalizes the ready queue (a completed-but-unconsumed frame),
//! then the oldest in-progress slot by capture timestamp.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use framelink_core::{FrameMeta, PixelFormat, Timestamp, TransportError};
use framelink_proto::fragment::{Fragment, CHUNK_SIZE};

// ── Slot ──────────────────────────────────────────────────────────────────────

/// Ownership tag of one assembly slot. Exactly one side may touch the slot's
/// payload at any instant: the producer while `ProducerFree`/`ProducerUsed`,
/// the consumer while `ConsumerFree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    ProducerFree,
    ProducerUsed,
    ConsumerFree,
}

struct Slot {
    state: SlotState,
    meta: FrameMeta,
    msg_total: i32,
    msg_received: i32,
    /// Received-index bitmask — duplicate fragments are detected here rather
    /// than double-counted (see DESIGN.md, open question 1).
    received: Vec<u64>,
    /// Taken while the consumer holds the frame view; restored on drop.
    buf: Option<Box<[u8]>>,
}

impl Slot {
    fn new(max_frame_len: usize, mask_words: usize) -> Self {
        Self {
            state: SlotState::ProducerFree,
            meta: FrameMeta {
                len: 0,
                width: 0,
                height: 0,
                format: PixelFormat::Yuyv,
                timestamp: Timestamp::ZERO,
            },
            msg_total: 0,
            msg_received: 0,
            received: vec![0; mask_words],
            buf: Some(vec![0u8; max_frame_len].into_boxed_slice()),
        }
    }

    fn begin_frame(&mut self, meta: FrameMeta, msg_total: i32) {
        self.state = SlotState::ProducerUsed;
        self.meta = meta;
        self.msg_total = msg_total;
        self.msg_received = 0;
        self.received.fill(0);
    }

    fn mark_received(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        if self.received[word] & (1 << bit) != 0 {
            return false;
        }
        self.received[word] |= 1 << bit;
        self.msg_received += 1;
        true
    }
}

struct Inner {
    slots: Vec<Slot>,
    ready: VecDeque<usize>,
    /// Jitter gate: while locked, `get_frame` refuses to drain until
    /// `ready_backlog` frames are queued.
    locked: bool,
    ready_backlog: usize,
    min_get_interval: Duration,
    last_get: Option<Instant>,
}

// ── ReassemblyBuffer ──────────────────────────────────────────────────────────

/// Concurrency-safe fragment reassembly pool. Single-producer /
/// single-consumer by contract; the interior mutex only guards short
/// memcpy-sized critical sections.
pub struct ReassemblyBuffer {
    max_frame_len: usize,
    max_fragments: usize,
    format: PixelFormat,
    inner: Mutex<Inner>,
    ready_notify: Notify,
}

impl ReassemblyBuffer {
    /// Allocate `capacity` slots of `max_frame_len` bytes each, plus a ready
    /// queue of the same capacity. All memory is allocated here and reused
    /// for the lifetime of the buffer.
    pub fn new(capacity: usize, max_frame_len: usize, format: PixelFormat) -> Self {
        assert!(capacity > 0, "reassembly buffer needs at least one slot");
        let max_fragments = max_frame_len.div_ceil(CHUNK_SIZE).max(1);
        let mask_words = max_fragments.div_ceil(64);
        Self {
            max_frame_len,
            max_fragments,
            format,
            inner: Mutex::new(Inner {
                slots: (0..capacity)
                    .map(|_| Slot::new(max_frame_len, mask_words))
                    .collect(),
                ready: VecDeque::with_capacity(capacity),
                locked: false,
                ready_backlog: 0,
                min_get_interval: Duration::ZERO,
                last_get: None,
            }),
            ready_notify: Notify::new(),
        }
    }

    /// Configure the consumer admission policy: a minimum interval between
    /// `get_frame` returns, and a backlog of `ready_backlog` frames required
    /// before draining begins (the gate re-arms whenever the queue empties).
    pub fn set_admission(&self, min_get_interval: Duration, ready_backlog: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.min_get_interval = min_get_interval;
        inner.ready_backlog = ready_backlog;
        inner.locked = ready_backlog > 0;
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    /// Completed frames currently queued.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    // ── Producer side ─────────────────────────────────────────────────────────

    /// Feed one received fragment into the pool.
    ///
    /// Slot selection order: the in-progress slot with this fragment's
    /// timestamp, else any free slot, else the oldest entry of the ready
    /// queue (overwriting a finished frame nobody consumed), else the oldest
    /// in-progress slot. A fragment that cannot claim any slot is dropped
    /// silently — UDP tolerates the loss.
    pub fn process_fragment(&self, frag: &Fragment) -> Result<(), TransportError> {
        if frag.len as usize > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frag.len as usize,
                max: self.max_frame_len,
            });
        }
        let index = frag.msg_number as usize;
        let offset = index * CHUNK_SIZE;
        if index >= self.max_fragments || offset + frag.chunk().len() > self.max_frame_len {
            return Err(TransportError::FragmentOutOfRange {
                index: frag.msg_number,
                total: self.max_fragments as i32,
            });
        }

        let mut inner = self.inner.lock().unwrap();

        let idx = match self.claim_slot(&mut inner, frag) {
            Some(idx) => idx,
            None => {
                trace!("No slot available — dropping fragment ts={}", frag.timestamp);
                return Ok(());
            }
        };

        let slot = &mut inner.slots[idx];
        if !slot.mark_received(index) {
            debug!(
                "Duplicate fragment {}/{} ts={} — ignored",
                frag.msg_number, frag.msg_total, frag.timestamp
            );
            return Ok(());
        }

        if let Some(buf) = slot.buf.as_deref_mut() {
            let chunk = frag.chunk();
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
        }

        if slot.msg_received == slot.msg_total {
            slot.state = SlotState::ConsumerFree;
            if inner.ready.len() < inner.slots.len() {
                inner.ready.push_back(idx);
                drop(inner);
                self.ready_notify.notify_one();
            } else {
                // Cannot happen while the consumer honors the
                // single-outstanding-frame discipline; recover by recycling.
                warn!("Ready queue full — dropping completed frame");
                inner.slots[idx].state = SlotState::ProducerFree;
            }
        }
        Ok(())
    }

    /// Pick the slot a fragment lands in. On a miss for its timestamp, a new
    /// frame starts assembling — possibly cannibalizing older work.
    fn claim_slot(&self, inner: &mut Inner, frag: &Fragment) -> Option<usize> {
        // In-progress slot for this frame's timestamp
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.state == SlotState::ProducerUsed && s.meta.timestamp == frag.timestamp)
        {
            return Some(idx);
        }

        let meta = frag.frame_meta(self.format);

        // Free slot
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.state == SlotState::ProducerFree)
        {
            inner.slots[idx].begin_frame(meta, frag.msg_total);
            return Some(idx);
        }

        // Overwrite a completed-but-unconsumed frame — lossy by design
        if let Some(idx) = inner.ready.pop_front() {
            debug!(
                "Overwriting unconsumed frame ts={} for new ts={}",
                inner.slots[idx].meta.timestamp, frag.timestamp
            );
            inner.slots[idx].begin_frame(meta, frag.msg_total);
            return Some(idx);
        }

        // Forcibly reclaim the oldest in-progress frame; (sec, usec)
        // lexicographic order, strictly earlier wins.
        if let Some(idx) = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::ProducerUsed)
            .min_by_key(|(_, s)| s.meta.timestamp)
            .map(|(i, _)| i)
        {
            debug!(
                "Reclaiming oldest in-progress frame ts={} for new ts={}",
                inner.slots[idx].meta.timestamp, frag.timestamp
            );
            inner.slots[idx].begin_frame(meta, frag.msg_total);
            return Some(idx);
        }

        // Every slot is checked out by the consumer — nothing to claim.
        None
    }

    // ── Consumer side ─────────────────────────────────────────────────────────

    /// Pop the next completed frame, waiting up to `timeout`.
    ///
    /// Honors the admission policy set via [`set_admission`]: the call
    /// first pads out the minimum inter-get interval, then waits for the
    /// backlog gate. Returns `None` on timeout.
    ///
    /// The returned [`AssembledFrame`] borrows this buffer; dropping it
    /// returns the slot to the producer. At most one frame may be
    /// outstanding — enforced by the borrow.
    ///
    /// [`set_admission`]: ReassemblyBuffer::set_admission
    pub async fn get_frame(&self, timeout: Duration) -> Option<AssembledFrame<'_>> {
        let deadline = Instant::now() + timeout;

        // Rate limit: pad out the minimum interval between consecutive gets.
        let pause = {
            let inner = self.inner.lock().unwrap();
            inner.last_get.and_then(|last| {
                (last + inner.min_get_interval).checked_duration_since(Instant::now())
            })
        };
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.locked && inner.ready.len() >= inner.ready_backlog {
                    inner.locked = false;
                }
                if !inner.locked {
                    if let Some(idx) = inner.ready.pop_front() {
                        if inner.ready.is_empty() && inner.ready_backlog > 0 {
                            inner.locked = true;
                        }
                        inner.last_get = Some(Instant::now());
                        let slot = &mut inner.slots[idx];
                        let meta = slot.meta;
                        let buf = slot.buf.take();
                        return Some(AssembledFrame {
                            owner: self,
                            index: idx,
                            meta,
                            buf,
                        });
                    }
                }
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, self.ready_notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    fn return_slot(&self, index: usize, buf: Option<Box<[u8]>>) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        slot.buf = buf;
        slot.state = SlotState::ProducerFree;
    }
}

// ── AssembledFrame ────────────────────────────────────────────────────────────

/// View of one completed frame, borrowing its assembly slot.
///
/// Dropping the view performs the `return_frame` transition
/// (ConsumerFree → ProducerFree), handing the slot back to the producer.
pub struct AssembledFrame<'a> {
    owner: &'a ReassemblyBuffer,
    index: usize,
    meta: FrameMeta,
    buf: Option<Box<[u8]>>,
}

impl AssembledFrame<'_> {
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Assembled payload, truncated to the declared frame length.
    pub fn data(&self) -> &[u8] {
        let buf = self.buf.as_deref().unwrap_or(&[]);
        &buf[..self.meta.len.min(buf.len())]
    }
}

impl Drop for AssembledFrame<'_> {
    fn drop(&mut self) {
        self.owner.return_slot(self.index, self.buf.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::FrameMeta;

    const TS1: Timestamp = Timestamp { sec: 100, usec: 0 };
    const TS2: Timestamp = Timestamp { sec: 100, usec: 50 };
    const TS3: Timestamp = Timestamp { sec: 101, usec: 0 };

    fn meta(len: usize, ts: Timestamp) -> FrameMeta {
        FrameMeta {
            len,
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            timestamp: ts,
        }
    }

    /// Build the fragments of a frame whose payload is `fill` repeated.
    fn frags(ts: Timestamp, len: usize, fill: u8) -> Vec<Fragment> {
        let data = vec![fill; len];
        let total = len.div_ceil(CHUNK_SIZE).max(1) as i32;
        (0..total)
            .map(|i| {
                let offset = i as usize * CHUNK_SIZE;
                let end = (offset + CHUNK_SIZE).min(len);
                Fragment::for_chunk(&meta(len, ts), total, i, &data[offset..end])
            })
            .collect()
    }

    #[tokio::test]
    async fn reassembles_out_of_order_fragments() {
        // P2: any delivery order yields the original payload, one enqueue
        let buf = ReassemblyBuffer::new(3, 8000, PixelFormat::Yuyv);
        let mut parts = frags(TS1, 3500, 0xCD);
        parts.reverse();
        for f in &parts {
            buf.process_fragment(f).unwrap();
        }
        assert_eq!(buf.ready_len(), 1);

        let frame = buf.get_frame(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame.meta().timestamp, TS1);
        assert_eq!(frame.data(), &vec![0xCD; 3500][..]);
    }

    #[tokio::test]
    async fn interleaved_frames_both_complete() {
        // Scenario 1: 2-fragment F1 and 3-fragment F2, interleaved
        let buf = ReassemblyBuffer::new(3, 8000, PixelFormat::Yuyv);
        let f1 = frags(TS1, 2000, 0x11);
        let f2 = frags(TS2, 3500, 0x22);
        assert_eq!((f1.len(), f2.len()), (2, 3));

        buf.process_fragment(&f1[0]).unwrap();
        buf.process_fragment(&f2[0]).unwrap();
        buf.process_fragment(&f1[1]).unwrap();
        buf.process_fragment(&f2[1]).unwrap();
        buf.process_fragment(&f2[2]).unwrap();

        let first = buf.get_frame(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.meta().timestamp, TS1);
        assert_eq!(first.data(), &vec![0x11; 2000][..]);
        drop(first);

        let second = buf.get_frame(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.meta().timestamp, TS2);
        assert_eq!(second.data(), &vec![0x22; 3500][..]);
    }

    #[tokio::test]
    async fn oldest_in_progress_frame_is_reclaimed() {
        // Scenario 2: all slots mid-assembly, new timestamp arrives
        let buf = ReassemblyBuffer::new(3, 8000, PixelFormat::Yuyv);
        for (ts, fill) in [(TS1, 0x01), (TS2, 0x02), (TS3, 0x03)] {
            // First fragment only — every slot stays in progress
            buf.process_fragment(&frags(ts, 3000, fill)[0]).unwrap();
        }

        let ts_new = Timestamp::new(200, 0);
        let newcomer = frags(ts_new, 2000, 0xFF);
        for f in &newcomer {
            buf.process_fragment(f).unwrap();
        }

        // Newcomer completed in the slot reclaimed from TS1 (the oldest)
        let frame = buf.get_frame(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame.meta().timestamp, ts_new);
        assert_eq!(frame.data(), &vec![0xFF; 2000][..]);
        drop(frame);

        // TS1's partial assembly is gone: resending its missing tail alone
        // cannot complete it (a fresh slot claim starts the count over).
        let f1 = frags(TS1, 3000, 0x01);
        buf.process_fragment(&f1[1]).unwrap();
        assert!(buf.get_frame(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn unconsumed_ready_frame_is_overwritten() {
        let buf = ReassemblyBuffer::new(1, 8000, PixelFormat::Yuyv);
        for f in &frags(TS1, 2000, 0xAA) {
            buf.process_fragment(f).unwrap();
        }
        assert_eq!(buf.ready_len(), 1);

        // Single slot, ready frame never consumed — new frame cannibalizes it
        for f in &frags(TS3, 2000, 0xBB) {
            buf.process_fragment(f).unwrap();
        }
        let frame = buf.get_frame(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame.meta().timestamp, TS3);
        assert_eq!(frame.data(), &vec![0xBB; 2000][..]);
    }

    #[tokio::test]
    async fn duplicate_fragment_does_not_complete_early() {
        // P3: the received-index mask dedupes, so a repeated fragment can
        // never stand in for a missing one.
        let buf = ReassemblyBuffer::new(2, 8000, PixelFormat::Yuyv);
        let parts = frags(TS1, 3500, 0x77);
        assert_eq!(parts.len(), 3);

        buf.process_fragment(&parts[0]).unwrap();
        buf.process_fragment(&parts[0]).unwrap();
        buf.process_fragment(&parts[1]).unwrap();
        assert_eq!(buf.ready_len(), 0);

        buf.process_fragment(&parts[2]).unwrap();
        assert_eq!(buf.ready_len(), 1);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let buf = ReassemblyBuffer::new(2, 2000, PixelFormat::Yuyv);
        let err = buf
            .process_fragment(&frags(TS1, 3000, 0x00)[0])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::FrameTooLarge { len: 3000, max: 2000 }
        ));
    }

    #[tokio::test]
    async fn fragment_index_beyond_slot_is_rejected() {
        // A corrupt header can declare a small frame with a huge index;
        // the copy must never run past the slot.
        let buf = ReassemblyBuffer::new(2, 4000, PixelFormat::Yuyv);
        let mut frag = frags(TS1, 1000, 0x00).remove(0);
        frag.msg_total = 10;
        frag.msg_number = 9;
        assert!(matches!(
            buf.process_fragment(&frag),
            Err(TransportError::FragmentOutOfRange { index: 9, .. })
        ));
    }

    #[tokio::test]
    async fn checked_out_slot_survives_producer_pressure() {
        // P1: the consumer's outstanding frame is never reclaimed
        let buf = ReassemblyBuffer::new(1, 8000, PixelFormat::Yuyv);
        for f in &frags(TS1, 2000, 0x5A) {
            buf.process_fragment(f).unwrap();
        }
        let frame = buf.get_frame(Duration::from_millis(10)).await.unwrap();

        // Flood with new frames while the view is held: the only slot is
        // checked out, so everything is dropped on the floor.
        for f in &frags(TS3, 2000, 0x99) {
            buf.process_fragment(f).unwrap();
        }
        assert_eq!(frame.data(), &vec![0x5A; 2000][..]);
        assert_eq!(buf.ready_len(), 0);
    }

    #[tokio::test]
    async fn get_frame_times_out_when_empty() {
        let buf = ReassemblyBuffer::new(2, 2000, PixelFormat::Yuyv);
        let started = Instant::now();
        assert!(buf.get_frame(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn backlog_gate_holds_until_filled() {
        let buf = ReassemblyBuffer::new(4, 2000, PixelFormat::Yuyv);
        buf.set_admission(Duration::ZERO, 2);

        for f in &frags(TS1, 1000, 0x01) {
            buf.process_fragment(f).unwrap();
        }
        // One frame ready, gate wants two
        assert!(buf.get_frame(Duration::from_millis(20)).await.is_none());

        for f in &frags(TS2, 1000, 0x02) {
            buf.process_fragment(f).unwrap();
        }
        let frame = buf.get_frame(Duration::from_millis(20)).await.unwrap();
        assert_eq!(frame.meta().timestamp, TS1);
    }
}
