// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::types::{EncodeError, EncodedFrame};

/// Bounded, sequence-ordered buffer between the completion thread and the
/// caller. Completions may arrive in any order; frames only ever leave in
/// submission order. Admission is capped, so the reordering side can never
/// outgrow the cap.
#[derive(Clone)]
pub(crate) struct OutputQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    progress: Condvar,
}

struct QueueState {
    capacity: usize,
    /// Sequence numbers handed out to submissions so far.
    admitted: u64,
    /// Completions processed (enqueued), including ones already dequeued.
    completed: u64,
    /// Next sequence the caller will receive.
    next_seq: u64,
    pending: BTreeMap<u64, EncodedFrame>,
    failed: bool,
}

pub(crate) enum DrainOutcome {
    Drained,
    Failed,
    TimedOut,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    capacity,
                    admitted: 0,
                    completed: 0,
                    next_seq: 0,
                    pending: BTreeMap::new(),
                    failed: false,
                }),
                progress: Condvar::new(),
            }),
        }
    }

    /// Reserve the next sequence number for a submission, or report
    /// saturation. A frame stays counted from here until it is dequeued.
    pub fn admit(&self) -> Result<u64, EncodeError> {
        let mut st = self.inner.state.lock();
        // Frames count against the capacity from admission until the caller
        // dequeues them; delivery is in order, so next_seq doubles as the
        // delivered count.
        if (st.admitted - st.next_seq) as usize >= st.capacity {
            return Err(EncodeError::QueueFull);
        }
        let seq = st.admitted;
        st.admitted += 1;
        Ok(seq)
    }

    /// Undo the most recent `admit`, for submissions the service refused
    /// synchronously.
    pub fn retract(&self, seq: u64) {
        let mut st = self.inner.state.lock();
        if st.admitted == seq + 1 {
            st.admitted = seq;
        }
    }

    /// Insert a completed frame, keyed by its sequence tag. Called from the
    /// completion thread.
    pub fn enqueue(&self, seq: u64, frame: EncodedFrame) -> Result<(), EncodeError> {
        let mut st = self.inner.state.lock();
        if st.failed {
            // Failing the session drops everything still in flight.
            return Ok(());
        }
        if seq >= st.admitted || seq < st.next_seq || st.pending.contains_key(&seq) {
            return Err(EncodeError::ReorderViolation(seq));
        }
        st.pending.insert(seq, frame);
        st.completed += 1;
        self.inner.progress.notify_all();
        Ok(())
    }

    /// Frame for the next expected sequence, if it has arrived. Never yields
    /// frames out of order.
    pub fn dequeue_next(&self) -> Option<EncodedFrame> {
        let mut st = self.inner.state.lock();
        let next = st.next_seq;
        let frame = st.pending.remove(&next)?;
        st.next_seq += 1;
        Some(frame)
    }

    /// Block until `target` completions have been processed, the queue is
    /// marked failed, or the deadline passes.
    pub fn wait_drained(&self, target: u64, deadline: Instant) -> DrainOutcome {
        let mut st = self.inner.state.lock();
        loop {
            if st.failed {
                return DrainOutcome::Failed;
            }
            if st.completed >= target {
                return DrainOutcome::Drained;
            }
            if self.inner.progress.wait_until(&mut st, deadline).timed_out() {
                if st.failed {
                    return DrainOutcome::Failed;
                }
                if st.completed >= target {
                    return DrainOutcome::Drained;
                }
                return DrainOutcome::TimedOut;
            }
        }
    }

    /// Mark the queue failed and wake any drain waiter.
    pub fn fail(&self) {
        let mut st = self.inner.state.lock();
        st.failed = true;
        self.inner.progress.notify_all();
    }

    /// Drop all buffered frames.
    pub fn clear(&self) {
        let mut st = self.inner.state.lock();
        st.next_seq = st.admitted;
        st.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::types::MediaTime;

    fn frame(seq: u64) -> EncodedFrame {
        EncodedFrame {
            seq,
            data: vec![seq as u8],
            pts: MediaTime { value: seq as i64 * 1001, timescale: 30000 },
            duration: MediaTime { value: 1001, timescale: 30000 },
            metrics: None,
        }
    }

    #[test]
    fn in_order_completions_flow_through() {
        let queue = OutputQueue::new(4);
        for _ in 0..3 {
            let seq = queue.admit().unwrap();
            queue.enqueue(seq, frame(seq)).unwrap();
        }
        for expected in 0..3 {
            assert_eq!(queue.dequeue_next().unwrap().seq, expected);
        }
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn out_of_order_completions_are_resequenced() {
        let queue = OutputQueue::new(8);
        for _ in 0..4 {
            queue.admit().unwrap();
        }
        for seq in [2, 0, 3, 1] {
            queue.enqueue(seq, frame(seq)).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue_next()).map(|f| f.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn gaps_hold_back_later_frames() {
        let queue = OutputQueue::new(4);
        queue.admit().unwrap();
        queue.admit().unwrap();
        queue.enqueue(1, frame(1)).unwrap();
        assert!(queue.dequeue_next().is_none());
        queue.enqueue(0, frame(0)).unwrap();
        assert_eq!(queue.dequeue_next().unwrap().seq, 0);
        assert_eq!(queue.dequeue_next().unwrap().seq, 1);
    }

    #[test]
    fn admission_is_bounded_until_frames_are_dequeued() {
        let queue = OutputQueue::new(2);
        let a = queue.admit().unwrap();
        let _b = queue.admit().unwrap();
        assert!(matches!(queue.admit(), Err(EncodeError::QueueFull)));

        // Completion alone does not free capacity; dequeue does.
        queue.enqueue(a, frame(a)).unwrap();
        assert!(matches!(queue.admit(), Err(EncodeError::QueueFull)));
        assert_eq!(queue.dequeue_next().unwrap().seq, a);
        assert!(queue.admit().is_ok());
    }

    #[test]
    fn retract_frees_the_last_admission() {
        let queue = OutputQueue::new(1);
        let seq = queue.admit().unwrap();
        queue.retract(seq);
        assert_eq!(queue.admit().unwrap(), seq);
    }

    #[test]
    fn unknown_and_duplicate_sequences_are_violations() {
        let queue = OutputQueue::new(4);
        assert!(matches!(queue.enqueue(0, frame(0)), Err(EncodeError::ReorderViolation(0))));

        let seq = queue.admit().unwrap();
        queue.enqueue(seq, frame(seq)).unwrap();
        assert!(matches!(queue.enqueue(seq, frame(seq)), Err(EncodeError::ReorderViolation(_))));

        // Already delivered sequences are stale.
        queue.dequeue_next().unwrap();
        assert!(matches!(queue.enqueue(seq, frame(seq)), Err(EncodeError::ReorderViolation(_))));
    }

    #[test]
    fn drain_wait_outcomes() {
        let queue = OutputQueue::new(4);
        assert!(matches!(queue.wait_drained(0, Instant::now()), DrainOutcome::Drained));
        assert!(matches!(
            queue.wait_drained(1, Instant::now() + Duration::from_millis(10)),
            DrainOutcome::TimedOut
        ));

        let seq = queue.admit().unwrap();
        queue.enqueue(seq, frame(seq)).unwrap();
        assert!(matches!(queue.wait_drained(1, Instant::now()), DrainOutcome::Drained));

        queue.fail();
        assert!(matches!(queue.wait_drained(2, Instant::now()), DrainOutcome::Failed));
    }

    #[test]
    fn failed_queue_swallows_late_completions() {
        let queue = OutputQueue::new(4);
        let seq = queue.admit().unwrap();
        queue.fail();
        queue.clear();
        queue.enqueue(seq, frame(seq)).unwrap();
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn clear_drops_buffered_frames() {
        let queue = OutputQueue::new(4);
        for _ in 0..2 {
            let seq = queue.admit().unwrap();
            queue.enqueue(seq, frame(seq)).unwrap();
        }
        queue.clear();
        assert!(queue.dequeue_next().is_none());
    }
}
