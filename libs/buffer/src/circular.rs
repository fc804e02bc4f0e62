//! The circular observation buffer
//!
//! Sequence numbers are assigned here, under the buffer lock, which makes
//! them strictly monotone and dense across every source. The ring holds the
//! newest `capacity` observations; evicted ones are folded into a rolling
//! checkpoint so historical Current views stay reconstructible in
//! O(checkpoint_interval).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use types::{Observation, SequenceNumber};

use crate::checkpoint::Checkpoint;
use crate::error::BufferError;
use crate::observer::ChangeSignaler;
use crate::Result;

/// Observations copied out of one `sample` call, with the range bookkeeping
/// streaming needs.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub observations: Vec<Arc<Observation>>,
    /// Sequence to continue from on the next call
    pub end_sequence: SequenceNumber,
    /// True when the whole requested range was consumed without hitting the
    /// count limit
    pub end_of_buffer: bool,
    pub first_sequence: SequenceNumber,
    pub next_sequence: SequenceNumber,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    checkpoint_interval: u64,
    slots: Vec<Option<Arc<Observation>>>,
    next_sequence: SequenceNumber,
    first_sequence: SequenceNumber,
    /// Latest per data item over everything ever added
    latest: Checkpoint,
    /// State through `first_sequence - 1`; evicted observations fold in here
    first: Checkpoint,
    /// Periodic snapshots: (last sequence covered, view)
    checkpoints: VecDeque<(SequenceNumber, Checkpoint)>,
}

impl Inner {
    fn slot(&self, seq: SequenceNumber) -> Option<Arc<Observation>> {
        if seq < self.first_sequence || seq >= self.next_sequence {
            return None;
        }
        self.slots[(seq % self.capacity as u64) as usize].clone()
    }

    fn size(&self) -> usize {
        (self.next_sequence - self.first_sequence) as usize
    }
}

/// Bounded, sequence-numbered observation storage
pub struct CircularBuffer {
    inner: Mutex<Inner>,
    signalers: Mutex<HashMap<String, Arc<ChangeSignaler>>>,
}

impl CircularBuffer {
    /// `capacity` bounds stored observations; `checkpoint_interval` trades
    /// memory for faster historical Current reconstruction.
    pub fn new(capacity: usize, checkpoint_interval: u64) -> Self {
        assert!(capacity > 0, "buffer capacity must be nonzero");
        assert!(checkpoint_interval > 0, "checkpoint interval must be nonzero");
        Self {
            inner: Mutex::new(Inner {
                capacity,
                checkpoint_interval,
                slots: vec![None; capacity],
                next_sequence: 1,
                first_sequence: 1,
                latest: Checkpoint::new(),
                first: Checkpoint::new(),
                checkpoints: VecDeque::new(),
            }),
            signalers: Mutex::new(HashMap::new()),
        }
    }

    /// Append one observation: assign the next sequence, overwrite the
    /// oldest slot when full, refresh the latest view, and signal observers
    /// of the affected data item. Returns the assigned sequence.
    pub fn add(&self, mut obs: Observation) -> SequenceNumber {
        let (seq, signaler) = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_sequence;
            obs.sequence = seq;
            let obs = Arc::new(obs);

            let idx = (seq % inner.capacity as u64) as usize;
            if let Some(evicted) = inner.slots[idx].replace(Arc::clone(&obs)) {
                inner.first.add(&evicted);
                inner.first_sequence = evicted.sequence + 1;
            }

            inner.latest.add(&obs);
            inner.next_sequence = seq + 1;

            if seq % inner.checkpoint_interval == 0 {
                let snapshot = inner.latest.clone();
                inner.checkpoints.push_back((seq, snapshot));
            }
            let min_useful = inner.first_sequence.saturating_sub(1);
            while inner
                .checkpoints
                .front()
                .is_some_and(|(covered, _)| *covered < min_useful)
            {
                inner.checkpoints.pop_front();
            }

            (seq, self.signaler_if_exists(&obs.data_item_id))
        };

        if let Some(signaler) = signaler {
            signaler.signal(seq);
        }
        seq
    }

    /// The observation at `seq`, if it is still in the ring.
    pub fn get(&self, seq: SequenceNumber) -> Option<Arc<Observation>> {
        self.inner.lock().unwrap().slot(seq)
    }

    pub fn first_sequence(&self) -> SequenceNumber {
        self.inner.lock().unwrap().first_sequence
    }

    pub fn next_sequence(&self) -> SequenceNumber {
        self.inner.lock().unwrap().next_sequence
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Latest observation per data item, optionally filtered, optionally as
    /// of a historical sequence.
    ///
    /// With `at`, the view is rebuilt from the nearest checkpoint at or
    /// before `at` and replayed forward. `at` outside
    /// `[first_sequence, next_sequence)` is rejected.
    pub fn current(
        &self,
        filter: Option<&HashSet<String>>,
        at: Option<SequenceNumber>,
    ) -> Result<Vec<Arc<Observation>>> {
        let inner = self.inner.lock().unwrap();
        match at {
            None => Ok(inner.latest.observations(filter)),
            Some(at) => {
                if at < inner.first_sequence || at >= inner.next_sequence {
                    return Err(BufferError::OutOfRange {
                        requested: at,
                        first: inner.first_sequence,
                        next: inner.next_sequence,
                    });
                }

                let (mut view, covered) = inner
                    .checkpoints
                    .iter()
                    .rev()
                    .find(|(covered, _)| *covered <= at)
                    .map(|(covered, cp)| (cp.clone(), *covered))
                    .unwrap_or_else(|| {
                        (inner.first.clone(), inner.first_sequence - 1)
                    });

                for seq in (covered + 1)..=at {
                    if let Some(obs) = inner.slot(seq) {
                        view.add(&obs);
                    }
                }
                Ok(view.observations(filter))
            }
        }
    }

    /// Copy out up to `count` observations in sequence order from `from`
    /// (default `first_sequence`) up to exclusive `to` (default
    /// `next_sequence`), restricted to `filter`.
    ///
    /// Iteration snapshots `next_sequence` at entry and copies under the
    /// lock in chunks, releasing it between chunks, so a slow reader never
    /// stalls ingestion. If eviction overtakes the cursor between chunks
    /// the caller gets `OutOfRange` rather than a silent gap.
    pub fn sample(
        &self,
        filter: Option<&HashSet<String>>,
        from: Option<SequenceNumber>,
        to: Option<SequenceNumber>,
        count: usize,
    ) -> Result<SampleResult> {
        const CHUNK: u64 = 1024;

        let (first, next) = {
            let inner = self.inner.lock().unwrap();
            (inner.first_sequence, inner.next_sequence)
        };

        let from = from.unwrap_or(first);
        if from < first || from > next {
            return Err(BufferError::OutOfRange {
                requested: from,
                first,
                next,
            });
        }
        let limit = to.map_or(next, |t| t.min(next));

        let mut observations = Vec::new();
        let mut end_of_buffer = true;
        let mut pos = from;
        'copy: while pos < limit {
            let chunk_end = (pos + CHUNK).min(limit);
            let inner = self.inner.lock().unwrap();
            if pos < inner.first_sequence {
                return Err(BufferError::OutOfRange {
                    requested: pos,
                    first: inner.first_sequence,
                    next: inner.next_sequence,
                });
            }
            while pos < chunk_end {
                if observations.len() >= count {
                    end_of_buffer = false;
                    break 'copy;
                }
                if let Some(obs) = inner.slot(pos) {
                    let matches = filter.map_or(true, |f| f.contains(&obs.data_item_id));
                    if matches {
                        observations.push(obs);
                    }
                }
                pos += 1;
            }
        }

        Ok(SampleResult {
            observations,
            end_sequence: pos,
            end_of_buffer,
            first_sequence: first,
            next_sequence: next,
        })
    }

    /// Signaler for one data item, created on first use
    pub fn signaler(&self, data_item_id: &str) -> Arc<ChangeSignaler> {
        let mut signalers = self.signalers.lock().unwrap();
        Arc::clone(
            signalers
                .entry(data_item_id.to_string())
                .or_insert_with(|| Arc::new(ChangeSignaler::new())),
        )
    }

    fn signaler_if_exists(&self, data_item_id: &str) -> Option<Arc<ChangeSignaler>> {
        self.signalers.lock().unwrap().get(data_item_id).cloned()
    }
}
