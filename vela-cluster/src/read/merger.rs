//! Global k-way merge of per-shard result lists
//!
//! Every shard contributes a sequence sorted by score descending. A max-heap
//! holds the current head of each sequence; popping always yields the global
//! maximum among the heads. Because each sequence is sorted, the first time
//! an id is popped it carries the highest score that id has on any shard,
//! so later occurrences are dropped without comparing them.
//!
//! Equal scores are ordered by point id ascending, then by shard index, so
//! the output never depends on the order shards finished in.

use crate::types::{PointId, ScoredPoint};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Output of a merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergedResults {
    /// Unique by id, non-increasing score, at most `limit` entries
    pub points: Vec<ScoredPoint>,
    /// Popped entries dropped because their id was already emitted
    pub duplicates_suppressed: usize,
}

/// Cursor into one shard's sequence, ordered by the entry it points at
#[derive(Debug)]
struct HeapEntry {
    score: f32,
    id: PointId,
    shard: usize,
    position: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher score first, then smaller id,
        // then smaller shard index
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.shard.cmp(&self.shard))
    }
}

/// Result merger
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultMerger;

impl ResultMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merge sorted per-shard sequences into one deduplicated top-`limit`
    pub fn merge(&self, shards: &[Vec<ScoredPoint>], limit: usize) -> MergedResults {
        let capacity = limit.min(shards.iter().map(Vec::len).sum());
        let mut points = Vec::with_capacity(capacity);
        let mut duplicates_suppressed = 0;

        if limit == 0 {
            return MergedResults {
                points,
                duplicates_suppressed,
            };
        }

        let mut heap = BinaryHeap::with_capacity(shards.len());
        for (shard, sequence) in shards.iter().enumerate() {
            if let Some(head) = sequence.first() {
                heap.push(HeapEntry {
                    score: head.score,
                    id: head.id,
                    shard,
                    position: 0,
                });
            }
        }

        let mut emitted: HashSet<PointId> = HashSet::with_capacity(capacity);

        while let Some(entry) = heap.pop() {
            let sequence = &shards[entry.shard];

            if emitted.insert(entry.id) {
                points.push(sequence[entry.position].clone());
            } else {
                duplicates_suppressed += 1;
            }

            if points.len() >= limit {
                break;
            }

            let next = entry.position + 1;
            if let Some(head) = sequence.get(next) {
                heap.push(HeapEntry {
                    score: head.score,
                    id: head.id,
                    shard: entry.shard,
                    position: next,
                });
            }
        }

        MergedResults {
            points,
            duplicates_suppressed,
        }
    }
}
