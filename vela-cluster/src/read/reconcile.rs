//! Per-shard replica reconciliation
//!
//! Replicas of one shard can disagree on a point while a write is still
//! propagating. Responses are unioned by point id and for each id the entry
//! with the highest version wins; equal versions fall back to the higher
//! score and then to the lexicographically smallest peer id.

use crate::consistency::ConflictPolicy;
use crate::types::{PeerId, PointId, ScoredPoint};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// A successful response from one replica
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaResponse {
    pub peer_id: PeerId,
    /// Local top-K, sorted by score descending
    pub points: Vec<ScoredPoint>,
}

impl ReplicaResponse {
    pub fn new(peer_id: impl Into<PeerId>, points: Vec<ScoredPoint>) -> Self {
        Self {
            peer_id: peer_id.into(),
            points,
        }
    }
}

/// Reconciled contribution of one shard
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconciledShard {
    /// Unique by id, sorted by score descending then id ascending
    pub points: Vec<ScoredPoint>,
    /// Ids on which responding replicas reported different entries
    pub conflicts: usize,
}

/// Collapse replica responses of one shard into a single sequence of at most
/// `limit` entries.
pub fn reconcile(
    responses: &[ReplicaResponse],
    policy: ConflictPolicy,
    limit: usize,
) -> ReconciledShard {
    if policy == ConflictPolicy::PassThrough && responses.len() == 1 {
        let mut points = responses[0].points.clone();
        points.truncate(limit);
        return ReconciledShard {
            points,
            conflicts: 0,
        };
    }

    // Visit peers in id order so the winner never depends on arrival order
    let mut ordered: Vec<&ReplicaResponse> = responses.iter().collect();
    ordered.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

    struct Candidate<'a> {
        point: &'a ScoredPoint,
        disagreed: bool,
    }

    let mut winners: HashMap<PointId, Candidate<'_>> = HashMap::new();
    for response in ordered {
        for point in &response.points {
            match winners.entry(point.id) {
                Entry::Vacant(slot) => {
                    slot.insert(Candidate {
                        point,
                        disagreed: false,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get_mut();
                    if current.point.version != point.version
                        || current.point.score.total_cmp(&point.score) != Ordering::Equal
                    {
                        current.disagreed = true;
                    }
                    // Strictly better only, so the earlier (smaller) peer id keeps full ties
                    if supersedes(point, current.point) {
                        current.point = point;
                    }
                }
            }
        }
    }

    let conflicts = winners.values().filter(|c| c.disagreed).count();
    let mut points: Vec<ScoredPoint> = winners.into_values().map(|c| c.point.clone()).collect();
    points.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    points.truncate(limit);

    ReconciledShard { points, conflicts }
}

fn supersedes(challenger: &ScoredPoint, current: &ScoredPoint) -> bool {
    match challenger.version.cmp(&current.version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => challenger.score.total_cmp(&current.score) == Ordering::Greater,
    }
}
