//! Commit Log
//!
//! Append-only record of every state mutation the dispatcher reports.
//! Each commit links to the previous one through a hash chain, so a log
//! exported by an embedder can be checked for tampering or gaps.

use alloc::vec;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use spci_core::CommitType;

use super::syslog::EventId;

/// Hash identifying a commit
pub type CommitId = [u8; 32];

/// A state mutation record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Hash of this commit (computed from contents + prev_commit)
    pub id: CommitId,
    /// Hash of the previous commit
    pub prev_commit: CommitId,
    /// Sequence number (monotonic)
    pub seq: u64,
    /// Monitor tick of the call that produced it
    pub timestamp: u64,
    /// The state mutation
    pub commit_type: CommitType,
    /// The SysLog event that caused this commit
    pub caused_by: Option<EventId>,
}

/// Maximum number of commits kept in memory
const MAX_COMMITLOG_ENTRIES: usize = 100_000;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Commit log with a hash chain starting at a genesis commit.
pub struct CommitLog {
    /// Commit entries (append-only)
    commits: Vec<Commit>,
    /// Next sequence number
    next_seq: u64,
    /// Hash of the last commit
    last_hash: CommitId,
}

impl CommitLog {
    /// Create a new CommitLog with a genesis commit.
    pub fn new(timestamp: u64) -> Self {
        let genesis = Commit {
            id: [0u8; 32],
            prev_commit: [0u8; 32],
            seq: 0,
            timestamp,
            commit_type: CommitType::Genesis,
            caused_by: None,
        };
        let id = compute_hash(&genesis);
        let genesis = Commit { id, ..genesis };

        Self {
            commits: vec![genesis],
            next_seq: 1,
            last_hash: id,
        }
    }

    /// Append a new commit. Returns its ID.
    pub fn append(
        &mut self,
        commit_type: CommitType,
        caused_by: Option<EventId>,
        timestamp: u64,
    ) -> CommitId {
        let commit = Commit {
            id: [0u8; 32],
            prev_commit: self.last_hash,
            seq: self.next_seq,
            timestamp,
            commit_type,
            caused_by,
        };
        let id = compute_hash(&commit);
        let commit = Commit { id, ..commit };

        self.last_hash = id;
        self.next_seq += 1;
        self.commits.push(commit);

        self.trim_if_needed();
        id
    }

    /// Get all commits still held.
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    /// Get commits in a sequence range.
    pub fn get_range(&self, start_seq: u64, end_seq: u64) -> Vec<&Commit> {
        self.commits
            .iter()
            .filter(|c| c.seq >= start_seq && c.seq < end_seq)
            .collect()
    }

    /// Get the most recent N commits.
    pub fn get_recent(&self, count: usize) -> Vec<&Commit> {
        self.commits.iter().rev().take(count).collect()
    }

    /// Commits caused by one SysLog event, oldest first.
    pub fn caused_by(&self, event: EventId) -> impl Iterator<Item = &Commit> {
        self.commits
            .iter()
            .filter(move |c| c.caused_by == Some(event))
    }

    /// Hash of the most recent commit.
    pub fn head(&self) -> CommitId {
        self.last_hash
    }

    /// Sequence number of the last commit.
    pub fn current_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Never true: the log always holds at least its genesis or its newest
    /// commit.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Verify the hash chain.
    ///
    /// After trimming, the chain is checked from the oldest commit still
    /// held.
    pub fn verify_integrity(&self) -> bool {
        let Some(first) = self.commits.first() else {
            return true;
        };
        if first.seq == 0 && first.prev_commit != [0u8; 32] {
            return false;
        }

        let mut expected_prev = first.prev_commit;
        let mut expected_seq = first.seq;
        for commit in &self.commits {
            if commit.prev_commit != expected_prev || commit.seq != expected_seq {
                return false;
            }
            if compute_hash(commit) != commit.id {
                return false;
            }
            expected_prev = commit.id;
            expected_seq += 1;
        }

        expected_prev == self.last_hash
    }

    /// Trim old commits if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.commits.len() > MAX_COMMITLOG_ENTRIES {
            let drain_count = self.commits.len() - MAX_COMMITLOG_ENTRIES;
            self.commits.drain(0..drain_count);
        }
    }
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::new(0)
    }
}

fn fnv_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FNV-1a over the chain link, sequence, timestamp, cause and the JSON
/// encoding of the commit type, widened to 32 bytes.
fn compute_hash(commit: &Commit) -> CommitId {
    let mut hash = FNV_OFFSET;
    hash = fnv_bytes(hash, &commit.prev_commit);
    hash = fnv_bytes(hash, &commit.seq.to_le_bytes());
    hash = fnv_bytes(hash, &commit.timestamp.to_le_bytes());
    match commit.caused_by {
        Some(event) => {
            hash = fnv_bytes(hash, &[1]);
            hash = fnv_bytes(hash, &event.to_le_bytes());
        }
        None => hash = fnv_bytes(hash, &[0]),
    }
    // CommitType holds only integers, enums and sequences; encoding it
    // cannot fail.
    let encoded = serde_json::to_vec(&commit.commit_type).unwrap_or_default();
    hash = fnv_bytes(hash, &encoded);

    let mut result = [0u8; 32];
    let mut h = hash;
    for chunk in result.chunks_mut(8) {
        chunk.copy_from_slice(&h.to_le_bytes());
        h = h.wrapping_mul(FNV_PRIME);
    }
    result
}
