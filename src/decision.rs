//! Pure reconciliation function over the `(local, remote)` product domain
//! (spec §4.8). No I/O, no time, no randomness — every branch is a function
//! of the two `FileState` values alone.

use crate::state::FileState;
use crate::vclock::Comparison;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Download,
    Upload,
    DeleteLocal,
    DeleteRemote,
    Conflict,
    /// Local has a tombstone the remote has never seen; remote should
    /// record it without any file-layer effect (spec §4.8 rule 4).
    PropagateTombstoneToRemote,
    /// Symmetric: remote has a tombstone local has never seen.
    PropagateTombstoneToLocal,
    /// Caller logs and falls back to a conservative default (spec §4.8
    /// rule 8) — never produced by `decide` itself, reserved for callers
    /// that encounter a state shape this function doesn't recognize.
    Uncertain,
}

/// Rules are evaluated top-to-bottom; first match wins (spec §4.8).
pub fn decide(local: Option<&FileState>, remote: Option<&FileState>) -> Action {
    match (local, remote) {
        (None, None) => Action::Skip,

        (Some(FileState::Exists(l)), Some(FileState::Exists(r))) if l.content_hash == r.content_hash => Action::Skip,

        (None, Some(FileState::Exists(_))) => Action::Download,
        (Some(FileState::Exists(_)), None) => Action::Upload,

        (Some(FileState::Deleted(_)), None) => Action::PropagateTombstoneToRemote,
        (None, Some(FileState::Deleted(_))) => Action::PropagateTombstoneToLocal,

        (Some(FileState::Deleted(_)), Some(FileState::Deleted(_))) => Action::Skip,

        // Local tombstone vs. remote live file.
        (Some(FileState::Deleted(t)), Some(FileState::Exists(m))) => match t.vector_clock.compare(&m.vector_clock) {
            Comparison::Successor => Action::DeleteRemote,
            Comparison::Antecedent => Action::Download,
            Comparison::Equal => Action::DeleteRemote,
            Comparison::Concurrent => Action::Conflict,
        },

        // Local live file vs. remote tombstone.
        (Some(FileState::Exists(m)), Some(FileState::Deleted(t))) => match t.vector_clock.compare(&m.vector_clock) {
            Comparison::Successor => Action::DeleteLocal,
            Comparison::Antecedent => Action::Upload,
            Comparison::Equal => Action::DeleteLocal,
            Comparison::Concurrent => Action::Conflict,
        },

        // Both exist, hashes differ.
        (Some(FileState::Exists(l)), Some(FileState::Exists(r))) => match l.vector_clock.compare(&r.vector_clock) {
            Comparison::Antecedent => Action::Download,
            Comparison::Successor => Action::Upload,
            Comparison::Equal => Action::Conflict,
            Comparison::Concurrent => Action::Conflict,
        },
    }
}

/// Finer-grained classification of an `Action::Conflict` outcome, used by
/// the planner (not `decide` itself, which stays pure and rule-literal) to
/// pick a concrete resolution:
///
/// - `ModifyModify`: both sides hold live, differing content. Each side
///   keeps its own file and fetches the other's as a conflict artifact
///   (spec §4.9, §8 scenario 2 — both peers end up with both versions).
/// - `DeleteVsModify`: one side deleted, the other modified, concurrently.
///   No conflict artifact — the live file wins and the deleter's tombstone
///   is cleared (spec §8 scenario 3 is explicit that the modify-vs-delete
///   case keeps only the surviving file, unlike the modify-vs-modify case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    ModifyModify,
    /// `true` when the local side holds the tombstone (so the remote holds
    /// the live file we should download and whose tombstone we should
    /// drop); `false` when local holds the live file.
    DeleteVsModify { local_is_tombstone: bool },
}

pub fn classify_conflict(local: Option<&FileState>, remote: Option<&FileState>) -> Option<ConflictKind> {
    match (local, remote) {
        (Some(FileState::Exists(_)), Some(FileState::Exists(_))) => Some(ConflictKind::ModifyModify),
        (Some(FileState::Deleted(_)), Some(FileState::Exists(_))) => Some(ConflictKind::DeleteVsModify { local_is_tombstone: true }),
        (Some(FileState::Exists(_)), Some(FileState::Deleted(_))) => Some(ConflictKind::DeleteVsModify { local_is_tombstone: false }),
        _ => None,
    }
}
