// Member identity and per-peer observed state.
//
// The member table itself is owned by the host; the core only ever addresses
// one peer at a time through the `SwimOps` callbacks and exchanges the small
// wire tuples defined here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque member identifier. Totally ordered for logging only; the protocol
/// never relies on the ordering. "No peer" is expressed as `Option::None`
/// wherever a slot may legitimately be empty.
pub type MemberId = u64;

/// Liveness belief about a peer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum MemberStatus {
    /// Member responds to probes.
    Alive,
    /// Member missed a probe round and is awaiting confirmation.
    Suspect,
    /// Member exceeded its suspicion timeout.
    Dead,
    /// Member has not finished bootstrapping into the group yet. Never
    /// gossiped to other members.
    Inactive,
}

impl MemberStatus {
    /// Single-character code used in protocol trace lines.
    pub fn as_char(&self) -> char {
        match self {
            MemberStatus::Alive => 'A',
            MemberStatus::Suspect => 'S',
            MemberStatus::Dead => 'D',
            MemberStatus::Inactive => 'I',
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberStatus::Alive => "ALIVE",
            MemberStatus::Suspect => "SUSPECT",
            MemberStatus::Dead => "DEAD",
            MemberStatus::Inactive => "INACTIVE",
        };
        f.write_str(name)
    }
}

/// Observed (not authoritative) state of one peer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct MemberState {
    /// Last incarnation observed for this peer. Only the peer itself may
    /// increase it, and only to refute suspicion raised against it.
    pub incarnation: u64,
    /// Current local belief.
    pub status: MemberStatus,
    /// Host-maintained round-trip estimate to this peer, in milliseconds.
    /// Consumed by the probe-timeout calculation, never written by the core.
    pub delay: u64,
}

impl MemberState {
    pub fn new(status: MemberStatus, incarnation: u64) -> Self {
        Self {
            incarnation,
            status,
            delay: 0,
        }
    }
}

impl Default for MemberState {
    fn default() -> Self {
        Self::new(MemberStatus::Inactive, 0)
    }
}

/// One piggybacked state delta: "member `id` was seen in state `state`".
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct MemberUpdate {
    pub id: MemberId,
    pub state: MemberState,
}
