// RustySwim - SWIM-based failure detection core
//
// The gossip membership engine behind RustyDB clustering, extracted as a
// standalone library. It implements the protocol side of SWIM (Scalable
// Weakly-consistent Infection-style Process Group Membership, Das et al.,
// 2002): the per-tick probe state machine, the suspicion subsystem, the
// piggyback update queue and the indirect-probe coordination.
//
// The crate deliberately owns no transport and no member table. The host
// supplies both through the `SwimOps` callback trait and drives the engine by
// calling `SwimContext::progress` periodically; inbound protocol messages are
// fed back through `SwimContext::updates_parse`.

pub mod config;
pub mod context;
pub mod error;
pub mod member;
pub mod ops;
pub mod tick;
mod updates;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{SwimConfig, PIGGYBACK_ENTRIES, PIGGYBACK_TX_COUNT};
pub use context::{now_ms, SwimContext};
pub use error::{Result, SwimError};
pub use member::{MemberId, MemberState, MemberStatus, MemberUpdate};
pub use ops::{IpingArgs, SwimOps};
pub use tick::ProgressStatus;
