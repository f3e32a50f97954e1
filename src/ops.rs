// Host callback surface.
//
// The core is transport- and storage-agnostic: everything it needs from the
// surrounding process comes through this trait. One implementor per context.

use crate::error::{Result, SwimError};
use crate::member::{MemberId, MemberState, MemberUpdate};
use std::any::Any;

/// Opaque reply-correlation cookie staged with an indirect-ping request and
/// handed back unchanged through [`SwimOps::send_reply`]. Typically wraps the
/// host's in-flight RPC handle.
pub type IpingArgs = Box<dyn Any + Send>;

/// Operations the host must provide to a [`SwimContext`](crate::SwimContext).
///
/// Locking contract: `get_dping_target`, `get_iping_target`,
/// `get_member_state`, `set_member_state` and `new_incarnation` are invoked
/// *while the context lock is held* — implementations must not re-enter any
/// core API. `send_request` and `send_reply` are always invoked with the lock
/// released.
pub trait SwimOps: Send + Sync {
    /// Transmit a protocol message about member `id` to peer `to`, carrying
    /// the piggybacked updates. Ownership of `upds` transfers to the
    /// transport. Failures are tolerated by the protocol (message loss), but
    /// abort the current progress iteration.
    fn send_request(&self, id: MemberId, to: MemberId, upds: Vec<MemberUpdate>) -> Result<()>;

    /// Answer a previously suspended indirect-ping request: tell `to` how the
    /// forwarded probe of `id` went. Only required when the host forwards
    /// indirect pings.
    fn send_reply(&self, id: MemberId, to: MemberId, rc: Result<()>, args: IpingArgs) -> Result<()> {
        let _ = (id, to, rc, args);
        Err(SwimError::Unsupported("send_reply"))
    }

    /// Next peer to probe directly, or `None` if there is nobody to probe
    /// this period.
    fn get_dping_target(&self) -> Option<MemberId>;

    /// Next ALIVE peer to forward an indirect probe through, or `None` to
    /// truncate the subgroup. The host is responsible for picking distinct
    /// random peers.
    fn get_iping_target(&self) -> Option<MemberId>;

    /// Look up the locally stored state of `id`.
    /// Must fail with [`SwimError::NotFound`] for unknown members.
    fn get_member_state(&self, id: MemberId) -> Result<MemberState>;

    /// Store a new state for `id`.
    fn set_member_state(&self, id: MemberId, state: &MemberState) -> Result<()>;

    /// Mint the next incarnation for self, writing it into `state`. Called
    /// when a SUSPECT/DEAD claim against self must be refuted. The default
    /// bumps the counter in place; hosts that persist incarnations across
    /// restarts should override it.
    fn new_incarnation(&self, id: MemberId, state: &mut MemberState) -> Result<()> {
        let _ = id;
        state.incarnation += 1;
        Ok(())
    }
}
