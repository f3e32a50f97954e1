// Shared test doubles: an in-memory member table plus recorders for
// everything the core pushes through the callback surface.

use crate::config::SwimConfig;
use crate::error::{Result, SwimError};
use crate::member::{MemberId, MemberState, MemberStatus, MemberUpdate};
use crate::ops::{IpingArgs, SwimOps};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Millisecond-scale tunables so state-machine tests run in tens of
/// milliseconds of wall clock.
pub(crate) fn test_config() -> SwimConfig {
    SwimConfig {
        period_ms: 30,
        suspect_timeout_ms: 60,
        ping_timeout_ms: 10,
        subgroup_size: 2,
        piggyback_tx_max: 50,
    }
}

#[derive(Default)]
struct MockState {
    members: Mutex<HashMap<MemberId, MemberState>>,
    requests: Mutex<Vec<(MemberId, MemberId, Vec<MemberUpdate>)>>,
    replies: Mutex<Vec<(MemberId, MemberId, Result<()>)>>,
    dping_targets: Mutex<VecDeque<MemberId>>,
    iping_targets: Mutex<VecDeque<MemberId>>,
}

/// Callback table whose member store and target queues are scripted by the
/// test. Clones share the recorder, so the test keeps one handle for
/// assertions after handing another to the context.
#[derive(Clone, Default)]
pub(crate) struct MockOps(Arc<MockState>);

impl MockOps {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, id: MemberId, status: MemberStatus, incarnation: u64) {
        self.0
            .members
            .lock()
            .insert(id, MemberState::new(status, incarnation));
    }

    pub(crate) fn remove(&self, id: MemberId) {
        self.0.members.lock().remove(&id);
    }

    pub(crate) fn state(&self, id: MemberId) -> MemberState {
        self.0.members.lock()[&id]
    }

    pub(crate) fn push_dping_target(&self, id: MemberId) {
        self.0.dping_targets.lock().push_back(id);
    }

    pub(crate) fn push_iping_target(&self, id: MemberId) {
        self.0.iping_targets.lock().push_back(id);
    }

    pub(crate) fn requests(&self) -> Vec<(MemberId, MemberId, Vec<MemberUpdate>)> {
        self.0.requests.lock().clone()
    }

    pub(crate) fn replies(&self) -> Vec<(MemberId, MemberId, Result<()>)> {
        self.0.replies.lock().clone()
    }
}

impl SwimOps for MockOps {
    fn send_request(&self, id: MemberId, to: MemberId, upds: Vec<MemberUpdate>) -> Result<()> {
        self.0.requests.lock().push((id, to, upds));
        Ok(())
    }

    fn send_reply(&self, id: MemberId, to: MemberId, rc: Result<()>, _args: IpingArgs) -> Result<()> {
        self.0.replies.lock().push((id, to, rc));
        Ok(())
    }

    fn get_dping_target(&self) -> Option<MemberId> {
        self.0.dping_targets.lock().pop_front()
    }

    fn get_iping_target(&self) -> Option<MemberId> {
        self.0.iping_targets.lock().pop_front()
    }

    fn get_member_state(&self, id: MemberId) -> Result<MemberState> {
        self.0
            .members
            .lock()
            .get(&id)
            .copied()
            .ok_or(SwimError::NotFound(id))
    }

    fn set_member_state(&self, id: MemberId, state: &MemberState) -> Result<()> {
        self.0.members.lock().insert(id, *state);
        Ok(())
    }
}
