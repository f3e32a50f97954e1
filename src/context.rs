// Protocol context: identity, tunables, the four bookkeeping queues and the
// lock that guards them.
//
// A context owns the update queue, the suspect list, the indirect-ping table
// and the probe subgroup. The member table stays with the host and is only
// borrowed through `SwimOps` for the duration of a callback. All context
// state is mutated under one non-recursive mutex; transport callbacks are
// invoked with that mutex released.

use crate::config::SwimConfig;
use crate::error::{Result, SwimError};
use crate::member::{MemberId, MemberStatus};
use crate::ops::{IpingArgs, SwimOps};
use crate::tick::TickState;
use crate::updates::member_dead;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first use of the crate in this process.
pub fn now_ms() -> u64 {
    CLOCK_ANCHOR.elapsed().as_millis() as u64
}

/// Pending dissemination of one member's state change.
pub(crate) struct UpdateEntry {
    pub(crate) id: MemberId,
    /// Who told us. Kept for tracing only.
    pub(crate) from: MemberId,
    pub(crate) tx_count: u64,
}

/// One member we currently believe to be SUSPECT.
pub(crate) struct SuspectEntry {
    pub(crate) id: MemberId,
    pub(crate) from: MemberId,
    pub(crate) deadline_ms: u64,
}

/// One suspended indirect-ping request awaiting the target's answer.
pub(crate) struct IpingEntry {
    pub(crate) id: MemberId,
    pub(crate) from: MemberId,
    pub(crate) args: IpingArgs,
    pub(crate) deadline_ms: u64,
}

/// One forwarder picked for the current indirect-probe round.
pub(crate) struct SubgroupEntry {
    /// The member being probed.
    pub(crate) from: MemberId,
    /// The peer the probe is forwarded through.
    pub(crate) id: MemberId,
}

/// Everything guarded by the context mutex.
pub(crate) struct ProtoState {
    pub(crate) self_id: Option<MemberId>,
    pub(crate) target: Option<MemberId>,
    pub(crate) tick: TickState,
    pub(crate) cfg: SwimConfig,

    pub(crate) updates: VecDeque<UpdateEntry>,
    pub(crate) suspects: Vec<SuspectEntry>,
    pub(crate) ipings: Vec<IpingEntry>,
    pub(crate) subgroup: VecDeque<SubgroupEntry>,

    /// When the current wait step (PINGED/IPINGED) expires.
    pub(crate) deadline: u64,
    /// When the next probe period may begin.
    pub(crate) next_tick_time: u64,
    /// Earliest interesting time across all wait structures.
    pub(crate) next_event: u64,
    /// When `progress` was expected to be re-entered; 0 while paused.
    pub(crate) expect_progress_time: u64,
    /// Set while the host has reported a network glitch. Allows a DEAD claim
    /// to land on a still-bootstrapping member.
    pub(crate) glitch: bool,
}

/// One SWIM protocol engine.
///
/// Thread-safe: the host may call `progress`, `updates_parse` and the
/// indirect-ping entry points from any threads it likes.
pub struct SwimContext {
    pub(crate) ops: Arc<dyn SwimOps>,
    pub(crate) inner: Mutex<ProtoState>,
}

impl SwimContext {
    /// Create a context with tunables taken from the environment.
    ///
    /// `self_id` may be `None`: the engine then ignores `progress` and parse
    /// calls until an identity is assigned through [`Self::self_set`].
    pub fn new(self_id: Option<MemberId>, ops: Arc<dyn SwimOps>) -> Self {
        Self::with_config(self_id, ops, SwimConfig::from_env())
    }

    /// Create a context with explicit tunables.
    pub fn with_config(self_id: Option<MemberId>, ops: Arc<dyn SwimOps>, cfg: SwimConfig) -> Self {
        // Delay the first probe until the surrounding code had time to
        // finish its own initialization.
        let next_tick_time = now_ms() + 3 * cfg.period_ms;
        Self {
            ops,
            inner: Mutex::new(ProtoState {
                self_id,
                target: None,
                tick: TickState::Select,
                cfg,
                updates: VecDeque::new(),
                suspects: Vec::new(),
                ipings: Vec::new(),
                subgroup: VecDeque::new(),
                deadline: 0,
                next_tick_time,
                next_event: 0,
                expect_progress_time: 0,
                glitch: false,
            }),
        }
    }

    /// The host callback table this context was created with.
    pub fn ops(&self) -> &dyn SwimOps {
        &*self.ops
    }

    pub fn self_id(&self) -> Option<MemberId> {
        self.inner.lock().self_id
    }

    /// Assign or clear our own identity. Clearing pauses the engine and
    /// resets the starvation detector so the pause is not reported as a
    /// glitch later.
    pub fn self_set(&self, self_id: Option<MemberId>) {
        let mut st = self.inner.lock();
        st.self_id = self_id;
        if self_id.is_none() {
            st.expect_progress_time = 0;
        }
    }

    /// Protocol period in milliseconds. Should not be set below three ping
    /// timeouts; the core does not clamp.
    pub fn period(&self) -> u64 {
        self.inner.lock().cfg.period_ms
    }

    pub fn period_set(&self, val: u64) {
        tracing::debug!(period_ms = val, "protocol period set");
        self.inner.lock().cfg.period_ms = val;
    }

    pub fn suspect_timeout(&self) -> u64 {
        self.inner.lock().cfg.suspect_timeout_ms
    }

    pub fn suspect_timeout_set(&self, val: u64) {
        tracing::debug!(suspect_timeout_ms = val, "suspect timeout set");
        self.inner.lock().cfg.suspect_timeout_ms = val;
    }

    pub fn ping_timeout(&self) -> u64 {
        self.inner.lock().cfg.ping_timeout_ms
    }

    pub fn ping_timeout_set(&self, val: u64) {
        tracing::debug!(ping_timeout_ms = val, "ping timeout set");
        self.inner.lock().cfg.ping_timeout_ms = val;
    }

    /// Stage an incoming indirect-ping request: the host received a request
    /// from `from_id` asking us to probe `to_id`. The answer is sent through
    /// `send_reply` once [`Self::ipings_reply`] is called for the target or
    /// the ping timeout expires. Fails with [`SwimError::Already`] if a probe
    /// of `to_id` is already in flight.
    pub fn ipings_suspend(&self, from_id: MemberId, to_id: MemberId, args: IpingArgs) -> Result<()> {
        let mut st = self.inner.lock();
        if st.ipings.iter().any(|e| e.id == to_id) {
            return Err(SwimError::Already);
        }
        let deadline_ms = now_ms() + st.cfg.ping_timeout_ms;
        st.ipings.push(IpingEntry {
            id: to_id,
            from: from_id,
            args,
            deadline_ms,
        });
        Ok(())
    }

    /// Answer every suspended indirect-ping request whose target is `to_id`
    /// with the given result. This is how the host forwards the outcome of a
    /// relayed probe back to its original requester.
    pub fn ipings_reply(&self, to_id: MemberId, rc: Result<()>) -> Result<()> {
        let expired = {
            let mut st = self.inner.lock();
            let mut taken = Vec::new();
            let mut i = 0;
            while i < st.ipings.len() {
                if st.ipings[i].id == to_id {
                    taken.push(st.ipings.remove(i));
                } else {
                    i += 1;
                }
            }
            taken
        };

        let mut out = Ok(());
        for entry in expired {
            tracing::debug!(member = entry.id, requester = entry.from, "answering indirect ping");
            if let Err(e) = self.ops.send_reply(entry.id, entry.from, rc.clone(), entry.args) {
                tracing::error!(error = %e, "indirect ping reply failed");
                out = Err(e);
            }
        }
        out
    }

    /// Sweep the indirect-ping table: shift deadlines by the reported glitch
    /// delay, answer expired entries with `TimedOut` and fold live deadlines
    /// into `next_event`.
    pub(crate) fn ipings_expire(&self, now: u64, net_glitch_delay: u64) -> Result<()> {
        let expired = {
            let mut st = self.inner.lock();
            let mut taken = Vec::new();
            let mut i = 0;
            while i < st.ipings.len() {
                let deadline = {
                    let entry = &mut st.ipings[i];
                    entry.deadline_ms = entry.deadline_ms.saturating_add(net_glitch_delay);
                    entry.deadline_ms
                };
                if now > deadline {
                    taken.push(st.ipings.remove(i));
                } else {
                    if deadline < st.next_event {
                        st.next_event = deadline;
                    }
                    i += 1;
                }
            }
            taken
        };

        let mut out = Ok(());
        for entry in expired {
            tracing::debug!(member = entry.id, requester = entry.from, "indirect ping expired");
            if let Err(e) =
                self.ops
                    .send_reply(entry.id, entry.from, Err(SwimError::TimedOut), entry.args)
            {
                tracing::error!(error = %e, "indirect ping reply failed");
                out = Err(e);
            }
        }
        out
    }

    /// Sweep the suspect list. Our own suspicions that aged out upgrade the
    /// member to DEAD; suspicions we merely heard about are re-dated and
    /// confirmed with their original reporter first.
    pub(crate) fn update_suspected(&self, now: u64, net_glitch_delay: u64) -> Result<()> {
        let mut confirms: Vec<(MemberId, MemberId)> = Vec::new();
        {
            let mut guard = self.inner.lock();
            let self_id = match guard.self_id {
                Some(id) => id,
                None => return Ok(()),
            };
            let ping_timeout_ms = guard.cfg.ping_timeout_ms;
            let mut i = 0;
            while i < guard.suspects.len() {
                let (id, from, deadline) = {
                    let entry = &mut guard.suspects[i];
                    entry.deadline_ms = entry.deadline_ms.saturating_add(net_glitch_delay);
                    (entry.id, entry.from, entry.deadline_ms)
                };
                if now > deadline {
                    let id_state = match self.ops.get_member_state(id) {
                        Ok(state) if state.status == MemberStatus::Suspect => state,
                        // Removed or updated behind our back; just drop it.
                        _ => {
                            guard.suspects.remove(i);
                            continue;
                        }
                    };

                    tracing::debug!(member = id, "suspicion timed out");
                    if from != self_id {
                        // Heard from someone else and never confirmed it
                        // ourselves; keep the member suspected while we ask
                        // the original reporter.
                        let entry = &mut guard.suspects[i];
                        entry.from = self_id;
                        entry.deadline_ms += ping_timeout_ms;
                        confirms.push((id, from));
                        i += 1;
                    } else {
                        let incarnation = id_state.incarnation;
                        guard.suspects.remove(i);
                        let _ = member_dead(&mut guard, &*self.ops, self_id, id, incarnation);
                    }
                } else {
                    if deadline < guard.next_event {
                        guard.next_event = deadline;
                    }
                    i += 1;
                }
            }
        }

        let mut out = Ok(());
        for (id, from) in confirms {
            tracing::debug!(member = id, reporter = from, "confirming suspicion with reporter");
            if let Err(e) = self.updates_send(id, from) {
                tracing::error!(member = id, error = %e, "confirmation send failed");
                out = Err(e);
            }
        }
        out
    }

    /// External starvation signal: deadlines involving `id` (or everything,
    /// when `id` is self) move out by `delay_ms`. Repeated calls accumulate
    /// without bound.
    pub fn net_glitch_update(&self, id: MemberId, delay_ms: u64) -> Result<()> {
        let self_id = {
            let mut st = self.inner.lock();
            let is_self = st.self_id == Some(id);
            for entry in st.suspects.iter_mut() {
                if is_self || id == entry.id {
                    entry.deadline_ms += delay_ms;
                }
            }
            for entry in st.ipings.iter_mut() {
                if is_self || id == entry.id {
                    entry.deadline_ms += delay_ms;
                }
            }
            if (is_self || st.target == Some(id))
                && matches!(st.tick, TickState::Pinged | TickState::IPinged)
            {
                st.deadline += delay_ms;
            }
            st.glitch = true;
            st.self_id
        };

        if self_id != Some(id) {
            tracing::error!(peer = id, delay_ms, "network glitch detected");
        }
        Ok(())
    }

    /// Forget any pending suspicion about `id`. The update queue is not
    /// scrubbed; stale entries fall out the next time piggyback assembly
    /// fails to find the member.
    pub fn member_del(&self, id: MemberId) {
        let mut st = self.inner.lock();
        st.suspects.retain(|e| e.id != id);
    }
}

impl Drop for SwimContext {
    fn drop(&mut self) {
        // Answer every suspended indirect ping before the queues go away.
        // The host must tolerate send_reply during teardown.
        let _ = self.ipings_expire(u64::MAX, 0);
        let mut st = self.inner.lock();
        st.updates.clear();
        st.suspects.clear();
        st.subgroup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberStatus;
    use crate::test_util::{test_config, MockOps};

    fn ctx_with(ops: &MockOps) -> SwimContext {
        SwimContext::with_config(Some(1), Arc::new(ops.clone()), test_config())
    }

    #[test]
    fn iping_suspend_rejects_duplicate_target() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);

        ctx.ipings_suspend(2, 3, Box::new(())).unwrap();
        let err = ctx.ipings_suspend(4, 3, Box::new(())).unwrap_err();
        assert_eq!(err, SwimError::Already);
        assert_eq!(ctx.inner.lock().ipings.len(), 1);
    }

    #[test]
    fn iping_reply_drains_matching_targets() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);

        ctx.ipings_suspend(2, 3, Box::new(())).unwrap();
        ctx.ipings_suspend(4, 5, Box::new(())).unwrap();
        ctx.ipings_reply(3, Ok(())).unwrap();

        let replies = ops.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], (3, 2, Ok(())));
        assert_eq!(ctx.inner.lock().ipings.len(), 1);
    }

    #[test]
    fn iping_expiry_answers_with_timeout() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);

        ctx.ipings_suspend(2, 3, Box::new(())).unwrap();
        ctx.ipings_expire(u64::MAX - 1, 0).unwrap();

        let replies = ops.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], (3, 2, Err(SwimError::TimedOut)));
        assert!(ctx.inner.lock().ipings.is_empty());
    }

    #[test]
    fn drop_answers_all_pending_ipings() {
        let ops = MockOps::new();
        {
            let ctx = ctx_with(&ops);
            ctx.ipings_suspend(2, 3, Box::new(())).unwrap();
            ctx.ipings_suspend(4, 5, Box::new(())).unwrap();
        }
        let replies = ops.replies();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, _, rc)| *rc == Err(SwimError::TimedOut)));
    }

    #[test]
    fn glitch_shifts_are_additive() {
        let ops = MockOps::new();
        ops.insert(2, MemberStatus::Suspect, 0);
        let ctx = ctx_with(&ops);
        {
            let mut st = ctx.inner.lock();
            st.suspects.push(SuspectEntry {
                id: 2,
                from: 1,
                deadline_ms: 1_000,
            });
        }

        ctx.net_glitch_update(2, 40).unwrap();
        ctx.net_glitch_update(2, 60).unwrap();

        let st = ctx.inner.lock();
        assert_eq!(st.suspects[0].deadline_ms, 1_100);
        assert!(st.glitch);
    }

    #[test]
    fn glitch_for_self_shifts_every_deadline() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);
        ctx.ipings_suspend(2, 3, Box::new(())).unwrap();
        let before = ctx.inner.lock().ipings[0].deadline_ms;

        ctx.net_glitch_update(1, 25).unwrap();

        assert_eq!(ctx.inner.lock().ipings[0].deadline_ms, before + 25);
    }

    #[test]
    fn member_del_forgets_suspicion() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);
        {
            let mut st = ctx.inner.lock();
            st.suspects.push(SuspectEntry {
                id: 7,
                from: 1,
                deadline_ms: u64::MAX,
            });
        }
        ctx.member_del(7);
        assert!(ctx.inner.lock().suspects.is_empty());
    }

    #[test]
    fn clearing_self_resets_starvation_detector() {
        let ops = MockOps::new();
        let ctx = ctx_with(&ops);
        ctx.inner.lock().expect_progress_time = 12_345;
        ctx.self_set(None);
        assert_eq!(ctx.inner.lock().expect_progress_time, 0);
        assert_eq!(ctx.self_id(), None);
    }
}
