// The per-period probe state machine.
//
// One protocol period drives one peer through BEGIN -> PINGED -> TIMEDOUT ->
// IPINGED -> SELECT. The host calls `progress` as often as it likes; the loop
// runs until the wall-clock budget is exhausted or nothing interesting
// happens within the next 100 ms.

use crate::config::PROGRESS_SLACK_MS;
use crate::context::{now_ms, SubgroupEntry, SwimContext};
use crate::error::{Result, SwimError};
use crate::member::{MemberId, MemberState, MemberStatus};
use crate::updates::member_suspect;

/// Where the current probe round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickState {
    /// Next target already selected, probe not sent yet.
    Begin,
    /// Direct ping sent, waiting for a response.
    Pinged,
    /// No direct response; indirect probes go out through the subgroup.
    TimedOut,
    /// Indirect pings sent, waiting for responses or the period end.
    IPinged,
    /// Pick the next target.
    Select,
}

/// How a call to [`SwimContext::progress`] ended. Neither value is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// The wall-clock budget ran out.
    TimedOut,
    /// Nothing interesting happens within the next 100 ms; the host may
    /// sleep.
    Canceled,
    /// The engine has no identity assigned and did nothing.
    Idle,
}

/// Probe timeout for a peer with round-trip estimate `state_delay`:
/// twice the estimate, clamped into [ping_timeout, 3 * ping_timeout].
pub(crate) fn ping_delay(ping_timeout_ms: u64, state_delay: u64) -> u64 {
    let delay = state_delay * 2;
    if delay < ping_timeout_ms || delay > 3 * ping_timeout_ms {
        ping_timeout_ms
    } else {
        delay
    }
}

impl SwimContext {
    /// Drive the protocol for up to `timeout_us` microseconds.
    ///
    /// Sweeps the suspect list and the indirect-ping table, then advances the
    /// probe state machine, sending at most one probe per pass with the
    /// context lock released. Member-store failures other than not-found
    /// abort the call; a not-found probe target is recovered locally by
    /// selecting a new one.
    pub fn progress(&self, timeout_us: i64) -> Result<ProgressStatus> {
        if self.self_id().is_none() {
            // Not initialized yet (or paused); ignore this call.
            return Ok(ProgressStatus::Idle);
        }

        let (result, now) = self.progress_loop(timeout_us);

        let mut st = self.inner.lock();
        if st.self_id.is_some() {
            st.expect_progress_time = now + st.cfg.period_ms;
        }
        st.glitch = false;
        result
    }

    fn progress_loop(&self, timeout_us: i64) -> (Result<ProgressStatus>, u64) {
        let mut now = now_ms();
        let end = if timeout_us > 0 {
            now + timeout_us as u64 / 1000
        } else {
            0
        };

        let mut net_glitch_delay = 0u64;
        {
            let mut st = self.inner.lock();
            st.next_event = now + st.cfg.period_ms;
            if st.expect_progress_time != 0 && now > st.expect_progress_time {
                net_glitch_delay = now - st.expect_progress_time;
                tracing::error!(
                    delay_ms = net_glitch_delay,
                    "progress was not called for too long"
                );
            }
        }

        // The initial TIMEDOUT forces one full pass even with no budget, and
        // keeps the loop going until a started indirect round is dispatched.
        let mut tick = TickState::TimedOut;
        while now <= end || tick == TickState::TimedOut {
            if let Err(e) = self.update_suspected(now, net_glitch_delay) {
                tracing::error!(error = %e, "suspect sweep failed");
                return (Err(e), now);
            }
            if let Err(e) = self.ipings_expire(now, net_glitch_delay) {
                tracing::error!(error = %e, "indirect ping sweep failed");
                return (Err(e), now);
            }

            // (probed member, wire destination) staged under the lock, sent
            // after it is released.
            let mut probe: Option<(MemberId, MemberId)> = None;
            let next_event;
            {
                let mut guard = self.inner.lock();
                let self_id = match guard.self_id {
                    Some(id) => id,
                    None => return (Ok(ProgressStatus::Idle), now),
                };

                tick = TickState::Select;
                let mut target_state = MemberState::default();
                if let Some(target) = guard.target {
                    match self.ops.get_member_state(target) {
                        Ok(state) => {
                            target_state = state;
                            tick = guard.tick;
                        }
                        Err(SwimError::NotFound(_)) => {
                            // Target disappeared; pick another one.
                            guard.target = None;
                        }
                        Err(e) => {
                            guard.target = None;
                            drop(guard);
                            tracing::error!(member = target, error = %e, "member state lookup failed");
                            return (Err(e), now);
                        }
                    }
                }

                match tick {
                    TickState::Begin => {
                        if let Some(target) = guard.target {
                            if now > guard.next_tick_time {
                                let delay =
                                    ping_delay(guard.cfg.ping_timeout_ms, target_state.delay);
                                tracing::debug!(
                                    member = target,
                                    status = %target_state.status,
                                    incarnation = target_state.incarnation,
                                    timeout_ms = delay,
                                    "dping"
                                );
                                guard.next_tick_time = now + guard.cfg.period_ms;
                                guard.deadline = now + delay;
                                if guard.deadline < guard.next_event {
                                    guard.next_event = guard.deadline;
                                }
                                probe = Some((target, target));
                                tick = TickState::Pinged;
                            } else if guard.next_tick_time < guard.next_event {
                                guard.next_event = guard.next_tick_time;
                            }
                        }
                    }
                    TickState::Pinged => {
                        // Did the target of the previous step ever ack the
                        // direct ping?
                        guard.deadline += net_glitch_delay;
                        if now > guard.deadline {
                            tick = if target_state.status != MemberStatus::Inactive {
                                TickState::TimedOut
                            } else {
                                // Still bootstrapping; skip to the next member.
                                TickState::Select
                            };
                            guard.next_event = now;
                        } else if guard.deadline < guard.next_event {
                            guard.next_event = guard.deadline;
                        }
                    }
                    TickState::TimedOut => {
                        // No direct response within an RTT; fan out indirect
                        // pings through a small subgroup.
                        if let Some(target) = guard.target {
                            if guard.subgroup.is_empty() {
                                let wanted = guard.cfg.subgroup_size;
                                for _ in 0..wanted {
                                    match self.ops.get_iping_target() {
                                        Some(forwarder) => {
                                            guard.subgroup.push_back(SubgroupEntry {
                                                from: target,
                                                id: forwarder,
                                            })
                                        }
                                        None => break,
                                    }
                                }
                            }

                            if let Some(item) = guard.subgroup.pop_front() {
                                match self.ops.get_member_state(item.id) {
                                    Ok(state) => {
                                        let mut delay = ping_delay(
                                            guard.cfg.ping_timeout_ms,
                                            target_state.delay,
                                        );
                                        let mut send = false;
                                        if item.from != item.id {
                                            // Only ALIVE members may carry an
                                            // indirect probe.
                                            if state.status == MemberStatus::Alive {
                                                delay *= 2;
                                                tracing::debug!(
                                                    forwarder = item.id,
                                                    member = item.from,
                                                    timeout_ms = delay,
                                                    "ireq"
                                                );
                                                send = true;
                                            }
                                        } else if state.status == MemberStatus::Inactive {
                                            // Bootstrap retry goes straight
                                            // back to the target itself.
                                            tracing::debug!(
                                                member = item.id,
                                                timeout_ms = delay,
                                                "dping retry"
                                            );
                                            send = true;
                                        }
                                        if send {
                                            probe = Some((item.from, item.id));
                                            let deadline = now + delay;
                                            if deadline > guard.deadline {
                                                guard.deadline = deadline;
                                            }
                                            if guard.deadline < guard.next_event {
                                                guard.next_event = guard.deadline;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        tracing::error!(member = item.id, error = %e, "member state lookup failed");
                                    }
                                }
                            }

                            if guard.subgroup.is_empty() {
                                tick = TickState::IPinged;
                            }
                        }
                    }
                    TickState::IPinged => {
                        guard.deadline += net_glitch_delay;
                        if now > guard.deadline {
                            // Nobody reached the target for us either.
                            if target_state.status != MemberStatus::Inactive {
                                if let Some(target) = guard.target {
                                    let _ = member_suspect(
                                        &mut guard,
                                        &*self.ops,
                                        self_id,
                                        target,
                                        target_state.incarnation,
                                    );
                                }
                            }
                            guard.next_event = now;
                            tick = TickState::Select;
                        } else if guard.next_tick_time < guard.next_event {
                            guard.next_event = guard.next_tick_time;
                        }
                    }
                    TickState::Select => {
                        guard.target = self.ops.get_dping_target();
                        if guard.target.is_none() {
                            guard.next_event = now + guard.cfg.period_ms;
                        } else {
                            if guard.next_tick_time < guard.next_event {
                                guard.next_event = guard.next_tick_time;
                            }
                            tick = TickState::Begin;
                        }
                    }
                }

                // The starvation delta is applied exactly once per call.
                net_glitch_delay = 0;
                guard.tick = tick;
                next_event = guard.next_event;
            }

            if let Some((id, to)) = probe {
                if let Err(e) = self.updates_send(id, to) {
                    tracing::error!(member = id, to = to, error = %e, "probe send failed");
                    return (Err(e), now);
                }
            } else if now + PROGRESS_SLACK_MS < next_event {
                // Nothing due soon; let the host sleep.
                break;
            }

            now = now_ms();
        }

        let status = if now > end {
            ProgressStatus::TimedOut
        } else {
            ProgressStatus::Canceled
        };
        (Ok(status), now)
    }
}
