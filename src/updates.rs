// Piggyback dissemination and the update interpreter.
//
// Outbound: every protocol message carries a bounded vector of recent state
// deltas assembled by `updates_prepare`. Inbound: `updates_parse` reconciles
// remote observations with the host's member table using the
// (incarnation, status) precedence rules, where DEAD > SUSPECT > ALIVE and a
// higher incarnation beats everything.

use crate::config::PIGGYBACK_ENTRIES;
use crate::context::{ProtoState, SuspectEntry, SwimContext, UpdateEntry};
use crate::error::{Result, SwimError};
use crate::member::{MemberId, MemberState, MemberStatus, MemberUpdate};
use crate::now_ms;
use crate::ops::SwimOps;
use crate::tick::TickState;
use std::fmt::Write as _;

/// Trace one update vector as a single debug line, e.g.
/// `1 => 4: {2 A 0} {1 A 3}`.
pub(crate) fn dump_updates(
    self_id: MemberId,
    from_id: MemberId,
    to_id: MemberId,
    upds: &[MemberUpdate],
) {
    if !tracing::enabled!(tracing::Level::DEBUG) || upds.is_empty() {
        return;
    }
    let mut msg = String::new();
    for upd in upds {
        let _ = write!(
            msg,
            " {{{} {} {}}}",
            upd.id,
            upd.state.status.as_char(),
            upd.state.incarnation
        );
    }
    let outbound = self_id == from_id;
    let peer = if outbound { to_id } else { from_id };
    let dir = if outbound { "=>" } else { "<=" };
    tracing::debug!("{} {} {}:{}", self_id, dir, peer, msg);
}

/// Record that `id` changed state so the change gets piggybacked on future
/// messages, then push the new state into the host table. An existing queue
/// entry for the member is re-armed instead of duplicated.
pub(crate) fn notify(
    st: &mut ProtoState,
    ops: &dyn SwimOps,
    from: MemberId,
    id: MemberId,
    id_state: &MemberState,
    tx_count: u64,
) -> Result<()> {
    if let Some(entry) = st.updates.iter_mut().find(|e| e.id == id) {
        entry.from = from;
        entry.tx_count = tx_count;
    } else {
        st.updates.push_front(UpdateEntry { id, from, tx_count });
    }
    ops.set_member_state(id, id_state)
}

/// Fold an ALIVE observation at incarnation `nr` into local state.
pub(crate) fn member_alive(
    st: &mut ProtoState,
    ops: &dyn SwimOps,
    from: MemberId,
    id: MemberId,
    nr: u64,
) -> Result<()> {
    let mut id_state = match ops.get_member_state(id) {
        Ok(state) => state,
        Err(SwimError::NotFound(_)) => {
            tracing::debug!(member = id, "not bootstrapped yet");
            return Err(SwimError::NotFound(id));
        }
        Err(e) => {
            tracing::error!(member = id, error = %e, "member state lookup failed");
            return Err(e);
        }
    };

    let mut tx_count = 0;
    if id_state.status == MemberStatus::Inactive {
        // Bootstrap completed. Keep the news local instead of spreading it
        // through the whole group.
        tx_count = st.cfg.piggyback_tx_max;
    } else if nr > id_state.incarnation {
        // Fresher incarnation always wins.
    } else if id_state.status == MemberStatus::Dead
        || id_state.status == MemberStatus::Alive
        || id_state.incarnation >= nr
    {
        // Stale report, a no-op re-send, or a member already given up on.
        return Err(SwimError::Already);
    }

    st.suspects.retain(|e| e.id != id);
    tracing::info!(member = id, incarnation = nr, from = from, "member is ALIVE");
    id_state.incarnation = nr;
    id_state.status = MemberStatus::Alive;
    notify(st, ops, from, id, &id_state, tx_count)
}

/// Fold a DEAD observation at incarnation `nr` into local state.
pub(crate) fn member_dead(
    st: &mut ProtoState,
    ops: &dyn SwimOps,
    from: MemberId,
    id: MemberId,
    nr: u64,
) -> Result<()> {
    let mut id_state = match ops.get_member_state(id) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(member = id, error = %e, "member state lookup failed");
            return Err(e);
        }
    };

    if id_state.status == MemberStatus::Inactive {
        // A bootstrapping member is normally untouchable; only a reported
        // network glitch may have hidden its death from us.
        if !st.glitch {
            return Ok(());
        }
    } else if nr > id_state.incarnation {
    } else if id_state.status == MemberStatus::Dead || id_state.incarnation > nr {
        return Err(SwimError::Already);
    }

    st.suspects.retain(|e| e.id != id);
    tracing::error!(
        member = id,
        incarnation = nr,
        from = from,
        self_report = st.self_id == Some(from),
        "member is DEAD"
    );
    id_state.incarnation = nr;
    id_state.status = MemberStatus::Dead;
    notify(st, ops, from, id, &id_state, 0)
}

/// Fold a SUSPECT observation at incarnation `nr` into local state and arm
/// (or refresh) its suspicion deadline.
pub(crate) fn member_suspect(
    st: &mut ProtoState,
    ops: &dyn SwimOps,
    from: MemberId,
    id: MemberId,
    nr: u64,
) -> Result<()> {
    // Without a suspicion window there is nothing to wait for.
    if st.cfg.suspect_timeout_ms == 0 {
        return member_dead(st, ops, from, id, nr);
    }

    let mut id_state = match ops.get_member_state(id) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(member = id, error = %e, "member state lookup failed");
            return Err(e);
        }
    };

    if id_state.status == MemberStatus::Inactive {
        return Ok(());
    }
    if nr > id_state.incarnation {
        // Fresher suspicion is always tracked.
    } else if id_state.status == MemberStatus::Dead
        || id_state.status == MemberStatus::Suspect
        || id_state.incarnation > nr
    {
        return Err(SwimError::Already);
    }

    let deadline_ms = now_ms() + st.cfg.suspect_timeout_ms;
    if let Some(entry) = st.suspects.iter_mut().find(|e| e.id == id) {
        // A suspicion of a newer incarnation resets the existing one.
        if nr > id_state.incarnation {
            entry.from = from;
            entry.deadline_ms = deadline_ms;
        }
    } else {
        st.suspects.push(SuspectEntry {
            id,
            from,
            deadline_ms,
        });
    }

    tracing::info!(member = id, incarnation = nr, from = from, "member is SUSPECT");
    id_state.incarnation = nr;
    id_state.status = MemberStatus::Suspect;
    notify(st, ops, from, id, &id_state, 0)
}

impl SwimContext {
    /// Assemble the outbound update vector for a message about member `id`
    /// sent to peer `to`: the probed member first, then self, then the
    /// recipient, then up to [`PIGGYBACK_ENTRIES`] queue entries that are not
    /// already covered by the header slots. Each emitted queue entry burns
    /// one transmission from its budget.
    pub fn updates_prepare(&self, id: MemberId, to: MemberId) -> Result<Vec<MemberUpdate>> {
        let mut guard = self.inner.lock();
        let self_id = match guard.self_id {
            Some(s) => s,
            None => {
                return Err(SwimError::InvalidArgument(
                    "self identity is not set".into(),
                ))
            }
        };

        let cap = PIGGYBACK_ENTRIES + 1 + usize::from(id != self_id) + usize::from(id != to);
        let mut upds = Vec::with_capacity(cap);

        match self.ops.get_member_state(id) {
            Ok(state) => upds.push(MemberUpdate { id, state }),
            Err(SwimError::NotFound(_)) => {
                tracing::debug!(member = id, "not bootstrapped yet");
                return Err(SwimError::NotFound(id));
            }
            Err(e) => {
                tracing::error!(member = id, error = %e, "member state lookup failed");
                return Err(e);
            }
        }

        if id != self_id {
            // Refresh our own standing on the recipient.
            match self.ops.get_member_state(self_id) {
                Ok(state) => upds.push(MemberUpdate { id: self_id, state }),
                Err(e) => {
                    tracing::error!(member = self_id, error = %e, "member state lookup failed");
                    return Err(e);
                }
            }
        }

        if id != to {
            match self.ops.get_member_state(to) {
                Ok(state) => upds.push(MemberUpdate { id: to, state }),
                Err(SwimError::NotFound(_)) => {
                    tracing::debug!(member = to, "not bootstrapped yet");
                    return Err(SwimError::NotFound(to));
                }
                Err(e) => {
                    tracing::error!(member = to, error = %e, "member state lookup failed");
                    return Err(e);
                }
            }
        }

        let tx_max = guard.cfg.piggyback_tx_max;
        let mut i = 0;
        while i < guard.updates.len() {
            // Overflow beyond the packet budget is dropped outright.
            if upds.len() >= cap {
                guard.updates.remove(i);
                continue;
            }

            let entry_id = guard.updates[i].id;
            if entry_id != id && entry_id != self_id && entry_id != to {
                match self.ops.get_member_state(entry_id) {
                    Ok(state) => upds.push(MemberUpdate {
                        id: entry_id,
                        state,
                    }),
                    Err(SwimError::NotFound(_)) => {
                        // Member was removed; its pending update goes too.
                        guard.updates.remove(i);
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(member = entry_id, error = %e, "member state lookup failed");
                        return Err(e);
                    }
                }
            }

            let spent = {
                let entry = &mut guard.updates[i];
                entry.tx_count += 1;
                entry.tx_count > tx_max
            };
            if spent {
                guard.updates.remove(i);
            } else {
                i += 1;
            }
        }
        drop(guard);

        dump_updates(self_id, self_id, to, &upds);
        Ok(upds)
    }

    /// Prepare and transmit a message about `id` to `to`. The update vector
    /// is handed off to the transport.
    pub fn updates_send(&self, id: MemberId, to: MemberId) -> Result<()> {
        let upds = self.updates_prepare(id, to)?;
        self.ops.send_request(id, to, upds)
    }

    /// Reconcile a batch of inbound updates from `from_id`. `id` is the
    /// member the message was addressed about (self for a direct probe, the
    /// probe target for an indirect one); a batch touching the current probe
    /// target counts as an implicit ack.
    pub fn updates_parse(
        &self,
        from_id: MemberId,
        id: MemberId,
        upds: &[MemberUpdate],
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        let self_id = match guard.self_id {
            // Not initialized yet; ignore the batch.
            Some(s) => s,
            None => return Ok(()),
        };

        dump_updates(self_id, from_id, self_id, upds);
        if upds.is_empty() {
            return Ok(());
        }

        let mut tick = guard.tick;

        match self.ops.get_member_state(from_id) {
            Ok(state) if state.status == MemberStatus::Dead => {
                drop(guard);
                tracing::debug!(from = from_id, "skipping update from dead sender");
                return Err(SwimError::NotFound(from_id));
            }
            Ok(_) => {}
            Err(SwimError::NotFound(_)) => {
                drop(guard);
                tracing::debug!(from = from_id, "skipping update from unknown sender");
                return Err(SwimError::NotFound(from_id));
            }
            Err(e) => {
                drop(guard);
                tracing::error!(member = from_id, error = %e, "member state lookup failed");
                return Err(e);
            }
        }

        if (guard.target == Some(from_id) || guard.target == Some(id))
            && matches!(
                tick,
                TickState::Begin | TickState::Pinged | TickState::IPinged
            )
        {
            // The probe target answered, directly or through a forwarder.
            tracing::debug!(member = id, "probe target answered");
            tick = TickState::Select;
        }

        for upd in upds {
            match upd.state.status {
                // Inactive marks bootstrap in progress; it is never spread.
                MemberStatus::Inactive => {}
                MemberStatus::Alive => {
                    if upd.id == self_id {
                        continue;
                    }
                    let _ = member_alive(&mut guard, &*self.ops, from_id, upd.id, upd.state.incarnation);
                }
                MemberStatus::Suspect | MemberStatus::Dead => {
                    if upd.id == self_id {
                        // Somebody claims we are gone. Refute with a fresh
                        // incarnation unless we already did.
                        let mut self_state = match self.ops.get_member_state(self_id) {
                            Ok(state) => state,
                            Err(e) => {
                                drop(guard);
                                tracing::error!(member = self_id, error = %e, "member state lookup failed");
                                return Err(e);
                            }
                        };
                        if self_state.incarnation > upd.state.incarnation {
                            continue;
                        }

                        tracing::error!(
                            claim = %upd.state.status,
                            incarnation = upd.state.incarnation,
                            from = from_id,
                            "refuting claim against self"
                        );
                        if let Err(e) = self.ops.new_incarnation(self_id, &mut self_state) {
                            drop(guard);
                            tracing::error!(error = %e, "incarnation mint failed");
                            return Err(e);
                        }
                        if let Err(e) = notify(&mut guard, &*self.ops, self_id, self_id, &self_state, 0)
                        {
                            drop(guard);
                            tracing::error!(error = %e, "self update enqueue failed");
                            return Err(e);
                        }
                        continue;
                    }

                    if upd.state.status == MemberStatus::Suspect {
                        let _ = member_suspect(
                            &mut guard,
                            &*self.ops,
                            from_id,
                            upd.id,
                            upd.state.incarnation,
                        );
                    } else {
                        let _ = member_dead(
                            &mut guard,
                            &*self.ops,
                            from_id,
                            upd.id,
                            upd.state.incarnation,
                        );
                    }
                }
            }
        }

        guard.tick = tick;
        Ok(())
    }

    /// Lightweight response builder for receive paths that cannot afford a
    /// full parse: scans the inbound batch for SUSPECT/DEAD claims against
    /// self (minting a fresh incarnation when one qualifies) and returns an
    /// ALIVE about self, plus an ALIVE echo for `id` when the batch mentioned
    /// it. Pure aside from the incarnation mint.
    pub fn updates_short(
        &self,
        self_id: MemberId,
        self_incarnation: u64,
        from_id: MemberId,
        id: MemberId,
        upds_in: &[MemberUpdate],
    ) -> Result<Vec<MemberUpdate>> {
        dump_updates(self_id, from_id, self_id, upds_in);

        let mut self_state = MemberState {
            incarnation: self_incarnation,
            status: MemberStatus::Alive,
            delay: 0,
        };
        let mut id_upd: Option<&MemberUpdate> = None;
        {
            let _guard = self.inner.lock();
            for upd in upds_in {
                if upd.id == self_id {
                    if upd.state.incarnation < self_incarnation
                        || (upd.state.status != MemberStatus::Suspect
                            && upd.state.status != MemberStatus::Dead)
                    {
                        continue;
                    }
                    tracing::error!(
                        claim = %upd.state.status,
                        incarnation = upd.state.incarnation,
                        from = from_id,
                        "refuting claim against self"
                    );
                    self.ops.new_incarnation(self_id, &mut self_state)?;
                } else if upd.id == id {
                    id_upd = Some(upd);
                }
            }
        }

        let mut out = Vec::with_capacity(2);
        out.push(MemberUpdate {
            id: self_id,
            state: MemberState {
                incarnation: self_state.incarnation,
                status: MemberStatus::Alive,
                delay: 0,
            },
        });
        if id != self_id {
            if let Some(upd) = id_upd {
                out.push(MemberUpdate {
                    id,
                    state: MemberState {
                        incarnation: upd.state.incarnation,
                        status: MemberStatus::Alive,
                        delay: 0,
                    },
                });
            }
        }

        dump_updates(self_id, self_id, from_id, &out);
        Ok(out)
    }
}
