//! Presence set for one channel and the multi-frame SYNC protocol.
//!
//! The map is keyed by member key (`clientId:connectionId`) and only ever
//! moves forward: a message replaces the stored entry only when
//! [`PresenceMessage::is_newer_than`] says so, which makes re-applying a
//! message a no-op.
//!
//! A sync pass snapshots the keys present when it starts. Every message
//! applied during the pass removes its key from that residual set; whatever
//! is left when the final frame arrives is gone from the service and gets a
//! synthesized LEAVE. LEAVEs that arrive mid-pass are parked as ABSENT so a
//! stale PRESENT later in the same pass cannot resurrect the member.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::error::ErrorInfo;
use crate::protocol::{PresenceAction, PresenceMessage};

pub(crate) type SyncWaiter = oneshot::Sender<Result<(), ErrorInfo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncState {
    Initialized,
    InProgress,
    Ended,
    Failed,
}

pub(crate) struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Members entered by this client, keyed by clientId, for re-entry.
    local: HashMap<String, PresenceMessage>,
    residual: HashSet<String>,
    state: SyncState,
    sync_cursor: Option<String>,
    waiters: Vec<SyncWaiter>,
}

impl Default for PresenceMap {
    fn default() -> Self {
        Self {
            members: HashMap::new(),
            local: HashMap::new(),
            residual: HashSet::new(),
            state: SyncState::Initialized,
            sync_cursor: None,
            waiters: Vec::new(),
        }
    }
}

impl PresenceMap {
    pub(crate) fn sync_state(&self) -> SyncState {
        self.state
    }

    pub(crate) fn sync_in_progress(&self) -> bool {
        self.state == SyncState::InProgress
    }

    /// Live members, i.e. everything not parked as ABSENT.
    pub(crate) fn members(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self
            .members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .cloned()
            .collect();
        members.sort_by_key(PresenceMessage::member_key);
        members
    }

    pub(crate) fn start_sync(&mut self, cursor: Option<&str>) {
        if self.state != SyncState::InProgress {
            self.residual = self.members.keys().cloned().collect();
            self.state = SyncState::InProgress;
        }
        self.sync_cursor = cursor.map(str::to_string);
        tracing::debug!(cursor = ?self.sync_cursor, residual = self.residual.len(), "Presence sync started");
    }

    /// Apply one presence message. Returns the event to broadcast, or `None`
    /// when the message is older than what is already stored.
    pub(crate) fn put(
        &mut self,
        msg: PresenceMessage,
        own_connection_id: Option<&str>,
    ) -> Option<PresenceMessage> {
        let key = msg.member_key();
        // Seen in this pass, even if what we hold is newer.
        self.residual.remove(&key);
        if let Some(existing) = self.members.get(&key)
            && !msg.is_newer_than(existing)
        {
            tracing::trace!(member = %key, id = ?msg.id, "Ignoring stale presence message");
            return None;
        }

        if own_connection_id.is_some() && msg.connection_id.as_deref() == own_connection_id {
            self.track_local(&msg);
        }

        match msg.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                let stored = PresenceMessage {
                    action: PresenceAction::Present,
                    ..msg.clone()
                };
                self.members.insert(key, stored);
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                if self.state == SyncState::InProgress {
                    let parked = PresenceMessage {
                        action: PresenceAction::Absent,
                        ..msg.clone()
                    };
                    self.members.insert(key, parked);
                } else {
                    match self.members.remove(&key) {
                        Some(existing) if existing.action != PresenceAction::Absent => {}
                        _ => return None,
                    }
                }
            }
        }
        Some(msg)
    }

    fn track_local(&mut self, msg: &PresenceMessage) {
        let Some(client_id) = msg.client_id.clone() else {
            return;
        };
        match msg.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.local.insert(client_id, msg.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.local.remove(&client_id);
            }
        }
    }

    /// Finish the pass. Returns synthesized LEAVEs for members that were
    /// present before the pass but never confirmed during it.
    pub(crate) fn end_sync(&mut self, timestamp: Option<i64>) -> Vec<PresenceMessage> {
        self.members.retain(|_, m| m.action != PresenceAction::Absent);

        let mut departed: Vec<PresenceMessage> = self
            .residual
            .drain()
            .filter_map(|key| self.members.remove(&key))
            .map(|member| PresenceMessage {
                action: PresenceAction::Leave,
                timestamp: timestamp.or(member.timestamp),
                ..member
            })
            .collect();
        departed.sort_by_key(PresenceMessage::member_key);

        self.state = SyncState::Ended;
        self.sync_cursor = None;
        tracing::debug!(
            members = self.members.len(),
            departed = departed.len(),
            "Presence sync ended"
        );
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        departed
    }

    /// Abort the pass. The member set is left as it was, but its validity is
    /// unknown until the next pass completes.
    pub(crate) fn fail_sync(&mut self, error: ErrorInfo) {
        if self.state == SyncState::InProgress {
            self.state = SyncState::Failed;
        }
        self.residual.clear();
        self.sync_cursor = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Resolve `waiter` when the current (or next) pass ends or fails.
    pub(crate) fn once_sync_complete(&mut self, waiter: SyncWaiter) {
        match self.state {
            SyncState::Ended => {
                let _ = waiter.send(Ok(()));
            }
            SyncState::Initialized | SyncState::InProgress | SyncState::Failed => {
                self.waiters.push(waiter);
            }
        }
    }

    /// ENTER messages for every member this client had entered, to be sent
    /// again after the service lost track of them.
    pub(crate) fn reenter_local_members(&self) -> Vec<PresenceMessage> {
        let mut entries: Vec<PresenceMessage> = self
            .local
            .values()
            .map(|m| PresenceMessage {
                action: PresenceAction::Enter,
                id: m.id.clone(),
                client_id: m.client_id.clone(),
                data: m.data.clone(),
                encoding: m.encoding.clone(),
                ..Default::default()
            })
            .collect();
        entries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        entries
    }

    /// Forget everything; used when the channel detaches or fails.
    pub(crate) fn reset(&mut self, error: ErrorInfo) {
        self.fail_sync(error);
        self.members.clear();
        self.local.clear();
        self.state = SyncState::Initialized;
    }
}
