/// Per-group encryption availability, as the chat UI sees it.
///
/// Uninitialized → Pending → {Available, Unavailable}. Unavailable → Pending
/// on retry, anything → Failed on an unrecoverable error, Failed → Pending
/// only through an explicit [`retry`](EncryptionStateMachine::retry). A key
/// held in the session cache moves any state to Available.
///
/// Pure logic, no I/O. The session feeds it resolution outcomes and
/// broadcasts the transitions it reports.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::E2eeError;
use crate::keys::EncryptedMessage;
use crate::types::{now_ms, GroupId, UserId};

/// Shown instead of a message this device cannot decrypt.
pub const LOCKED_PLACEHOLDER: &str = "Encrypted message. Waiting for the group key.";
/// Shown while decryption has not run yet.
pub const PENDING_PLACEHOLDER: &str = "Decrypting…";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionState {
    #[default]
    Uninitialized,
    Pending,
    Available,
    Unavailable { reason: String },
    Failed { reason: String },
}

impl fmt::Display for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionState::Uninitialized => f.write_str("uninitialized"),
            EncryptionState::Pending => f.write_str("pending"),
            EncryptionState::Available => f.write_str("available"),
            EncryptionState::Unavailable { reason } => write!(f, "unavailable ({reason})"),
            EncryptionState::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub group_id: GroupId,
    pub from: EncryptionState,
    pub to: EncryptionState,
}

/// Snapshot for the chat header: key present, still loading, last check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberKeyAvailability {
    pub group_id: GroupId,
    pub has_key: bool,
    pub loading: bool,
    pub last_checked_at: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    state: EncryptionState,
    last_checked_at: Option<u64>,
}

#[derive(Default)]
pub struct EncryptionStateMachine {
    groups: HashMap<GroupId, Entry>,
}

impl EncryptionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, group_id: &GroupId) -> EncryptionState {
        self.groups
            .get(group_id)
            .map(|e| e.state.clone())
            .unwrap_or_default()
    }

    /// Sending requires a resolved key.
    pub fn can_send(&self, group_id: &GroupId) -> bool {
        self.state(group_id) == EncryptionState::Available
    }

    /// Whether the UI should offer a retry.
    pub fn can_retry(&self, group_id: &GroupId) -> bool {
        matches!(
            self.state(group_id),
            EncryptionState::Unavailable { .. } | EncryptionState::Failed { .. }
        )
    }

    pub fn availability(&self, group_id: &GroupId) -> MemberKeyAvailability {
        let entry = self.groups.get(group_id).cloned().unwrap_or_default();
        MemberKeyAvailability {
            group_id: group_id.clone(),
            has_key: entry.state == EncryptionState::Available,
            loading: entry.state == EncryptionState::Pending,
            last_checked_at: entry.last_checked_at,
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// Start resolving. From Uninitialized or Unavailable only.
    pub fn begin(&mut self, group_id: &GroupId) -> Option<StateChange> {
        match self.state(group_id) {
            EncryptionState::Uninitialized | EncryptionState::Unavailable { .. } => {
                self.transition(group_id, EncryptionState::Pending)
            }
            _ => None,
        }
    }

    /// User-initiated retry. The only way out of Failed.
    pub fn retry(&mut self, group_id: &GroupId) -> Option<StateChange> {
        if self.can_retry(group_id) {
            self.transition(group_id, EncryptionState::Pending)
        } else {
            None
        }
    }

    /// Resolution finished. Pending only.
    pub fn resolve(&mut self, group_id: &GroupId, has_key: bool) -> Option<StateChange> {
        if self.state(group_id) != EncryptionState::Pending {
            return None;
        }
        let to = if has_key {
            EncryptionState::Available
        } else {
            EncryptionState::Unavailable {
                reason: "no key envelope for this device".into(),
            }
        };
        self.transition(group_id, to)
    }

    /// The key is in hand (setup just ran, or it resolved). From any state.
    pub fn confirm_key(&mut self, group_id: &GroupId) -> Option<StateChange> {
        self.transition(group_id, EncryptionState::Available)
    }

    /// Resolution could not finish (timeout, offline, not admitted yet). Pending only.
    pub fn mark_unavailable(&mut self, group_id: &GroupId, reason: String) -> Option<StateChange> {
        if self.state(group_id) != EncryptionState::Pending {
            return None;
        }
        self.transition(group_id, EncryptionState::Unavailable { reason })
    }

    /// Unrecoverable error, from any state.
    pub fn fail(&mut self, group_id: &GroupId, reason: String) -> Option<StateChange> {
        if matches!(self.state(group_id), EncryptionState::Failed { .. }) {
            return None;
        }
        self.transition(group_id, EncryptionState::Failed { reason })
    }

    /// Back to Uninitialized (navigation away, group leave).
    pub fn reset(&mut self, group_id: &GroupId) -> Option<StateChange> {
        let entry = self.groups.remove(group_id)?;
        if entry.state == EncryptionState::Uninitialized {
            return None;
        }
        Some(StateChange {
            group_id: group_id.clone(),
            from: entry.state,
            to: EncryptionState::Uninitialized,
        })
    }

    /// Reset every group (logout).
    pub fn clear(&mut self) -> Vec<StateChange> {
        let groups: Vec<GroupId> = self.groups.keys().cloned().collect();
        groups.iter().filter_map(|g| self.reset(g)).collect()
    }

    /// Map the outcome of a key resolution onto a transition.
    ///
    /// Cancellation resets, so the next entry re-derives from the store.
    pub fn apply_outcome(
        &mut self,
        group_id: &GroupId,
        outcome: &Result<bool, E2eeError>,
    ) -> Option<StateChange> {
        match outcome {
            Ok(true) => self.confirm_key(group_id),
            Ok(false) => self.resolve(group_id, false),
            Err(E2eeError::Cancelled) => self.reset(group_id),
            Err(e) if e.is_retry_later() => self.mark_unavailable(group_id, e.to_string()),
            Err(e) => self.fail(group_id, e.to_string()),
        }
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn transition(&mut self, group_id: &GroupId, to: EncryptionState) -> Option<StateChange> {
        let entry = self.groups.entry(group_id.clone()).or_default();
        if entry.state == to {
            return None;
        }
        if matches!(
            to,
            EncryptionState::Available
                | EncryptionState::Unavailable { .. }
                | EncryptionState::Failed { .. }
        ) {
            entry.last_checked_at = Some(now_ms());
        }
        let from = std::mem::replace(&mut entry.state, to.clone());
        Some(StateChange {
            group_id: group_id.clone(),
            from,
            to,
        })
    }
}

// ── InboundMessage ───────────────────────────────────────────────────────

/// A received message as the chat list renders it.
///
/// `is_decrypted`: `None` not attempted yet, `Some(true)` plaintext in
/// `text`, `Some(false)` locked. A locked message never exposes ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub created_at: u64,
    pub is_encrypted: bool,
    pub is_decrypted: Option<bool>,
    pub text: Option<String>,
}

impl InboundMessage {
    pub fn pending(message: &EncryptedMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            group_id: message.group_id.clone(),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            is_encrypted: true,
            is_decrypted: None,
            text: None,
        }
    }

    pub(crate) fn decrypted(mut self, text: String) -> Self {
        self.is_decrypted = Some(true);
        self.text = Some(text);
        self
    }

    pub(crate) fn locked(mut self) -> Self {
        self.is_decrypted = Some(false);
        self.text = None;
        self
    }

    pub fn display_text(&self) -> &str {
        match (self.is_decrypted, &self.text) {
            (Some(true), Some(text)) => text.as_str(),
            (None, _) => PENDING_PLACEHOLDER,
            _ => LOCKED_PLACEHOLDER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g() -> GroupId {
        GroupId::from("G1")
    }

    #[test]
    fn starts_uninitialized() {
        let sm = EncryptionStateMachine::new();
        assert_eq!(sm.state(&g()), EncryptionState::Uninitialized);
        assert!(!sm.can_send(&g()));
        assert!(!sm.can_retry(&g()));
    }

    #[test]
    fn happy_path() {
        let mut sm = EncryptionStateMachine::new();
        let change = sm.begin(&g()).unwrap();
        assert_eq!(change.from, EncryptionState::Uninitialized);
        assert_eq!(change.to, EncryptionState::Pending);
        assert!(sm.availability(&g()).loading);

        sm.resolve(&g(), true).unwrap();
        assert!(sm.can_send(&g()));
        let availability = sm.availability(&g());
        assert!(availability.has_key);
        assert!(!availability.loading);
        assert!(availability.last_checked_at.is_some());
    }

    #[test]
    fn unavailable_then_retry() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&g());
        sm.resolve(&g(), false).unwrap();
        assert!(matches!(sm.state(&g()), EncryptionState::Unavailable { .. }));
        assert!(sm.can_retry(&g()));
        assert!(!sm.can_send(&g()));

        sm.retry(&g()).unwrap();
        assert_eq!(sm.state(&g()), EncryptionState::Pending);
    }

    #[test]
    fn failed_only_leaves_through_retry() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&g());
        sm.fail(&g(), "permission denied".into()).unwrap();

        assert!(sm.begin(&g()).is_none());
        assert!(sm.resolve(&g(), true).is_none());
        assert!(sm.fail(&g(), "again".into()).is_none());

        sm.retry(&g()).unwrap();
        sm.resolve(&g(), true).unwrap();
        assert!(sm.can_send(&g()));
    }

    #[test]
    fn confirmed_key_clears_failed() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&g());
        sm.fail(&g(), "permission denied".into()).unwrap();

        let change = sm.apply_outcome(&g(), &Ok(true)).unwrap();
        assert!(matches!(change.from, EncryptionState::Failed { .. }));
        assert_eq!(change.to, EncryptionState::Available);
        assert!(sm.can_send(&g()));
        assert!(sm.confirm_key(&g()).is_none());
    }

    #[test]
    fn resolve_outside_pending_ignored() {
        let mut sm = EncryptionStateMachine::new();
        assert!(sm.resolve(&g(), true).is_none());
        assert!(sm.mark_unavailable(&g(), "x".into()).is_none());
        assert_eq!(sm.state(&g()), EncryptionState::Uninitialized);
    }

    #[test]
    fn available_is_not_restarted() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&g());
        sm.resolve(&g(), true);
        assert!(sm.begin(&g()).is_none());
        assert!(sm.retry(&g()).is_none());
    }

    #[test]
    fn outcome_mapping() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&g());
        sm.apply_outcome(&g(), &Err(E2eeError::Network("timed out".into())));
        assert!(matches!(sm.state(&g()), EncryptionState::Unavailable { .. }));

        sm.retry(&g());
        sm.apply_outcome(&g(), &Err(E2eeError::PermissionDenied("rules".into())));
        assert!(matches!(sm.state(&g()), EncryptionState::Failed { .. }));

        sm.retry(&g());
        sm.apply_outcome(&g(), &Err(E2eeError::Cancelled));
        assert_eq!(sm.state(&g()), EncryptionState::Uninitialized);
    }

    #[test]
    fn clear_reports_every_group() {
        let mut sm = EncryptionStateMachine::new();
        sm.begin(&"G1".into());
        sm.begin(&"G2".into());
        sm.resolve(&"G2".into(), true);

        let changes = sm.clear();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.to == EncryptionState::Uninitialized));
        assert_eq!(sm.state(&"G2".into()), EncryptionState::Uninitialized);
    }

    #[test]
    fn state_display() {
        assert_eq!(EncryptionState::Pending.to_string(), "pending");
        assert_eq!(
            EncryptionState::Unavailable {
                reason: "offline".into()
            }
            .to_string(),
            "unavailable (offline)"
        );
    }

    #[test]
    fn inbound_message_display() {
        let message = InboundMessage {
            message_id: "m1".into(),
            group_id: g(),
            sender_id: "alice".into(),
            created_at: 0,
            is_encrypted: true,
            is_decrypted: None,
            text: None,
        };
        assert_eq!(message.display_text(), PENDING_PLACEHOLDER);
        assert_eq!(message.clone().locked().display_text(), LOCKED_PLACEHOLDER);
        assert_eq!(message.decrypted("hi".into()).display_text(), "hi");
    }
}
