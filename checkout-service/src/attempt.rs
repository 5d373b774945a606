use std::fmt;

use tokio::sync::watch;
use uuid::Uuid;

/// Identity of one checkout attempt. Also used as the idempotency key for the
/// attempt's order create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn payment_key(&self) -> String {
        format!("{}:payment", self.0)
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returned by long-running steps when their attempt stops being current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Handle held by every task working on behalf of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptToken {
    id: AttemptId,
    current: watch::Receiver<Option<AttemptId>>,
}

impl AttemptToken {
    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        *self.current.borrow() == Some(self.id)
    }

    /// Resolves once a newer attempt begins or this one is revoked.
    pub async fn cancelled(&self) {
        let mut rx = self.current.clone();
        loop {
            if *rx.borrow_and_update() != Some(self.id) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Source of truth for which attempt is current. Beginning an attempt
/// supersedes every earlier token.
#[derive(Debug)]
pub struct AttemptRegistry {
    tx: watch::Sender<Option<AttemptId>>,
}

impl Default for AttemptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn begin(&self) -> AttemptToken {
        let id = AttemptId::new();
        self.tx.send_replace(Some(id));
        AttemptToken { id, current: self.tx.subscribe() }
    }

    /// Revoke `id` if it is still current. Returns whether anything changed.
    pub fn revoke(&self, id: AttemptId) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Some(id) {
                *current = None;
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> Option<AttemptId> {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn newer_attempt_supersedes_older() {
        let registry = AttemptRegistry::new();
        let first = registry.begin();
        assert!(first.is_current());
        let second = registry.begin();
        assert!(!first.is_current());
        assert!(second.is_current());
        tokio::time::timeout(Duration::from_millis(50), first.cancelled())
            .await
            .expect("superseded token resolves");
    }

    #[tokio::test]
    async fn revoke_only_touches_current() {
        let registry = AttemptRegistry::new();
        let first = registry.begin();
        let second = registry.begin();
        assert!(!registry.revoke(first.id()));
        assert!(second.is_current());
        assert!(registry.revoke(second.id()));
        assert!(!second.is_current());
        assert_eq!(registry.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn current_token_stays_pending() {
        let registry = AttemptRegistry::new();
        let token = registry.begin();
        let waited = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn payment_key_derives_from_attempt() {
        let id = AttemptId::new();
        assert_eq!(id.payment_key(), format!("{id}:payment"));
    }
}
