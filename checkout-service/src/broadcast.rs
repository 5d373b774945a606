//! Completion signals from the payment return page.
//!
//! The return page may be served in a different browsing context from the one
//! that started checkout. It announces the provider's verdict on a direct
//! message channel, and falls back to a shared-storage relay key when nobody is
//! listening directly. The listener reads both and hands the controller one
//! normalized [`CompletionSignal`] stream. The relay key is removed as soon as
//! it is read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::attempt::AttemptToken;

pub const PAYMENT_REDIRECT_RESULT: &str = "PAYMENT_REDIRECT_RESULT";
pub const RELAY_STORAGE_KEY: &str = "payment_redirect_result";
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSignal {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_code", skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i64>,
}

/// Return pages pass the provider's query string through, so the result code
/// can arrive as a number or as numeric text.
fn lenient_code<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Int(code)) => Some(code),
        Some(Raw::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
    #[serde(rename = "PAYMENT_REDIRECT_RESULT")]
    PaymentRedirectResult(CompletionSignal),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalChannel {
    Direct,
    Storage,
}

impl SignalChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalChannel::Direct => "direct",
            SignalChannel::Storage => "storage",
        }
    }
}

/// Key/value store shared by every context, with a change feed of keys.
#[derive(Clone)]
pub struct SharedStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
    changes: broadcast::Sender<String>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { entries: Arc::default(), changes }
    }
}

impl SharedStorage {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, key: &str, value: String) {
        self.entries().insert(key.to_string(), value);
        let _ = self.changes.send(key.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Read and remove in one step.
    pub fn take(&self, key: &str) -> Option<String> {
        self.entries().remove(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct { receivers: usize },
    Relayed,
}

/// Publish/subscribe surface shared by the return page and the checkout flow.
#[derive(Clone)]
pub struct BroadcastBus {
    direct: broadcast::Sender<String>,
    storage: SharedStorage,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        let (direct, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { direct, storage: SharedStorage::default() }
    }
}

impl BroadcastBus {
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Post a raw message on the direct channel. Returns false when no context is
    /// listening.
    pub fn post_raw(&self, raw: String) -> bool {
        self.direct.send(raw).is_ok()
    }

    pub fn publish(&self, signal: &CompletionSignal) -> Result<Delivery, serde_json::Error> {
        let raw = encode(signal)?;
        match self.direct.send(raw.clone()) {
            Ok(receivers) => Ok(Delivery::Direct { receivers }),
            Err(_) => {
                debug!(order_id = %signal.order_id, "no direct listener; relaying through storage");
                self.storage.set(RELAY_STORAGE_KEY, raw);
                Ok(Delivery::Relayed)
            }
        }
    }

    pub fn publish_via_storage(&self, signal: &CompletionSignal) -> Result<(), serde_json::Error> {
        self.storage.set(RELAY_STORAGE_KEY, encode(signal)?);
        Ok(())
    }
}

fn encode(signal: &CompletionSignal) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireMessage::PaymentRedirectResult(signal.clone()))
}

fn decode(raw: &str) -> Option<CompletionSignal> {
    match serde_json::from_str::<WireMessage>(raw) {
        Ok(WireMessage::PaymentRedirectResult(signal)) => Some(signal),
        Ok(WireMessage::Other) => {
            debug!("ignoring unrelated broadcast message");
            None
        }
        Err(e) => {
            debug!(error = %e, "ignoring malformed broadcast message");
            None
        }
    }
}

/// Attempt-scoped subscription to both channels. Dropping it unsubscribes.
pub struct CrossTabBroadcastListener {
    direct: broadcast::Receiver<String>,
    relay: broadcast::Receiver<String>,
    storage: SharedStorage,
    token: AttemptToken,
    drained_initial: bool,
    direct_open: bool,
    relay_open: bool,
}

impl CrossTabBroadcastListener {
    pub fn subscribe(bus: &BroadcastBus, token: AttemptToken) -> Self {
        Self {
            direct: bus.direct.subscribe(),
            relay: bus.storage.subscribe(),
            storage: bus.storage.clone(),
            token,
            drained_initial: false,
            direct_open: true,
            relay_open: true,
        }
    }

    /// Next completion signal, or `None` once the attempt is no longer current.
    pub async fn next_signal(&mut self) -> Option<(CompletionSignal, SignalChannel)> {
        if !self.drained_initial {
            self.drained_initial = true;
            if let Some(signal) = self.storage.take(RELAY_STORAGE_KEY).as_deref().and_then(decode) {
                return Some((signal, SignalChannel::Storage));
            }
        }
        loop {
            if !self.token.is_current() {
                return None;
            }
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                msg = self.direct.recv(), if self.direct_open => match msg {
                    Ok(raw) => {
                        if let Some(signal) = decode(&raw) {
                            return Some((signal, SignalChannel::Direct));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "direct channel lagged"),
                    Err(RecvError::Closed) => self.direct_open = false,
                },
                key = self.relay.recv(), if self.relay_open => match key {
                    Ok(key) if key == RELAY_STORAGE_KEY => {
                        if let Some(signal) = self.storage.take(RELAY_STORAGE_KEY).as_deref().and_then(decode) {
                            return Some((signal, SignalChannel::Storage));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if let Some(signal) = self.storage.take(RELAY_STORAGE_KEY).as_deref().and_then(decode) {
                            return Some((signal, SignalChannel::Storage));
                        }
                    }
                    Err(RecvError::Closed) => self.relay_open = false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn signal(code: Option<i64>) -> CompletionSignal {
        CompletionSignal { order_id: "ord-1".into(), request_id: Some("pay-1".into()), result_code: code }
    }

    #[test]
    fn wire_shape_matches_return_page_contract() {
        let raw = encode(&signal(Some(0))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({"type": PAYMENT_REDIRECT_RESULT, "orderId": "ord-1", "requestId": "pay-1", "resultCode": 0})
        );
    }

    #[test]
    fn decode_is_lenient_about_result_code() {
        let s = decode(r#"{"type":"PAYMENT_REDIRECT_RESULT","orderId":"o","resultCode":"0"}"#).unwrap();
        assert_eq!(s.result_code, Some(0));
        let s = decode(r#"{"type":"PAYMENT_REDIRECT_RESULT","orderId":"o","resultCode":"abc"}"#).unwrap();
        assert_eq!(s.result_code, None);
        assert!(decode(r#"{"type":"CART_UPDATED","count":3}"#).is_none());
        assert!(decode("not json").is_none());
    }

    #[tokio::test]
    async fn direct_delivery_and_unrelated_messages() {
        let bus = BroadcastBus::default();
        let registry = AttemptRegistry::new();
        let mut listener = CrossTabBroadcastListener::subscribe(&bus, registry.begin());
        assert!(bus.post_raw(r#"{"type":"CART_UPDATED"}"#.into()));
        assert_eq!(bus.publish(&signal(Some(0))).unwrap(), Delivery::Direct { receivers: 1 });
        let (got, channel) = listener.next_signal().await.unwrap();
        assert_eq!(got, signal(Some(0)));
        assert_eq!(channel, SignalChannel::Direct);
    }

    #[tokio::test]
    async fn relay_is_used_without_listeners_and_cleared_on_read() {
        let bus = BroadcastBus::default();
        assert_eq!(bus.publish(&signal(Some(0))).unwrap(), Delivery::Relayed);
        assert!(bus.storage().get(RELAY_STORAGE_KEY).is_some());

        let registry = AttemptRegistry::new();
        let mut listener = CrossTabBroadcastListener::subscribe(&bus, registry.begin());
        let (got, channel) = listener.next_signal().await.unwrap();
        assert_eq!(got.order_id, "ord-1");
        assert_eq!(channel, SignalChannel::Storage);
        assert!(bus.storage().get(RELAY_STORAGE_KEY).is_none());
    }

    #[tokio::test]
    async fn relay_change_wakes_listener() {
        let bus = BroadcastBus::default();
        let registry = AttemptRegistry::new();
        let mut listener = CrossTabBroadcastListener::subscribe(&bus, registry.begin());
        bus.publish_via_storage(&signal(Some(1006))).unwrap();
        let (got, channel) = listener.next_signal().await.unwrap();
        assert_eq!(got.result_code, Some(1006));
        assert_eq!(channel, SignalChannel::Storage);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_listener_stops() {
        let bus = BroadcastBus::default();
        let registry = AttemptRegistry::new();
        let mut listener = CrossTabBroadcastListener::subscribe(&bus, registry.begin());
        let waiter = tokio::spawn(async move { listener.next_signal().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.begin();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
