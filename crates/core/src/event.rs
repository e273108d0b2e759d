//! Event bus and event types shared across Petrel crates.
//!
//! Events travel on named channels. A channel name is a dot-separated
//! path of lowercase segments whose first segment is the domain
//! (`system` or `xmpp`). Subscribers register glob patterns over full
//! channel names and receive every published event whose channel
//! matches.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::EventBusError;

/// Domains a channel may belong to. The first segment of every valid
/// channel name is one of these.
const DOMAINS: &[&str] = &["system", "xmpp"];

/// Default capacity of each per-domain broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A validated event channel name such as `xmpp.message.received`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Creates a channel after validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Checks whether a name is a well-formed channel: non-empty,
    /// lowercase alphanumeric segments separated by single dots, and a
    /// known domain as the first segment.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') {
            return false;
        }
        if name.contains("..") {
            return false;
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
        {
            return false;
        }
        name.split('.').next().is_some_and(|d| DOMAINS.contains(&d))
    }

    /// The domain segment of the channel name.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Where an event originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// A named engine or application component.
    System(String),
    /// The XMPP protocol engine.
    Xmpp,
}

/// An event envelope: a payload plus the metadata every event carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Everything the engine can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    // ── Connection lifecycle (system.*) ──────────────────────────────
    /// Session established and resource bound.
    ConnectionEstablished { jid: String },
    /// Sign-in failed; the engine is parked in its error state.
    ConnectionFailed { reason: String },
    /// An established session was severed. There is no automatic
    /// reconnect; callers decide whether to sign in again.
    TransportFailed { reason: String },
    /// The engine stopped. `success` is false only when an open
    /// transport failed its close handshake.
    Stopped { success: bool },

    // ── Protocol events (xmpp.*) ─────────────────────────────────────
    /// An inbound chat message that carried a receipt request.
    MessageReceived { message: InboundMessage },
    /// A delivery or read acknowledgment from a peer.
    ReceiptReceived { receipt: Receipt },
    /// Presence echoed back for this client's own full JID.
    OwnPresenceChanged { presence: OwnPresence },
    /// Presence update for a contact.
    ContactPresenceChanged { presence: ContactPresence },
    /// The contact roster returned by the server.
    RosterReceived { entries: Vec<RosterEntry> },
}

/// An inbound chat message as surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub from: String,
    pub kind: MessageKind,
    pub conversation: Conversation,
    pub content: String,
}

/// A delivery/read receipt (`urn:xmpp:receipts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub event: ReceiptEvent,
    pub entity: String,
    pub id: String,
}

/// Presence reported for this client's own full JID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnPresence {
    pub full_jid: String,
    pub jid: String,
    pub show: String,
}

/// Presence reported for a contact's full JID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPresence {
    pub full_jid: String,
    pub jid: String,
    pub priority: i32,
    pub show: String,
    pub delay: Option<DateTime<Utc>>,
}

/// One roster entry after filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub jid: String,
    pub subscription: Subscription,
    pub pending: bool,
}

/// The `type` attribute of a message stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Groupchat,
    Normal,
    Headline,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Normal => "normal",
            Self::Headline => "headline",
            Self::Error => "error",
        }
    }
}

impl FromStr for MessageKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "chat" => Self::Chat,
            "groupchat" => Self::Groupchat,
            "headline" => Self::Headline,
            "error" => Self::Error,
            _ => Self::Normal,
        })
    }
}

/// The conversation family a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conversation {
    #[serde(rename = "p2p")]
    P2p,
}

impl Conversation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P2p => "p2p",
        }
    }
}

/// The acknowledgment level carried by a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptEvent {
    Received,
    Read,
}

impl ReceiptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Read => "read",
        }
    }
}

impl FromStr for ReceiptEvent {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "read" => Self::Read,
            _ => Self::Received,
        })
    }
}

/// Roster subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
            Self::Remove => "remove",
        }
    }
}

impl FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to" => Self::To,
            "from" => Self::From,
            "both" => Self::Both,
            "remove" => Self::Remove,
            _ => Self::None,
        })
    }
}

/// Publish/subscribe surface handed to components that emit or
/// observe events.
pub trait EventBus: Send + Sync {
    /// Publishes an event. Publishing with no live subscriber is not
    /// an error; events are fire-and-forget.
    fn publish(&self, event: Event) -> Result<(), EventBusError>;

    /// Subscribes to every channel matching a glob pattern.
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Event bus backed by one tokio broadcast channel per domain.
pub struct BroadcastEventBus {
    senders: HashMap<&'static str, broadcast::Sender<Event>>,
}

impl BroadcastEventBus {
    /// Creates a bus whose per-domain channels hold up to `capacity`
    /// undelivered events. A capacity below 1 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let senders = DOMAINS
            .iter()
            .map(|domain| {
                let (tx, _) = broadcast::channel(capacity);
                (*domain, tx)
            })
            .collect();
        Self { senders }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> Vec<(&'static str, broadcast::Receiver<Event>)> {
        let first = pattern.split('.').next().unwrap_or(pattern);
        self.senders
            .iter()
            .filter(|(domain, _)| has_glob_meta(first) || first == **domain)
            .map(|(domain, tx)| (*domain, tx.subscribe()))
            .collect()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .senders
            .get(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;
        trace!(channel = %event.channel, "publishing event");
        // A send error only means nobody is listening right now.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| EventBusError::InvalidPattern(format!("{pattern}: {e}")))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern);
        if receivers.is_empty() {
            return Err(EventBusError::InvalidPattern(format!(
                "{pattern}: unknown domain"
            )));
        }
        let mut subscription = EventSubscription {
            matcher,
            system: None,
            xmpp: None,
        };
        for (domain, rx) in receivers {
            match domain {
                "system" => subscription.system = Some(rx),
                "xmpp" => subscription.xmpp = Some(rx),
                _ => {}
            }
        }
        Ok(subscription)
    }
}

/// A live subscription. Call [`EventSubscription::recv`] to await the
/// next matching event.
#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
}

impl EventSubscription {
    /// Waits for the next event whose channel matches this
    /// subscription's pattern. Events on subscribed domains that do
    /// not match are skipped silently.
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let received = tokio::select! {
                r = Self::recv_from(self.system.as_mut()) => r,
                r = Self::recv_from(self.xmpp.as_mut()) => r,
            };
            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(EventBusError::Lagged(n));
                }
            }
        }
    }

    async fn recv_from(
        receiver: Option<&mut broadcast::Receiver<Event>>,
    ) -> Result<Event, broadcast::error::RecvError> {
        match receiver {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}


#[cfg(test)]
mod event_bus_tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn make_event(channel: &str) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::Xmpp,
            EventPayload::Stopped { success: true },
        )
    }

    async fn recv_one(subscription: &mut EventSubscription) -> Event {
        timeout(Duration::from_millis(100), subscription.recv())
            .await
            .expect("timed out waiting for event")
            .expect("recv failed")
    }

    #[tokio::test]
    async fn delivers_to_domain_subscriber() {
        let bus = BroadcastEventBus::new(16);
        let mut sub = bus.subscribe("system.*").unwrap();
        bus.publish(make_event("system.connection.stopped")).unwrap();
        let event = recv_one(&mut sub).await;
        assert_eq!(event.channel.as_str(), "system.connection.stopped");
    }

    #[tokio::test]
    async fn does_not_deliver_across_domains() {
        let bus = BroadcastEventBus::new(16);
        let mut sub = bus.subscribe("xmpp.*").unwrap();
        bus.publish(make_event("system.connection.stopped")).unwrap();
        let result = timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(result.is_err(), "event from another domain leaked through");
    }

    #[tokio::test]
    async fn glob_first_segment_spans_domains() {
        let bus = BroadcastEventBus::new(16);
        let mut sub = bus.subscribe("*.connection.*").unwrap();
        bus.publish(make_event("system.connection.stopped")).unwrap();
        bus.publish(make_event("xmpp.connection.ignored")).unwrap();
        let first = recv_one(&mut sub).await;
        let second = recv_one(&mut sub).await;
        let mut channels = [first.channel.to_string(), second.channel.to_string()];
        channels.sort();
        assert_eq!(
            channels,
            ["system.connection.stopped", "xmpp.connection.ignored"]
        );
    }

    #[tokio::test]
    async fn skips_non_matching_events_on_subscribed_domain() {
        let bus = BroadcastEventBus::new(16);
        let mut sub = bus.subscribe("xmpp.message.*").unwrap();
        bus.publish(make_event("xmpp.roster.received")).unwrap();
        bus.publish(make_event("xmpp.message.received")).unwrap();
        let event = recv_one(&mut sub).await;
        assert_eq!(event.channel.as_str(), "xmpp.message.received");
    }

    #[tokio::test]
    async fn exact_channel_pattern_matches_only_itself() {
        let bus = BroadcastEventBus::new(16);
        let mut sub = bus.subscribe("xmpp.message.receipt").unwrap();
        bus.publish(make_event("xmpp.message.received")).unwrap();
        bus.publish(make_event("xmpp.message.receipt")).unwrap();
        let event = recv_one(&mut sub).await;
        assert_eq!(event.channel.as_str(), "xmpp.message.receipt");
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = BroadcastEventBus::new(16);
        assert!(bus.publish(make_event("xmpp.message.received")).is_ok());
    }

    #[tokio::test]
    async fn lagged_subscriber_learns_how_much_it_missed() {
        let bus = BroadcastEventBus::new(1);
        let mut sub = bus.subscribe("system.*").unwrap();
        bus.publish(make_event("system.connection.stopped")).unwrap();
        bus.publish(make_event("system.connection.error")).unwrap();
        let err = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap_err();
        let EventBusError::Lagged(missed) = err else {
            panic!("expected Lagged, got: {err}");
        };
        assert_eq!(missed, 1);
        let event = recv_one(&mut sub).await;
        assert_eq!(event.channel.as_str(), "system.connection.error");
    }

    #[tokio::test]
    async fn rejects_bad_glob_pattern() {
        let bus = BroadcastEventBus::new(16);
        let err = bus.subscribe("system.[").unwrap_err();
        assert!(matches!(err, EventBusError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_domain_pattern() {
        let bus = BroadcastEventBus::new(16);
        let err = bus.subscribe("plugin.*").unwrap_err();
        assert!(matches!(err, EventBusError::InvalidPattern(_)));
    }
}
