//! The protocol engine: owns the transport, drives sign-in, routes
//! inbound stanzas, and publishes the results on the event bus.

use std::sync::Arc;

use petrel_core::config::{AccountConfig, ServerConfig};
use petrel_core::event::{
    Channel, Conversation, Event, EventBus, EventPayload, EventSource, MessageKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xmpp_parsers::minidom::Element;

use crate::dispatch;
use crate::error::ConnectionError;
use crate::identity::IdentityGenerator;
use crate::stanza::{Stanza, serialize_element};
use crate::transport::{ConnectionConfig, WebSocketTransport, XmppTransport};

/// Engine lifecycle as visible to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No session. Either nothing happened yet or stop completed.
    Idle,
    /// Sign-in is connecting and negotiating.
    Connecting,
    /// A session is established; stanzas flow.
    Online,
    /// The last session ended abnormally. A fresh sign-in may be
    /// attempted; there is no automatic reconnect.
    Error,
}

/// Account identity used to sign in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub jid: String,
    pub password: String,
    /// Companion telephony account, recorded on the session but never
    /// signed in.
    pub telephony_jid: Option<String>,
}

impl From<AccountConfig> for AccountCredentials {
    fn from(account: AccountConfig) -> Self {
        Self {
            jid: account.jid,
            password: account.password,
            telephony_jid: account.telephony_jid,
        }
    }
}

/// Facts about the open session, fixed at sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub jid: String,
    pub full_jid: String,
    pub password: String,
    pub telephony_jid: Option<String>,
    pub websocket_url: String,
}

/// Returned after a chat message goes out; mirrors what went on the
/// wire so callers can render the pending message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDescriptor {
    pub to: String,
    pub kind: MessageKind,
    pub conversation: Conversation,
    pub id: String,
    pub content: String,
}

pub struct ProtocolEngine<T = WebSocketTransport>
where
    T: XmppTransport,
{
    state: EngineState,
    server: ServerConfig,
    identity: IdentityGenerator,
    session: Option<Session>,
    transport: Option<T>,
    event_bus: Arc<dyn EventBus>,
    started: bool,
}

impl<T> ProtocolEngine<T>
where
    T: XmppTransport,
{
    pub fn new(server: ServerConfig, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            state: EngineState::Idle,
            server,
            identity: IdentityGenerator::new(),
            session: None,
            transport: None,
            event_bus,
            started: false,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The session opened by the last successful sign-in. Stays
    /// readable in the error state so callers can see what was open.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Prepares the engine. Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!("Engine ready for {}", self.server.websocket_url());
    }

    /// Opens a session: connect, authenticate, bind, all inside the
    /// transport's `connect`. Credential validation happens before any
    /// network activity. Signing in while a session is open is a no-op.
    pub async fn sign_in(
        &mut self,
        credentials: &AccountCredentials,
    ) -> Result<(), ConnectionError> {
        if matches!(self.state, EngineState::Online) && self.transport.is_some() {
            return Ok(());
        }

        if credentials.jid.trim().is_empty() {
            return Err(ConnectionError::InvalidCredentials(
                "jid must not be empty".to_string(),
            ));
        }
        if credentials.password.is_empty() {
            return Err(ConnectionError::InvalidCredentials(
                "password must not be empty".to_string(),
            ));
        }

        let full_jid = self.identity.full_jid(&credentials.jid);
        let websocket_url = self.server.websocket_url();
        let config = ConnectionConfig {
            full_jid: full_jid.clone(),
            password: credentials.password.clone(),
            host: self.server.host.clone(),
            websocket_url: websocket_url.clone(),
            timeout_seconds: self.server.timeout_seconds,
        };

        self.state = EngineState::Connecting;
        info!("Signing in as {full_jid}");

        match T::connect(&config).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.session = Some(Session {
                    jid: credentials.jid.clone(),
                    full_jid: full_jid.clone(),
                    password: credentials.password.clone(),
                    telephony_jid: credentials.telephony_jid.clone(),
                    websocket_url,
                });
                self.state = EngineState::Online;
                self.emit(EventPayload::ConnectionEstablished { jid: full_jid });
                Ok(())
            }
            Err(error) => {
                self.state = EngineState::Error;
                warn!("Sign-in failed: {error}");
                self.emit(EventPayload::ConnectionFailed {
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Handles one inbound frame: replies go back on the wire before
    /// any event reaches the bus. Returns `Ok(false)` once no session
    /// is open, which is how [`run`](Self::run) terminates.
    pub async fn process_next(&mut self) -> Result<bool, ConnectionError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(false);
        };

        let raw = match transport.recv().await {
            Ok(raw) => raw,
            Err(error) => return Err(self.fail_transport(error)),
        };

        let stanza = match Stanza::parse(&raw) {
            Ok(stanza) => stanza,
            Err(error) => {
                warn!("Dropping malformed frame: {error}");
                return Ok(true);
            }
        };

        let own_full_jid = self
            .session
            .as_ref()
            .map(|session| session.full_jid.clone())
            .unwrap_or_default();
        let dispatch = dispatch::dispatch_stanza(&stanza, &own_full_jid);

        for reply in &dispatch.replies {
            if let Err(error) = self.send_element(reply).await {
                return Err(self.fail_transport(error));
            }
        }
        for event in dispatch.events {
            self.emit(event);
        }
        Ok(true)
    }

    /// Drives the engine until the session ends: cleanly after `stop`,
    /// or with the error that severed the transport.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        while self.process_next().await? {}
        Ok(())
    }

    /// Advertises availability. The server answers by echoing our own
    /// presence back, which surfaces as an own-presence event.
    pub async fn send_initial_presence(&mut self) -> Result<(), ConnectionError> {
        self.require_transport()?;
        self.send_element(&dispatch::build_initial_presence()).await
    }

    /// Sends one peer-to-peer chat message carrying a receipt request.
    pub async fn send_chat_message(
        &mut self,
        to: &str,
        body: &str,
    ) -> Result<MessageDescriptor, ConnectionError> {
        // Check the session first so a rejected send never burns an id.
        self.require_transport()?;
        let full_jid = self
            .session
            .as_ref()
            .map(|session| session.full_jid.clone())
            .unwrap_or_default();
        let id = self.identity.correlation_id();
        let message = dispatch::build_chat_message(&full_jid, to, &id, body);
        self.send_element(&message).await?;
        debug!("Sent chat message {id} to {to}");
        Ok(MessageDescriptor {
            to: to.to_string(),
            kind: MessageKind::Chat,
            conversation: Conversation::P2p,
            id,
            content: body.to_string(),
        })
    }

    /// Asks the server for the contact roster. Entries arrive later on
    /// the stream and surface as a roster event.
    pub async fn request_rosters(&mut self) -> Result<(), ConnectionError> {
        self.require_transport()?;
        let id = self.identity.correlation_id();
        self.send_element(&dispatch::build_roster_query(&id)).await
    }

    /// Ends the session. Close failures are logged and reflected in the
    /// stopped event, never returned; the engine always lands in Idle.
    pub async fn stop(&mut self) {
        let mut success = true;
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                warn!("Transport close failed: {error}");
                success = false;
            }
        }
        self.session = None;
        self.state = EngineState::Idle;
        info!("Engine stopped");
        self.emit(EventPayload::Stopped { success });
    }

    fn require_transport(&mut self) -> Result<&mut T, ConnectionError> {
        self.transport.as_mut().ok_or_else(|| {
            ConnectionError::TransportError("cannot send while no session is open".to_string())
        })
    }

    async fn send_element(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let payload =
            serialize_element(element).map_err(|e| ConnectionError::StreamError(e.to_string()))?;
        self.require_transport()?.send(&payload).await
    }

    fn fail_transport(&mut self, error: ConnectionError) -> ConnectionError {
        self.transport = None;
        self.state = EngineState::Error;
        warn!("Transport failed: {error}");
        self.emit(EventPayload::TransportFailed {
            reason: error.to_string(),
        });
        error
    }

    fn emit(&self, payload: EventPayload) {
        let channel_name = match &payload {
            EventPayload::ConnectionEstablished { .. } => "system.connection.established",
            EventPayload::ConnectionFailed { .. } => "system.connection.error",
            EventPayload::TransportFailed { .. } => "system.transport.error",
            EventPayload::Stopped { .. } => "system.connection.stopped",
            EventPayload::MessageReceived { .. } => "xmpp.message.received",
            EventPayload::ReceiptReceived { .. } => "xmpp.message.receipt",
            EventPayload::OwnPresenceChanged { .. } => "xmpp.presence.own",
            EventPayload::ContactPresenceChanged { .. } => "xmpp.presence.contact",
            EventPayload::RosterReceived { .. } => "xmpp.roster.received",
        };

        let Ok(channel) = Channel::new(channel_name) else {
            warn!("Invalid event channel: {channel_name}");
            return;
        };

        let event = Event::new(channel, EventSource::Xmpp, payload);
        let _ = self.event_bus.publish(event);
    }
}
