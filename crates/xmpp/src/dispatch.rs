//! Routing for inbound stanzas.
//!
//! [`dispatch_stanza`] is a pure function from one parsed stanza to the
//! replies that must go back on the wire and the events to surface on the
//! bus. Keeping it free of IO makes the whole routing table testable
//! without a server.

use chrono::{DateTime, Utc};
use petrel_core::event::{
    ContactPresence, Conversation, EventPayload, InboundMessage, MessageKind, OwnPresence, Receipt,
    ReceiptEvent, RosterEntry, Subscription,
};
use tracing::{debug, warn};
use xmpp_parsers::minidom::{Element, Node};
use xmpp_parsers::ns;

use crate::stanza::{Stanza, StanzaKind};

pub(crate) const NS_RECEIPTS: &str = "urn:xmpp:receipts";

/// Roster entries whose JID starts with this prefix belong to the
/// telephony gateway and never surface as contacts.
const TELEPHONY_PREFIX: &str = "tel";

/// Marker on outbound receipt acks naming which side produced them.
const RECEIPT_ENTITY: &str = "client";

/// What one stanza asks of us: wire replies first, then bus events.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub replies: Vec<Element>,
    pub events: Vec<EventPayload>,
}

/// Routes one inbound stanza. Replies must be written to the transport
/// before the events are published so the server never observes an
/// acknowledged message we have not yet surfaced.
pub fn dispatch_stanza(stanza: &Stanza, own_full_jid: &str) -> Dispatch {
    match stanza.kind() {
        StanzaKind::Iq => dispatch_iq(stanza),
        StanzaKind::Message => dispatch_message(stanza),
        StanzaKind::Presence => dispatch_presence(stanza, own_full_jid),
        StanzaKind::Close => {
            debug!("Server closed the stream");
            Dispatch::default()
        }
        StanzaKind::Other => {
            debug!("Ignoring unknown stanza: {}", stanza.element().name());
            Dispatch::default()
        }
    }
}

fn dispatch_iq(stanza: &Stanza) -> Dispatch {
    let mut dispatch = Dispatch::default();

    if stanza.element().children().any(|c| c.name() == "ping") {
        dispatch.replies.push(build_ping_result(stanza));
        return dispatch;
    }

    if stanza.attr("type") == Some("result") {
        if let Some(query) = stanza.element().get_child("query", ns::ROSTER) {
            dispatch.events.push(EventPayload::RosterReceived {
                entries: parse_roster_entries(query),
            });
        }
    }

    dispatch
}

/// Ping replies go back in the namespace the request arrived in.
fn build_ping_result(stanza: &Stanza) -> Element {
    Element::builder("iq", stanza.element().ns())
        .attr("to", stanza.attr("from"))
        .attr("id", stanza.attr("id"))
        .attr("type", "result")
        .build()
}

fn parse_roster_entries(query: &Element) -> Vec<RosterEntry> {
    let mut entries = Vec::new();
    for item in query.children().filter(|c| c.name() == "item") {
        let jid = item.attr("jid").unwrap_or_default();
        if jid.starts_with(TELEPHONY_PREFIX) {
            continue;
        }
        let subscription: Subscription = item
            .attr("subscription")
            .unwrap_or_default()
            .parse()
            .unwrap_or(Subscription::None);
        entries.push(RosterEntry {
            jid: jid.to_string(),
            subscription,
            pending: item.attr("ask") == Some("subscribe"),
        });
    }
    entries
}

fn dispatch_message(stanza: &Stanza) -> Dispatch {
    let mut dispatch = Dispatch::default();
    let kind: MessageKind = stanza
        .attr("type")
        .unwrap_or("normal")
        .parse()
        .unwrap_or(MessageKind::Normal);

    if kind != MessageKind::Chat {
        // Receipts can ride on any message type; everything else in a
        // non-chat message is out of scope here.
        for child in stanza.element().children() {
            if child.is("received", NS_RECEIPTS) {
                dispatch.events.push(EventPayload::ReceiptReceived {
                    receipt: receipt_from_child(child),
                });
            }
        }
        return dispatch;
    }

    let from = stanza.attr("from").unwrap_or_default().to_string();
    let mut content = String::new();
    for child in stanza.element().children() {
        match child.name() {
            // Chat states and archive markers carry no payload we surface.
            "active" | "composing" | "archived" | "stanza-id" => {}
            "received" if child.is("received", NS_RECEIPTS) => {
                dispatch.events.push(EventPayload::ReceiptReceived {
                    receipt: receipt_from_child(child),
                });
            }
            "body" => content = child.text(),
            "request" if child.is("request", NS_RECEIPTS) => {
                dispatch
                    .replies
                    .push(build_receipt_ack(stanza, ReceiptEvent::Received));
                dispatch
                    .replies
                    .push(build_receipt_ack(stanza, ReceiptEvent::Read));
                dispatch.events.push(EventPayload::MessageReceived {
                    message: InboundMessage {
                        from: from.clone(),
                        kind: MessageKind::Chat,
                        conversation: Conversation::P2p,
                        content: content.clone(),
                    },
                });
            }
            other => debug!("Ignoring message child: {other}"),
        }
    }

    dispatch
}

fn receipt_from_child(child: &Element) -> Receipt {
    let event: ReceiptEvent = child
        .attr("event")
        .unwrap_or_default()
        .parse()
        .unwrap_or(ReceiptEvent::Received);
    Receipt {
        event,
        entity: child.attr("entity").unwrap_or_default().to_string(),
        id: child.attr("id").unwrap_or_default().to_string(),
    }
}

fn dispatch_presence(stanza: &Stanza, own_full_jid: &str) -> Dispatch {
    let mut dispatch = Dispatch::default();
    let Some(from) = stanza.attr("from") else {
        warn!("Dropping presence without a from attribute");
        return dispatch;
    };

    if from == own_full_jid {
        // The server reflects our own presence back; what it carries is
        // irrelevant, being online is the only state we ever advertise.
        dispatch.events.push(EventPayload::OwnPresenceChanged {
            presence: OwnPresence {
                full_jid: from.to_string(),
                jid: bare_jid(from).to_string(),
                show: "online".to_string(),
            },
        });
        return dispatch;
    }

    let mut priority: i32 = 5;
    let mut show = "online".to_string();
    let mut delay: Option<DateTime<Utc>> = None;
    for child in stanza.element().children() {
        match child.name() {
            "priority" => priority = child.text().trim().parse().unwrap_or(5),
            "show" => {
                let text = child.text();
                let text = text.trim();
                if !text.is_empty() {
                    show = text.to_string();
                }
            }
            "delay" => delay = parse_delay_stamp(child.attr("stamp")),
            other => debug!("Ignoring presence child: {other}"),
        }
    }

    dispatch.events.push(EventPayload::ContactPresenceChanged {
        presence: ContactPresence {
            full_jid: from.to_string(),
            jid: bare_jid(from).to_string(),
            priority,
            show,
            delay,
        },
    });
    dispatch
}

fn parse_delay_stamp(stamp: Option<&str>) -> Option<DateTime<Utc>> {
    let stamp = stamp?;
    match stamp.parse::<DateTime<Utc>>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!("Ignoring unparseable delay stamp {stamp:?}: {e}");
            None
        }
    }
}

fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// The presence sent right after sign-in. Empty, so the server applies
/// its defaults and broadcasts us as available.
pub fn build_initial_presence() -> Element {
    Element::builder("presence", ns::JABBER_CLIENT).build()
}

/// Roster fetch. The caller supplies the correlation id so the result
/// can be matched to the request.
pub fn build_roster_query(id: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "get")
        .attr("id", id)
        .append(Element::builder("query", ns::ROSTER).build())
        .build()
}

/// One outbound chat message carrying a receipt request. Child order is
/// body first, then request, matching what receivers expect to walk.
pub fn build_chat_message(from: &str, to: &str, id: &str, body: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("from", from)
        .attr("to", to)
        .attr("id", id)
        .attr("type", "chat")
        .append(
            Element::builder("body", ns::JABBER_CLIENT)
                .append(Node::Text(body.to_string()))
                .build(),
        )
        .append(Element::builder("request", NS_RECEIPTS).build())
        .build()
}

/// Receipt ack for an inbound message: sender and recipient swapped,
/// the inbound stanza id echoed on the receipt child.
fn build_receipt_ack(stanza: &Stanza, event: ReceiptEvent) -> Element {
    Element::builder("message", stanza.element().ns())
        .attr("to", stanza.attr("from"))
        .attr("from", stanza.attr("to"))
        .attr("type", "chat")
        .append(
            Element::builder("received", NS_RECEIPTS)
                .attr("event", event.as_str())
                .attr("entity", RECEIPT_ENTITY)
                .attr("id", stanza.attr("id"))
                .build(),
        )
        .build()
}
