//! Stanza codec: raw frame payloads to typed stanzas and back.

use std::str::FromStr;

use xmpp_parsers::minidom::Element;

use crate::error::StanzaError;

/// The closed set of stanza kinds the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
    /// RFC 7395 framing close.
    Close,
    /// Anything else; routed to the dispatcher's ignored branch.
    Other,
}

impl StanzaKind {
    fn from_name(name: &str) -> Self {
        match name {
            "iq" => Self::Iq,
            "message" => Self::Message,
            "presence" => Self::Presence,
            "close" => Self::Close,
            _ => Self::Other,
        }
    }
}

/// One parsed stanza: its kind plus the underlying element, with
/// child order and unknown attributes preserved exactly as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Element,
}

impl Stanza {
    /// Parses one frame payload. The payload must be UTF-8, non-empty,
    /// and well-formed XML; anything else is a parse failure for the
    /// caller to log and drop.
    pub fn parse(raw: &[u8]) -> Result<Self, StanzaError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| StanzaError::ParseFailed(format!("frame is not valid UTF-8: {e}")))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(StanzaError::ParseFailed("frame is empty".to_string()));
        }
        let element = Element::from_str(trimmed)
            .map_err(|e| StanzaError::ParseFailed(format!("invalid XML: {e}")))?;
        Ok(Self::from_element(element))
    }

    pub fn from_element(element: Element) -> Self {
        Self {
            kind: StanzaKind::from_name(element.name()),
            element,
        }
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Attribute of the top-level element.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }
}

/// Serializes an element to the UTF-8 bytes of one text frame.
pub fn serialize_element(element: &Element) -> Result<Vec<u8>, StanzaError> {
    let mut payload = Vec::new();
    element
        .write_to(&mut payload)
        .map_err(|e| StanzaError::ParseFailed(format!("failed to serialize element: {e}")))?;
    Ok(payload)
}
