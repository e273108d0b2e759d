//! Session negotiation: framed stream open, SASL PLAIN, stream restart,
//! resource bind. Runs over an already-connected transport and leaves the
//! stream ready for stanza traffic.

use base64::{Engine, engine::general_purpose::STANDARD};
use sasl::client::Mechanism;
use sasl::client::mechanisms::Plain;
use sasl::common::{ChannelBinding, Credentials};
use tokio::time::timeout;
use tracing::{debug, trace};
use xmpp_parsers::minidom::{Element, Node};
use xmpp_parsers::ns;

use crate::error::ConnectionError;
use crate::stanza::serialize_element;
use crate::transport::{ConnectionConfig, XmppTransport, connect_timeout};

/// RFC 7395 stream framing namespace.
pub(crate) const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

const BIND_REQUEST_ID: &str = "resource-bind";

/// Drives the whole negotiation sequence under the connect timeout; a
/// server that goes silent mid-negotiation surfaces as
/// [`ConnectionError::Timeout`]. On success the transport carries an
/// authenticated, resource-bound session.
pub async fn establish<T: XmppTransport>(
    transport: &mut T,
    config: &ConnectionConfig,
) -> Result<(), ConnectionError> {
    match timeout(connect_timeout(config), negotiate_session(transport, config)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout),
    }
}

async fn negotiate_session<T: XmppTransport>(
    transport: &mut T,
    config: &ConnectionConfig,
) -> Result<(), ConnectionError> {
    open_stream(transport, &config.host).await?;
    let features = await_features(transport).await?;
    authenticate(transport, config, &features).await?;

    // SASL success resets the stream; open it again before binding.
    open_stream(transport, &config.host).await?;
    let features = await_features(transport).await?;
    if features.get_child("bind", ns::BIND).is_none() {
        return Err(ConnectionError::StreamError(
            "server does not offer resource binding".to_string(),
        ));
    }
    bind_resource(transport, &config.full_jid).await
}

async fn open_stream<T: XmppTransport>(
    transport: &mut T,
    host: &str,
) -> Result<(), ConnectionError> {
    let open = Element::builder("open", NS_FRAMING)
        .attr("to", host)
        .attr("version", "1.0")
        .build();
    send_element(transport, &open).await
}

async fn await_features<T: XmppTransport>(transport: &mut T) -> Result<Element, ConnectionError> {
    loop {
        let element = next_element(transport).await?;
        match element.name() {
            "open" => trace!("Server acknowledged stream open"),
            "features" => return Ok(element),
            "close" => {
                return Err(ConnectionError::StreamError(
                    "server closed the stream during negotiation".to_string(),
                ));
            }
            other => {
                return Err(ConnectionError::StreamError(format!(
                    "unexpected element while waiting for stream features: {other}"
                )));
            }
        }
    }
}

async fn authenticate<T: XmppTransport>(
    transport: &mut T,
    config: &ConnectionConfig,
    features: &Element,
) -> Result<(), ConnectionError> {
    let offered: Vec<String> = features
        .get_child("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|child| child.name() == "mechanism")
                .map(Element::text)
                .collect()
        })
        .unwrap_or_default();

    if !offered.iter().any(|mechanism| mechanism == "PLAIN") {
        return Err(ConnectionError::AuthenticationFailed(format!(
            "server offers no supported SASL mechanism (offered: {})",
            offered.join(", ")
        )));
    }

    // SASL identifies the account by the local part alone.
    let local_part = config
        .full_jid
        .split('@')
        .next()
        .unwrap_or(&config.full_jid);
    let credentials = Credentials::default()
        .with_username(local_part)
        .with_password(config.password.as_str())
        .with_channel_binding(ChannelBinding::Unsupported);
    let mut mechanism = Plain::from_credentials(credentials)
        .map_err(|e| ConnectionError::AuthenticationFailed(format!("SASL setup failed: {e:?}")))?;
    let initial = mechanism.initial();

    let auth = Element::builder("auth", ns::SASL)
        .attr("mechanism", "PLAIN")
        .append(Node::Text(STANDARD.encode(&initial)))
        .build();
    send_element(transport, &auth).await?;

    let reply = next_element(transport).await?;
    match reply.name() {
        "success" => {
            debug!("SASL authentication succeeded");
            Ok(())
        }
        "failure" => Err(map_sasl_failure(&reply)),
        other => Err(ConnectionError::StreamError(format!(
            "unexpected element during SASL negotiation: {other}"
        ))),
    }
}

/// Turns a SASL `<failure/>` into an error carrying the defined
/// condition plus any human-readable text the server attached.
fn map_sasl_failure(failure: &Element) -> ConnectionError {
    let condition = failure
        .children()
        .find(|child| child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let text = failure
        .children()
        .find(|child| child.name() == "text")
        .map(Element::text)
        .unwrap_or_default();

    if text.is_empty() {
        ConnectionError::AuthenticationFailed(condition)
    } else {
        ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
    }
}

async fn bind_resource<T: XmppTransport>(
    transport: &mut T,
    full_jid: &str,
) -> Result<(), ConnectionError> {
    let resource = full_jid
        .split_once('/')
        .map(|(_, resource)| resource)
        .unwrap_or_default();
    let bind = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", BIND_REQUEST_ID)
        .append(
            Element::builder("bind", ns::BIND)
                .append(
                    Element::builder("resource", ns::BIND)
                        .append(Node::Text(resource.to_string()))
                        .build(),
                )
                .build(),
        )
        .build();
    send_element(transport, &bind).await?;

    loop {
        let element = next_element(transport).await?;
        if element.name() != "iq" || element.attr("id") != Some(BIND_REQUEST_ID) {
            trace!("Skipping {} frame while binding", element.name());
            continue;
        }
        if element.attr("type") == Some("result") {
            debug!("Bound resource {resource}");
            return Ok(());
        }
        return Err(ConnectionError::StreamError(
            "invalid response to resource binding".to_string(),
        ));
    }
}

async fn send_element<T: XmppTransport>(
    transport: &mut T,
    element: &Element,
) -> Result<(), ConnectionError> {
    let payload =
        serialize_element(element).map_err(|e| ConnectionError::StreamError(e.to_string()))?;
    transport.send(&payload).await
}

async fn next_element<T: XmppTransport>(transport: &mut T) -> Result<Element, ConnectionError> {
    let raw = transport.recv().await?;
    let text = std::str::from_utf8(&raw).map_err(|e| {
        ConnectionError::StreamError(format!("negotiation frame is not valid UTF-8: {e}"))
    })?;
    text.trim()
        .parse::<Element>()
        .map_err(|e| ConnectionError::StreamError(format!("invalid negotiation frame: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;

    /// Transport with a pre-scripted inbound side; outbound frames are
    /// captured for inspection.
    struct ScriptedTransport {
        inbound: VecDeque<&'static str>,
        sent: Vec<String>,
    }

    impl ScriptedTransport {
        fn new(inbound: &[&'static str]) -> Self {
            Self {
                inbound: inbound.iter().copied().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl XmppTransport for ScriptedTransport {
        async fn connect(_config: &ConnectionConfig) -> Result<Self, ConnectionError> {
            unreachable!("scripted transports are constructed directly")
        }

        async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            self.sent.push(String::from_utf8(data.to_vec()).unwrap());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
            match self.inbound.pop_front() {
                Some(frame) => Ok(frame.as_bytes().to_vec()),
                None => Err(ConnectionError::TransportError(
                    "script exhausted".to_string(),
                )),
            }
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    /// Transport that accepts writes and then never produces a frame.
    struct SilentTransport;

    impl XmppTransport for SilentTransport {
        async fn connect(_config: &ConnectionConfig) -> Result<Self, ConnectionError> {
            unreachable!("silent transports are constructed directly")
        }

        async fn send(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            full_jid: "alice@example.com/node_0.1_Ab12Cd34".to_string(),
            password: "secret".to_string(),
            host: "example.com".to_string(),
            websocket_url: "wss://example.com:443/websocket".to_string(),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn establishes_a_session_end_to_end() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            r#"<success xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#,
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></features>"#,
            r#"<iq xmlns="jabber:client" type="result" id="resource-bind"/>"#,
        ]);

        establish(&mut transport, &test_config()).await.unwrap();

        assert_eq!(transport.sent.len(), 4);

        let open = Element::from_str(&transport.sent[0]).unwrap();
        assert_eq!(open.name(), "open");
        assert_eq!(open.attr("to"), Some("example.com"));
        assert_eq!(open.attr("version"), Some("1.0"));

        let auth = Element::from_str(&transport.sent[1]).unwrap();
        assert_eq!(auth.name(), "auth");
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        // base64 of "\0alice\0secret"
        assert_eq!(auth.text(), "AGFsaWNlAHNlY3JldQ==");

        let reopen = Element::from_str(&transport.sent[2]).unwrap();
        assert_eq!(reopen.name(), "open");

        let bind = Element::from_str(&transport.sent[3]).unwrap();
        assert_eq!(bind.name(), "iq");
        assert_eq!(bind.attr("type"), Some("set"));
        assert_eq!(bind.attr("id"), Some("resource-bind"));
        let resource = bind
            .get_child("bind", ns::BIND)
            .and_then(|b| b.get_child("resource", ns::BIND))
            .unwrap();
        assert_eq!(resource.text(), "node_0.1_Ab12Cd34");
    }

    #[tokio::test]
    async fn reports_sasl_failure_condition() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><not-authorized/><text>bad password</text></failure>"#,
        ]);

        let err = establish(&mut transport, &test_config()).await.unwrap_err();
        let ConnectionError::AuthenticationFailed(message) = err else {
            panic!("expected authentication failure, got: {err:?}");
        };
        assert_eq!(message, "not-authorized: bad password");
    }

    #[tokio::test]
    async fn rejects_server_without_plain() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>SCRAM-SHA-1</mechanism></mechanisms></features>"#,
        ]);

        let err = establish(&mut transport, &test_config()).await.unwrap_err();
        let ConnectionError::AuthenticationFailed(message) = err else {
            panic!("expected authentication failure, got: {err:?}");
        };
        assert!(message.contains("SCRAM-SHA-1"));
        // Nothing past the stream open went out.
        assert_eq!(transport.sent.len(), 1);
    }

    #[tokio::test]
    async fn rejects_stream_without_bind_feature() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            r#"<success xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#,
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"/>"#,
        ]);

        let err = establish(&mut transport, &test_config()).await.unwrap_err();
        let ConnectionError::StreamError(message) = err else {
            panic!("expected stream error, got: {err:?}");
        };
        assert!(message.contains("resource binding"));
    }

    #[tokio::test]
    async fn bind_skips_unrelated_frames() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            r#"<success xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#,
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></features>"#,
            r#"<presence xmlns="jabber:client" from="bob@example.com/phone"/>"#,
            r#"<iq xmlns="jabber:client" type="result" id="resource-bind"/>"#,
        ]);

        establish(&mut transport, &test_config()).await.unwrap();
    }

    #[tokio::test]
    async fn bind_rejection_is_a_stream_error() {
        let mut transport = ScriptedTransport::new(&[
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><mechanisms xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            r#"<success xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#,
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" version="1.0"/>"#,
            r#"<features xmlns="http://etherx.jabber.org/streams"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></features>"#,
            r#"<iq xmlns="jabber:client" type="error" id="resource-bind"/>"#,
        ]);

        let err = establish(&mut transport, &test_config()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::StreamError(_)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let mut transport = SilentTransport;
        let mut config = test_config();
        config.timeout_seconds = 1;

        // Bounded wait so a regression cannot hang the test run.
        let result = timeout(Duration::from_secs(3), establish(&mut transport, &config)).await;
        let err = result
            .expect("negotiation should give up on its own")
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
    }

    #[test]
    fn sasl_failure_without_text_is_just_the_condition() {
        let failure = Element::from_str(
            r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><account-disabled/></failure>"#,
        )
        .unwrap();
        let err = map_sasl_failure(&failure);
        assert_eq!(err.to_string(), "Authentication failed: account-disabled");
    }

    #[test]
    fn sasl_failure_without_condition_is_unknown() {
        let failure =
            Element::from_str(r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"/>"#).unwrap();
        let err = map_sasl_failure(&failure);
        assert_eq!(err.to_string(), "Authentication failed: unknown");
    }
}
