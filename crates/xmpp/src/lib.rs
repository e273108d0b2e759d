pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod negotiate;
pub mod stanza;
pub mod transport;

pub use dispatch::{Dispatch, dispatch_stanza};
pub use engine::{AccountCredentials, EngineState, MessageDescriptor, ProtocolEngine, Session};
pub use error::{ConnectionError, StanzaError};
pub use identity::IdentityGenerator;
pub use stanza::{Stanza, StanzaKind, serialize_element};
pub use transport::{ConnectionConfig, WebSocketTransport, XmppTransport};
