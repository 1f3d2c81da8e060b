//! Network transport: control-message protocol, duplex channel, reconnection.

pub mod channel;
pub mod protocol;
pub mod reconnect;

pub use channel::{
    AudioWireMode, MockConnector, MockTransport, MockTransportProbe, Transport,
    TransportConnector, TransportEvent, WsConnector, WsTransport,
};
pub use protocol::{ClientEvent, ServerEvent};
pub use reconnect::ReconnectPolicy;
