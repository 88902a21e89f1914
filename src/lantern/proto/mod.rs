//! Control-channel wire protocol: length-delimited frames multiplexing many
//! sessions over one connection, tagged with a `(tunnel_id, session_id)` head.

pub mod codec;
pub mod request;

pub use codec::{Head, ProtoCodec, ProtoError, ProtoKind, ProtoMessage};
pub use request::{BasicAuth, Registered, RequestError, TunnelProto, TunnelRequest};
