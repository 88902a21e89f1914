use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("empty local_addr")]
    EmptyLocalAddr,
    #[error("empty vhost for http(s) tunnel")]
    EmptyVhost,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProto {
    Tcp,
    Http,
    Https,
}

impl std::fmt::Display for TunnelProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelProto::Tcp => write!(f, "tcp"),
            TunnelProto::Http => write!(f, "http"),
            TunnelProto::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    #[serde(default)]
    pub realm: String,
    pub username: String,
    pub password: String,
}

/// Registration parameters for one tunnel; serialized as the JSON payload
/// of a `Request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub proto: TunnelProto,
    pub local_addr: String,
    pub local_port: u16,
    #[serde(default)]
    pub auth_token: String,
    /// TCP only. 0 means "allocate any port from the server's allow-range".
    #[serde(default)]
    pub remote_port: u16,
    /// HTTP(S) only. Matched case-insensitively against the Host header.
    #[serde(default)]
    pub vhost: String,
    /// Headers replaced on the forwarded request (set wins over an existing value).
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    /// Headers appended to the forwarded request.
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl TunnelRequest {
    pub fn tcp(local_addr: &str, local_port: u16, remote_port: u16) -> Self {
        Self {
            proto: TunnelProto::Tcp,
            local_addr: local_addr.to_string(),
            local_port,
            auth_token: String::new(),
            remote_port,
            vhost: String::new(),
            set_headers: BTreeMap::new(),
            add_headers: BTreeMap::new(),
            basic_auth: None,
        }
    }

    pub fn http(local_addr: &str, local_port: u16, vhost: &str) -> Self {
        Self {
            proto: TunnelProto::Http,
            local_addr: local_addr.to_string(),
            local_port,
            auth_token: String::new(),
            remote_port: 0,
            vhost: vhost.to_string(),
            set_headers: BTreeMap::new(),
            add_headers: BTreeMap::new(),
            basic_auth: None,
        }
    }

    /// Trims and lowercases the routable fields and validates the shape for
    /// the declared proto. The auth token is left untouched.
    pub fn normalize(mut self) -> Result<Self, RequestError> {
        self.local_addr = self.local_addr.trim().to_string();
        if self.local_addr.is_empty() {
            return Err(RequestError::EmptyLocalAddr);
        }
        self.vhost = self.vhost.trim().to_ascii_lowercase();
        match self.proto {
            TunnelProto::Tcp => {
                self.vhost.clear();
            }
            TunnelProto::Http | TunnelProto::Https => {
                if self.vhost.is_empty() {
                    return Err(RequestError::EmptyVhost);
                }
                self.remote_port = 0;
            }
        }
        Ok(self)
    }

    /// The public resource this tunnel claims, for logs and snapshots.
    pub fn public_resource(&self) -> String {
        match self.proto {
            TunnelProto::Tcp => format!("tcp:{}", self.remote_port),
            TunnelProto::Http | TunnelProto::Https => {
                format!("{}://{}", self.proto, self.vhost)
            }
        }
    }

    /// The local service this tunnel forwards to, as a dialable address.
    pub fn local_resource(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    pub fn to_payload(&self) -> Result<Bytes, RequestError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RequestError> {
        let req: TunnelRequest = serde_json::from_slice(payload)?;
        req.normalize()
    }
}

/// Body of a `ResponseOk` frame. The response family carries no routing
/// head, so the assigned tunnel id rides in the payload together with the
/// resolved request (auto-allocated port filled in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registered {
    pub tunnel_id: u32,
    pub request: TunnelRequest,
}

impl Registered {
    pub fn to_payload(&self) -> Result<Bytes, RequestError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, RequestError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_keeps_fields() {
        let mut req = TunnelRequest::http("127.0.0.1", 8080, "App.Example.COM");
        req.auth_token = " tok ".into();
        req.set_headers.insert("X-Real-IP".into(), "$remote".into());
        req.basic_auth = Some(BasicAuth {
            realm: "r".into(),
            username: "u".into(),
            password: "p".into(),
        });

        let bytes = req.to_payload().unwrap();
        let got = TunnelRequest::from_payload(&bytes).unwrap();

        assert_eq!(got.vhost, "app.example.com");
        // token is not normalized
        assert_eq!(got.auth_token, " tok ");
        assert_eq!(got.set_headers.get("X-Real-IP").unwrap(), "$remote");
        assert_eq!(got.basic_auth.unwrap().realm, "r");
    }

    #[test]
    fn normalize_rejects_empty_fields() {
        let req = TunnelRequest::tcp("   ", 22, 0);
        assert!(matches!(
            req.normalize(),
            Err(RequestError::EmptyLocalAddr)
        ));

        let req = TunnelRequest::http("127.0.0.1", 80, "  ");
        assert!(matches!(req.normalize(), Err(RequestError::EmptyVhost)));
    }

    #[test]
    fn normalize_clears_cross_proto_fields() {
        let mut req = TunnelRequest::tcp("127.0.0.1", 22, 10022);
        req.vhost = "leftover.example.com".into();
        let req = req.normalize().unwrap();
        assert!(req.vhost.is_empty());

        let mut req = TunnelRequest::http("127.0.0.1", 80, "a.example.com");
        req.remote_port = 9999;
        let req = req.normalize().unwrap();
        assert_eq!(req.remote_port, 0);
    }

    #[test]
    fn registered_roundtrip() {
        let reg = Registered {
            tunnel_id: 42,
            request: TunnelRequest::tcp("127.0.0.1", 22, 20001),
        };
        let got = Registered::from_payload(&reg.to_payload().unwrap()).unwrap();
        assert_eq!(got, reg);
        assert_eq!(got.request.public_resource(), "tcp:20001");
    }
}
