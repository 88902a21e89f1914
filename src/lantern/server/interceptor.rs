use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::lantern::proto::{TunnelProto, TunnelRequest};
use crate::lantern::server::http::RequestHead;
use crate::lantern::server::registry::Registry;

#[derive(Debug, Error)]
pub enum InterceptError {
    /// Fatal to the registration attempt only; the control connection may
    /// keep serving other tunnels.
    #[error("bad auth token")]
    BadAuthToken,
    #[error("remote port {0} not in the allowed range")]
    PortNotAllowed(u16),
    #[error("no free port left in the allowed range")]
    PortsExhausted,
}

#[derive(Debug, Error)]
#[error("invalid port range: {0:?}")]
pub struct PortRangeError(String);

/// One inclusive port span, parsed from `"20000-20010"` or a bare `"20000"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, PortRangeError> {
        let s = s.trim();
        let bad = || PortRangeError(s.to_string());
        let (lo, hi) = match s.split_once('-') {
            Some((a, b)) => (
                a.trim().parse::<u16>().map_err(|_| bad())?,
                b.trim().parse::<u16>().map_err(|_| bad())?,
            ),
            None => {
                let p = s.parse::<u16>().map_err(|_| bad())?;
                (p, p)
            }
        };
        if lo == 0 || lo > hi {
            return Err(bad());
        }
        Ok(PortRange { lo, hi })
    }
}

/// Comma-separated list of [`PortRange`]s, e.g. `"1024-2000,10000-20000"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllowList(Vec<PortRange>);

impl PortAllowList {
    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|r| r.contains(port))
    }

    pub fn iter_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().flat_map(|r| r.lo..=r.hi)
    }
}

impl FromStr for PortAllowList {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, PortRangeError> {
        let mut ranges = Vec::new();
        for part in s.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            ranges.push(part.parse::<PortRange>()?);
        }
        if ranges.is_empty() {
            return Err(PortRangeError(s.to_string()));
        }
        Ok(PortAllowList(ranges))
    }
}

/// Gates tunnel registration: auth-token check plus public-port policy.
/// Returns the resolved request that the registry then binds.
#[derive(Debug, Default)]
pub struct RequestInterceptor {
    auth_token: Option<String>,
    allow_ports: Option<PortAllowList>,
}

// Fallback span when no allow-range is configured: everything non-privileged.
const ANY_PORT_RANGE: PortRange = PortRange { lo: 1024, hi: 65535 };

impl RequestInterceptor {
    pub fn new(auth_token: Option<String>, allow_ports: Option<PortAllowList>) -> Self {
        Self {
            auth_token,
            allow_ports,
        }
    }

    pub fn handle(
        &self,
        mut request: TunnelRequest,
        registry: &Registry,
    ) -> Result<TunnelRequest, InterceptError> {
        if let Some(token) = &self.auth_token {
            if request.auth_token != *token {
                return Err(InterceptError::BadAuthToken);
            }
        }

        if request.proto == TunnelProto::Tcp {
            if request.remote_port == 0 {
                request.remote_port = self
                    .allocate_port(registry)
                    .ok_or(InterceptError::PortsExhausted)?;
            } else if let Some(allow) = &self.allow_ports {
                if !allow.contains(request.remote_port) {
                    return Err(InterceptError::PortNotAllowed(request.remote_port));
                }
            }
        }

        Ok(request)
    }

    /// Lowest port in the allow-range with no live descriptor bound to it.
    /// Whether the OS will actually let us bind it is decided by the bind
    /// that immediately follows registration.
    fn allocate_port(&self, registry: &Registry) -> Option<u16> {
        match &self.allow_ports {
            Some(allow) => allow.iter_ports().find(|p| !registry.is_port_bound(*p)),
            None => (ANY_PORT_RANGE.lo..=ANY_PORT_RANGE.hi).find(|p| !registry.is_port_bound(*p)),
        }
    }
}

/// Outcome of the per-request HTTP hook.
#[derive(Debug, PartialEq, Eq)]
pub enum HttpIntercept {
    /// Rewrites applied; forward the (possibly modified) request.
    Forward,
    /// Answer the public side directly and do not consume a session.
    Respond(Vec<u8>),
}

/// Applies the tunnel's declared header rewrites and, when enabled, the
/// basic-auth challenge. Runs strictly before any session bookkeeping.
pub fn intercept_http(head: &mut RequestHead, tunnel: &TunnelRequest) -> HttpIntercept {
    if let Some(auth) = &tunnel.basic_auth {
        let authorized = head
            .header("authorization")
            .map(|v| check_basic_auth(v, &auth.username, &auth.password))
            .unwrap_or(false);
        if !authorized {
            return HttpIntercept::Respond(unauthorized_response(&auth.realm));
        }
    }

    for (name, value) in &tunnel.set_headers {
        head.set_header(name, value);
    }
    for (name, value) in &tunnel.add_headers {
        head.add_header(name, value);
    }
    HttpIntercept::Forward
}

fn check_basic_auth(header_value: &str, username: &str, password: &str) -> bool {
    let Some(encoded) = header_value.trim().strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == username && p == password,
        None => false,
    }
}

fn unauthorized_response(realm: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 401 Unauthorized\r\n\
         WWW-Authenticate: Basic realm=\"{realm}\"\r\n\
         Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

pub fn not_found_response() -> Vec<u8> {
    let body = "tunnel not found\n";
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
