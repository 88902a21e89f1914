use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::lantern::proto::ProtoMessage;
use crate::lantern::server::{
    interceptor::{self, HttpIntercept},
    registry::{Descriptor, Registry},
    tcp::{SESSION_CHANNEL_DEPTH, pump_public_conn},
};

/// Parsed HTTP/1.x request head: request line plus headers, preserving
/// header order for faithful re-serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Byte offset just past the `\r\n\r\n` terminator, if present.
    pub fn find_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    /// Parses a head out of `buf`. `None` means incomplete or malformed;
    /// callers distinguish the two with [`RequestHead::find_end`].
    pub fn parse(buf: &[u8]) -> Option<(RequestHead, usize)> {
        let end = Self::find_end(buf)?;
        let text = std::str::from_utf8(&buf[..end - 4]).ok()?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next()?;
        let mut parts = request_line.split_ascii_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        let version = parts.next()?.to_string();
        if !version.starts_with("HTTP/") {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Some((
            RequestHead {
                method,
                target,
                version,
                headers,
            },
            end,
        ))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every existing occurrence of `name`, then inserts the value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Host header without any port suffix, lowercased for registry lookup.
    pub fn host(&self) -> Option<String> {
        let raw = self.header("host")?.trim();
        let host = raw.split(':').next().unwrap_or(raw).trim();
        if host.is_empty() {
            return None;
        }
        Some(host.to_ascii_lowercase())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Shared HTTP ingress: routes public connections to tunnels by virtual
/// host and then hands them to the same session pump as TCP ingress.
pub async fn run_http_listener(
    registry: Arc<Registry>,
    listener: TcpListener,
    max_header_bytes: usize,
    buffer_size: usize,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "http: ingress listening");
    }

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = listener.accept() => {
                let (stream, peer) = res?;
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        serve_http_conn(registry, stream, max_header_bytes, buffer_size).await
                    {
                        tracing::debug!(peer = %peer, err = %err, "http: connection ended");
                    }
                });
            }
        }
    }

    Ok(())
}

/// Discards `remaining` body bytes of a request that was answered locally,
/// reading past what is already buffered if needed.
async fn drain_request_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut remaining: u64,
) -> anyhow::Result<()> {
    loop {
        let have = std::cmp::min(buf.len() as u64, remaining) as usize;
        buf.advance(have);
        remaining -= have as u64;
        if remaining == 0 {
            return Ok(());
        }
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("http: connection closed mid request body");
        }
    }
}

async fn serve_http_conn(
    registry: Arc<Registry>,
    mut stream: TcpStream,
    max_header_bytes: usize,
    buffer_size: usize,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    // Pre-session phase: parse request heads and run the interceptor until
    // a request is accepted. Challenges (401) and misses (404) are answered
    // here without touching any session state.
    let (descriptor, first_payload) = loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let Some(end) = RequestHead::find_end(&buf) else {
            if buf.len() > max_header_bytes {
                anyhow::bail!("http: request head exceeds {max_header_bytes} bytes");
            }
            continue;
        };

        let Some((mut head, consumed)) = RequestHead::parse(&buf[..end]) else {
            anyhow::bail!("http: malformed request head");
        };

        let Some(host) = head.host() else {
            anyhow::bail!("http: request without Host header");
        };

        let Some(descriptor) = registry.lookup_host(&host) else {
            stream
                .write_all(&interceptor::not_found_response())
                .await?;
            return Ok(());
        };

        match interceptor::intercept_http(&mut head, &descriptor.request) {
            HttpIntercept::Respond(resp) => {
                // Answered directly; the client may retry on the same
                // connection (e.g. with credentials). The rejected request's
                // body must be discarded too, or its bytes would lead the
                // next request head.
                stream.write_all(&resp).await?;
                if head.header("transfer-encoding").is_some() {
                    return Ok(());
                }
                let body_len = head
                    .header("content-length")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(0);
                buf.advance(consumed);
                drain_request_body(&mut stream, &mut buf, body_len).await?;
            }
            HttpIntercept::Forward => {
                let mut payload = head.to_bytes();
                // Body bytes already buffered behind the head travel in the
                // same first frame to preserve order.
                payload.extend_from_slice(&buf[consumed..]);
                break (descriptor, Bytes::from(payload));
            }
        }
    };

    // Session phase: identical to TCP ingress from here on. The session id
    // is allocated once and reused across keep-alive request cycles on
    // this connection.
    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_CHANNEL_DEPTH);
    let session_id = match descriptor.sessions.put(tx) {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(tunnel_id = descriptor.tunnel_id, err = %err, "http: refusing connection");
            return Ok(());
        }
    };

    let tid = descriptor.tunnel_id;
    if descriptor
        .control
        .send(ProtoMessage::remote_connected(tid, session_id))
        .await
        .is_err()
        || descriptor
            .control
            .send(ProtoMessage::transfer(tid, session_id, first_payload))
            .await
            .is_err()
    {
        descriptor.sessions.remove(session_id);
        return Ok(());
    }

    pump_public_conn(stream, descriptor, session_id, rx, buffer_size).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lantern::proto::{ProtoKind, TunnelRequest};
    use crate::lantern::proto::request::BasicAuth;

    async fn spawn_ingress(
        registry: Arc<Registry>,
    ) -> (std::net::SocketAddr, tokio::sync::watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            run_http_listener(registry, listener, 64 * 1024, 4096, stop_rx).await
        });
        (addr, stop_tx)
    }

    fn register_host(
        registry: &Registry,
        request: TunnelRequest,
    ) -> (Arc<Descriptor>, mpsc::Receiver<ProtoMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let vhost = request.vhost.clone();
        let d = Descriptor::new(registry.next_tunnel_id(), request, tx, "test".into());
        registry.register_host(&vhost, d.clone()).unwrap();
        (d, rx)
    }

    #[test]
    fn head_parse_and_reserialize() {
        let raw = b"GET /p?q=1 HTTP/1.1\r\nHost: A.Example.com:8080\r\nX-One: 1\r\n\r\nBODY";
        let (head, consumed) = RequestHead::parse(raw).unwrap();
        assert_eq!(consumed, raw.len() - 4);
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/p?q=1");
        assert_eq!(head.host(), Some("a.example.com".to_string()));

        let bytes = head.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /p?q=1 HTTP/1.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(text.contains("X-One: 1\r\n"));
    }

    #[test]
    fn head_parse_incomplete_and_malformed() {
        assert!(RequestHead::find_end(b"GET / HTTP/1.1\r\nHost: a\r\n").is_none());
        assert!(RequestHead::parse(b"NOT-HTTP\r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn unknown_host_gets_synthetic_not_found() {
        let registry = Arc::new(Registry::new());
        let (addr, _stop) = spawn_ingress(registry).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: nobody.example.com\r\n\r\n")
            .await
            .unwrap();

        let mut resp = Vec::new();
        conn.read_to_end(&mut resp).await.unwrap();
        let resp = String::from_utf8(resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 404 "));
    }

    #[tokio::test]
    async fn accepted_request_becomes_first_transfer_with_session() {
        let registry = Arc::new(Registry::new());
        let mut request = TunnelRequest::http("127.0.0.1", 8080, "app.example.com");
        request.set_headers.insert("X-Fwd".into(), "lantern".into());
        let (descriptor, mut control_rx) = register_host(&registry, request);
        let (addr, _stop) = spawn_ingress(registry).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"POST /submit HTTP/1.1\r\nHost: App.Example.com\r\nContent-Length: 4\r\n\r\nbody")
            .await
            .unwrap();

        let connected = control_rx.recv().await.unwrap();
        assert_eq!(connected.kind, ProtoKind::RemoteConnected);
        let sid = connected.head.unwrap().session_id;
        assert_eq!(descriptor.sessions.len(), 1);

        let first = control_rx.recv().await.unwrap();
        assert_eq!(first.kind, ProtoKind::Transfer);
        assert_eq!(first.head.unwrap().session_id, sid);
        let text = String::from_utf8(first.payload.to_vec()).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("X-Fwd: lantern\r\n"));
        assert!(text.ends_with("\r\n\r\nbody"));
    }

    #[tokio::test]
    async fn basic_auth_challenge_consumes_no_session() {
        let registry = Arc::new(Registry::new());
        let mut request = TunnelRequest::http("127.0.0.1", 8080, "secure.example.com");
        request.basic_auth = Some(BasicAuth {
            realm: "r".into(),
            username: "u".into(),
            password: "p".into(),
        });
        let (descriptor, _control_rx) = register_host(&registry, request);
        let (addr, _stop) = spawn_ingress(registry).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: secure.example.com\r\n\r\n")
            .await
            .unwrap();

        let mut resp = vec![0u8; 1024];
        let n = conn.read(&mut resp).await.unwrap();
        let resp = String::from_utf8_lossy(&resp[..n]).to_string();
        assert!(resp.starts_with("HTTP/1.1 401 "));
        assert!(resp.contains("WWW-Authenticate: Basic realm=\"r\"\r\n"));
        assert!(descriptor.sessions.is_empty());
    }

    #[tokio::test]
    async fn challenged_request_body_is_drained_before_retry() {
        let registry = Arc::new(Registry::new());
        let mut request = TunnelRequest::http("127.0.0.1", 8080, "secure.example.com");
        request.basic_auth = Some(BasicAuth {
            realm: "r".into(),
            username: "u".into(),
            password: "p".into(),
        });
        let (_descriptor, mut control_rx) = register_host(&registry, request);
        let (addr, _stop) = spawn_ingress(registry).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            b"POST /login HTTP/1.1\r\nHost: secure.example.com\r\nContent-Length: 4\r\n\r\nabcd",
        )
        .await
        .unwrap();

        let mut resp = vec![0u8; 1024];
        let n = conn.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 401 "));

        // Retry with credentials on the same connection. The rejected body
        // must not lead the forwarded head.
        conn.write_all(
            b"GET / HTTP/1.1\r\nHost: secure.example.com\r\nAuthorization: Basic dTpw\r\n\r\n",
        )
        .await
        .unwrap();

        let connected = control_rx.recv().await.unwrap();
        assert_eq!(connected.kind, ProtoKind::RemoteConnected);
        let first = control_rx.recv().await.unwrap();
        assert_eq!(first.kind, ProtoKind::Transfer);
        let text = String::from_utf8(first.payload.to_vec()).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!text.contains("abcd"));
    }
}
