use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::lantern::net::normalize_bind_addr;
use crate::lantern::proto::codec::DEFAULT_MAX_PAYLOAD_BYTES;

pub mod control;
pub mod http;
pub mod interceptor;
pub mod registry;
pub mod session;
pub mod tcp;

use control::ControlOptions;
use interceptor::{PortAllowList, RequestInterceptor};
use registry::Registry;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address the client control listener binds.
    pub bind_addr: String,
    /// Shared HTTP ingress address; `None` disables HTTP tunnels' ingress.
    pub http_bind_addr: Option<String>,
    pub auth_token: Option<String>,
    pub allow_ports: Option<PortAllowList>,
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub max_payload_bytes: u32,
    pub max_header_bytes: usize,
    pub buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5080".to_string(),
            http_bind_addr: None,
            auth_token: None,
            allow_ports: None,
            reader_idle: crate::lantern::heartbeat::DEFAULT_READER_IDLE,
            writer_idle: crate::lantern::heartbeat::DEFAULT_WRITER_IDLE,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_header_bytes: 64 * 1024,
            buffer_size: 32 * 1024,
        }
    }
}

/// Broker half: accepts client control connections, runs public ingress,
/// and relays between the two.
pub struct Server {
    opts: ServerOptions,
    registry: Arc<Registry>,
    interceptor: Arc<RequestInterceptor>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        let interceptor = Arc::new(RequestInterceptor::new(
            opts.auth_token.clone(),
            opts.allow_ports.clone(),
        ));
        Self {
            opts,
            registry: Arc::new(Registry::new()),
            interceptor,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Binds the configured addresses and runs until the shutdown channel
    /// flips.
    pub async fn listen_and_serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = normalize_bind_addr(&self.opts.bind_addr);
        let listener = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind control listener on {bind_addr}"))?;

        let http_listener = match &self.opts.http_bind_addr {
            Some(addr) => {
                let addr = normalize_bind_addr(addr);
                Some(
                    TcpListener::bind(addr.as_ref())
                        .await
                        .with_context(|| format!("bind http ingress on {addr}"))?,
                )
            }
            None => None,
        };

        self.serve_on(listener, http_listener, shutdown).await
    }

    /// Runs on already-bound listeners. Per-connection tasks are supervised
    /// so a panic in one handler never takes down the accept loop.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        http_listener: Option<TcpListener>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "server: control listener up");
        }

        let mut tasks = JoinSet::new();
        let http_ingress = http_listener.is_some();

        if let Some(http_listener) = http_listener {
            let registry = self.registry.clone();
            let max_header_bytes = self.opts.max_header_bytes;
            let buffer_size = self.opts.buffer_size;
            let stop = shutdown.clone();
            tasks.spawn(async move {
                if let Err(err) =
                    http::run_http_listener(registry, http_listener, max_header_bytes, buffer_size, stop)
                        .await
                {
                    tracing::error!(err = %err, "server: http ingress stopped");
                }
            });
        }

        let control_opts = ControlOptions {
            reader_idle: self.opts.reader_idle,
            writer_idle: self.opts.writer_idle,
            max_payload_bytes: self.opts.max_payload_bytes,
            buffer_size: self.opts.buffer_size,
            http_ingress,
        };

        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(err = %err, "server: accept failed");
                            continue;
                        }
                    };
                    tracing::info!(peer = %peer, "server: client connected");
                    let registry = self.registry.clone();
                    let interceptor = self.interceptor.clone();
                    let opts = control_opts.clone();
                    let conn_shutdown = shutdown.clone();
                    tasks.spawn(control::handle_control(
                        registry,
                        interceptor,
                        stream,
                        peer,
                        opts,
                        conn_shutdown,
                    ));
                }
            }
        }

        tracing::info!("server: shutting down, draining connections");
        tasks.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lantern::client::{Client, ClientError, ClientOptions};
    use crate::lantern::proto::TunnelRequest;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_echo_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr.to_string()
    }

    async fn spawn_http_service(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr.to_string()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    struct Broker {
        control_addr: String,
        http_addr: Option<String>,
        registry: Arc<Registry>,
        shutdown: tokio::sync::watch::Sender<bool>,
    }

    async fn spawn_broker(auth_token: Option<&str>, with_http: bool) -> Broker {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control.local_addr().unwrap().to_string();
        let (http_listener, http_addr) = if with_http {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let a = l.local_addr().unwrap().to_string();
            (Some(l), Some(a))
        } else {
            (None, None)
        };

        let server = Server::new(ServerOptions {
            auth_token: auth_token.map(String::from),
            ..ServerOptions::default()
        });
        let registry = server.registry();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.serve_on(control, http_listener, shutdown_rx));

        Broker {
            control_addr,
            http_addr,
            registry,
            shutdown: shutdown_tx,
        }
    }

    fn client_options(broker: &Broker, tunnels: Vec<TunnelRequest>) -> ClientOptions {
        ClientOptions {
            server_addr: broker.control_addr.clone(),
            tunnels,
            dial_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            ..ClientOptions::default()
        }
    }

    async fn wait_registered(registry: &Registry, tunnels: usize) {
        for _ in 0..100 {
            if registry.snapshot().len() >= tunnels {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("tunnel registration never completed");
    }

    #[tokio::test]
    async fn tcp_tunnel_relays_in_order() {
        let echo_addr = spawn_echo_service().await;
        let (echo_host, echo_port) = echo_addr.rsplit_once(':').unwrap();
        let broker = spawn_broker(Some("tk_e2e"), false).await;

        let remote_port = free_port().await;
        let mut tunnel = TunnelRequest::tcp(echo_host, echo_port.parse().unwrap(), remote_port);
        tunnel.auth_token = "tk_e2e".to_string();

        let (client_stop_tx, client_stop_rx) = watch::channel(false);
        let client = Client::new(client_options(&broker, vec![tunnel])).unwrap();
        tokio::spawn(client.run(client_stop_rx));
        wait_registered(&broker.registry, 1).await;

        let mut public = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
        let chunks = ["alpha ", "beta ", "gamma ", "delta"];
        for chunk in chunks {
            public.write_all(chunk.as_bytes()).await.unwrap();
        }
        let expected: String = chunks.concat();
        let mut echoed = vec![0u8; expected.len()];
        public.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, expected.as_bytes());

        // Closing the public side propagates all the way to the local
        // service and empties the session table.
        drop(public);
        for _ in 0..100 {
            let snap = broker.registry.snapshot();
            if snap[0].sessions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(broker.registry.snapshot()[0].sessions, 0);

        let _ = client_stop_tx.send(true);
        let _ = broker.shutdown.send(true);
    }

    #[tokio::test]
    async fn concurrent_sessions_stay_ordered_and_isolated() {
        let echo_addr = spawn_echo_service().await;
        let (host, port) = echo_addr.rsplit_once(':').unwrap();
        let broker = spawn_broker(None, false).await;

        let remote_port = free_port().await;
        let tunnel = TunnelRequest::tcp(host, port.parse().unwrap(), remote_port);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let client = Client::new(client_options(&broker, vec![tunnel])).unwrap();
        tokio::spawn(client.run(stop_rx));
        wait_registered(&broker.registry, 1).await;

        // Several public connections interleave over the one control
        // channel; each must get exactly its own bytes back, in order.
        let mut workers = Vec::new();
        for i in 0..4u8 {
            workers.push(tokio::spawn(async move {
                let mut conn = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
                let mut sent = Vec::new();
                for round in 0..8u8 {
                    let chunk = format!("conn{i}-msg{round};");
                    conn.write_all(chunk.as_bytes()).await.unwrap();
                    sent.extend_from_slice(chunk.as_bytes());
                    tokio::task::yield_now().await;
                }
                let mut got = vec![0u8; sent.len()];
                conn.read_exact(&mut got).await.unwrap();
                assert_eq!(got, sent);
            }));
        }
        for w in workers {
            w.await.unwrap();
        }

        let _ = broker.shutdown.send(true);
    }

    #[tokio::test]
    async fn http_tunnel_routes_by_host_header() {
        let http_addr = spawn_http_service("hello from behind nat").await;
        let (host, port) = http_addr.rsplit_once(':').unwrap();
        let broker = spawn_broker(None, true).await;

        let tunnel = TunnelRequest::http(host, port.parse().unwrap(), "app.test");
        let (_client_stop_tx, client_stop_rx) = watch::channel(false);
        let client = Client::new(client_options(&broker, vec![tunnel])).unwrap();
        tokio::spawn(client.run(client_stop_rx));
        wait_registered(&broker.registry, 1).await;

        let ingress = broker.http_addr.clone().unwrap();
        let mut conn = TcpStream::connect(&ingress).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: app.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
        assert!(response.contains("hello from behind nat"));

        // Unknown vhost answers locally without touching any tunnel.
        let mut conn = TcpStream::connect(&ingress).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: nobody.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");

        let _ = broker.shutdown.send(true);
    }

    #[tokio::test]
    async fn bad_token_is_rejected_without_retry() {
        let echo_addr = spawn_echo_service().await;
        let (host, port) = echo_addr.rsplit_once(':').unwrap();
        let broker = spawn_broker(Some("tk_right"), false).await;

        let remote_port = free_port().await;
        let mut tunnel = TunnelRequest::tcp(host, port.parse().unwrap(), remote_port);
        tunnel.auth_token = "tk_wrong".to_string();

        let (_stop_tx, stop_rx) = watch::channel(false);
        let client = Client::new(client_options(&broker, vec![tunnel])).unwrap();
        let err = client.run(stop_rx).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)), "got: {err}");
        assert!(broker.registry.snapshot().is_empty());

        let _ = broker.shutdown.send(true);
    }

    #[tokio::test]
    async fn client_disconnect_frees_public_port() {
        let echo_addr = spawn_echo_service().await;
        let (host, port) = echo_addr.rsplit_once(':').unwrap();
        let broker = spawn_broker(None, false).await;

        let remote_port = free_port().await;
        let tunnel = TunnelRequest::tcp(host, port.parse().unwrap(), remote_port);
        let (stop_tx, stop_rx) = watch::channel(false);
        let client = Client::new(client_options(&broker, vec![tunnel])).unwrap();
        tokio::spawn(client.run(stop_rx));
        wait_registered(&broker.registry, 1).await;

        let _ = stop_tx.send(true);
        for _ in 0..100 {
            if broker.registry.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(broker.registry.snapshot().is_empty());
        // The port is reusable immediately after teardown.
        let rebound = TcpListener::bind(("127.0.0.1", remote_port)).await;
        assert!(rebound.is_ok());

        let _ = broker.shutdown.send(true);
    }
}
