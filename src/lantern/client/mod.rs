use std::{collections::HashMap, time::Duration};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::{Instant, timeout},
};
use tokio_util::codec::Framed;

use crate::lantern::heartbeat::{self, IdleEvent, IdleMonitor};
use crate::lantern::proto::{
    ProtoCodec, ProtoKind, ProtoMessage, Registered, RequestError, TunnelRequest,
};

pub mod local;

use local::LocalConnManager;

const CLIENT_CHANNEL_DEPTH: usize = 256;
const RETRY_BACKOFF_START: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Reconnect delay: doubles per consecutive failure up to the cap, and
/// drops back to the start once the broker accepts a registration.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: RETRY_BACKOFF_START,
        }
    }

    /// Current delay; escalates the next one.
    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (delay * 2).min(RETRY_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.delay = RETRY_BACKOFF_START;
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid tunnel request: {0}")]
    BadRequest(#[from] RequestError),
    #[error("no tunnels configured")]
    NoTunnels,
    #[error("broker rejected registration: {0}")]
    Rejected(String),
    #[error("connect to broker {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("timed out waiting for registration response")]
    RegistrationTimeout,
}

impl ClientError {
    /// Permanent failures are not worth reconnecting for; the broker will
    /// reject the same registration again.
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            ClientError::Rejected(_) | ClientError::BadRequest(_) | ClientError::NoTunnels
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub tunnels: Vec<TunnelRequest>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub max_payload_bytes: u32,
    pub buffer_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:5080".to_string(),
            tunnels: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            reader_idle: heartbeat::DEFAULT_READER_IDLE,
            writer_idle: heartbeat::DEFAULT_WRITER_IDLE,
            max_payload_bytes: crate::lantern::proto::codec::DEFAULT_MAX_PAYLOAD_BYTES,
            buffer_size: 32 * 1024,
        }
    }
}

/// Tunnel client: keeps one control connection to the broker, registers
/// the configured tunnels, and relays sessions to local services.
pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> Result<Self, ClientError> {
        if opts.tunnels.is_empty() {
            return Err(ClientError::NoTunnels);
        }
        opts.tunnels = opts
            .tunnels
            .into_iter()
            .map(TunnelRequest::normalize)
            .collect::<Result<_, _>>()?;
        Ok(Self { opts })
    }

    /// Runs until shutdown, reconnecting with backoff after transient
    /// failures. Permanent rejections end the run instead of hammering
    /// the broker with doomed registrations.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut backoff = Backoff::new();
        loop {
            match self.run_once(&mut backoff, shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_permanent() => {
                    tracing::error!(err = %err, "client: giving up");
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.next();
                    tracing::warn!(
                        err = %err,
                        retry_in = %humantime::format_duration(delay),
                        "client: connection lost, will retry"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_once(
        &self,
        backoff: &mut Backoff,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let addr = &self.opts.server_addr;
        let stream = timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
            })?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!(%addr, "client: connected to broker");

        let framed = Framed::new(stream, ProtoCodec::new(self.opts.max_payload_bytes));
        let (sink, mut frames) = framed.split();
        let (control_tx, control_rx) = mpsc::channel::<ProtoMessage>(CLIENT_CHANNEL_DEPTH);
        let writer = tokio::spawn(heartbeat::run_pinged_writer(
            sink,
            control_rx,
            self.opts.writer_idle,
        ));

        let result = self
            .serve_connection(&control_tx, &mut frames, &mut shutdown, backoff)
            .await;

        drop(control_tx);
        let _ = writer.await;
        result
    }

    async fn serve_connection<S>(
        &self,
        control_tx: &mpsc::Sender<ProtoMessage>,
        frames: &mut S,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<(), ClientError>
    where
        S: futures_util::Stream<Item = Result<ProtoMessage, crate::lantern::proto::ProtoError>>
            + Unpin,
    {
        let registered = self
            .register_tunnels(control_tx, frames)
            .await?;
        // The broker accepted us; a later outage starts from a short retry
        // again instead of whatever the last streak escalated to.
        backoff.reset();
        for reg in registered.values() {
            tracing::info!(public = %reg.public_resource(), local = %reg.local_resource(), "client: tunnel up");
        }

        let locals = LocalConnManager::new(
            control_tx.clone(),
            self.opts.dial_timeout,
            self.opts.buffer_size,
        );
        let mut idle = IdleMonitor::reader(self.opts.reader_idle);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep_until(idle.next_deadline()) => {
                    if idle.poll(Instant::now()) == Some(IdleEvent::Close) {
                        break Err(ClientError::ConnectionLost("broker went silent".to_string()));
                    }
                }
                frame = frames.next() => {
                    let Some(frame) = frame else {
                        break Err(ClientError::ConnectionLost("broker closed the connection".to_string()));
                    };
                    let frame = match frame {
                        Ok(f) => f,
                        Err(err) => break Err(ClientError::ConnectionLost(err.to_string())),
                    };
                    idle.on_read();
                    self.dispatch_frame(control_tx, &locals, &registered, frame).await;
                }
            }
        };

        locals.evict_all();
        outcome
    }

    async fn dispatch_frame(
        &self,
        control_tx: &mpsc::Sender<ProtoMessage>,
        locals: &std::sync::Arc<LocalConnManager>,
        registered: &HashMap<u32, TunnelRequest>,
        frame: ProtoMessage,
    ) {
        match frame.kind {
            ProtoKind::Ping => {
                let _ = control_tx.send(ProtoMessage::pong()).await;
            }
            ProtoKind::Pong => {}
            ProtoKind::RemoteConnected => {
                if let (Some(head), Some(request)) =
                    (frame.head, frame.head.and_then(|h| registered.get(&h.tunnel_id)))
                {
                    locals.ensure(head.tunnel_id, head.session_id, request.local_resource());
                }
            }
            ProtoKind::Transfer => {
                if let Some(head) = frame.head {
                    if let Some(request) = registered.get(&head.tunnel_id) {
                        locals
                            .forward(
                                head.tunnel_id,
                                head.session_id,
                                request.local_resource(),
                                frame.payload,
                            )
                            .await;
                    }
                }
            }
            ProtoKind::RemoteDisconnect => {
                if let Some(head) = frame.head {
                    locals.evict(head.tunnel_id, head.session_id);
                }
            }
            other => {
                tracing::warn!(kind = ?other, "client: unexpected frame, ignoring");
            }
        }
    }

    /// Registers every configured tunnel in sequence. The broker answers
    /// registration requests in order, so the next Ok/Err frame always
    /// belongs to the oldest outstanding request.
    async fn register_tunnels<S>(
        &self,
        control_tx: &mpsc::Sender<ProtoMessage>,
        frames: &mut S,
    ) -> Result<HashMap<u32, TunnelRequest>, ClientError>
    where
        S: futures_util::Stream<Item = Result<ProtoMessage, crate::lantern::proto::ProtoError>>
            + Unpin,
    {
        let mut registered = HashMap::new();
        for tunnel in &self.opts.tunnels {
            let payload = tunnel.to_payload()?;
            control_tx
                .send(ProtoMessage::request(payload))
                .await
                .map_err(|_| ClientError::ConnectionLost("writer gone".to_string()))?;

            let deadline = Instant::now() + self.opts.request_timeout;
            let reply = loop {
                let frame = timeout(deadline.saturating_duration_since(Instant::now()), frames.next())
                    .await
                    .map_err(|_| ClientError::RegistrationTimeout)?
                    .ok_or_else(|| {
                        ClientError::ConnectionLost("broker closed during registration".to_string())
                    })?
                    .map_err(|err| ClientError::ConnectionLost(err.to_string()))?;
                match frame.kind {
                    ProtoKind::Ping => {
                        let _ = control_tx.send(ProtoMessage::pong()).await;
                    }
                    ProtoKind::Pong => {}
                    _ => break frame,
                }
            };

            match reply.kind {
                ProtoKind::ResponseOk => {
                    let reg = Registered::from_payload(&reply.payload)?;
                    registered.insert(reg.tunnel_id, reg.request);
                }
                ProtoKind::ResponseErr => {
                    let reason = String::from_utf8_lossy(&reply.payload).into_owned();
                    return Err(ClientError::Rejected(reason));
                }
                other => {
                    return Err(ClientError::ConnectionLost(format!(
                        "expected registration response, got {other:?}"
                    )));
                }
            }
        }
        Ok(registered)
    }
}
