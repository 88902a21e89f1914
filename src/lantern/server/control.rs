use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::codec::Framed;

use crate::lantern::heartbeat::{self, IdleEvent, IdleMonitor};
use crate::lantern::proto::{
    ProtoCodec, ProtoKind, ProtoMessage, Registered, TunnelProto, TunnelRequest,
};
use crate::lantern::server::{
    interceptor::RequestInterceptor,
    registry::{ControlSender, Descriptor, Registry},
    tcp,
};

/// Outbound queue depth of one control connection.
const CONTROL_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct ControlOptions {
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub max_payload_bytes: u32,
    pub buffer_size: usize,
    /// Whether this broker runs a shared HTTP ingress. Without one a
    /// registered vhost would never receive traffic, so HTTP registrations
    /// are refused outright.
    pub http_ingress: bool,
}

/// One tunnel bound by this control connection: its descriptor plus the
/// ingress resources that must be torn down with it.
struct BoundTunnel {
    descriptor: Arc<Descriptor>,
    stop: watch::Sender<bool>,
    listener_task: Option<tokio::task::JoinHandle<()>>,
}

/// Serves one client control connection: registration requests, frame
/// demultiplexing toward public sessions, and heartbeat liveness. All
/// tunnels registered on this connection die with it.
pub(crate) async fn handle_control(
    registry: Arc<Registry>,
    interceptor: Arc<RequestInterceptor>,
    stream: TcpStream,
    peer: SocketAddr,
    opts: ControlOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let framed = Framed::new(stream, ProtoCodec::new(opts.max_payload_bytes));
    let (sink, mut frames) = framed.split();

    let (control_tx, control_rx) = mpsc::channel::<ProtoMessage>(CONTROL_CHANNEL_DEPTH);
    let writer = tokio::spawn(heartbeat::run_pinged_writer(
        sink,
        control_rx,
        opts.writer_idle,
    ));

    let mut tunnels: HashMap<u32, BoundTunnel> = HashMap::new();
    let mut idle = IdleMonitor::reader(opts.reader_idle);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle.next_deadline()) => {
                if idle.poll(Instant::now()) == Some(IdleEvent::Close) {
                    tracing::warn!(peer = %peer, "control: reader idle, presuming peer dead");
                    break;
                }
            }
            frame = frames.next() => {
                let Some(frame) = frame else {
                    tracing::debug!(peer = %peer, "control: connection closed by peer");
                    break;
                };
                let frame = match frame {
                    Ok(f) => f,
                    Err(err) => {
                        tracing::warn!(peer = %peer, err = %err, "control: protocol error");
                        break;
                    }
                };
                idle.on_read();
                if !dispatch_frame(
                    &registry,
                    &interceptor,
                    &control_tx,
                    peer,
                    &opts,
                    &mut tunnels,
                    frame,
                )
                .await
                {
                    break;
                }
            }
        }
    }

    for (_, tunnel) in tunnels.drain() {
        teardown_tunnel(&registry, tunnel).await;
    }
    drop(control_tx);
    let _ = writer.await;
    tracing::info!(peer = %peer, "control: connection torn down");
}

/// Returns false when the frame is a protocol violation that must close
/// the connection.
async fn dispatch_frame(
    registry: &Arc<Registry>,
    interceptor: &RequestInterceptor,
    control_tx: &ControlSender,
    peer: SocketAddr,
    opts: &ControlOptions,
    tunnels: &mut HashMap<u32, BoundTunnel>,
    frame: ProtoMessage,
) -> bool {
    match frame.kind {
        ProtoKind::Ping => {
            let _ = control_tx.send(ProtoMessage::pong()).await;
            true
        }
        ProtoKind::Pong => true,
        ProtoKind::Request => {
            register_tunnel(
                registry,
                interceptor,
                control_tx,
                peer,
                opts,
                tunnels,
                &frame.payload,
            )
            .await;
            true
        }
        ProtoKind::Transfer => {
            let Some(head) = frame.head else { return false };
            if let Some(tunnel) = tunnels.get(&head.tunnel_id) {
                if let Some(session) = tunnel.descriptor.sessions.get(head.session_id) {
                    // Gone sessions are a benign race with eviction.
                    let _ = session.send(frame.payload).await;
                }
            }
            true
        }
        ProtoKind::RemoteDisconnect => {
            let Some(head) = frame.head else { return false };
            if let Some(tunnel) = tunnels.get(&head.tunnel_id) {
                // Dropping the handle closes the public connection.
                tunnel.descriptor.sessions.remove(head.session_id);
            }
            true
        }
        ProtoKind::RemoteConnected | ProtoKind::ResponseOk | ProtoKind::ResponseErr => {
            tracing::warn!(peer = %peer, kind = ?frame.kind, "control: unexpected frame from client");
            false
        }
    }
}

async fn register_tunnel(
    registry: &Arc<Registry>,
    interceptor: &RequestInterceptor,
    control_tx: &ControlSender,
    peer: SocketAddr,
    opts: &ControlOptions,
    tunnels: &mut HashMap<u32, BoundTunnel>,
    payload: &[u8],
) {
    let request = match TunnelRequest::from_payload(payload) {
        Ok(r) => r,
        Err(err) => {
            respond_err(control_tx, &format!("invalid tunnel request: {err}")).await;
            return;
        }
    };

    let resolved = match interceptor.handle(request, registry) {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(peer = %peer, err = %err, "control: registration rejected");
            respond_err(control_tx, &err.to_string()).await;
            return;
        }
    };

    let tunnel_id = registry.next_tunnel_id();
    let descriptor = Descriptor::new(
        tunnel_id,
        resolved.clone(),
        control_tx.clone(),
        peer.to_string(),
    );

    let bound = match resolved.proto {
        TunnelProto::Tcp => {
            bind_tcp_tunnel(registry, descriptor.clone(), opts.buffer_size).await
        }
        TunnelProto::Http | TunnelProto::Https if !opts.http_ingress => {
            Err("http ingress is not enabled on this broker".to_string())
        }
        TunnelProto::Http | TunnelProto::Https => bind_http_tunnel(registry, descriptor.clone()),
    };

    match bound {
        Ok(tunnel) => {
            tunnels.insert(tunnel_id, tunnel);
            let registered = Registered {
                tunnel_id,
                request: resolved,
            };
            match registered.to_payload() {
                Ok(body) => {
                    let _ = control_tx.send(ProtoMessage::response_ok(body)).await;
                    tracing::info!(
                        peer = %peer,
                        tunnel_id,
                        public = %registered.request.public_resource(),
                        "control: tunnel registered"
                    );
                }
                Err(err) => respond_err(control_tx, &err.to_string()).await,
            }
        }
        Err(reason) => {
            tracing::warn!(peer = %peer, reason = %reason, "control: registration failed");
            respond_err(control_tx, &reason).await;
        }
    }
}

async fn bind_tcp_tunnel(
    registry: &Arc<Registry>,
    descriptor: Arc<Descriptor>,
    buffer_size: usize,
) -> Result<BoundTunnel, String> {
    let port = descriptor.request.remote_port;
    registry
        .register_port(port, descriptor.clone())
        .map_err(|e| e.to_string())?;

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(err) => {
            registry.unregister_port(port);
            return Err(format!("bind public port {port}: {err}"));
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let d = descriptor.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = tcp::run_tcp_listener(d, listener, buffer_size, stop_rx).await {
            tracing::warn!(err = %err, "tcp: public listener stopped");
        }
    });

    Ok(BoundTunnel {
        descriptor,
        stop: stop_tx,
        listener_task: Some(task),
    })
}

fn bind_http_tunnel(
    registry: &Arc<Registry>,
    descriptor: Arc<Descriptor>,
) -> Result<BoundTunnel, String> {
    registry
        .register_host(&descriptor.request.vhost, descriptor.clone())
        .map_err(|e| e.to_string())?;
    let (stop_tx, _stop_rx) = watch::channel(false);
    Ok(BoundTunnel {
        descriptor,
        stop: stop_tx,
        listener_task: None,
    })
}

async fn respond_err(control_tx: &ControlSender, reason: &str) {
    let _ = control_tx.send(ProtoMessage::response_err(reason)).await;
}

/// Unregisters the public resource, stops the ingress listener, and drains
/// the session table so every public connection closes.
async fn teardown_tunnel(registry: &Arc<Registry>, tunnel: BoundTunnel) {
    let request = &tunnel.descriptor.request;
    match request.proto {
        TunnelProto::Tcp => {
            registry.unregister_port(request.remote_port);
        }
        TunnelProto::Http | TunnelProto::Https => {
            registry.unregister_host(&request.vhost);
        }
    }

    let _ = tunnel.stop.send(true);
    if let Some(task) = tunnel.listener_task {
        task.abort();
        let _ = task.await;
    }

    let drained = tunnel.descriptor.sessions.drain();
    tracing::info!(
        tunnel_id = tunnel.descriptor.tunnel_id,
        public = %request.public_resource(),
        sessions = drained.len(),
        "control: tunnel unregistered"
    );
    // Dropping the drained handles closes each public connection.
}
