use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::lantern::proto::ProtoMessage;
use crate::lantern::server::registry::Descriptor;

/// Per-session backpressure depth between the control demux and the
/// public socket writer.
pub(crate) const SESSION_CHANNEL_DEPTH: usize = 64;

/// Public-port listener for one TCP tunnel descriptor. Bound by the
/// control handler at registration time so bind failures surface in the
/// registration response.
pub async fn run_tcp_listener(
    descriptor: Arc<Descriptor>,
    listener: TcpListener,
    buffer_size: usize,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(
        tunnel_id = descriptor.tunnel_id,
        public = %descriptor.request.public_resource(),
        "tcp: public listener ready"
    );

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = listener.accept() => {
                let (stream, peer) = res?;
                let descriptor = descriptor.clone();
                tokio::spawn(async move {
                    serve_public_conn(descriptor, stream, buffer_size).await;
                    tracing::debug!(peer = %peer, "tcp: public connection ended");
                });
            }
        }
    }

    Ok(())
}

async fn serve_public_conn(descriptor: Arc<Descriptor>, stream: TcpStream, buffer_size: usize) {
    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_CHANNEL_DEPTH);
    let session_id = match descriptor.sessions.put(tx) {
        Ok(id) => id,
        Err(err) => {
            // Fatal tunnel condition; refuse new sessions.
            tracing::error!(tunnel_id = descriptor.tunnel_id, err = %err, "tcp: refusing connection");
            return;
        }
    };

    let connected = ProtoMessage::remote_connected(descriptor.tunnel_id, session_id);
    if descriptor.control.send(connected).await.is_err() {
        descriptor.sessions.remove(session_id);
        return;
    }

    pump_public_conn(stream, descriptor, session_id, rx, buffer_size).await;
}

/// Shuttles bytes between one public connection and the tunnel's control
/// channel. Inbound chunks become `Transfer` frames; frames demuxed to this
/// session arrive on `rx`. Whichever side observes closure first evicts the
/// session exactly once and notifies the peer.
pub(crate) async fn pump_public_conn(
    stream: TcpStream,
    descriptor: Arc<Descriptor>,
    session_id: u32,
    mut rx: mpsc::Receiver<Bytes>,
    buffer_size: usize,
) {
    let (mut rd, mut wr) = stream.into_split();

    // Writer half: ends when the session entry (the only sender) is gone,
    // which closes the public side exactly once.
    let mut writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        tokio::select! {
            _ = &mut writer => break,
            res = rd.read(&mut buf) => {
                match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = ProtoMessage::transfer(
                            descriptor.tunnel_id,
                            session_id,
                            Bytes::copy_from_slice(&buf[..n]),
                        );
                        if descriptor.control.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if descriptor.sessions.remove(session_id).is_some() {
        let disconnect = ProtoMessage::remote_disconnect(descriptor.tunnel_id, session_id);
        let _ = descriptor.control.send(disconnect).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lantern::proto::{ProtoKind, TunnelRequest};

    async fn descriptor_with_control() -> (Arc<Descriptor>, mpsc::Receiver<ProtoMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let d = Descriptor::new(
            1,
            TunnelRequest::tcp("127.0.0.1", 22, 0),
            tx,
            "test".into(),
        );
        (d, rx)
    }

    #[tokio::test]
    async fn accept_creates_session_and_announces_it() {
        let (descriptor, mut control_rx) = descriptor_with_control().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let d = descriptor.clone();
        tokio::spawn(async move { run_tcp_listener(d, listener, 4096, stop_rx).await });

        let mut public = TcpStream::connect(addr).await.unwrap();

        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.kind, ProtoKind::RemoteConnected);
        let head = msg.head.unwrap();
        assert_eq!(head.tunnel_id, 1);
        assert_eq!(descriptor.sessions.len(), 1);

        // Bytes written publicly come back as Transfer frames for that session.
        public.write_all(b"hello").await.unwrap();
        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.kind, ProtoKind::Transfer);
        assert_eq!(msg.head.unwrap().session_id, head.session_id);
        assert_eq!(&msg.payload[..], b"hello");

        // Public close evicts the session and notifies the control channel.
        drop(public);
        let msg = control_rx.recv().await.unwrap();
        assert_eq!(msg.kind, ProtoKind::RemoteDisconnect);
        assert_eq!(descriptor.sessions.len(), 0);
    }

    #[tokio::test]
    async fn evicting_the_session_closes_the_public_connection() {
        let (descriptor, mut control_rx) = descriptor_with_control().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let d = descriptor.clone();
        tokio::spawn(async move { run_tcp_listener(d, listener, 4096, stop_rx).await });

        let mut public = TcpStream::connect(addr).await.unwrap();
        let msg = control_rx.recv().await.unwrap();
        let session_id = msg.head.unwrap().session_id;

        // Server-side demux delivers bytes to the public socket.
        let sender = descriptor.sessions.get(session_id).unwrap();
        sender.send(Bytes::from_static(b"pong")).await.unwrap();
        let mut out = [0u8; 4];
        public.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"pong");

        // RemoteDisconnect path: removing the entry drops the only sender,
        // which shuts the public socket down.
        drop(sender);
        descriptor.sessions.remove(session_id);
        let n = public.read(&mut out).await.unwrap();
        assert_eq!(n, 0);
    }
}
