use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

use crate::lantern::proto::ProtoMessage;
use crate::lantern::server::registry::ControlSender;

const LOCAL_CHANNEL_DEPTH: usize = 64;

/// Client-side connection cache keyed by `(tunnel_id, session_id)`.
///
/// Frames for the same session can race the session's first connect, so
/// lookups go through the map's entry lock: exactly one local connection
/// per session, later frames queue on its channel.
pub struct LocalConnManager {
    conns: DashMap<(u32, u32), mpsc::Sender<Bytes>>,
    control: ControlSender,
    connect_timeout: Duration,
    buffer_size: usize,
}

impl LocalConnManager {
    pub fn new(control: ControlSender, connect_timeout: Duration, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            conns: DashMap::new(),
            control,
            connect_timeout,
            buffer_size,
        })
    }

    /// Opens the local connection for a session if none exists yet.
    pub fn ensure(self: &Arc<Self>, tunnel_id: u32, session_id: u32, local_addr: String) {
        self.conns
            .entry((tunnel_id, session_id))
            .or_insert_with(|| self.spawn_session(tunnel_id, session_id, local_addr));
    }

    /// Queues payload toward the session's local connection, opening it
    /// first when the broker's connect notice was lost or reordered.
    pub async fn forward(
        self: &Arc<Self>,
        tunnel_id: u32,
        session_id: u32,
        local_addr: String,
        payload: Bytes,
    ) {
        let tx = self
            .conns
            .entry((tunnel_id, session_id))
            .or_insert_with(|| self.spawn_session(tunnel_id, session_id, local_addr))
            .clone();
        // A full or closed queue means the session task already died and
        // has notified the broker.
        let _ = tx.send(payload).await;
    }

    /// Drops the session's handle. The pump task sees the closed channel
    /// and winds down without sending a disconnect back.
    pub fn evict(&self, tunnel_id: u32, session_id: u32) {
        self.conns.remove(&(tunnel_id, session_id));
    }

    pub fn evict_all(&self) {
        self.conns.clear();
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    fn spawn_session(
        self: &Arc<Self>,
        tunnel_id: u32,
        session_id: u32,
        local_addr: String,
    ) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(LOCAL_CHANNEL_DEPTH);
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .pump_session(tunnel_id, session_id, local_addr, rx)
                .await;
        });
        tx
    }

    async fn pump_session(
        self: Arc<Self>,
        tunnel_id: u32,
        session_id: u32,
        local_addr: String,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&local_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::warn!(%local_addr, tunnel_id, session_id, err = %err, "local: connect failed");
                self.close_session(tunnel_id, session_id).await;
                return;
            }
            Err(_) => {
                tracing::warn!(%local_addr, tunnel_id, session_id, "local: connect timed out");
                self.close_session(tunnel_id, session_id).await;
                return;
            }
        };
        tracing::debug!(%local_addr, tunnel_id, session_id, "local: session connected");

        let (mut rd, mut wr) = stream.into_split();
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            if wr.write_all(&chunk).await.is_err() {
                                self.close_session(tunnel_id, session_id).await;
                                break;
                            }
                        }
                        // Evicted from the map: the broker side is gone,
                        // nothing to notify.
                        None => break,
                    }
                }
                read = rd.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            self.close_session(tunnel_id, session_id).await;
                            break;
                        }
                        Ok(n) => {
                            let frame = ProtoMessage::transfer(
                                tunnel_id,
                                session_id,
                                Bytes::copy_from_slice(&buf[..n]),
                            );
                            if self.control.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!(tunnel_id, session_id, "local: session closed");
    }

    /// Exactly-once local teardown: whoever removes the map entry sends
    /// the disconnect notice to the broker.
    async fn close_session(&self, tunnel_id: u32, session_id: u32) {
        if self.conns.remove(&(tunnel_id, session_id)).is_some() {
            let _ = self
                .control
                .send(ProtoMessage::remote_disconnect(tunnel_id, session_id))
                .await;
        }
    }
}
