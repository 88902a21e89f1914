use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::{sync::mpsc, time::Instant};

use crate::lantern::proto::{ProtoError, ProtoMessage};

pub const DEFAULT_READER_IDLE: Duration = Duration::from_secs(60 * 5);
pub const DEFAULT_WRITER_IDLE: Duration = Duration::from_secs(60 * 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// No outbound traffic for the writer threshold: send one `Ping`.
    SendPing,
    /// No inbound traffic for the reader threshold: the peer is presumed
    /// dead and the connection must be closed.
    Close,
}

/// Bidirectional idle tracker for one connection.
///
/// The writer threshold should be materially shorter than the reader
/// threshold so pings reliably arrive before the peer gives up on the link.
/// A loop drives this by sleeping until [`IdleMonitor::next_deadline`] and
/// then acting on [`IdleMonitor::poll`]; `on_read`/`on_write` reset the
/// respective timers.
#[derive(Debug)]
pub struct IdleMonitor {
    reader_idle: Duration,
    writer_idle: Duration,
    last_read: Instant,
    last_write: Instant,
}

impl IdleMonitor {
    pub fn new(reader_idle: Duration, writer_idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            reader_idle,
            writer_idle,
            last_read: now,
            last_write: now,
        }
    }

    /// Reader-only monitor; never asks for a ping.
    pub fn reader(reader_idle: Duration) -> Self {
        Self::new(reader_idle, Duration::MAX)
    }

    /// Writer-only monitor; never closes.
    pub fn writer(writer_idle: Duration) -> Self {
        Self::new(Duration::MAX, writer_idle)
    }

    pub fn on_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn on_write(&mut self) {
        self.last_write = Instant::now();
    }

    pub fn next_deadline(&self) -> Instant {
        let read_deadline = deadline(self.last_read, self.reader_idle);
        let write_deadline = deadline(self.last_write, self.writer_idle);
        read_deadline.min(write_deadline)
    }

    pub fn poll(&self, now: Instant) -> Option<IdleEvent> {
        if now >= deadline(self.last_read, self.reader_idle) {
            return Some(IdleEvent::Close);
        }
        if now >= deadline(self.last_write, self.writer_idle) {
            return Some(IdleEvent::SendPing);
        }
        None
    }
}

/// Writer half of a control channel: drains queued frames into the sink
/// and keeps the link warm with a `Ping` whenever the writer threshold
/// elapses with nothing sent. Ends when the queue closes or the sink fails.
pub async fn run_pinged_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ProtoMessage>,
    writer_idle: Duration,
) where
    S: Sink<ProtoMessage, Error = ProtoError> + Unpin,
{
    let mut idle = IdleMonitor::writer(writer_idle);
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if sink.send(msg).await.is_err() {
                    break;
                }
                idle.on_write();
            }
            _ = tokio::time::sleep_until(idle.next_deadline()) => {
                if idle.poll(Instant::now()) == Some(IdleEvent::SendPing) {
                    if sink.send(ProtoMessage::ping()).await.is_err() {
                        break;
                    }
                    idle.on_write();
                }
            }
        }
    }
    let _ = sink.close().await;
}

fn deadline(from: Instant, idle: Duration) -> Instant {
    from.checked_add(idle).unwrap_or_else(far_future)
}

fn far_future() -> Instant {
    // Far enough that a sleep on it never fires.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn writer_idle_pings_once_then_reader_idle_closes() {
        let mut mon = IdleMonitor::new(Duration::from_secs(5), Duration::from_secs(3));

        // Silence for 3s: exactly one ping is due.
        tokio::time::sleep_until(mon.next_deadline()).await;
        assert_eq!(mon.poll(Instant::now()), Some(IdleEvent::SendPing));
        mon.on_write();
        assert_eq!(mon.poll(Instant::now()), None);

        // Still nothing inbound: at the 5s mark the reader gives up.
        tokio::time::sleep_until(mon.next_deadline()).await;
        assert_eq!(mon.poll(Instant::now()), Some(IdleEvent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_resets_both_timers() {
        let mut mon = IdleMonitor::new(Duration::from_secs(5), Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(2)).await;
        mon.on_read();
        mon.on_write();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mon.poll(Instant::now()), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mon.poll(Instant::now()), Some(IdleEvent::SendPing));
    }

    #[tokio::test(start_paused = true)]
    async fn pinged_writer_emits_ping_when_idle() {
        use futures_util::StreamExt;
        use tokio_util::codec::{FramedRead, FramedWrite};

        use crate::lantern::proto::{ProtoCodec, ProtoKind};

        let (ours, theirs) = tokio::io::duplex(1024);
        let sink = FramedWrite::new(ours, ProtoCodec::default());
        let (tx, rx) = mpsc::channel::<ProtoMessage>(4);

        tokio::spawn(run_pinged_writer(sink, rx, Duration::from_secs(3)));

        let mut frames = FramedRead::new(theirs, ProtoCodec::default());
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first.kind, ProtoKind::Ping);

        // Queued traffic resets the timer; the next frame is ours, not a ping.
        tx.send(ProtoMessage::pong()).await.unwrap();
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(second.kind, ProtoKind::Pong);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_only_monitor_never_pings() {
        let mon = IdleMonitor::reader(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(mon.poll(Instant::now()), None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mon.poll(Instant::now()), Some(IdleEvent::Close));
    }
}
