use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Routing handle for one public-facing connection. The session entry does
/// not own the socket; dropping the last sender ends the connection's
/// writer task, which closes the socket exactly once.
pub type SessionSender = mpsc::Sender<Bytes>;

#[derive(Debug, Error)]
#[error("session id space exhausted")]
pub struct SessionExhausted;

/// Per-tunnel demultiplexing table: session id -> public connection handle.
///
/// Ids are monotonically increasing and never reused while the tunnel is
/// alive; running out of the u32 space is fatal to the tunnel.
#[derive(Debug, Default)]
pub struct SessionTable {
    next_id: AtomicU32,
    entries: Mutex<HashMap<u32, SessionSender>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the next session id and registers the handle under it.
    /// Once the counter reaches `u32::MAX` it stays there, so an exhausted
    /// table never wraps around and reissues live ids.
    pub fn put(&self, sender: SessionSender) -> Result<u32, SessionExhausted> {
        let id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                (id < u32::MAX).then(|| id + 1)
            })
            .map_err(|_| SessionExhausted)?;
        self.entries
            .lock()
            .expect("session table poisoned")
            .insert(id, sender);
        Ok(id)
    }

    #[cfg(test)]
    fn starting_at(next_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(next_id),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: u32) -> Option<SessionSender> {
        self.entries
            .lock()
            .expect("session table poisoned")
            .get(&id)
            .cloned()
    }

    /// Idempotent: the local close path and the remote-disconnect path may
    /// race on the same id, and the loser must see a plain no-op.
    pub fn remove(&self, id: u32) -> Option<SessionSender> {
        self.entries
            .lock()
            .expect("session table poisoned")
            .remove(&id)
    }

    /// Empties the table, returning every live handle so the caller can
    /// drop them and close the public side of each session.
    pub fn drain(&self) -> Vec<(u32, SessionSender)> {
        self.entries
            .lock()
            .expect("session table poisoned")
            .drain()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
