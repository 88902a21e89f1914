use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::lantern::proto::{ProtoMessage, TunnelProto, TunnelRequest};
use crate::lantern::server::session::SessionTable;

/// Outbound handle to the control channel a tunnel is bound to.
pub type ControlSender = mpsc::Sender<ProtoMessage>;

/// Server-side record binding a public resource to its tunnel: the
/// validated request, the owning control channel, and the session table
/// this descriptor exclusively owns.
#[derive(Debug)]
pub struct Descriptor {
    pub tunnel_id: u32,
    pub request: TunnelRequest,
    pub control: ControlSender,
    pub sessions: SessionTable,
    /// Remote address of the registering client, for snapshots.
    pub client_addr: String,
}

impl Descriptor {
    pub fn new(
        tunnel_id: u32,
        request: TunnelRequest,
        control: ControlSender,
        client_addr: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            request,
            control,
            sessions: SessionTable::new(),
            client_addr,
        })
    }
}

#[derive(Debug, Error)]
#[error("{0} already bound")]
pub struct AlreadyBound(pub String);

/// Read-only view of one live tunnel, served by the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: u32,
    pub proto: TunnelProto,
    pub public: String,
    pub local: String,
    pub sessions: usize,
    pub client_addr: String,
}

/// Two independent key spaces map a public identifier to its descriptor:
/// TCP tunnels by public port, HTTP(S) tunnels by normalized virtual host.
/// Check-and-insert is a single critical section per key space.
#[derive(Debug, Default)]
pub struct Registry {
    tunnel_id_seq: AtomicU32,
    by_port: Mutex<HashMap<u16, Arc<Descriptor>>>,
    by_host: Mutex<HashMap<String, Arc<Descriptor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tunnel_id_seq: AtomicU32::new(1),
            by_port: Mutex::new(HashMap::new()),
            by_host: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_tunnel_id(&self) -> u32 {
        self.tunnel_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_port(
        &self,
        port: u16,
        descriptor: Arc<Descriptor>,
    ) -> Result<(), AlreadyBound> {
        let mut map = self.by_port.lock().expect("registry poisoned");
        if map.contains_key(&port) {
            return Err(AlreadyBound(format!("tcp port {port}")));
        }
        map.insert(port, descriptor);
        Ok(())
    }

    pub fn lookup_port(&self, port: u16) -> Option<Arc<Descriptor>> {
        self.by_port
            .lock()
            .expect("registry poisoned")
            .get(&port)
            .cloned()
    }

    /// Removal only; the caller closes the control channel and drains the
    /// session table.
    pub fn unregister_port(&self, port: u16) -> Option<Arc<Descriptor>> {
        self.by_port.lock().expect("registry poisoned").remove(&port)
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.by_port
            .lock()
            .expect("registry poisoned")
            .contains_key(&port)
    }

    pub fn register_host(
        &self,
        host: &str,
        descriptor: Arc<Descriptor>,
    ) -> Result<(), AlreadyBound> {
        let key = normalize_host(host);
        let mut map = self.by_host.lock().expect("registry poisoned");
        if map.contains_key(&key) {
            return Err(AlreadyBound(format!("host {key}")));
        }
        map.insert(key, descriptor);
        Ok(())
    }

    pub fn lookup_host(&self, host: &str) -> Option<Arc<Descriptor>> {
        self.by_host
            .lock()
            .expect("registry poisoned")
            .get(&normalize_host(host))
            .cloned()
    }

    pub fn unregister_host(&self, host: &str) -> Option<Arc<Descriptor>> {
        self.by_host
            .lock()
            .expect("registry poisoned")
            .remove(&normalize_host(host))
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut out = Vec::new();
        for d in self.by_port.lock().expect("registry poisoned").values() {
            out.push(snapshot_of(d));
        }
        for d in self.by_host.lock().expect("registry poisoned").values() {
            out.push(snapshot_of(d));
        }
        out.sort_by_key(|s| s.tunnel_id);
        out
    }
}

fn snapshot_of(d: &Arc<Descriptor>) -> TunnelSnapshot {
    TunnelSnapshot {
        tunnel_id: d.tunnel_id,
        proto: d.request.proto,
        public: d.request.public_resource(),
        local: format!("{}:{}", d.request.local_addr, d.request.local_port),
        sessions: d.sessions.len(),
        client_addr: d.client_addr.clone(),
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}
