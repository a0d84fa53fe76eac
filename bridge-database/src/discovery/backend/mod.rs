use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::info;

use crate::session::mysql::Endpoint;

/// Role a backend plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    ReadWrite,
    ReadOnly,
}

/// Liveness as last observed by a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unknown,
    Up,
    Down,
}

/// One upstream server: its address, role, last observed liveness and the
/// idle authenticated connections parked for reuse.
pub struct Backend {
    pub addr: String,
    pub backend_type: BackendType,
    state: Mutex<BackendState>,
    state_since: Mutex<DateTime<Utc>>,
    connected_clients: AtomicU32,
    pub(crate) pool: Mutex<Vec<Endpoint>>,
}

impl Backend {
    pub fn new(addr: &str, backend_type: BackendType) -> Self {
        Backend {
            addr: addr.to_string(),
            backend_type,
            state: Mutex::new(BackendState::Unknown),
            state_since: Mutex::new(Utc::now()),
            connected_clients: AtomicU32::new(0),
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, new_state: BackendState) {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            info!(
                "backend {} changed state {:?} -> {:?}",
                self.addr, *state, new_state
            );
            *state = new_state;
            *self.state_since.lock().unwrap() = Utc::now();
        }
    }

    pub fn state_since(&self) -> DateTime<Utc> {
        *self.state_since.lock().unwrap()
    }

    /// Sessions currently holding a connection to this backend, pooled idle
    /// connections included.
    pub fn connected_clients(&self) -> u32 {
        self.connected_clients.load(Ordering::SeqCst)
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::SeqCst);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pooled(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Point-in-time view of one backend for the stats surface.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub addr: String,
    pub backend_type: BackendType,
    pub state: BackendState,
    pub connected_clients: u32,
    pub pooled: usize,
}

/// Ordered set of configured backends, shared by every connection.
pub struct BackendRegistry {
    backends: Vec<Backend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            backends: Vec::new(),
        }
    }

    pub fn from_config(read_write: &[String], read_only: &[String]) -> Self {
        let mut registry = BackendRegistry::new();
        for addr in read_write {
            registry.add(addr, BackendType::ReadWrite);
        }
        for addr in read_only {
            registry.add(addr, BackendType::ReadOnly);
        }
        registry
    }

    pub fn add(&mut self, addr: &str, backend_type: BackendType) {
        info!("registered {:?} backend {}", backend_type, addr);
        self.backends.push(Backend::new(addr, backend_type));
    }

    pub fn get(&self, ndx: usize) -> Option<&Backend> {
        self.backends.get(ndx)
    }

    pub fn count(&self) -> usize {
        self.backends.len()
    }

    /// Shortest queue first: the UP (or not yet probed) read-write backend
    /// with the fewest connected clients.
    pub fn pick_rw(&self) -> Option<usize> {
        let mut picked: Option<usize> = None;
        let mut min_connected = u32::MAX;
        for (ndx, backend) in self.backends.iter().enumerate() {
            if backend.state() == BackendState::Down
                || backend.backend_type != BackendType::ReadWrite
            {
                continue;
            }
            if backend.connected_clients() < min_connected {
                min_connected = backend.connected_clients();
                picked = Some(ndx);
            }
        }
        picked
    }

    /// Stats surface for the observability collaborators.
    pub fn stats(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                addr: b.addr.clone(),
                backend_type: b.backend_type,
                state: b.state(),
                connected_clients: b.connected_clients(),
                pooled: b.pooled(),
            })
            .collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
