use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::output::ByteSink;

pub type ClientId = u64;

struct ClientConnection {
    id: ClientId,
    stream: Arc<TcpStream>,
    peer: Option<SocketAddr>,
    registered_at: Instant,
}

/// Connected viewers. The count is kept beside the list so it can be read
/// without taking the lock.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<ClientConnection>>,
    count: AtomicU32,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClientConnection>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, stream: TcpStream) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = stream.peer_addr().ok();
        let mut clients = self.lock();
        clients.push(ClientConnection {
            id,
            stream: Arc::new(stream),
            peer,
            registered_at: Instant::now(),
        });
        self.count.store(clients.len() as u32, Ordering::SeqCst);
        drop(clients);
        log::info!("client {} connected from {:?}", id, peer);
        id
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().iter().any(|c| c.id == id)
    }

    /// Closes and forgets the client. Returns `false` if it was already gone,
    /// so every client is counted out exactly once.
    pub fn remove(&self, id: ClientId) -> bool {
        self.remove_all(&[id]) == 1
    }

    fn remove_all(&self, ids: &[ClientId]) -> usize {
        let mut removed = Vec::new();
        {
            let mut clients = self.lock();
            clients.retain_mut(|c| {
                if ids.contains(&c.id) {
                    let _ = c.stream.shutdown(Shutdown::Both);
                    removed.push((c.id, c.peer, c.registered_at));
                    false
                } else {
                    true
                }
            });
            self.count.store(clients.len() as u32, Ordering::SeqCst);
        }
        for (id, peer, registered_at) in &removed {
            log::info!(
                "client {} ({:?}) disconnected after {:?}",
                id,
                peer,
                registered_at.elapsed()
            );
        }
        removed.len()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Writes `buf` to every client. Clients whose write fails are removed
    /// once the pass is over; returns how many were removed.
    pub fn broadcast(&self, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let snapshot: Vec<(ClientId, Arc<TcpStream>)> = {
            let clients = self.lock();
            clients.iter().map(|c| (c.id, Arc::clone(&c.stream))).collect()
        };
        if snapshot.is_empty() {
            return 0;
        }

        let mut failed = Vec::new();
        for (id, stream) in snapshot {
            if let Err(e) = (&*stream).write_all(buf) {
                log::debug!("write to client {} failed: {}", id, e);
                failed.push(id);
            }
        }
        if failed.is_empty() {
            return 0;
        }
        self.remove_all(&failed)
    }

    /// Closes every client, used on stop.
    pub fn close_all(&self) {
        let ids: Vec<ClientId> = self.lock().iter().map(|c| c.id).collect();
        if !ids.is_empty() {
            self.remove_all(&ids);
        }
    }
}

/// Byte sink that fans muxed output out to every registered client.
pub struct FanOut {
    registry: Arc<ClientRegistry>,
}

impl FanOut {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }
}

impl ByteSink for FanOut {
    fn write_bytes(&mut self, buf: &[u8]) {
        self.registry.broadcast(buf);
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
