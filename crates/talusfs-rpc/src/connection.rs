//! Peer identities and the shared connection registry.
//!
//! Connections are shared by every import and export talking to the same
//! peer, so they carry an explicit registry refcount on top of the usual
//! shared ownership. A connection whose count reaches zero is retired to an
//! unused list rather than freed; a later lookup revives it. Releasing a
//! connection below zero is a caller bug and panics.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::import::{ConnEpoch, Import};

/// Network identity of a node: fabric id plus process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    /// Fabric-level node id.
    pub nid: u64,
    /// Process id within the node.
    pub pid: u32,
}

impl PeerId {
    /// Build an id from its parts.
    pub fn new(nid: u64, pid: u32) -> PeerId {
        PeerId { nid, pid }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nid, self.pid)
    }
}

/// A live association with one peer.
pub struct Connection {
    peer: PeerId,
    self_id: PeerId,
    refcount: AtomicI64,
    owner: Mutex<Option<Weak<Import>>>,
}

impl Connection {
    pub(crate) fn new(peer: PeerId, self_id: PeerId) -> Connection {
        Connection {
            peer,
            self_id,
            refcount: AtomicI64::new(1),
            owner: Mutex::new(None),
        }
    }

    /// Remote identity.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Local identity used when talking to this peer.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Current registry refcount.
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Take an additional registry reference.
    pub fn addref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn bind_import(&self, imp: &Arc<Import>) {
        *self.owner.lock().unwrap() = Some(Arc::downgrade(imp));
    }

    fn bound_import(&self) -> Option<Arc<Import>> {
        self.owner.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[derive(Default)]
struct Lists {
    active: Vec<Arc<Connection>>,
    unused: Vec<Arc<Connection>>,
}

/// Registry of connections keyed by peer, with an unused pool.
#[derive(Default)]
pub struct ConnRegistry {
    inner: Mutex<Lists>,
}

impl ConnRegistry {
    /// Empty registry.
    pub fn new() -> ConnRegistry {
        ConnRegistry::default()
    }

    fn lookup_locked(lists: &mut Lists, peer: PeerId) -> Option<Arc<Connection>> {
        if let Some(conn) = lists.active.iter().find(|c| c.peer == peer) {
            conn.addref();
            return Some(Arc::clone(conn));
        }
        if let Some(pos) = lists.unused.iter().position(|c| c.peer == peer) {
            let conn = lists.unused.remove(pos);
            conn.refcount.store(1, Ordering::SeqCst);
            lists.active.push(Arc::clone(&conn));
            debug!(peer = %peer, "revived unused connection");
            return Some(conn);
        }
        None
    }

    /// Find an existing connection to `peer`, reviving an unused one.
    pub fn lookup(&self, peer: PeerId) -> Option<Arc<Connection>> {
        let mut lists = self.inner.lock().unwrap();
        Self::lookup_locked(&mut lists, peer)
    }

    /// Find or create a connection to `peer`.
    pub fn get(&self, peer: PeerId, self_id: PeerId) -> Arc<Connection> {
        {
            let mut lists = self.inner.lock().unwrap();
            if let Some(conn) = Self::lookup_locked(&mut lists, peer) {
                return conn;
            }
        }

        // Allocate outside the lock, then look again before publishing in
        // case we raced another allocator.
        let fresh = Arc::new(Connection::new(peer, self_id));
        let mut lists = self.inner.lock().unwrap();
        if let Some(conn) = Self::lookup_locked(&mut lists, peer) {
            return conn;
        }
        lists.active.push(Arc::clone(&fresh));
        debug!(peer = %peer, "created connection");
        fresh
    }

    /// Release one registry reference. Returns true when this was the last
    /// reference and the connection was retired to the unused pool.
    ///
    /// Panics if the count would go negative.
    pub fn put(&self, conn: &Arc<Connection>) -> bool {
        let remaining = conn.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(
            remaining >= 0,
            "connection {} refcount underflow",
            conn.peer
        );
        if remaining > 0 {
            return false;
        }
        let mut lists = self.inner.lock().unwrap();
        if let Some(pos) = lists.active.iter().position(|c| Arc::ptr_eq(c, conn)) {
            let retired = lists.active.remove(pos);
            lists.unused.push(retired);
            debug!(peer = %conn.peer(), "retired connection to unused pool");
        }
        true
    }

    /// Fail every import bound to an active connection to `peer`.
    ///
    /// Matches the full node+process identity; other processes on the same
    /// node are left alone. Bound imports keep their connection active, so
    /// the unused pool never holds one. Returns the number of imports
    /// failed. The wildcard epoch is used, so imports disconnect regardless
    /// of how many times they have reconnected since.
    pub fn drop_peer(&self, peer: PeerId) -> usize {
        let imports: Vec<Arc<Import>> = {
            let lists = self.inner.lock().unwrap();
            lists
                .active
                .iter()
                .filter(|c| c.peer == peer)
                .filter_map(|c| c.bound_import())
                .collect()
        };
        let mut failed = 0;
        for imp in imports {
            warn!(peer = %peer, "dropping connections: failing bound import");
            if imp.fail(ConnEpoch(0)).is_some() {
                failed += 1;
            }
        }
        failed
    }

    /// Number of connections currently in use.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// Number of retired connections available for revival.
    pub fn unused_count(&self) -> usize {
        self.inner.lock().unwrap().unused.len()
    }
}
