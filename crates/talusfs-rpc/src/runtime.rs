//! The runtime context: configuration, identity, xid allocation, the
//! connection registry, and the driver handle.
//!
//! There are no process-wide singletons; everything hangs off one
//! [`RpcRuntime`] value, so two runtimes in one process (as the tests do
//! constantly) never share state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::connection::{ConnRegistry, PeerId};
use crate::import::{Import, ImportConfig, ImportState};
use crate::net::NetDriver;
use crate::request::Request;
use crate::set::RequestSet;
use crate::stats::RpcStats;
use crate::wire;

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Baseline reply deadline per send attempt. Imports with the
    /// server-timeout hint use half of it.
    pub request_timeout: Duration,
    /// How long an unlink may stall before each "still waiting" complaint.
    pub diagnostic_timeout: Duration,
    /// How long a server waits for one bulk transfer to move.
    pub server_bulk_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> RpcConfig {
        RpcConfig {
            request_timeout: Duration::from_secs(60),
            diagnostic_timeout: Duration::from_secs(300),
            server_bulk_timeout: Duration::from_secs(7),
        }
    }
}

/// Owned context every client-side object hangs off.
pub struct RpcRuntime {
    config: RpcConfig,
    self_id: PeerId,
    next_xid: AtomicU64,
    registry: ConnRegistry,
    net: Arc<dyn NetDriver>,
    stats: RpcStats,
}

impl RpcRuntime {
    /// Build a runtime over `net`, identifying as `self_id` on the wire.
    pub fn new(config: RpcConfig, net: Arc<dyn NetDriver>, self_id: PeerId) -> Arc<RpcRuntime> {
        info!(self_id = %self_id, "rpc runtime starting");
        Arc::new(RpcRuntime {
            config,
            self_id,
            next_xid: AtomicU64::new(1),
            registry: ConnRegistry::new(),
            net,
            stats: RpcStats::new(),
        })
    }

    /// Runtime tunables.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Identity stamped as the source of every send.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// The driver the runtime sends through.
    pub fn net(&self) -> &Arc<dyn NetDriver> {
        &self.net
    }

    /// Counter surface.
    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }

    /// Allocate the next transfer id. Strictly increasing for the life of
    /// the runtime.
    pub fn next_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next allocation will return.
    pub fn peek_next_xid(&self) -> u64 {
        self.next_xid.load(Ordering::SeqCst)
    }

    /// Build an import to `peer`: find or create the connection, bind the
    /// import to it, and promote it to FULL ready for requests. The
    /// loopback fabric has no handshake, so binding is establishment.
    pub fn new_import(
        self: &Arc<Self>,
        peer: PeerId,
        request_portal: u32,
        reply_portal: u32,
        config: ImportConfig,
    ) -> Arc<Import> {
        let conn = self.registry.get(peer, self.self_id);
        let imp = Arc::new(Import::new(
            Arc::clone(&conn),
            request_portal,
            reply_portal,
            config,
        ));
        conn.bind_import(&imp);
        imp.set_state(ImportState::Full);
        imp
    }

    /// Build a request against `import` with the given request region
    /// layout, declaring a reply of the given layout.
    pub fn new_request(
        self: &Arc<Self>,
        import: &Arc<Import>,
        version: u32,
        opcode: u32,
        lens: &[usize],
        reply_lens: &[usize],
    ) -> Request {
        let replen = wire::msg_size(reply_lens);
        Request::build(
            Arc::clone(self),
            Arc::clone(import),
            version,
            opcode,
            lens,
            replen,
        )
    }

    /// Fresh empty request set.
    pub fn new_set(&self) -> RequestSet {
        RequestSet::new()
    }

    /// Fail every import with an active connection to `peer`. Returns the
    /// number of imports failed.
    pub fn drop_peer(&self, peer: PeerId) -> usize {
        self.registry.drop_peer(peer)
    }

    /// Deactivate `import` (if needed) and wait for its in-flight
    /// requests to drain, complaining on the baseline-timeout cadence.
    pub async fn invalidate_import(&self, import: &Import) {
        import.invalidate(self.config.request_timeout).await;
    }
}
