//! Bulk transfer descriptors.
//!
//! Large payloads never ride inside message regions. The passive side
//! (always the client) exposes memory tagged with the request xid; the
//! active side (always the server) moves the data with a put or a get
//! once it has seen the request. Completion flows through the same
//! flags-then-wake protocol requests use.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use crate::connection::PeerId;
use crate::error::Result;
use crate::net::{BulkSink, NetDriver, NetHandle};
use crate::request::ReqShared;

/// Direction and side of a bulk transfer. The active (server) side moves
/// the data; the passive (client) side only exposes memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRole {
    /// Server pushes and this side holds the data. Server role.
    PutSource,
    /// Server pushes and this side receives. Client role.
    PutSink,
    /// Server pulls and this side holds the data. Client role.
    GetSource,
    /// Server pulls and this side receives. Server role.
    GetSink,
}

impl BulkRole {
    /// True for the passive roles a request may carry.
    pub fn is_client(self) -> bool {
        matches!(self, BulkRole::PutSink | BulkRole::GetSource)
    }

    /// True for the active roles an export may carry.
    pub fn is_server(self) -> bool {
        !self.is_client()
    }
}

/// Memory attached to a bulk transfer.
#[derive(Debug, Clone)]
pub enum BulkIo {
    /// Data the peer will take, fragment by fragment.
    Source(Vec<Bytes>),
    /// Capacity for data the peer will deliver, one length per fragment.
    Sink(Vec<usize>),
}

impl BulkIo {
    /// Total number of bytes the transfer covers.
    pub fn nob(&self) -> usize {
        match self {
            BulkIo::Source(frags) => frags.iter().map(Bytes::len).sum(),
            BulkIo::Sink(lens) => lens.iter().sum(),
        }
    }

    /// Fragment count.
    pub fn fragments(&self) -> usize {
        match self {
            BulkIo::Source(frags) => frags.len(),
            BulkIo::Sink(lens) => lens.len(),
        }
    }
}

struct BulkState {
    active: bool,
    registered: bool,
    success: bool,
    last_xid: u64,
    nob_transferred: usize,
    received: Option<Vec<Bytes>>,
}

enum WakePath {
    /// Client descriptors wake through their owning request.
    Request(Arc<ReqShared>),
    /// Server descriptors carry their own channel.
    Own(mpsc::UnboundedSender<()>),
}

/// Descriptor state shared with network completions.
pub(crate) struct BulkShared {
    state: Mutex<BulkState>,
    wake: WakePath,
}

impl BulkShared {
    fn new(wake: WakePath) -> BulkShared {
        BulkShared {
            state: Mutex::new(BulkState {
                active: false,
                registered: false,
                success: false,
                last_xid: 0,
                nob_transferred: 0,
                received: None,
            }),
            wake,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BulkState> {
        self.state.lock().unwrap()
    }

    /// The transfer settled. `Some` reports success with the byte count
    /// and, for receiving roles, the delivered fragments; `None` reports
    /// failure or withdrawal.
    pub(crate) fn complete(&self, outcome: Option<(Option<Vec<Bytes>>, usize)>) {
        let mut st = self.lock();
        if let Some((data, nob)) = outcome {
            st.success = true;
            st.nob_transferred = nob;
            if let Some(data) = data {
                st.received = Some(data);
            }
        }
        st.active = false;
        drop(st);
        match &self.wake {
            WakePath::Request(req) => req.wake(),
            WakePath::Own(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

/// One bulk transfer, client or server side.
pub struct BulkDesc {
    shared: Arc<BulkShared>,
    rx: Option<mpsc::UnboundedReceiver<()>>,
    role: BulkRole,
    portal: u32,
    io: BulkIo,
    nob: usize,
    xid: u64,
    peer: Option<PeerId>,
    handle: Option<NetHandle>,
}

impl BulkDesc {
    /// Client-side descriptor, woken through the owning request.
    pub(crate) fn for_request(
        role: BulkRole,
        portal: u32,
        io: BulkIo,
        req: Arc<ReqShared>,
    ) -> BulkDesc {
        assert!(role.is_client());
        let nob = io.nob();
        BulkDesc {
            shared: Arc::new(BulkShared::new(WakePath::Request(req))),
            rx: None,
            role,
            portal,
            io,
            nob,
            xid: 0,
            peer: None,
            handle: None,
        }
    }

    /// Server-side descriptor for a transfer with `peer`, matched on the
    /// originating request's `xid`.
    pub(crate) fn for_export(
        role: BulkRole,
        portal: u32,
        io: BulkIo,
        peer: PeerId,
        xid: u64,
    ) -> BulkDesc {
        assert!(role.is_server());
        let (tx, rx) = mpsc::unbounded_channel();
        let nob = io.nob();
        BulkDesc {
            shared: Arc::new(BulkShared::new(WakePath::Own(tx))),
            rx: Some(rx),
            role,
            portal,
            io,
            nob,
            xid,
            peer: Some(peer),
            handle: None,
        }
    }

    /// Role of this side.
    pub fn role(&self) -> BulkRole {
        self.role
    }

    /// Bulk portal the transfer matches on.
    pub fn portal(&self) -> u32 {
        self.portal
    }

    /// Total bytes the descriptor covers.
    pub fn nob(&self) -> usize {
        self.nob
    }

    /// True while the network holds the descriptor's memory.
    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// True once the transfer completed in full.
    pub fn is_success(&self) -> bool {
        self.shared.lock().success
    }

    /// Bytes actually moved.
    pub fn nob_transferred(&self) -> usize {
        self.shared.lock().nob_transferred
    }

    /// Fragments delivered to a sink-side descriptor.
    pub fn take_received(&mut self) -> Option<Vec<Bytes>> {
        self.shared.lock().received.take()
    }

    pub(crate) fn take_handle(&mut self) -> Option<NetHandle> {
        self.handle.take()
    }

    /// Expose the descriptor's memory for the peer, tagged with `xid`.
    /// Client side only; the peer drives the actual transfer.
    pub(crate) async fn register(
        &mut self,
        net: &dyn NetDriver,
        self_id: PeerId,
        peer: PeerId,
        xid: u64,
    ) -> Result<()> {
        assert!(self.role.is_client());
        assert!(self.nob > 0, "empty bulk descriptor");
        {
            let mut st = self.shared.lock();
            assert!(!st.active, "bulk still engaged");
            // A retransmit must carry a fresh xid or a late transfer
            // matching the old one could land in the re-exposed memory.
            assert!(
                !st.registered || xid != st.last_xid,
                "re-registering bulk without fresh xid"
            );
            st.registered = true;
            st.last_xid = xid;
            st.success = false;
            st.nob_transferred = 0;
            st.received = None;
            st.active = true;
        }
        self.xid = xid;
        self.peer = Some(peer);
        debug!(xid, nob = self.nob, role = ?self.role, "registering bulk");
        let sink = BulkSink::new(Arc::clone(&self.shared));
        match net
            .attach_bulk(self_id, peer, self.portal, xid, self.io.clone(), sink)
            .await
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Nothing could have matched yet; the settled sink has
                // already cleared the active flag.
                warn!(xid, error = %e, "bulk attach failed");
                Err(e)
            }
        }
    }

    /// Start moving data against the peer's exposed memory. Server side
    /// only. Errors surface through the completion state, never here.
    pub(crate) async fn start(&mut self, net: &dyn NetDriver, self_id: PeerId) {
        assert!(self.role.is_server());
        let peer = self.peer.expect("server descriptor carries its peer");
        {
            let mut st = self.shared.lock();
            assert!(!st.active, "bulk already engaged");
            st.success = false;
            st.nob_transferred = 0;
            st.received = None;
            st.active = true;
        }
        debug!(xid = self.xid, nob = self.nob, role = ?self.role, "starting bulk transfer");
        let sink = BulkSink::new(Arc::clone(&self.shared));
        match net
            .start_bulk(self_id, peer, self.portal, self.xid, self.io.clone(), sink)
            .await
        {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                // The waiter sees an inactive, unsuccessful descriptor.
                warn!(xid = self.xid, error = %e, "bulk start failed");
            }
        }
    }

    /// Wait until the transfer settles, `limit` passes, or `fail_early`
    /// reports true. Returns false when the limit ran out. Server side.
    pub(crate) async fn wait_settled<F: Fn() -> bool>(&mut self, limit: Duration, fail_early: F) -> bool {
        let shared = Arc::clone(&self.shared);
        let rx = self.rx.as_mut().expect("client descriptors settle through their request");
        let settled = time::timeout(limit, async {
            loop {
                if !shared.lock().active || fail_early() {
                    return;
                }
                let _ = rx.recv().await;
            }
        })
        .await;
        settled.is_ok()
    }

    /// Cancel an in-flight server transfer and wait out the completion.
    /// Idempotent.
    pub(crate) async fn abort(&mut self, net: &dyn NetDriver, diagnostic: Duration) {
        if !self.is_active() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            net.unlink(handle).await;
        }
        let shared = Arc::clone(&self.shared);
        let rx = self.rx.as_mut().expect("client descriptors settle through their request");
        loop {
            if !shared.lock().active {
                return;
            }
            match time::timeout(diagnostic, rx.recv()).await {
                Ok(_) => {}
                Err(_) => warn!(xid = self.xid, "unexpectedly long bulk abort"),
            }
        }
    }
}
