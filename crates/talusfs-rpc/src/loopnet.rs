//! In-process loopback fabric.
//!
//! Frames never leave the process: a send to a registered service portal
//! decodes the message and dispatches the portal's handler on a fresh task,
//! a send to any other portal lands in the matching armed reply buffer, and
//! bulk moves memory to memory the moment the active side starts it. The
//! fault injectors make the interesting failure paths deterministic: lost
//! request frames, refused sends, and transfers that hang until released or
//! evicted.
//!
//! All runtimes driven over one [`LoopNet`] share its portal space, so a
//! client runtime and the services it talks to live side by side in the
//! same process, which is exactly what the tests want.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::bulk::BulkIo;
use crate::connection::{ConnRegistry, PeerId};
use crate::error::{Result, RpcError};
use crate::net::{AckPolicy, BulkSink, NetDriver, NetHandle, ReplySink, SendSink};
use crate::runtime::RpcConfig;
use crate::service::{Export, IncomingRequest, RpcHandler};
use crate::wire::Msg;

struct ServiceEntry {
    handler: Arc<dyn RpcHandler>,
    reply_portal: u32,
}

struct ReplyEntry {
    sink: ReplySink,
    peer: PeerId,
    max_len: usize,
    handle: u64,
}

struct PassiveBulk {
    io: BulkIo,
    sink: BulkSink,
    peer: PeerId,
    handle: u64,
}

struct DeferredBulk {
    from: PeerId,
    to: PeerId,
    portal: u32,
    xid: u64,
    io: BulkIo,
    sink: BulkSink,
}

enum HandleKind {
    Reply(PeerId, u32, u64),
    Bulk(PeerId, u32, u64),
    Deferred,
}

/// What a send resolved to, decided under the lock, acted on outside it.
enum SendRoute {
    Refused,
    Dropped,
    Dispatch {
        handler: Arc<dyn RpcHandler>,
        reply_portal: u32,
        export: Arc<Export>,
    },
    Reply {
        entry: ReplyEntry,
        fits: bool,
    },
    Unmatched,
}

#[derive(Default)]
struct Inner {
    services: HashMap<u32, ServiceEntry>,
    /// Armed reply buffers keyed by the node they live at.
    reply_buffers: HashMap<(PeerId, u32, u64), ReplyEntry>,
    /// Exposed passive bulk memory keyed by the node it lives at.
    bulk_passive: HashMap<(PeerId, u32, u64), PassiveBulk>,
    /// Transfers held back by the defer injector, by handle.
    deferred: HashMap<u64, DeferredBulk>,
    by_handle: HashMap<u64, HandleKind>,
    exports: HashMap<PeerId, Arc<Export>>,
    next_handle: u64,
    drop_requests: u32,
    fail_sends: u32,
    defer_bulk: u32,
}

impl Inner {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn export_for(&mut self, peer: PeerId) -> Arc<Export> {
        Arc::clone(
            self.exports
                .entry(peer)
                .or_insert_with(|| Arc::new(Export::new(peer))),
        )
    }

    /// Remove the passive descriptor `peer` may drive at `at`, if any.
    fn take_passive(&mut self, at: PeerId, portal: u32, xid: u64, peer: PeerId) -> Option<PassiveBulk> {
        let matched = self
            .bulk_passive
            .get(&(at, portal, xid))
            .map_or(false, |p| p.peer == peer);
        if !matched {
            return None;
        }
        let passive = self.bulk_passive.remove(&(at, portal, xid))?;
        self.by_handle.remove(&passive.handle);
        Some(passive)
    }
}

/// Loopback driver for tests and single-process setups.
pub struct LoopNet {
    me: Weak<LoopNet>,
    config: RpcConfig,
    registry: Arc<ConnRegistry>,
    inner: Mutex<Inner>,
}

impl LoopNet {
    /// Loopback driver with default server tunables.
    pub fn new() -> Arc<LoopNet> {
        Self::with_config(RpcConfig::default())
    }

    /// Loopback driver whose dispatched services run under `config`.
    pub fn with_config(config: RpcConfig) -> Arc<LoopNet> {
        Arc::new_cyclic(|me| LoopNet {
            me: me.clone(),
            config,
            registry: Arc::new(ConnRegistry::new()),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Serve `request_portal` with `handler`, sending replies to the
    /// caller's buffers on `reply_portal`.
    ///
    /// Panics if the portal is already serviced.
    pub fn register_service(
        &self,
        request_portal: u32,
        reply_portal: u32,
        handler: Arc<dyn RpcHandler>,
    ) {
        let prev = self.lock().services.insert(
            request_portal,
            ServiceEntry {
                handler,
                reply_portal,
            },
        );
        assert!(prev.is_none(), "portal {request_portal} already serviced");
    }

    /// The session for `peer`, if any request from it has arrived.
    pub fn export(&self, peer: PeerId) -> Option<Arc<Export>> {
        self.lock().exports.get(&peer).map(Arc::clone)
    }

    /// Evict `peer`: fail its session and settle any transfers stalled
    /// against it so server-side waits wake up instead of running out
    /// their clocks.
    pub fn evict_export(&self, peer: PeerId) {
        let (export, stalled) = {
            let mut inner = self.lock();
            let export = inner.export_for(peer);
            let handles: Vec<u64> = inner
                .deferred
                .iter()
                .filter(|(_, d)| d.to == peer || d.from == peer)
                .map(|(h, _)| *h)
                .collect();
            let mut stalled = Vec::with_capacity(handles.len());
            for h in handles {
                inner.by_handle.remove(&h);
                if let Some(d) = inner.deferred.remove(&h) {
                    stalled.push(d);
                }
            }
            (export, stalled)
        };
        export.fail();
        // Dropping the entries settles their sinks as withdrawn.
        drop(stalled);
    }

    /// Accept then lose the next `n` request sends, as a fabric dropping
    /// frames on the floor would.
    pub fn set_drop_requests(&self, n: u32) {
        self.lock().drop_requests = n;
    }

    /// Refuse the next `n` sends outright.
    pub fn set_fail_sends(&self, n: u32) {
        self.lock().fail_sends = n;
    }

    /// Hold the next `n` started bulk transfers unsettled until
    /// [`LoopNet::release_deferred_bulk`] runs or the peer is evicted.
    pub fn set_defer_bulk(&self, n: u32) {
        self.lock().defer_bulk = n;
    }

    /// Run every held bulk transfer. Returns how many ran.
    pub fn release_deferred_bulk(&self) -> usize {
        let jobs = {
            let mut inner = self.lock();
            let handles: Vec<u64> = inner.deferred.keys().copied().collect();
            let mut jobs = Vec::with_capacity(handles.len());
            for h in handles {
                inner.by_handle.remove(&h);
                let d = inner
                    .deferred
                    .remove(&h)
                    .expect("deferred entry under its own key");
                let passive = inner.take_passive(d.to, d.portal, d.xid, d.from);
                jobs.push((d, passive));
            }
            jobs
        };
        let n = jobs.len();
        for (d, passive) in jobs {
            match passive {
                Some(p) => run_transfer(d.xid, d.io, d.sink, p.io, p.sink),
                None => d.sink.failed(),
            }
        }
        n
    }

    /// Armed reply buffers across all nodes.
    pub fn armed_replies(&self) -> usize {
        self.lock().reply_buffers.len()
    }

    /// Attached passive bulk descriptors across all nodes.
    pub fn attached_bulk(&self) -> usize {
        self.lock().bulk_passive.len()
    }

    fn route_send(&self, from: PeerId, to: PeerId, portal: u32, xid: u64, len: usize) -> SendRoute {
        let mut inner = self.lock();
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return SendRoute::Refused;
        }
        if let Some(entry) = inner.services.get(&portal) {
            if inner.drop_requests > 0 {
                inner.drop_requests -= 1;
                return SendRoute::Dropped;
            }
            let handler = Arc::clone(&entry.handler);
            let reply_portal = entry.reply_portal;
            let export = inner.export_for(from);
            return SendRoute::Dispatch {
                handler,
                reply_portal,
                export,
            };
        }
        let matched = inner
            .reply_buffers
            .get(&(to, portal, xid))
            .map_or(false, |e| e.peer == from);
        if !matched {
            return SendRoute::Unmatched;
        }
        let entry = inner
            .reply_buffers
            .remove(&(to, portal, xid))
            .expect("matched buffer still present");
        inner.by_handle.remove(&entry.handle);
        let fits = len <= entry.max_len;
        SendRoute::Reply { entry, fits }
    }
}

#[async_trait]
impl NetDriver for LoopNet {
    async fn put_message(
        &self,
        from: PeerId,
        to: PeerId,
        portal: u32,
        xid: u64,
        frame: Bytes,
        _ack: AckPolicy,
        sink: SendSink,
    ) -> Result<()> {
        match self.route_send(from, to, portal, xid, frame.len()) {
            SendRoute::Refused => {
                warn!(xid, portal, "refusing send");
                sink.failed();
                Err(RpcError::Driver {
                    reason: "injected send failure".into(),
                })
            }
            SendRoute::Dropped => {
                debug!(xid, portal, "dropping request frame");
                sink.sent();
                Ok(())
            }
            SendRoute::Dispatch {
                handler,
                reply_portal,
                export,
            } => {
                sink.sent();
                match Msg::decode(&frame) {
                    Ok(msg) => {
                        let net: Arc<dyn NetDriver> =
                            self.me.upgrade().expect("driver owned by a live runtime");
                        let registry = Arc::clone(&self.registry);
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            let mut req = IncomingRequest::new(
                                net,
                                registry,
                                export,
                                to,
                                from,
                                xid,
                                msg,
                                reply_portal,
                                config,
                            );
                            if let Err(e) = handler.handle(&mut req).await {
                                warn!(xid, error = %e, "service handler failed");
                                if req.wants_error_reply() {
                                    if req.status() == 0 {
                                        req.set_status(e.to_status());
                                    }
                                    if let Err(e) = req.error_reply().await {
                                        warn!(xid, error = %e, "error reply failed");
                                    }
                                }
                            }
                        });
                    }
                    // The frame was accepted; the sender resolves the
                    // missing reply by timeout, as with a real fabric.
                    Err(e) => warn!(xid, portal, error = %e, "undecodable request frame"),
                }
                Ok(())
            }
            SendRoute::Reply { entry, fits } => {
                if fits {
                    entry.sink.deliver(frame);
                } else {
                    warn!(
                        xid,
                        portal,
                        len = frame.len(),
                        max_len = entry.max_len,
                        "frame overruns armed buffer"
                    );
                    entry.sink.failed();
                }
                sink.sent();
                Ok(())
            }
            SendRoute::Unmatched => {
                debug!(xid, portal, "no buffer armed for frame");
                sink.sent();
                Ok(())
            }
        }
    }

    async fn expect_reply(
        &self,
        at: PeerId,
        peer: PeerId,
        portal: u32,
        xid: u64,
        max_len: usize,
        sink: ReplySink,
    ) -> Result<NetHandle> {
        let mut inner = self.lock();
        let handle = inner.alloc_handle();
        let prev = inner.reply_buffers.insert(
            (at, portal, xid),
            ReplyEntry {
                sink,
                peer,
                max_len,
                handle,
            },
        );
        assert!(prev.is_none(), "reply buffer already armed for xid {xid}");
        inner.by_handle.insert(handle, HandleKind::Reply(at, portal, xid));
        Ok(NetHandle(handle))
    }

    async fn attach_bulk(
        &self,
        at: PeerId,
        peer: PeerId,
        portal: u32,
        xid: u64,
        io: BulkIo,
        sink: BulkSink,
    ) -> Result<NetHandle> {
        let mut inner = self.lock();
        let handle = inner.alloc_handle();
        let prev = inner.bulk_passive.insert(
            (at, portal, xid),
            PassiveBulk {
                io,
                sink,
                peer,
                handle,
            },
        );
        assert!(prev.is_none(), "bulk already attached for xid {xid}");
        inner.by_handle.insert(handle, HandleKind::Bulk(at, portal, xid));
        Ok(NetHandle(handle))
    }

    async fn start_bulk(
        &self,
        from: PeerId,
        to: PeerId,
        portal: u32,
        xid: u64,
        io: BulkIo,
        sink: BulkSink,
    ) -> Result<NetHandle> {
        let (handle, passive) = {
            let mut inner = self.lock();
            let handle = inner.alloc_handle();
            if inner.defer_bulk > 0 {
                inner.defer_bulk -= 1;
                debug!(xid, portal, "holding bulk transfer");
                inner.deferred.insert(
                    handle,
                    DeferredBulk {
                        from,
                        to,
                        portal,
                        xid,
                        io,
                        sink,
                    },
                );
                inner.by_handle.insert(handle, HandleKind::Deferred);
                return Ok(NetHandle(handle));
            }
            (handle, inner.take_passive(to, portal, xid, from))
        };
        match passive {
            Some(p) => {
                run_transfer(xid, io, sink, p.io, p.sink);
                Ok(NetHandle(handle))
            }
            None => {
                sink.failed();
                Err(RpcError::Driver {
                    reason: format!("no bulk attached for xid {xid}"),
                })
            }
        }
    }

    async fn unlink(&self, handle: NetHandle) {
        let (reply, bulk, deferred) = {
            let mut inner = self.lock();
            match inner.by_handle.remove(&handle.0) {
                Some(HandleKind::Reply(at, portal, xid)) => {
                    (inner.reply_buffers.remove(&(at, portal, xid)), None, None)
                }
                Some(HandleKind::Bulk(at, portal, xid)) => {
                    (None, inner.bulk_passive.remove(&(at, portal, xid)), None)
                }
                Some(HandleKind::Deferred) => (None, None, inner.deferred.remove(&handle.0)),
                None => (None, None, None),
            }
        };
        if reply.is_some() || bulk.is_some() || deferred.is_some() {
            debug!(handle = handle.0, "unlinking buffer");
        }
        // Dropping the entries settles their sinks as withdrawn.
        drop(reply);
        drop(bulk);
        drop(deferred);
    }
}

/// Move the data and settle both sides. The active side drives; the
/// passive side only finds out what happened.
fn run_transfer(xid: u64, active_io: BulkIo, active_sink: BulkSink, passive_io: BulkIo, passive_sink: BulkSink) {
    match (active_io, passive_io) {
        // Put: the active side holds the data, the passive side receives.
        (BulkIo::Source(frags), BulkIo::Sink(lens)) => {
            let nob: usize = frags.iter().map(Bytes::len).sum();
            let cap: usize = lens.iter().sum();
            if nob > cap {
                warn!(xid, nob, cap, "bulk put overruns the exposed memory");
                active_sink.failed();
                passive_sink.failed();
                return;
            }
            passive_sink.delivered(Some(frags), nob);
            active_sink.delivered(None, nob);
        }
        // Get: the passive side holds the data, the active side receives.
        (BulkIo::Sink(lens), BulkIo::Source(frags)) => {
            let nob: usize = frags.iter().map(Bytes::len).sum();
            let cap: usize = lens.iter().sum();
            if nob > cap {
                warn!(xid, nob, cap, "bulk get overruns the receiving memory");
                active_sink.failed();
                passive_sink.failed();
                return;
            }
            active_sink.delivered(Some(frags), nob);
            passive_sink.delivered(None, nob);
        }
        (active, passive) => {
            let side = |io: &BulkIo| match io {
                BulkIo::Source(_) => "source",
                BulkIo::Sink(_) => "sink",
            };
            warn!(
                xid,
                active = side(&active),
                passive = side(&passive),
                "bulk direction mismatch"
            );
            active_sink.failed();
            passive_sink.failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{BulkDesc, BulkRole};
    use crate::request::test_support::shared_for_tests;
    use crate::wire::MsgType;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time;

    const PORTAL: u32 = 5;
    const REPLY_PORTAL: u32 = 6;

    fn client() -> PeerId {
        PeerId::new(1, 100)
    }

    fn server() -> PeerId {
        PeerId::new(2, 200)
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<u32>,
    }

    #[async_trait]
    impl RpcHandler for Recorder {
        async fn handle(&self, req: &mut IncomingRequest) -> Result<()> {
            let _ = self.tx.send(req.opcode());
            req.pack_reply(&[])?;
            req.send_reply().await
        }
    }

    fn request_frame(opcode: u32, xid: u64) -> Bytes {
        let mut msg = Msg::new(MsgType::Request, &[8]);
        msg.hdr.opcode = opcode;
        msg.hdr.xid = xid;
        msg.encode()
    }

    #[tokio::test]
    async fn test_reply_send_lands_in_armed_buffer() {
        let net = LoopNet::new();
        let (shared, mut rx) = shared_for_tests();
        shared.lock().receiving_reply = true;
        net.expect_reply(
            client(),
            server(),
            REPLY_PORTAL,
            shared.xid(),
            4096,
            ReplySink::new(Arc::clone(&shared)),
        )
        .await
        .unwrap();
        assert_eq!(net.armed_replies(), 1);

        let frame = Bytes::from_static(b"reply bytes");
        net.put_message(
            server(),
            client(),
            REPLY_PORTAL,
            shared.xid(),
            frame,
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();

        assert_eq!(net.armed_replies(), 0);
        rx.recv().await.unwrap();
        let st = shared.lock();
        assert!(st.replied);
        assert_eq!(st.nob_received, 11);
    }

    #[tokio::test]
    async fn test_oversize_reply_settles_buffer_as_failed() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        shared.lock().receiving_reply = true;
        net.expect_reply(
            client(),
            server(),
            REPLY_PORTAL,
            shared.xid(),
            4,
            ReplySink::new(Arc::clone(&shared)),
        )
        .await
        .unwrap();

        net.put_message(
            server(),
            client(),
            REPLY_PORTAL,
            shared.xid(),
            Bytes::from_static(b"much too long"),
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();

        let st = shared.lock();
        assert!(!st.replied, "oversize frame must not deliver");
        assert!(!st.receiving_reply, "buffer must settle regardless");
    }

    #[tokio::test]
    async fn test_unlink_withdraws_reply_buffer() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        shared.lock().receiving_reply = true;
        let handle = net
            .expect_reply(
                client(),
                server(),
                REPLY_PORTAL,
                shared.xid(),
                4096,
                ReplySink::new(Arc::clone(&shared)),
            )
            .await
            .unwrap();
        net.unlink(handle).await;
        assert_eq!(net.armed_replies(), 0);
        let st = shared.lock();
        assert!(!st.receiving_reply);
        assert!(!st.replied);
    }

    #[tokio::test]
    async fn test_fail_sends_refuses_then_recovers() {
        let net = LoopNet::new();
        net.set_fail_sends(1);
        let res = net
            .put_message(
                server(),
                client(),
                REPLY_PORTAL,
                1,
                Bytes::from_static(b"x"),
                AckPolicy::NoAck,
                SendSink::discard(),
            )
            .await;
        assert!(res.is_err());
        net.put_message(
            server(),
            client(),
            REPLY_PORTAL,
            2,
            Bytes::from_static(b"x"),
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_drop_requests_loses_exactly_n_frames() {
        let net = LoopNet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        net.register_service(PORTAL, REPLY_PORTAL, Arc::new(Recorder { tx }));
        net.set_drop_requests(1);

        net.put_message(
            client(),
            server(),
            PORTAL,
            10,
            request_frame(7, 10),
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();
        net.put_message(
            client(),
            server(),
            PORTAL,
            11,
            request_frame(8, 11),
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();

        let first = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, 8, "the dropped frame must never dispatch");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_creates_export_per_peer() {
        let net = LoopNet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        net.register_service(PORTAL, REPLY_PORTAL, Arc::new(Recorder { tx }));
        assert!(net.export(client()).is_none());
        net.put_message(
            client(),
            server(),
            PORTAL,
            21,
            request_frame(3, 21),
            AckPolicy::NoAck,
            SendSink::discard(),
        )
        .await
        .unwrap();
        rx.recv().await.unwrap();
        let export = net.export(client()).unwrap();
        assert_eq!(export.peer(), client());
        assert!(!export.is_failed());
    }

    #[tokio::test]
    async fn test_bulk_put_moves_data_instantly() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        let mut passive = BulkDesc::for_request(
            BulkRole::PutSink,
            8,
            BulkIo::Sink(vec![16, 16]),
            Arc::clone(&shared),
        );
        passive
            .register(net.as_ref(), client(), server(), 31)
            .await
            .unwrap();
        assert_eq!(net.attached_bulk(), 1);

        let payload = vec![Bytes::from_static(b"0123456789"), Bytes::from_static(b"abcdef")];
        let mut active =
            BulkDesc::for_export(BulkRole::PutSource, 8, BulkIo::Source(payload), client(), 31);
        active.start(net.as_ref(), server()).await;

        assert_eq!(net.attached_bulk(), 0);
        assert!(active.is_success());
        assert_eq!(active.nob_transferred(), 16);
        assert!(passive.is_success());
        assert!(!passive.is_active());
        let frags = passive.take_received().unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(&frags[0][..], b"0123456789");
    }

    #[tokio::test]
    async fn test_bulk_get_pulls_from_passive_source() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        let mut passive = BulkDesc::for_request(
            BulkRole::GetSource,
            8,
            BulkIo::Source(vec![Bytes::from_static(b"pull me")]),
            Arc::clone(&shared),
        );
        passive
            .register(net.as_ref(), client(), server(), 32)
            .await
            .unwrap();

        let mut active =
            BulkDesc::for_export(BulkRole::GetSink, 8, BulkIo::Sink(vec![64]), client(), 32);
        active.start(net.as_ref(), server()).await;

        assert!(active.is_success());
        assert_eq!(active.nob_transferred(), 7);
        let frags = active.take_received().unwrap();
        assert_eq!(&frags[0][..], b"pull me");
        assert!(passive.is_success());
    }

    #[tokio::test]
    async fn test_start_without_attach_fails_cleanly() {
        let net = LoopNet::new();
        let mut active =
            BulkDesc::for_export(BulkRole::PutSource, 8, BulkIo::Source(vec![Bytes::from_static(b"x")]), client(), 33);
        active.start(net.as_ref(), server()).await;
        assert!(!active.is_active());
        assert!(!active.is_success());
    }

    #[tokio::test]
    async fn test_deferred_bulk_waits_for_release() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        let mut passive = BulkDesc::for_request(
            BulkRole::PutSink,
            8,
            BulkIo::Sink(vec![32]),
            Arc::clone(&shared),
        );
        passive
            .register(net.as_ref(), client(), server(), 34)
            .await
            .unwrap();

        net.set_defer_bulk(1);
        let mut active = BulkDesc::for_export(
            BulkRole::PutSource,
            8,
            BulkIo::Source(vec![Bytes::from_static(b"late data")]),
            client(),
            34,
        );
        active.start(net.as_ref(), server()).await;
        assert!(active.is_active(), "deferred transfer must stay engaged");
        assert!(!active.is_success());

        assert_eq!(net.release_deferred_bulk(), 1);
        assert!(!active.is_active());
        assert!(active.is_success());
        assert_eq!(passive.take_received().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evict_fails_export_and_settles_deferred() {
        let net = LoopNet::new();
        let (shared, _rx) = shared_for_tests();
        let mut passive = BulkDesc::for_request(
            BulkRole::PutSink,
            8,
            BulkIo::Sink(vec![32]),
            Arc::clone(&shared),
        );
        passive
            .register(net.as_ref(), client(), server(), 35)
            .await
            .unwrap();

        net.set_defer_bulk(1);
        let mut active = BulkDesc::for_export(
            BulkRole::PutSource,
            8,
            BulkIo::Source(vec![Bytes::from_static(b"never lands")]),
            client(),
            35,
        );
        active.start(net.as_ref(), server()).await;
        assert!(active.is_active());

        net.evict_export(client());
        assert!(net.export(client()).unwrap().is_failed());
        assert!(!active.is_active(), "eviction must settle the held transfer");
        assert!(!active.is_success());
    }
}
