//! Client requests: state shared with the event side, the send path, and
//! the single-request wait engine.
//!
//! A request is owned by exactly one caller (or by a set), but its flag
//! state is shared with network completions through [`ReqShared`]. The
//! protocol is always the same: a completion takes the state lock, flips
//! flags, then signals the wait channel; the waiting side wakes, re-reads
//! the flags under the lock, and decides. Flags are the truth, the channel
//! only carries "look again" pulses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::bulk::{BulkDesc, BulkIo, BulkRole};
use crate::error::{status, Result, RpcError};
use crate::import::{ConnEpoch, Generation, Import, ImportState};
use crate::net::{AckPolicy, NetHandle, ReplySink, SendSink};
use crate::runtime::RpcRuntime;
use crate::wire::{self, flags, Msg, MsgType};

/// Life-cycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Built but never transmitted.
    New,
    /// On the wire, awaiting a reply.
    Rpc,
    /// Reply arrived; the bulk transfer is still outstanding.
    Bulk,
    /// Finished moving data; interpreter pending.
    Interpret,
    /// Fully finished, status final.
    Complete,
}

/// Completion interpreter, run exactly once as a request finishes.
/// Receives the final status and returns the (possibly adjusted) status.
pub type Interpreter = Box<dyn FnOnce(&mut Request, i32) -> i32 + Send>;

pub(crate) struct ReqState {
    pub(crate) phase: Phase,
    pub(crate) receiving_reply: bool,
    pub(crate) replied: bool,
    pub(crate) err: bool,
    pub(crate) timedout: bool,
    pub(crate) net_err: bool,
    pub(crate) resend: bool,
    pub(crate) restart: bool,
    pub(crate) intr: bool,
    pub(crate) status: i32,
    pub(crate) reply: Option<Bytes>,
    pub(crate) nob_received: usize,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) generation: Generation,
    pub(crate) retries: u32,
}

/// Request state shared with network completions.
pub(crate) struct ReqShared {
    xid: AtomicU64,
    state: Mutex<ReqState>,
    wake_tx: mpsc::UnboundedSender<()>,
    set_wake: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl ReqShared {
    fn new(xid: u64) -> (Arc<ReqShared>, mpsc::UnboundedReceiver<()>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReqShared {
            xid: AtomicU64::new(xid),
            state: Mutex::new(ReqState {
                phase: Phase::New,
                receiving_reply: false,
                replied: false,
                err: false,
                timedout: false,
                net_err: false,
                resend: false,
                restart: false,
                intr: false,
                status: 0,
                reply: None,
                nob_received: 0,
                sent_at: None,
                generation: Generation(0),
                retries: 0,
            }),
            wake_tx,
            set_wake: Mutex::new(None),
        });
        (shared, wake_rx)
    }

    pub(crate) fn xid(&self) -> u64 {
        self.xid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_xid(&self, xid: u64) {
        self.xid.store(xid, Ordering::SeqCst);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ReqState> {
        self.state.lock().unwrap()
    }

    /// Signal whoever is waiting: always the request's own channel, and the
    /// owning set's channel when the request belongs to one.
    pub(crate) fn wake(&self) {
        let _ = self.wake_tx.send(());
        if let Some(tx) = self.set_wake.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn attach_set_wake(&self, tx: mpsc::UnboundedSender<()>) {
        *self.set_wake.lock().unwrap() = Some(tx);
    }

    pub(crate) fn detach_set_wake(&self) {
        *self.set_wake.lock().unwrap() = None;
    }

    pub(crate) fn in_set(&self) -> bool {
        self.set_wake.lock().unwrap().is_some()
    }

    pub(crate) fn generation(&self) -> Generation {
        self.lock().generation
    }

    /// A reply frame landed, or the armed buffer was withdrawn (`None`).
    pub(crate) fn reply_in(&self, frame: Option<Bytes>) {
        let mut st = self.lock();
        assert!(st.receiving_reply, "reply completion without armed buffer");
        st.receiving_reply = false;
        if let Some(frame) = frame {
            st.replied = true;
            st.nob_received = frame.len();
            st.reply = Some(frame);
        }
        drop(st);
        self.wake();
    }

    /// The outgoing message never made it; resolves like a lost reply.
    pub(crate) fn send_failed(&self) {
        self.lock().net_err = true;
        self.wake();
    }

    /// Abort from the owning import; the wait path sees a hard error.
    pub(crate) fn mark_err(&self) {
        self.lock().err = true;
        self.wake();
    }
}

/// A client request.
///
/// Built through [`RpcRuntime::new_request`](crate::runtime::RpcRuntime::new_request),
/// filled via [`Request::reqmsg`], then either awaited with
/// [`Request::queue_wait`] or added to a [`RequestSet`](crate::set::RequestSet).
pub struct Request {
    pub(crate) shared: Arc<ReqShared>,
    pub(crate) rx: mpsc::UnboundedReceiver<()>,
    pub(crate) rt: Arc<RpcRuntime>,
    pub(crate) import: Arc<Import>,
    /// Outgoing message; fill its regions before sending.
    pub reqmsg: Msg,
    pub(crate) repmsg: Option<Msg>,
    pub(crate) replen: usize,
    pub(crate) timeout: Duration,
    pub(crate) request_portal: u32,
    pub(crate) reply_portal: u32,
    pub(crate) send_state: ImportState,
    /// Give up instead of retransmitting when the deadline passes.
    pub no_resend: bool,
    pub(crate) transno: u64,
    pub(crate) bulk: Option<BulkDesc>,
    pub(crate) reply_handle: Option<NetHandle>,
    pub(crate) interpret: Option<Interpreter>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("xid", &self.xid())
            .finish_non_exhaustive()
    }
}

/// Handle for interrupting a waiting request from another task.
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<ReqShared>,
}

impl InterruptHandle {
    /// Flag the request interrupted and wake its waiter. Honored once the
    /// request has also seen a timeout, matching the wait discipline.
    pub fn interrupt(&self) {
        self.shared.lock().intr = true;
        self.shared.wake();
    }
}

impl Request {
    pub(crate) fn build(
        rt: Arc<RpcRuntime>,
        import: Arc<Import>,
        version: u32,
        opcode: u32,
        lens: &[usize],
        replen: usize,
    ) -> Request {
        let xid = rt.next_xid();
        let (shared, rx) = ReqShared::new(xid);
        let mut reqmsg = Msg::new(MsgType::Request, lens);
        reqmsg.hdr.version |= version & wire::MSG_VERSION_MASK;
        reqmsg.hdr.opcode = opcode;
        reqmsg.hdr.xid = xid;
        let timeout = if import.config().server_timeout {
            rt.config().request_timeout / 2
        } else {
            rt.config().request_timeout
        };
        let (request_portal, reply_portal) = import.portals();
        Request {
            shared,
            rx,
            rt,
            import,
            reqmsg,
            repmsg: None,
            replen,
            timeout,
            request_portal,
            reply_portal,
            send_state: ImportState::Full,
            no_resend: false,
            transno: 0,
            bulk: None,
            reply_handle: None,
            interpret: None,
        }
    }

    /// Transfer id. Bumped when a request with bulk is retransmitted.
    pub fn xid(&self) -> u64 {
        self.shared.xid()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    /// Final (or most recent) status.
    pub fn status(&self) -> i32 {
        self.shared.lock().status
    }

    /// Transaction number from the reply, zero until one arrives.
    pub fn transno(&self) -> u64 {
        self.transno
    }

    /// The owning import.
    pub fn import(&self) -> &Arc<Import> {
        &self.import
    }

    /// Decoded reply message, present after a successful wait.
    pub fn reply(&self) -> Option<&Msg> {
        self.repmsg.as_ref()
    }

    /// Expected reply size; the armed buffer rejects longer frames.
    pub fn set_replen(&mut self, replen: usize) {
        self.replen = replen;
    }

    /// Override the per-attempt reply deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Install the completion interpreter.
    pub fn set_interpreter(&mut self, f: Interpreter) {
        self.interpret = Some(f);
    }

    /// Handle for interrupting this request from another task.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attach a client-side bulk descriptor. `role` must be a client role:
    /// the sink of a peer put, or the source of a peer get.
    pub fn attach_bulk(&mut self, role: BulkRole, portal: u32, io: BulkIo) {
        assert!(role.is_client(), "server bulk roles belong to exports");
        self.bulk = Some(BulkDesc::for_request(
            role,
            portal,
            io,
            Arc::clone(&self.shared),
        ));
    }

    /// Attached bulk descriptor, if any.
    pub fn bulk(&self) -> Option<&BulkDesc> {
        self.bulk.as_ref()
    }

    /// Mutable bulk access, for draining received fragments after a wait.
    pub fn bulk_mut(&mut self) -> Option<&mut BulkDesc> {
        self.bulk.as_mut()
    }

    /// Ask the engine to retransmit, as when the server reports it dropped
    /// the original. Clears the failure flags the retransmit supersedes.
    pub fn mark_resend(&mut self) {
        {
            let mut st = self.shared.lock();
            st.status = status::EAGAIN;
            st.resend = true;
            st.net_err = false;
            st.timedout = false;
        }
        if self.bulk.is_some() {
            let new_xid = self.rt.next_xid();
            self.shared.set_xid(new_xid);
            self.reqmsg.hdr.xid = new_xid;
        }
        self.shared.wake();
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.shared.lock().phase = phase;
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.shared.lock().status = status;
    }

    pub(crate) fn receiving_reply(&self) -> bool {
        self.shared.lock().receiving_reply
    }

    pub(crate) fn bulk_active(&self) -> bool {
        self.bulk.as_ref().map_or(false, BulkDesc::is_active)
    }

    /// Transmit the request: register bulk, stamp the connection epoch, arm
    /// the reply buffer, clear per-attempt flags, send.
    pub(crate) async fn send_rpc(&mut self, noreply: bool) -> Result<()> {
        assert_eq!(self.reqmsg.hdr.kind(), Some(MsgType::Request));
        // A retransmit must have disengaged cleanly from the previous
        // attempt before re-arming anything.
        assert!(!self.receiving_reply());

        let self_id = self.rt.self_id();
        let peer = self.import.peer();
        let xid = self.shared.xid();

        if let Some(bulk) = self.bulk.as_mut() {
            bulk.register(self.rt.net().as_ref(), self_id, peer, xid)
                .await?;
        }

        self.reqmsg.hdr.msg_type = MsgType::Request as u32;
        self.reqmsg.hdr.conn_cnt = self.import.conn_epoch().0;

        {
            let mut st = self.shared.lock();
            // If arming succeeds there will be a reply completion.
            st.receiving_reply = !noreply;
            st.replied = false;
            st.err = false;
            st.timedout = false;
            st.net_err = false;
            st.resend = false;
            st.restart = false;
        }

        if !noreply {
            assert!(self.replen != 0, "reply expected but no reply length set");
            let sink = ReplySink::new(Arc::clone(&self.shared));
            match self
                .rt
                .net()
                .expect_reply(self_id, peer, self.reply_portal, xid, self.replen, sink)
                .await
            {
                Ok(handle) => self.reply_handle = Some(handle),
                Err(e) => {
                    // The dropped sink already cleared the receiving flag.
                    if self.bulk.is_some() {
                        self.unregister_bulk().await;
                    }
                    return Err(e);
                }
            }
        }

        // The send completion owns one in-flight count.
        self.import.inflight_inc();
        self.shared.lock().sent_at = Some(Instant::now());
        self.rt.stats().record_send();

        let sink = SendSink::for_request(Arc::clone(&self.shared), Arc::clone(&self.import));
        let frame = self.reqmsg.encode();
        match self
            .rt
            .net()
            .put_message(
                self_id,
                peer,
                self.request_portal,
                xid,
                frame,
                AckPolicy::NoAck,
                sink,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // The settled sink balanced the in-flight count.
                self.unregister_reply().await;
                if self.bulk.is_some() {
                    self.unregister_bulk().await;
                }
                Err(e)
            }
        }
    }

    /// First transmission of a new request, as driven by a set. The request
    /// moves to the rpc phase even when the send fails; the failure then
    /// resolves through the network-error path.
    pub(crate) async fn send_new(&mut self) -> Result<()> {
        assert_eq!(self.phase(), Phase::New);
        self.set_phase(Phase::Rpc);
        self.shared.lock().generation = self.import.generation();
        self.import.sending_add(&self.shared);
        info!(
            xid = self.xid(),
            opcode = self.reqmsg.hdr.opcode,
            peer = %self.import.peer(),
            "sending rpc"
        );
        match self.send_rpc(false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(xid = self.xid(), error = %e, "send failed; expect timeout");
                self.shared.send_failed();
                Err(e)
            }
        }
    }

    /// Send without blocking for the reply. Completion is driven by the
    /// owning set's checks.
    pub async fn push(&mut self) -> Result<()> {
        self.send_new().await
    }

    /// Wait predicate: true when the request needs the waiter's attention.
    /// A fresh network error escalates to a full expiry here; when that
    /// ends in import recovery the wait continues until the abort lands.
    pub(crate) async fn check_reply(&mut self) -> bool {
        let (replied, net_err, timedout, err, resend, restart) = {
            let st = self.shared.lock();
            (
                st.replied, st.net_err, st.timedout, st.err, st.resend, st.restart,
            )
        };
        if replied {
            return true;
        }
        if net_err && !timedout {
            debug!(xid = self.xid(), "network error; expiring request");
            return self.expire_one().await;
        }
        err || resend || restart
    }

    /// Escalate a timed-out request: tear down its buffers and push the
    /// failure into the owning import. Returns true when the request was
    /// finished locally, false when import recovery will finish it.
    pub(crate) async fn expire_one(&mut self) -> bool {
        let sent_ago = {
            let mut st = self.shared.lock();
            st.timedout = true;
            st.sent_at.map(|t| t.elapsed())
        };
        error!(
            xid = self.xid(),
            opcode = self.reqmsg.hdr.opcode,
            sent_ago_secs = sent_ago.map_or(0, |d| d.as_secs()),
            "request timed out"
        );
        self.rt.stats().record_timeout();
        self.unregister_reply().await;
        if self.bulk.is_some() {
            self.unregister_bulk().await;
        }
        if self.send_state != ImportState::Full {
            // Primordial requests (connect and friends) fail outright
            // instead of dragging the import down.
            let mut st = self.shared.lock();
            st.status = status::ETIMEDOUT;
            st.err = true;
            return true;
        }
        let epoch = ConnEpoch(self.reqmsg.hdr.conn_cnt);
        self.import.fail(epoch);
        false
    }

    /// A reply deadline passed. Retransmit while the import's retry budget
    /// lasts; past the budget, escalate through [`Request::expire_one`].
    /// Returns true when the request was finished locally.
    pub(crate) async fn expire_or_retry(&mut self) -> bool {
        let retries = {
            let mut st = self.shared.lock();
            st.retries += 1;
            st.retries
        };
        info!(xid = self.xid(), retries, "request timeout");
        if retries >= self.import.max_retries() {
            self.expire_one().await
        } else {
            self.shared.lock().resend = true;
            false
        }
    }

    /// Withdraw the armed reply buffer and wait until the completion side
    /// has let go of it. No-op when nothing is armed.
    pub(crate) async fn unregister_reply(&mut self) {
        if !self.receiving_reply() {
            self.reply_handle = None;
            return;
        }
        if let Some(handle) = self.reply_handle.take() {
            self.rt.net().unlink(handle).await;
        }
        loop {
            if !self.receiving_reply() {
                return;
            }
            // Completion arrives in finite time; the long timeout only
            // surfaces a stuck driver.
            match time::timeout(self.rt.config().diagnostic_timeout, self.rx.recv()).await {
                Ok(_) => {}
                Err(_) => warn!(xid = self.xid(), "unexpectedly long reply unlink"),
            }
        }
    }

    /// Disconnect the bulk descriptor from the network and wait out the
    /// completion. Idempotent.
    pub(crate) async fn unregister_bulk(&mut self) {
        if !self.bulk_active() {
            return;
        }
        if let Some(handle) = self.bulk.as_mut().and_then(BulkDesc::take_handle) {
            self.rt.net().unlink(handle).await;
        }
        loop {
            if !self.bulk_active() {
                return;
            }
            match time::timeout(self.rt.config().diagnostic_timeout, self.rx.recv()).await {
                Ok(_) => {}
                Err(_) => warn!(xid = self.xid(), "unexpectedly long bulk unlink"),
            }
        }
    }

    /// Process a received reply: decode, validate the type, extract the
    /// status, record the transaction numbers. Returns the reply status
    /// (negative statuses travel back to the caller unchanged).
    pub(crate) fn after_reply(&mut self) -> i32 {
        let frame = {
            let mut st = self.shared.lock();
            assert!(!st.receiving_reply);
            debug_assert!(st.nob_received <= self.replen);
            st.reply.take()
        };
        let Some(frame) = frame else {
            error!(xid = self.xid(), "reply flagged but no frame recorded");
            return status::EPROTO;
        };
        let msg = match Msg::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                error!(xid = self.xid(), error = %e, "reply unpack failed");
                return status::EPROTO;
            }
        };
        let kind = msg.hdr.kind();
        if kind != Some(MsgType::Reply) && kind != Some(MsgType::Err) {
            error!(
                xid = self.xid(),
                msg_type = msg.hdr.msg_type,
                "invalid reply packet type"
            );
            return status::EPROTO;
        }
        let rc = if kind == Some(MsgType::Err) {
            let s = msg.hdr.status;
            error!(xid = self.xid(), status = s, "peer sent error reply");
            if s < 0 {
                s
            } else {
                status::EINVAL
            }
        } else {
            msg.hdr.status
        };
        if rc == status::ENOTCONN {
            // Evicted, or the server bounced; reconnection is the recovery
            // driver's business.
            warn!(xid = self.xid(), "peer reports not connected");
            self.repmsg = Some(msg);
            return rc;
        }
        self.transno = msg.hdr.transno;
        self.reqmsg.hdr.transno = msg.hdr.transno;
        if self.import.config().replayable {
            self.import.note_peer_committed(msg.hdr.last_committed);
        }
        self.repmsg = Some(msg);
        rc
    }

    /// Run the interpreter (if any) and finish the request.
    pub(crate) fn finish(&mut self, rc: i32) -> i32 {
        self.set_phase(Phase::Interpret);
        self.set_status(rc);
        let rc = match self.interpret.take() {
            Some(f) => f(self, rc),
            None => rc,
        };
        self.set_status(rc);
        self.set_phase(Phase::Complete);
        self.rt.stats().record_complete(rc);
        rc
    }

    /// Send the request and wait for completion, retransmitting on timeout
    /// until the import's retry budget is spent. The request finishes
    /// interpreted and in the complete phase. `Ok` carries the non-negative
    /// application status from the reply.
    pub async fn queue_wait(&mut self) -> Result<i32> {
        assert!(!self.shared.in_set(), "set members complete through the set");
        assert!(!self.receiving_reply());
        self.import.inflight_inc();
        info!(
            xid = self.xid(),
            opcode = self.reqmsg.hdr.opcode,
            peer = %self.import.peer(),
            "sending rpc"
        );
        self.set_phase(Phase::Rpc);
        self.shared.lock().generation = self.import.generation();

        let mut rc: i32 = 0;
        let mut wait_timeout = self.timeout.max(Duration::from_secs(1));
        loop {
            // A resend requested together with a nonzero reply status
            // aborts with that status instead of going round again.
            if rc != 0 {
                break;
            }
            if self.shared.lock().resend {
                self.reqmsg.hdr.add_flags(flags::MSG_RESENT);
                if self.bulk.is_some() {
                    self.unregister_bulk().await;
                    // Bulk requests are idempotent; a fresh xid keeps any
                    // late completion of the old transfer from matching.
                    let new_xid = self.rt.next_xid();
                    debug!(
                        old_xid = self.xid(),
                        new_xid, "bumping xid for bulk resend"
                    );
                    self.shared.set_xid(new_xid);
                    self.reqmsg.hdr.xid = new_xid;
                }
                warn!(xid = self.xid(), "resending request");
                self.rt.stats().record_resend();
            }
            self.import.sending_add(&self.shared);

            let send_rc = self.send_rpc(false).await;
            wait_timeout = match &send_rc {
                Ok(()) => self.timeout.max(Duration::from_secs(1)),
                Err(e) => {
                    info!(xid = self.xid(), error = %e, "send failed; recovering");
                    Duration::from_secs(1)
                }
            };

            // Wait for a completion flag. The deadline fires once; after
            // that the wait is unbounded and interrupts are honored.
            let mut timer_fired = false;
            let sleep = time::sleep(wait_timeout);
            tokio::pin!(sleep);
            loop {
                if self.check_reply().await {
                    break;
                }
                if timer_fired {
                    if self.shared.lock().intr {
                        break;
                    }
                    let _ = self.rx.recv().await;
                    continue;
                }
                let fired = tokio::select! {
                    _ = &mut sleep => true,
                    _ = self.rx.recv() => false,
                };
                if fired {
                    timer_fired = true;
                    let _ = self.expire_or_retry().await;
                }
            }

            self.import.sending_rm(&self.shared);
            // If the reply arrived normally this just observes that the
            // completion side has let go.
            self.unregister_reply().await;

            let (err, resend, intr, timedout, replied) = {
                let st = self.shared.lock();
                (st.err, st.resend, st.intr, st.timedout, st.replied)
            };
            if err {
                rc = status::EIO;
                break;
            }
            if resend && !intr {
                if self.no_resend {
                    rc = status::ETIMEDOUT;
                    break;
                }
                rc = 0;
                continue;
            }
            if intr {
                if !timedout {
                    error!(xid = self.xid(), "interrupted without timeout");
                }
                rc = status::EINTR;
                break;
            }
            if timedout {
                rc = status::ETIMEDOUT;
                break;
            }
            if !replied {
                error!(xid = self.xid(), "wait finished without reply");
                rc = status::EIO;
                break;
            }
            rc = self.after_reply();
            if self.shared.lock().resend {
                continue;
            }
            break;
        }

        if self.bulk.is_some() {
            if rc >= 0 {
                // The server declared success, so the bulk completing is a
                // formality; anything going wrong now is extremely strange.
                let drained = time::timeout(wait_timeout, async {
                    loop {
                        if !self.bulk.as_ref().map_or(false, BulkDesc::is_active) {
                            break;
                        }
                        let _ = self.rx.recv().await;
                    }
                })
                .await;
                match drained {
                    Err(_) => {
                        error!(xid = self.xid(), "bulk timed out");
                        rc = status::ETIMEDOUT;
                    }
                    Ok(()) => {
                        if self.bulk.as_ref().map_or(false, BulkDesc::is_success) {
                            let moved = self.bulk.as_ref().map_or(0, BulkDesc::nob_transferred);
                            self.rt.stats().record_bulk_bytes(moved as u64);
                        } else {
                            error!(xid = self.xid(), "bulk transfer failed");
                            rc = status::EIO;
                        }
                    }
                }
            }
            if rc < 0 {
                self.unregister_bulk().await;
            }
        }

        assert!(!self.receiving_reply());
        let rc = self.finish(rc);
        self.import.inflight_dec();
        if rc < 0 {
            Err(RpcError::from_status(rc))
        } else {
            Ok(rc)
        }
    }
}
