//! Request sets: batched concurrent requests completed together.
//!
//! A set owns its member requests and drives them all from one task. The
//! check engine advances every member as far as its flags allow; the wait
//! loop sleeps until the earliest member deadline, sweeps expiries, and
//! checks again until every member has completed. Completions wake the
//! set's channel rather than the members' own.
//!
//! Other tasks feed requests in through a [`SetAdder`] handle; queued
//! members are admitted at the owner's next check pass, including passes
//! taken inside `wait`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use crate::error::{status, Result};
use crate::request::{Phase, Request};
use crate::wire::flags;

/// Aggregate interpreter, run when every member finished with status 0.
pub type SetInterpreter = Box<dyn FnOnce(&mut RequestSet, i32) -> i32 + Send>;

/// Per-member callback for [`NbSet`], run as completed members are reaped.
pub type NbCallback = Box<dyn FnMut(&mut Request) + Send>;

enum Advance {
    /// Still moving through the machine.
    Pending,
    /// Was complete before this pass.
    AlreadyComplete,
    /// Reached complete during this pass.
    JustCompleted,
}

/// A batch of requests completed as a unit.
pub struct RequestSet {
    requests: Vec<Request>,
    remaining: usize,
    wake_tx: mpsc::UnboundedSender<()>,
    wake_rx: mpsc::UnboundedReceiver<()>,
    incoming_tx: mpsc::UnboundedSender<Request>,
    incoming_rx: mpsc::UnboundedReceiver<Request>,
    interpreter: Option<SetInterpreter>,
}

impl RequestSet {
    pub(crate) fn new() -> RequestSet {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        RequestSet {
            requests: Vec::new(),
            remaining: 0,
            wake_tx,
            wake_rx,
            incoming_tx,
            incoming_rx,
            interpreter: None,
        }
    }

    /// Install the aggregate interpreter.
    pub fn set_interpreter(&mut self, f: SetInterpreter) {
        self.interpreter = Some(f);
    }

    /// Members still short of complete.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The member requests, for post-wait inspection.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Mutable member access, for reply extraction after a wait.
    pub fn requests_mut(&mut self) -> &mut [Request] {
        &mut self.requests
    }

    /// Add a new, unsent request. Completions now signal the set.
    pub fn add(&mut self, req: Request) -> &mut Request {
        assert_eq!(req.phase(), Phase::New, "only unsent requests join a set");
        req.shared.attach_set_wake(self.wake_tx.clone());
        req.import.inflight_inc();
        self.remaining += 1;
        self.requests.push(req);
        let idx = self.requests.len() - 1;
        &mut self.requests[idx]
    }

    /// Handle for adding requests from other tasks, including while the
    /// owner sits in [`wait`](RequestSet::wait).
    pub fn adder(&self) -> SetAdder {
        SetAdder {
            incoming_tx: self.incoming_tx.clone(),
            wake_tx: self.wake_tx.clone(),
        }
    }

    /// Admit every request queued through adders since the last pass. The
    /// adder already attached the wake channel and counted the in-flight.
    fn drain_incoming(&mut self) {
        while let Ok(req) = self.incoming_rx.try_recv() {
            debug!(xid = req.xid(), "admitting queued request");
            self.remaining += 1;
            self.requests.push(req);
        }
    }

    /// Advance every member as far as its completion flags allow.
    ///
    /// With `check_allsent` the answer is "is the whole set finished (or
    /// does the caller need to recompute its deadline)"; without it the
    /// answer is "has at least one member completed".
    pub async fn check(&mut self, check_allsent: bool) -> bool {
        self.drain_incoming();
        if self.remaining == 0 {
            return true;
        }
        let mut force_recalc = false;
        let mut ncompleted = 0usize;
        let mut finished_now = 0usize;
        for req in &mut self.requests {
            match advance_one(req, &mut force_recalc).await {
                Advance::Pending => {}
                Advance::AlreadyComplete => ncompleted += 1,
                Advance::JustCompleted => {
                    ncompleted += 1;
                    finished_now += 1;
                }
            }
        }
        self.remaining -= finished_now;
        if check_allsent {
            self.remaining == 0 || force_recalc
        } else {
            ncompleted > 0 || force_recalc
        }
    }

    /// Earliest whole-second sleep until some member needs attention.
    /// `None` means no member is armed. A member whose deadline has passed,
    /// or sits inside the current second, forces a 1-second ASAP sleep.
    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut best: Option<u64> = None;
        for req in &self.requests {
            let st = req.shared.lock();
            if st.phase != Phase::Rpc && st.phase != Phase::Bulk {
                continue;
            }
            if st.timedout {
                continue;
            }
            let Some(sent) = st.sent_at else { continue };
            let remaining = (sent + req.timeout).saturating_duration_since(now).as_secs();
            if remaining == 0 {
                return Some(Duration::from_secs(1));
            }
            best = Some(best.map_or(remaining, |b| b.min(remaining)));
        }
        best.map(Duration::from_secs)
    }

    /// Expire every member whose deadline has passed. Members already
    /// resending (or timed out) are left to the check engine. A member in
    /// the rpc phase can still spend a retry; one stuck mid-bulk cannot,
    /// its transfer is torn down outright.
    async fn expire_due(&mut self) {
        let now = Instant::now();
        for req in &mut self.requests {
            let phase = {
                let st = req.shared.lock();
                let in_flight =
                    (st.phase == Phase::Rpc && !st.resend) || st.phase == Phase::Bulk;
                let due = in_flight
                    && !st.timedout
                    && st.sent_at.map_or(false, |sent| sent + req.timeout <= now);
                if !due {
                    continue;
                }
                st.phase
            };
            if phase == Phase::Rpc {
                let _ = req.expire_or_retry().await;
            } else {
                let _ = req.expire_one().await;
            }
        }
    }

    /// Flag every member still in the rpc phase as interrupted.
    pub fn interrupt(&self) {
        for req in &self.requests {
            let mut st = req.shared.lock();
            if st.phase == Phase::Rpc {
                st.intr = true;
                drop(st);
                req.shared.wake();
            }
        }
    }

    /// Send every unsent member and wait until the whole set completes.
    ///
    /// Returns the first non-zero member status, with members of a failed
    /// import reporting connection-aborted; when every member succeeded,
    /// the aggregate interpreter (if any) supplies the result.
    pub async fn wait(&mut self) -> i32 {
        self.drain_incoming();
        if self.requests.is_empty() {
            return 0;
        }
        for req in &mut self.requests {
            if req.phase() == Phase::New {
                // A failed send resolves through the timeout machinery.
                let _ = req.send_new().await;
            }
        }
        loop {
            if self.check(true).await && self.remaining == 0 {
                break;
            }
            if self.remaining == 0 {
                break;
            }
            let timeout = self.next_timeout().unwrap_or(Duration::from_secs(1));
            debug!(
                timeout_secs = timeout.as_secs(),
                remaining = self.remaining,
                "set sleeping"
            );
            let sleep = time::sleep(timeout);
            tokio::pin!(sleep);
            let fired = loop {
                let fired = tokio::select! {
                    _ = &mut sleep => true,
                    _ = self.wake_rx.recv() => false,
                };
                if fired {
                    break true;
                }
                if self.check(true).await {
                    break false;
                }
            };
            if fired {
                self.expire_due().await;
            }
        }

        let mut rc = 0i32;
        for req in &self.requests {
            if req.phase() != Phase::Complete {
                error!(
                    xid = req.xid(),
                    phase = ?req.phase(),
                    "set finished with member not complete"
                );
            }
            let member_rc = if req.import.is_failed() {
                status::ECONNABORTED
            } else {
                req.status()
            };
            if rc == 0 {
                rc = member_rc;
            }
        }
        if rc == 0 {
            if let Some(f) = self.interpreter.take() {
                rc = f(self, 0);
            }
        }
        rc
    }

    /// Tear the set down. Every member must be either complete or still
    /// unsent; unsent members run their interpreter with a bad-request
    /// status so completion effects still fire. Requests queued through
    /// adders but never admitted die unsent the same way.
    pub fn destroy(mut self) {
        let expected = if self.remaining == 0 {
            Phase::Complete
        } else {
            Phase::New
        };
        for req in &mut self.requests {
            let phase = req.phase();
            assert!(
                phase == expected,
                "destroying set with member in phase {phase:?}"
            );
            if phase == Phase::New {
                req.finish(status::EBADR);
                req.import.inflight_dec();
                self.remaining -= 1;
            }
        }
        while let Ok(mut req) = self.incoming_rx.try_recv() {
            req.finish(status::EBADR);
            req.import.inflight_dec();
        }
    }
}

/// Producer-side handle feeding requests into a set owned elsewhere.
///
/// Clones freely; every clone targets the same set. A queued request is
/// admitted and sent at the owner's next check pass, which the add nudges
/// awake.
#[derive(Clone)]
pub struct SetAdder {
    incoming_tx: mpsc::UnboundedSender<Request>,
    wake_tx: mpsc::UnboundedSender<()>,
}

impl SetAdder {
    /// Queue a new, unsent request for the set. The import's in-flight
    /// gauge counts it from here. When the set is already gone the request
    /// comes back untouched, usable standalone.
    pub fn add(&self, req: Request) -> std::result::Result<(), Request> {
        assert_eq!(req.phase(), Phase::New, "only unsent requests join a set");
        req.shared.attach_set_wake(self.wake_tx.clone());
        req.import.inflight_inc();
        match self.incoming_tx.send(req) {
            Ok(()) => {
                let _ = self.wake_tx.send(());
                Ok(())
            }
            Err(mpsc::error::SendError(req)) => {
                req.shared.detach_set_wake();
                req.import.inflight_dec();
                Err(req)
            }
        }
    }
}

/// One pass of the per-member state machine.
async fn advance_one(req: &mut Request, force_recalc: &mut bool) -> Advance {
    if req.phase() == Phase::New && req.send_new().await.is_err() {
        *force_recalc = true;
    }
    if req.phase() == Phase::Complete {
        return Advance::AlreadyComplete;
    }
    let interpret_status = match poll_member(req, force_recalc).await {
        Some(status) => status,
        None => return Advance::Pending,
    };
    // Safety net for paths that raced a late completion.
    req.unregister_reply().await;
    req.unregister_bulk().await;
    req.finish(interpret_status);
    req.import.inflight_dec();
    Advance::JustCompleted
}

/// Drive one member forward. `Some(status)` means it reached the
/// interpret phase; `None` means it still has network activity pending.
async fn poll_member(req: &mut Request, force_recalc: &mut bool) -> Option<i32> {
    if req.phase() == Phase::Interpret {
        return Some(req.status());
    }

    let (net_err, timedout) = {
        let st = req.shared.lock();
        (st.net_err, st.timedout)
    };
    if net_err && !timedout {
        let _ = req.expire_one().await;
    }

    if req.shared.lock().err {
        req.unregister_reply().await;
        {
            let mut st = req.shared.lock();
            if st.status == 0 {
                st.status = status::EIO;
            }
            st.phase = Phase::Interpret;
        }
        req.import.sending_rm(&req.shared);
        return Some(req.status());
    }

    // The guard's scope must close before the await below, or the future
    // loses `Send`; an explicit drop would not narrow the capture.
    let interrupted = {
        let st = req.shared.lock();
        st.intr && st.timedout
    };
    if interrupted {
        req.unregister_reply().await;
        req.set_status(status::EINTR);
        req.set_phase(Phase::Interpret);
        req.import.sending_rm(&req.shared);
        return Some(status::EINTR);
    }

    if req.phase() == Phase::Rpc {
        let (timedout, resend) = {
            let st = req.shared.lock();
            (st.timedout, st.resend)
        };
        if timedout || resend {
            req.unregister_reply().await;
            req.import.sending_rm(&req.shared);
            if req.no_resend {
                req.set_status(status::ENOTCONN);
                req.set_phase(Phase::Interpret);
                return Some(status::ENOTCONN);
            }
            req.import.sending_add(&req.shared);
            if req.shared.lock().resend {
                req.reqmsg.hdr.add_flags(flags::MSG_RESENT);
                if req.bulk.is_some() {
                    req.unregister_bulk().await;
                    let new_xid = req.rt.next_xid();
                    debug!(
                        old_xid = req.xid(),
                        new_xid, "bumping xid for bulk resend"
                    );
                    req.shared.set_xid(new_xid);
                    req.reqmsg.hdr.xid = new_xid;
                }
                warn!(xid = req.xid(), "resending request");
                req.rt.stats().record_resend();
            }
            if let Err(e) = req.send_rpc(false).await {
                debug!(xid = req.xid(), error = %e, "resend failed; will retry");
            }
            // Fresh attempt, fresh deadline.
            *force_recalc = true;
        }
        if req.receiving_reply() {
            return None;
        }
        if !req.shared.lock().replied {
            return None;
        }
        req.import.sending_rm(&req.shared);
        let rc = req.after_reply();
        req.set_status(rc);
        if req.shared.lock().resend {
            return None;
        }
        if req.bulk.is_none() || rc != 0 {
            req.set_phase(Phase::Interpret);
            return Some(rc);
        }
        req.set_phase(Phase::Bulk);
        // Fall through: the transfer may already have settled.
    }

    if req.phase() == Phase::Bulk {
        if req.bulk_active() {
            return None;
        }
        if req.bulk.as_ref().map_or(false, |b| b.is_success()) {
            let moved = req.bulk.as_ref().map_or(0, |b| b.nob_transferred());
            req.rt.stats().record_bulk_bytes(moved as u64);
        } else {
            // The server declared success but the data never made it;
            // fail the request rather than the process.
            error!(xid = req.xid(), "bulk transfer failed after reply");
            req.set_status(status::EIO);
        }
        req.set_phase(Phase::Interpret);
        return Some(req.status());
    }

    None
}

/// Non-blocking request dispatch: push requests through an internal set,
/// then reap completions at the caller's pace.
pub struct NbSet {
    set: RequestSet,
    callback: Option<NbCallback>,
    outstanding: usize,
}

impl NbSet {
    /// Empty dispatch set; `callback` (if any) runs per reaped request.
    pub fn new(callback: Option<NbCallback>) -> NbSet {
        NbSet {
            set: RequestSet::new(),
            callback,
            outstanding: 0,
        }
    }

    /// Requests pushed and not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Add and immediately transmit a request. A failed transmit still
    /// leaves the request in the set; it resolves at the next reap.
    pub async fn add(&mut self, req: Request) -> Result<()> {
        self.outstanding += 1;
        let req = self.set.add(req);
        match req.push().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "non-blocking send failed");
                Err(e)
            }
        }
    }

    /// Block until every outstanding request completes, then reap them.
    pub async fn flush(&mut self) -> i32 {
        let rc = self.set.wait().await;
        self.reap().await;
        rc
    }

    /// Harvest completed requests, running the callback on each. Returns
    /// the number reaped.
    pub async fn reap(&mut self) -> usize {
        let _ = self.set.check(false).await;
        let mut reaped = 0;
        let mut i = 0;
        while i < self.set.requests.len() {
            if self.set.requests[i].phase() == Phase::Complete {
                let mut req = self.set.requests.remove(i);
                self.outstanding -= 1;
                reaped += 1;
                if let Some(cb) = self.callback.as_mut() {
                    cb(&mut req);
                }
            } else {
                i += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    use crate::import::ImportConfig;
    use crate::loopnet::LoopNet;
    use crate::runtime::{RpcConfig, RpcRuntime};
    use crate::service::{IncomingRequest, RpcHandler};
    use crate::connection::PeerId;

    use async_trait::async_trait;

    const ECHO_PORTAL: u32 = 11;
    const REPLY_PORTAL: u32 = 12;
    const TEST_VERSION: u32 = 0x0001_0000;

    struct EchoService;

    #[async_trait]
    impl RpcHandler for EchoService {
        async fn handle(&self, req: &mut IncomingRequest) -> crate::error::Result<()> {
            let body = req.msg().buf(0, 0).map(<[u8]>::to_vec).unwrap_or_default();
            req.pack_reply(&[body.len()])?;
            req.reply_mut().set_buf(0, &body)?;
            req.send_reply().await
        }
    }

    /// Replies with the status carried in the request's opcode field,
    /// negated; opcode 0 replies success.
    struct StatusService;

    #[async_trait]
    impl RpcHandler for StatusService {
        async fn handle(&self, req: &mut IncomingRequest) -> crate::error::Result<()> {
            let opcode = req.msg().hdr.opcode;
            req.pack_reply(&[0])?;
            req.set_status(-(opcode as i32));
            req.send_reply().await
        }
    }

    fn runtime_with(handler: Arc<dyn RpcHandler>) -> (Arc<RpcRuntime>, Arc<LoopNet>) {
        let net = LoopNet::new();
        net.register_service(ECHO_PORTAL, REPLY_PORTAL, handler);
        let rt = RpcRuntime::new(RpcConfig::default(), net.clone(), PeerId::new(1, 100));
        (rt, net)
    }

    fn peer() -> PeerId {
        PeerId::new(2, 200)
    }

    #[tokio::test]
    async fn test_empty_set_wait_returns_zero() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let mut set = rt.new_set();
        assert_eq!(set.wait().await, 0);
        set.destroy();
    }

    #[tokio::test]
    async fn test_set_completes_all_members() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut set = rt.new_set();
        for i in 0..3u8 {
            let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[16], &[16]);
            req.reqmsg.set_buf(0, &[i; 16]).unwrap();
            set.add(req);
        }
        assert_eq!(set.remaining(), 3);
        let rc = set.wait().await;
        assert_eq!(rc, 0);
        assert_eq!(set.remaining(), 0);
        for req in set.requests() {
            assert_eq!(req.phase(), Phase::Complete);
            assert_eq!(req.status(), 0);
        }
        set.destroy();
    }

    #[tokio::test]
    async fn test_wait_reports_first_nonzero_status() {
        let (rt, _net) = runtime_with(Arc::new(StatusService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut set = rt.new_set();
        for opcode in [0u32, 53, 5] {
            let mut req = rt.new_request(&imp, TEST_VERSION, opcode, &[8], &[8]);
            req.reqmsg.set_buf(0, &[0; 8]).unwrap();
            set.add(req);
        }
        let rc = set.wait().await;
        assert_eq!(rc, -53, "first failing member's status wins");
        set.destroy();
    }

    #[tokio::test]
    async fn test_aggregate_interpreter_runs_on_all_success() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut set = rt.new_set();
        let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[4], &[4]);
        req.reqmsg.set_buf(0, b"ping").unwrap();
        set.add(req);
        set.set_interpreter(Box::new(|set, rc| {
            assert_eq!(rc, 0);
            assert_eq!(set.remaining(), 0);
            17
        }));
        assert_eq!(set.wait().await, 17);
        set.destroy();
    }

    #[tokio::test]
    async fn test_destroy_interprets_unsent_members() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut set = rt.new_set();
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = Arc::clone(&seen);
        let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[4], &[4]);
        req.set_interpreter(Box::new(move |_req, rc| {
            seen2.store(rc, Ordering::SeqCst);
            rc
        }));
        set.add(req);
        set.destroy();
        assert_eq!(seen.load(Ordering::SeqCst), status::EBADR);
        assert_eq!(imp.inflight(), 0, "unsent member must not leak in-flight");
    }

    #[tokio::test]
    #[should_panic(expected = "only unsent requests")]
    async fn test_add_rejects_sent_request() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[4], &[4]);
        req.reqmsg.set_buf(0, b"ping").unwrap();
        req.queue_wait().await.unwrap();
        let mut set = rt.new_set();
        set.add(req);
    }

    #[tokio::test]
    async fn test_adder_queued_requests_complete_in_wait() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let mut set = rt.new_set();
        let adder = set.adder();
        for i in 0..2u8 {
            let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[16], &[16]);
            req.reqmsg.set_buf(0, &[i; 16]).unwrap();
            adder.add(req).expect("set is alive");
        }
        assert_eq!(imp.inflight(), 2, "queued members count as in-flight");
        assert_eq!(set.wait().await, 0);
        assert_eq!(set.requests().len(), 2);
        for req in set.requests() {
            assert_eq!(req.phase(), Phase::Complete);
            assert_eq!(req.status(), 0);
        }
        assert_eq!(imp.inflight(), 0);
        set.destroy();
    }

    #[tokio::test]
    async fn test_adder_hands_request_back_after_destroy() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let set = rt.new_set();
        let adder = set.adder();
        set.destroy();

        let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[4], &[4]);
        req.reqmsg.set_buf(0, b"ping").unwrap();
        let mut req = match adder.add(req) {
            Err(req) => req,
            Ok(()) => panic!("add against a destroyed set must fail"),
        };
        assert_eq!(req.phase(), Phase::New);
        assert_eq!(imp.inflight(), 0, "failed add must not leak in-flight");
        // Handed back untouched: still usable standalone.
        assert_eq!(req.queue_wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nbset_reaps_with_callback() {
        let (rt, _net) = runtime_with(Arc::new(EchoService));
        let imp = rt.new_import(peer(), ECHO_PORTAL, REPLY_PORTAL, ImportConfig::default());
        let reaped_statuses = Arc::new(AtomicI32::new(-1));
        let sink = Arc::clone(&reaped_statuses);
        let mut nbs = NbSet::new(Some(Box::new(move |req: &mut Request| {
            sink.store(req.status(), Ordering::SeqCst);
        })));
        let mut req = rt.new_request(&imp, TEST_VERSION, 0, &[4], &[4]);
        req.reqmsg.set_buf(0, b"ping").unwrap();
        nbs.add(req).await.unwrap();
        assert_eq!(nbs.outstanding(), 1);
        let rc = nbs.flush().await;
        assert_eq!(rc, 0);
        assert_eq!(nbs.outstanding(), 0);
        assert_eq!(reaped_statuses.load(Ordering::SeqCst), 0);
    }
}
