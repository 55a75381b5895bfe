//! Imports: the client's view of one remote service.
//!
//! An import pins a connection, tracks the health of the exchange with the
//! peer, and owns the generation barrier that fences stale requests after
//! a failure. Every request carries the generation current at send time;
//! deactivation bumps the generation and aborts everything older, so no
//! request that predates a failure can ever report success.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, PeerId};
use crate::request::ReqShared;

/// Import life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ImportState {
    /// Shut down for good. Sticky: no transition leaves it.
    Closed = 1,
    /// Created, never connected.
    New = 2,
    /// Connection lost.
    Disconnected = 3,
    /// Connection attempt in flight.
    Connecting = 4,
    /// Replaying committed-but-unacked transactions.
    Replay = 5,
    /// Replaying lock state.
    ReplayLocks = 6,
    /// Replay sent, awaiting the peer's confirmation.
    ReplayWait = 7,
    /// Recovering queued requests.
    Recover = 8,
    /// Connected and serving.
    Full = 9,
    /// The peer revoked our session.
    Evicted = 10,
}

impl ImportState {
    fn name(self) -> &'static str {
        match self {
            ImportState::Closed => "CLOSED",
            ImportState::New => "NEW",
            ImportState::Disconnected => "DISCONN",
            ImportState::Connecting => "CONNECTING",
            ImportState::Replay => "REPLAY",
            ImportState::ReplayLocks => "REPLAY_LOCKS",
            ImportState::ReplayWait => "REPLAY_WAIT",
            ImportState::Recover => "RECOVER",
            ImportState::Full => "FULL",
            ImportState::Evicted => "EVICTED",
        }
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deactivation counter. Requests stamped with an older generation are
/// stale and must never complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

/// Connection-attempt counter stamped into outgoing headers. Zero acts as
/// a wildcard when reporting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnEpoch(pub u32);

/// Per-import tuning.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Whether the peer supports replay; replayable imports survive a
    /// connection loss in DISCONN instead of deactivating.
    pub replayable: bool,
    /// Peer hint that halves the baseline request timeout.
    pub server_timeout: bool,
    /// Timeouts tolerated per request before the import is failed.
    pub max_retries: u32,
}

impl Default for ImportConfig {
    fn default() -> ImportConfig {
        ImportConfig {
            replayable: false,
            server_timeout: false,
            max_retries: 2,
        }
    }
}

/// State transitions surfaced to the owner, who decides whether to
/// reconnect, fail over, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportEvent {
    /// The active connection failed at the given generation. Replayable
    /// imports hold in DISCONN awaiting recovery; the rest deactivated.
    ConnectionLost {
        /// Generation current when the loss was observed.
        generation: Generation,
        /// Whether the import survives for replay.
        replayable: bool,
    },
    /// The import was deactivated; in-flight requests were aborted.
    Deactivated,
    /// The import was brought back to full service.
    Activated,
}

struct ImportInner {
    state: ImportState,
    invalid: bool,
    failed: bool,
    force_verify: bool,
    generation: Generation,
    conn_epoch: ConnEpoch,
    sending: Vec<Arc<ReqShared>>,
}

/// Client-side handle to one remote service over one connection.
pub struct Import {
    inner: Mutex<ImportInner>,
    inflight: watch::Sender<u64>,
    connection: Arc<Connection>,
    request_portal: u32,
    reply_portal: u32,
    config: ImportConfig,
    peer_committed: AtomicU64,
}

impl Import {
    /// Build an import over `connection`, sending requests to
    /// `request_portal` and expecting replies on `reply_portal`. The
    /// import starts in NEW; the owner promotes it once the link is
    /// considered established.
    pub(crate) fn new(
        connection: Arc<Connection>,
        request_portal: u32,
        reply_portal: u32,
        config: ImportConfig,
    ) -> Import {
        Import {
            inner: Mutex::new(ImportInner {
                state: ImportState::New,
                invalid: false,
                failed: false,
                force_verify: false,
                generation: Generation(1),
                conn_epoch: ConnEpoch(1),
                sending: Vec::new(),
            }),
            inflight: watch::Sender::new(0),
            connection,
            request_portal,
            reply_portal,
            config,
            peer_committed: AtomicU64::new(0),
        }
    }

    /// The peer this import talks to.
    pub fn peer(&self) -> PeerId {
        self.connection.peer()
    }

    /// The pinned connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn portals(&self) -> (u32, u32) {
        (self.request_portal, self.reply_portal)
    }

    /// Tuning this import was built with.
    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub(crate) fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Current state.
    pub fn state(&self) -> ImportState {
        self.inner.lock().unwrap().state
    }

    /// Move to `new`, honoring the sticky CLOSED rule.
    pub fn set_state(&self, new: ImportState) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ImportState::Closed && new != ImportState::Closed {
            debug!(peer = %self.peer(), attempted = %new, "import is closed; state change ignored");
            return;
        }
        if inner.state != new {
            info!(peer = %self.peer(), from = %inner.state, to = %new, "import state change");
            inner.state = new;
        }
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.inner.lock().unwrap().generation
    }

    /// Current connection epoch, stamped into outgoing headers.
    pub fn conn_epoch(&self) -> ConnEpoch {
        self.inner.lock().unwrap().conn_epoch
    }

    /// True once the import has been deactivated and not re-activated.
    pub fn is_invalid(&self) -> bool {
        self.inner.lock().unwrap().invalid
    }

    /// True while the import is failed; set results for its members come
    /// back connection-aborted. Activation clears the latch.
    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    /// True when the owner should verify the peer before trusting it.
    pub fn needs_verify(&self) -> bool {
        self.inner.lock().unwrap().force_verify
    }

    /// Requests currently between send and completion.
    pub fn inflight(&self) -> u64 {
        *self.inflight.borrow()
    }

    pub(crate) fn inflight_inc(&self) {
        self.inflight.send_modify(|n| *n += 1);
    }

    pub(crate) fn inflight_dec(&self) {
        self.inflight.send_modify(|n| {
            assert!(*n > 0, "in-flight count underflow");
            *n -= 1;
        });
    }

    pub(crate) fn sending_add(&self, req: &Arc<ReqShared>) {
        self.inner.lock().unwrap().sending.push(Arc::clone(req));
    }

    pub(crate) fn sending_rm(&self, req: &Arc<ReqShared>) {
        self.inner
            .lock()
            .unwrap()
            .sending
            .retain(|r| !Arc::ptr_eq(r, req));
    }

    /// Highest transaction number the peer has reported committed.
    pub fn peer_committed(&self) -> u64 {
        self.peer_committed.load(Ordering::SeqCst)
    }

    pub(crate) fn note_peer_committed(&self, transno: u64) {
        self.peer_committed.fetch_max(transno, Ordering::SeqCst);
    }

    /// Note a connection loss observed at `epoch`. Only transitions a FULL
    /// import whose epoch matches (zero is a wildcard); a stale epoch means
    /// the failure belongs to a connection already given up on.
    pub fn set_discon(&self, epoch: ConnEpoch) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ImportState::Full
            && (epoch.0 == 0 || epoch == inner.conn_epoch)
        {
            error!(peer = %self.peer(), epoch = epoch.0, "connection to service lost");
            inner.state = ImportState::Disconnected;
            true
        } else {
            debug!(
                peer = %self.peer(),
                state = %inner.state,
                "import already not connected"
            );
            false
        }
    }

    /// Take the import out of service: mark it invalid, advance the
    /// generation, and abort every in-flight request from an older
    /// generation. This is the hard barrier against stale completions.
    pub fn deactivate(&self) -> ImportEvent {
        let stale = {
            let mut inner = self.inner.lock().unwrap();
            inner.invalid = true;
            inner.failed = true;
            inner.generation.0 += 1;
            let current = inner.generation;
            info!(
                peer = %self.peer(),
                generation = current.0,
                "deactivating import"
            );
            inner
                .sending
                .iter()
                .filter(|r| r.generation() < current)
                .cloned()
                .collect::<Vec<_>>()
        };
        for req in stale {
            debug!(xid = req.xid(), "aborting in-flight request");
            req.mark_err();
        }
        ImportEvent::Deactivated
    }

    /// Restore the import to full service after recovery. Clears the
    /// failure latch and moves to the next connection epoch, so stale
    /// failures against the old epoch no longer bite.
    pub fn activate(&self) -> ImportEvent {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.invalid = false;
            inner.failed = false;
            inner.force_verify = false;
            inner.conn_epoch.0 += 1;
        }
        self.set_state(ImportState::Full);
        info!(peer = %self.peer(), "import activated");
        ImportEvent::Activated
    }

    /// React to a request-level failure against connection `epoch`. NEW
    /// imports deactivate outright; a FULL import moves to DISCONN and, if
    /// not replayable, deactivates as well. Returns the surfaced event, or
    /// `None` when the failure was stale.
    pub fn fail(&self, epoch: ConnEpoch) -> Option<ImportEvent> {
        if self.state() == ImportState::New {
            self.deactivate();
            return Some(ImportEvent::ConnectionLost {
                generation: self.generation(),
                replayable: self.config.replayable,
            });
        }
        if !self.set_discon(epoch) {
            return None;
        }
        if !self.config.replayable {
            debug!(peer = %self.peer(), "import not replayable, deactivating");
            self.deactivate();
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.failed = true;
            inner.force_verify = true;
        }
        Some(ImportEvent::ConnectionLost {
            generation: self.generation(),
            replayable: self.config.replayable,
        })
    }

    /// Deactivate (if not already invalid) and wait for every in-flight
    /// request to drain, complaining periodically if the drain stalls.
    pub async fn invalidate(&self, drain_warn: Duration) {
        if !self.is_invalid() {
            self.deactivate();
        }
        assert!(self.is_invalid());
        let mut rx = self.inflight.subscribe();
        loop {
            let wait = rx.wait_for(|n| *n == 0);
            match time::timeout(drain_warn, wait).await {
                Ok(Ok(_)) => return,
                Ok(Err(_)) => return,
                Err(_) => warn!(
                    peer = %self.peer(),
                    inflight = self.inflight(),
                    "still waiting for in-flight requests to drain"
                ),
            }
        }
    }
}

impl fmt::Debug for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Import")
            .field("peer", &self.peer())
            .field("state", &inner.state)
            .field("invalid", &inner.invalid)
            .field("generation", &inner.generation)
            .field("conn_epoch", &inner.conn_epoch)
            .field("inflight", &self.inflight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_support::shared_for_tests;

    fn raw_import(config: ImportConfig) -> Import {
        let conn = Connection::new(PeerId::new(10, 1), PeerId::new(1, 1));
        Import::new(Arc::new(conn), 5, 6, config)
    }

    /// An import already promoted to FULL, the state most tests start from.
    fn test_import(config: ImportConfig) -> Import {
        let imp = raw_import(config);
        imp.set_state(ImportState::Full);
        imp
    }

    #[test]
    fn test_import_starts_new_until_connected() {
        let imp = raw_import(ImportConfig::default());
        assert_eq!(imp.state(), ImportState::New);
        assert!(!imp.is_invalid());
        assert!(!imp.is_failed());
    }

    #[test]
    fn test_fail_new_import_deactivates_outright() {
        let imp = raw_import(ImportConfig::default());
        let gen = imp.generation();
        // A connection that was never established has nothing to replay;
        // failure tears it down without a DISCONNECT detour.
        match imp.fail(ConnEpoch(0)) {
            Some(ImportEvent::ConnectionLost { .. }) => {}
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
        assert_eq!(imp.state(), ImportState::New);
        assert!(imp.is_invalid());
        assert!(imp.is_failed());
        assert_eq!(imp.generation(), Generation(gen.0 + 1));
    }

    #[test]
    fn test_closed_is_sticky() {
        let imp = test_import(ImportConfig::default());
        imp.set_state(ImportState::Closed);
        imp.set_state(ImportState::Full);
        assert_eq!(imp.state(), ImportState::Closed);
    }

    #[test]
    fn test_set_discon_epoch_matching() {
        let imp = test_import(ImportConfig::default());
        assert_eq!(imp.state(), ImportState::Full);
        // Stale epoch: some other connection's failure.
        assert!(!imp.set_discon(ConnEpoch(7)));
        assert_eq!(imp.state(), ImportState::Full);
        // Wildcard always matches a FULL import.
        assert!(imp.set_discon(ConnEpoch(0)));
        assert_eq!(imp.state(), ImportState::Disconnected);
        // Not FULL anymore: reported failures are no-ops.
        assert!(!imp.set_discon(ConnEpoch(0)));
    }

    #[test]
    fn test_deactivate_aborts_only_stale_generations() {
        let imp = test_import(ImportConfig::default());
        let (old_req, mut old_rx) = shared_for_tests();
        let (new_req, mut new_rx) = shared_for_tests();
        old_req.lock().generation = imp.generation();
        imp.sending_add(&old_req);
        imp.sending_add(&new_req);
        // The second request is stamped as if sent after the bump.
        new_req.lock().generation = Generation(imp.generation().0 + 1);

        imp.deactivate();

        assert!(old_req.lock().err, "stale request must be aborted");
        assert!(old_rx.try_recv().is_ok());
        assert!(!new_req.lock().err, "current request must survive");
        assert!(new_rx.try_recv().is_err());
        assert!(imp.is_invalid());
        assert!(imp.is_failed());
    }

    #[test]
    fn test_fail_full_import_deactivates_when_not_replayable() {
        let imp = test_import(ImportConfig::default());
        let gen_before = imp.generation();
        let event = imp.fail(ConnEpoch(1));
        match event {
            Some(ImportEvent::ConnectionLost {
                generation,
                replayable,
            }) => {
                assert!(!replayable);
                assert!(generation > gen_before);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(imp.state(), ImportState::Disconnected);
        assert!(imp.is_invalid());
        assert!(imp.needs_verify());
    }

    #[test]
    fn test_fail_replayable_import_holds_in_disconn() {
        let imp = test_import(ImportConfig {
            replayable: true,
            ..ImportConfig::default()
        });
        let event = imp.fail(ConnEpoch(0));
        assert!(matches!(
            event,
            Some(ImportEvent::ConnectionLost {
                replayable: true,
                ..
            })
        ));
        assert_eq!(imp.state(), ImportState::Disconnected);
        assert!(!imp.is_invalid(), "replayable imports await recovery");
        assert!(imp.is_failed(), "failure latches even when replayable");
    }

    #[test]
    fn test_fail_with_stale_epoch_is_ignored() {
        let imp = test_import(ImportConfig::default());
        assert!(imp.fail(ConnEpoch(99)).is_none());
        assert_eq!(imp.state(), ImportState::Full);
        assert!(!imp.is_invalid());
    }

    #[test]
    fn test_activate_clears_invalid_and_bumps_epoch() {
        let imp = test_import(ImportConfig::default());
        imp.fail(ConnEpoch(0));
        assert!(imp.is_invalid());
        assert!(imp.is_failed());
        let epoch_before = imp.conn_epoch();
        assert_eq!(imp.activate(), ImportEvent::Activated);
        assert!(!imp.is_invalid());
        assert!(!imp.is_failed(), "activation clears the failure latch");
        assert!(!imp.needs_verify());
        assert_eq!(imp.state(), ImportState::Full);
        assert_eq!(imp.conn_epoch().0, epoch_before.0 + 1);
    }

    #[test]
    fn test_peer_committed_is_monotonic() {
        let imp = test_import(ImportConfig::default());
        imp.note_peer_committed(40);
        imp.note_peer_committed(25);
        assert_eq!(imp.peer_committed(), 40);
        imp.note_peer_committed(41);
        assert_eq!(imp.peer_committed(), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_waits_for_drain() {
        let imp = Arc::new(test_import(ImportConfig::default()));
        imp.inflight_inc();
        imp.inflight_inc();
        let imp2 = Arc::clone(&imp);
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(2)).await;
            imp2.inflight_dec();
            imp2.inflight_dec();
        });
        imp.invalidate(Duration::from_secs(60)).await;
        assert_eq!(imp.inflight(), 0);
        assert!(imp.is_invalid());
    }

    #[tokio::test]
    async fn test_invalidate_with_no_inflight_returns_immediately() {
        let imp = test_import(ImportConfig::default());
        imp.invalidate(Duration::from_secs(60)).await;
        assert!(imp.is_invalid());
    }
}
