//! The seam between the runtime and a concrete network fabric.
//!
//! [`NetDriver`] is everything the runtime asks of a fabric: send a matched
//! message, arm a reply buffer, expose or drive a bulk transfer, withdraw a
//! buffer. Completions flow back through the sink types, which update
//! request or descriptor state under its lock and signal the wait channel;
//! they never block. Every sink settles exactly once: an explicit `sent` /
//! `deliver` / `failed` call, or being dropped, which counts as a withdrawn
//! buffer (the failure path). A driver that takes a sink owns that
//! settlement.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bulk::{BulkIo, BulkShared};
use crate::connection::PeerId;
use crate::error::Result;
use crate::import::Import;
use crate::request::ReqShared;

/// Opaque id for a buffer or transfer the driver holds on the runtime's
/// behalf. Valid until settled or unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetHandle(pub u64);

/// Whether a send should solicit a delivery acknowledgement from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ask the peer's fabric for an acknowledgement.
    Ack,
    /// Fire and forget; delivery is inferred from higher-level traffic.
    NoAck,
}

/// A fabric driver the runtime can run over.
#[async_trait]
pub trait NetDriver: Send + Sync {
    /// Post `frame` to `portal` at `to`, matched by `xid` on the receiving
    /// side. On an `Err` return the driver has already settled `sink` as
    /// failed.
    async fn put_message(
        &self,
        from: PeerId,
        to: PeerId,
        portal: u32,
        xid: u64,
        frame: Bytes,
        ack: AckPolicy,
        sink: SendSink,
    ) -> Result<()>;

    /// Arm a single-use reply buffer at `at` for `xid` on `portal`, accepting
    /// only frames from `peer`. Frames longer than `max_len` settle the sink
    /// as failed.
    async fn expect_reply(
        &self,
        at: PeerId,
        peer: PeerId,
        portal: u32,
        xid: u64,
        max_len: usize,
        sink: ReplySink,
    ) -> Result<NetHandle>;

    /// Expose bulk segments at `at` for `peer` to drive with
    /// [`NetDriver::start_bulk`] under the same portal and xid.
    async fn attach_bulk(
        &self,
        at: PeerId,
        peer: PeerId,
        portal: u32,
        xid: u64,
        io: BulkIo,
        sink: BulkSink,
    ) -> Result<NetHandle>;

    /// Drive a transfer against buffers the peer attached under the same
    /// portal and xid: source segments push into the peer's sink, sink
    /// segments pull from the peer's source.
    async fn start_bulk(
        &self,
        from: PeerId,
        to: PeerId,
        portal: u32,
        xid: u64,
        io: BulkIo,
        sink: BulkSink,
    ) -> Result<NetHandle>;

    /// Withdraw an armed buffer or in-flight transfer. Settles the
    /// associated sink if it has not already settled; unknown or already
    /// settled handles are a no-op.
    async fn unlink(&self, handle: NetHandle);
}

enum SendTarget {
    Request {
        req: Arc<ReqShared>,
        import: Arc<Import>,
    },
    Discard,
}

/// Completion handle for an outgoing message.
pub struct SendSink {
    inner: Option<SendTarget>,
}

impl SendSink {
    pub(crate) fn for_request(req: Arc<ReqShared>, import: Arc<Import>) -> SendSink {
        SendSink {
            inner: Some(SendTarget::Request { req, import }),
        }
    }

    /// Sink for sends nothing waits on, such as replies.
    pub(crate) fn discard() -> SendSink {
        SendSink { inner: None }
    }

    /// The fabric accepted the frame.
    pub fn sent(mut self) {
        self.settle(true);
    }

    /// The send failed; the owning request sees a network error.
    pub fn failed(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, ok: bool) {
        if let Some(SendTarget::Request { req, import }) = self.inner.take() {
            if !ok {
                req.send_failed();
            }
            import.inflight_dec();
        }
    }
}

impl Drop for SendSink {
    fn drop(&mut self) {
        self.settle(false);
    }
}

/// Completion handle for an armed reply buffer.
pub struct ReplySink {
    inner: Option<Arc<ReqShared>>,
}

impl ReplySink {
    pub(crate) fn new(req: Arc<ReqShared>) -> ReplySink {
        ReplySink { inner: Some(req) }
    }

    /// A reply frame landed in the buffer.
    pub fn deliver(mut self, frame: Bytes) {
        if let Some(req) = self.inner.take() {
            req.reply_in(Some(frame));
        }
    }

    /// Delivery failed; the request resolves by timeout.
    pub fn failed(mut self) {
        if let Some(req) = self.inner.take() {
            req.reply_in(None);
        }
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if let Some(req) = self.inner.take() {
            req.reply_in(None);
        }
    }
}

/// Completion handle for a bulk transfer, either side.
pub struct BulkSink {
    inner: Option<Arc<BulkShared>>,
}

impl BulkSink {
    pub(crate) fn new(shared: Arc<BulkShared>) -> BulkSink {
        BulkSink {
            inner: Some(shared),
        }
    }

    /// Transfer finished; sink roles carry the landed segments.
    pub fn delivered(mut self, data: Option<Vec<Bytes>>, nob: usize) {
        if let Some(shared) = self.inner.take() {
            shared.complete(Some((data, nob)));
        }
    }

    /// Transfer failed or was withdrawn before completion.
    pub fn failed(mut self) {
        if let Some(shared) = self.inner.take() {
            shared.complete(None);
        }
    }
}

impl Drop for BulkSink {
    fn drop(&mut self) {
        if let Some(shared) = self.inner.take() {
            shared.complete(None);
        }
    }
}
