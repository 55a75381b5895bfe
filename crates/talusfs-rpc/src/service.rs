//! Server-side request surface: exports, incoming requests, replies.
//!
//! The network driver materializes an [`IncomingRequest`] for every frame
//! that reaches a registered service and hands it to that service's
//! [`RpcHandler`]. Handlers read the parsed message, pack a reply with the
//! codec, optionally move bulk data, and send the reply back through the
//! connection registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::bulk::{BulkDesc, BulkIo, BulkRole};
use crate::connection::{ConnRegistry, PeerId};
use crate::error::Result;
use crate::net::{AckPolicy, NetDriver, SendSink};
use crate::runtime::RpcConfig;
use crate::wire::{Msg, MsgType};

/// Server-side session with one client peer.
///
/// The failed flag is the server's eviction signal: bulk waits observe it
/// and abort instead of stalling on a client that will never answer.
pub struct Export {
    peer: PeerId,
    failed: AtomicBool,
}

impl Export {
    pub(crate) fn new(peer: PeerId) -> Export {
        Export {
            peer,
            failed: AtomicBool::new(false),
        }
    }

    /// The client this session belongs to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// True once the session has been evicted.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Evict the session. In-flight server bulk against it aborts.
    pub fn fail(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            info!(peer = %self.peer, "export failed");
        }
    }
}

/// Handler for one service portal.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Process one incoming request. An error escaping here makes the
    /// dispatcher attempt an error reply with the request's status,
    /// unless the handler already replied or suppressed replying.
    async fn handle(&self, req: &mut IncomingRequest) -> Result<()>;
}

/// One request as seen by a service handler.
pub struct IncomingRequest {
    net: Arc<dyn NetDriver>,
    registry: Arc<ConnRegistry>,
    export: Arc<Export>,
    self_id: PeerId,
    peer: PeerId,
    xid: u64,
    arrived: Instant,
    msg: Msg,
    reply_portal: u32,
    config: RpcConfig,
    reply: Option<Msg>,
    status: i32,
    err_reply: bool,
    difficult: bool,
    replied: bool,
    no_reply: bool,
}

impl IncomingRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        net: Arc<dyn NetDriver>,
        registry: Arc<ConnRegistry>,
        export: Arc<Export>,
        self_id: PeerId,
        peer: PeerId,
        xid: u64,
        msg: Msg,
        reply_portal: u32,
        config: RpcConfig,
    ) -> IncomingRequest {
        IncomingRequest {
            net,
            registry,
            export,
            self_id,
            peer,
            xid,
            arrived: Instant::now(),
            msg,
            reply_portal,
            config,
            reply: None,
            status: 0,
            err_reply: false,
            difficult: false,
            replied: false,
            no_reply: false,
        }
    }

    /// The parsed request message.
    pub fn msg(&self) -> &Msg {
        &self.msg
    }

    /// Request opcode.
    pub fn opcode(&self) -> u32 {
        self.msg.hdr.opcode
    }

    /// Transfer id the reply (and any bulk) must match.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// The requesting peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The session the request arrived on.
    pub fn export(&self) -> &Arc<Export> {
        &self.export
    }

    /// When the request was handed to the service.
    pub fn arrived(&self) -> Instant {
        self.arrived
    }

    /// Status the reply will carry.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Set the status the reply will carry.
    pub fn set_status(&mut self, status: i32) {
        self.status = status;
    }

    /// Request an acknowledged reply send.
    pub fn set_difficult(&mut self, difficult: bool) {
        self.difficult = difficult;
    }

    /// True once a reply send has been attempted.
    pub fn replied(&self) -> bool {
        self.replied
    }

    /// Give up on replying entirely; the peer resolves this request
    /// through its own retransmit machinery. Bulk comm failures use this
    /// so a half-broken transfer is never acknowledged.
    pub fn suppress_reply(&mut self) {
        self.no_reply = true;
    }

    pub(crate) fn wants_error_reply(&self) -> bool {
        !self.replied && !self.no_reply
    }

    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub(crate) fn net(&self) -> &Arc<dyn NetDriver> {
        &self.net
    }

    pub(crate) fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Allocate the reply message with the given region layout.
    pub fn pack_reply(&mut self, lens: &[usize]) -> Result<()> {
        let mut reply = Msg::new(MsgType::Reply, lens);
        reply.hdr.xid = self.xid;
        self.reply = Some(reply);
        Ok(())
    }

    /// The packed reply.
    ///
    /// Panics if [`pack_reply`](Self::pack_reply) has not run.
    pub fn reply_mut(&mut self) -> &mut Msg {
        match self.reply.as_mut() {
            Some(msg) => msg,
            None => panic!("reply not packed"),
        }
    }

    /// Server-side bulk descriptor against this request's peer and xid.
    pub fn prep_bulk(&self, role: BulkRole, portal: u32, io: BulkIo) -> BulkDesc {
        assert!(role.is_server(), "client bulk roles belong to requests");
        BulkDesc::for_export(role, portal, io, self.peer, self.xid)
    }

    /// Send the packed reply: stamp type/status/opcode, resolve the
    /// connection through the registry (reference held across the send),
    /// and put the frame to the peer's reply buffer.
    pub async fn send_reply(&mut self) -> Result<()> {
        let frame = {
            let status = self.status;
            let opcode = self.msg.hdr.opcode;
            let err_reply = self.err_reply;
            let reply = match self.reply.as_mut() {
                Some(msg) => msg,
                None => panic!("send_reply without packed reply"),
            };
            reply.hdr.msg_type = if err_reply {
                MsgType::Err as u32
            } else {
                MsgType::Reply as u32
            };
            reply.hdr.status = status;
            reply.hdr.opcode = opcode;
            reply.encode()
        };
        let ack = if self.difficult {
            AckPolicy::Ack
        } else {
            AckPolicy::NoAck
        };
        self.replied = true;
        let conn = self.registry.get(self.peer, self.self_id);
        let res = self
            .net
            .put_message(
                self.self_id,
                self.peer,
                self.reply_portal,
                self.xid,
                frame,
                ack,
                SendSink::discard(),
            )
            .await;
        self.registry.put(&conn);
        if let Err(e) = &res {
            warn!(xid = self.xid, peer = %self.peer, error = %e, "reply send failed");
        }
        res
    }

    /// Send an error reply carrying the current status. Packs an empty
    /// reply when the handler never built one.
    pub async fn error_reply(&mut self) -> Result<()> {
        if self.reply.is_none() {
            self.pack_reply(&[])?;
        }
        self.err_reply = true;
        self.send_reply().await
    }
}
