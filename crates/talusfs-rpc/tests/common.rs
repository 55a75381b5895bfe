//! Shared fixtures for the end-to-end rpc tests: a small file-flavored
//! service over the loopback driver and the client plumbing to reach it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use talusfs_rpc::error::{status, Result};
use talusfs_rpc::exchange::{pack_typed_reply, server_bulk_pull, server_bulk_push, typed_body};
use talusfs_rpc::net::{BulkSink, ReplySink, SendSink};
use talusfs_rpc::wire::flags;
use talusfs_rpc::{
    AckPolicy, BulkIo, Import, ImportConfig, IncomingRequest, LoopNet, Msg, NetDriver, NetHandle,
    PeerId, RpcConfig, RpcHandler, RpcRuntime,
};

pub const REQUEST_PORTAL: u32 = 31;
pub const REPLY_PORTAL: u32 = 32;
pub const BULK_PORTAL: u32 = 33;
/// No service listens here; frames sent to it are never answered.
pub const DEAD_PORTAL: u32 = 39;

pub const VERSION: u32 = 0x0003_0000;

pub const OP_PING: u32 = 1;
pub const OP_READ: u32 = 2;
pub const OP_WRITE: u32 = 3;

pub fn client_id() -> PeerId {
    PeerId::new(1, 101)
}

pub fn server_id() -> PeerId {
    PeerId::new(2, 201)
}

/// Install the log subscriber once per test binary; `RUST_LOG` filters.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingArgs {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingReply {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadArgs {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WriteArgs {
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IoReply {
    pub nob: u64,
}

/// File-flavored test service: ping echoes a sequence number, read pushes
/// a slice of the backing buffer as bulk, write pulls client bulk into
/// [`FileService::written`].
pub struct FileService {
    data: Bytes,
    written: Mutex<Option<Vec<u8>>>,
}

impl FileService {
    pub fn new(data: Bytes) -> FileService {
        FileService {
            data,
            written: Mutex::new(None),
        }
    }

    pub fn written(&self) -> Option<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcHandler for FileService {
    async fn handle(&self, req: &mut IncomingRequest) -> Result<()> {
        match req.opcode() {
            OP_PING => {
                let args: PingArgs = typed_body(req.msg())?;
                pack_typed_reply(req, &PingReply { seq: args.seq })?;
                req.send_reply().await
            }
            OP_READ => {
                let args: ReadArgs = typed_body(req.msg())?;
                let start = (args.offset as usize).min(self.data.len());
                let end = (start + args.len as usize).min(self.data.len());
                let nob = server_bulk_push(req, BULK_PORTAL, vec![self.data.slice(start..end)])
                    .await?;
                pack_typed_reply(req, &IoReply { nob: nob as u64 })?;
                req.send_reply().await
            }
            OP_WRITE => {
                let args: WriteArgs = typed_body(req.msg())?;
                let frags = server_bulk_pull(req, BULK_PORTAL, vec![args.len as usize]).await?;
                let mut flat = Vec::with_capacity(args.len as usize);
                for frag in &frags {
                    flat.extend_from_slice(frag);
                }
                let nob = flat.len() as u64;
                *self.written.lock().unwrap() = Some(flat);
                pack_typed_reply(req, &IoReply { nob })?;
                req.send_reply().await
            }
            _ => {
                req.set_status(status::EINVAL);
                req.pack_reply(&[0])?;
                req.send_reply().await
            }
        }
    }
}

/// One service node and one client runtime over a shared loopback fabric.
pub struct Harness {
    pub net: Arc<LoopNet>,
    pub rt: Arc<RpcRuntime>,
    pub service: Arc<FileService>,
}

pub fn harness(data: Bytes) -> Harness {
    init_tracing();
    let net = LoopNet::new();
    let service = Arc::new(FileService::new(data));
    net.register_service(REQUEST_PORTAL, REPLY_PORTAL, service.clone());
    let rt = RpcRuntime::new(RpcConfig::default(), net.clone(), client_id());
    Harness { net, rt, service }
}

impl Harness {
    /// Import aimed at the file service.
    pub fn import(&self) -> Arc<Import> {
        self.rt.new_import(
            server_id(),
            REQUEST_PORTAL,
            REPLY_PORTAL,
            ImportConfig::default(),
        )
    }

    /// Import aimed at a portal nothing services, so requests over it
    /// always run out their clocks.
    pub fn dead_import(&self, peer: PeerId, max_retries: u32) -> Arc<Import> {
        self.rt.new_import(
            peer,
            DEAD_PORTAL,
            REPLY_PORTAL,
            ImportConfig {
                max_retries,
                ..ImportConfig::default()
            },
        )
    }
}

/// One driver call as seen at the runtime/fabric seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOp {
    Send { portal: u32, xid: u64, resent: bool },
    ArmReply { xid: u64 },
    AttachBulk { xid: u64 },
    StartBulk { xid: u64 },
    UnlinkReply { xid: u64 },
    UnlinkBulk { xid: u64 },
}

/// Journals every driver call in order before handing it to the real
/// loopback. Unlinks are tagged with what their handle was armed for.
pub struct RecordingNet {
    inner: Arc<LoopNet>,
    ops: Mutex<Vec<NetOp>>,
    handles: Mutex<HashMap<u64, NetOp>>,
}

impl RecordingNet {
    pub fn wrap(inner: Arc<LoopNet>) -> Arc<RecordingNet> {
        Arc::new(RecordingNet {
            inner,
            ops: Mutex::new(Vec::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// The journal so far.
    pub fn ops(&self) -> Vec<NetOp> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: NetOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl NetDriver for RecordingNet {
    async fn put_message(
        &self,
        from: PeerId,
        to: PeerId,
        portal: u32,
        xid: u64,
        frame: Bytes,
        ack: AckPolicy,
        sink: SendSink,
    ) -> Result<()> {
        let resent = Msg::decode(&frame)
            .map(|m| m.hdr.has_flags(flags::MSG_RESENT))
            .unwrap_or(false);
        self.record(NetOp::Send { portal, xid, resent });
        self.inner
            .put_message(from, to, portal, xid, frame, ack, sink)
            .await
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
        self.record(NetOp::ArmReply { xid });
        let handle = self
            .inner
            .expect_reply(at, peer, portal, xid, max_len, sink)
            .await?;
        self.handles
            .lock()
            .unwrap()
            .insert(handle.0, NetOp::UnlinkReply { xid });
        Ok(handle)
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
        self.record(NetOp::AttachBulk { xid });
        let handle = self
            .inner
            .attach_bulk(at, peer, portal, xid, io, sink)
            .await?;
        self.handles
            .lock()
            .unwrap()
            .insert(handle.0, NetOp::UnlinkBulk { xid });
        Ok(handle)
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
        self.record(NetOp::StartBulk { xid });
        let handle = self
            .inner
            .start_bulk(from, to, portal, xid, io, sink)
            .await?;
        self.handles
            .lock()
            .unwrap()
            .insert(handle.0, NetOp::UnlinkBulk { xid });
        Ok(handle)
    }

    async fn unlink(&self, handle: NetHandle) {
        if let Some(op) = self.handles.lock().unwrap().remove(&handle.0) {
            self.record(op);
        }
        self.inner.unlink(handle).await;
    }
}

/// [`Harness`] variant whose client runtime talks through the journaling
/// wrapper. Server-side traffic still runs on the bare loopback.
pub struct RecordingHarness {
    pub net: Arc<LoopNet>,
    pub rec: Arc<RecordingNet>,
    pub rt: Arc<RpcRuntime>,
}

pub fn recording_harness(data: Bytes) -> RecordingHarness {
    init_tracing();
    let net = LoopNet::new();
    let service = Arc::new(FileService::new(data));
    net.register_service(REQUEST_PORTAL, REPLY_PORTAL, service);
    let rec = RecordingNet::wrap(net.clone());
    let rt = RpcRuntime::new(RpcConfig::default(), rec.clone(), client_id());
    RecordingHarness { net, rec, rt }
}

impl RecordingHarness {
    /// Import aimed at the file service.
    pub fn import(&self) -> Arc<Import> {
        self.rt.new_import(
            server_id(),
            REQUEST_PORTAL,
            REPLY_PORTAL,
            ImportConfig::default(),
        )
    }
}
