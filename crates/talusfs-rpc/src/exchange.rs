//! Simple typed exchanges and server bulk routines.
//!
//! Most operations are a one-buffer typed request answered by a one-buffer
//! typed reply, with any real data moving as bulk beside them. The helpers
//! here pack and unpack those bodies with `bincode` and run the server side
//! of a bulk transfer with its full wait-abort-reply discipline, so service
//! handlers stay a few lines long.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bulk::{BulkDesc, BulkIo, BulkRole};
use crate::error::{status, Result, RpcError};
use crate::import::Import;
use crate::request::Request;
use crate::runtime::RpcRuntime;
use crate::service::IncomingRequest;
use crate::wire::Msg;

/// Build a request whose single region carries the encoding of `body`,
/// declaring a single-region reply of up to `replen` bytes.
pub fn typed_request<Q: Serialize>(
    rt: &Arc<RpcRuntime>,
    import: &Arc<Import>,
    version: u32,
    opcode: u32,
    body: &Q,
    replen: usize,
) -> Result<Request> {
    let encoded = encode_body(body)?;
    let mut req = rt.new_request(import, version, opcode, &[encoded.len()], &[replen]);
    req.reqmsg.set_buf(0, &encoded)?;
    Ok(req)
}

/// Send `req`, wait for completion, and decode the typed reply body.
/// A non-zero application status surfaces as an error instead.
pub async fn wait_typed<P: DeserializeOwned>(req: &mut Request) -> Result<P> {
    let rc = req.queue_wait().await?;
    if rc != 0 {
        return Err(RpcError::Remote { status: rc });
    }
    let msg = req.reply().ok_or_else(|| RpcError::Malformed {
        reason: "completed request has no reply message".into(),
    })?;
    typed_body(msg)
}

/// Decode a typed body from region 0 of `msg`.
pub fn typed_body<P: DeserializeOwned>(msg: &Msg) -> Result<P> {
    let buf = msg.buf(0, 0).ok_or_else(|| RpcError::Malformed {
        reason: "message missing its body region".into(),
    })?;
    bincode::deserialize(buf).map_err(|e| RpcError::Body(e.to_string()))
}

/// Pack `body` as the single-region reply of an incoming request.
pub fn pack_typed_reply<P: Serialize>(req: &mut IncomingRequest, body: &P) -> Result<()> {
    let encoded = encode_body(body)?;
    req.pack_reply(&[encoded.len()])?;
    req.reply_mut().set_buf(0, &encoded)?;
    Ok(())
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    bincode::serialize(body).map_err(|e| RpcError::Body(e.to_string()))
}

/// Expose `frags` beside `req` for the server to pull. The write path.
pub fn attach_pull_source(req: &mut Request, portal: u32, frags: Vec<Bytes>) {
    req.attach_bulk(BulkRole::GetSource, portal, BulkIo::Source(frags));
}

/// Expose receive capacity beside `req` for data the server will push.
/// The read path.
pub fn attach_push_sink(req: &mut Request, portal: u32, capacities: Vec<usize>) {
    req.attach_bulk(BulkRole::PutSink, portal, BulkIo::Sink(capacities));
}

/// Pull the data a client exposed beside `req`. On success the delivered
/// fragments come back and the handler still owes a reply.
///
/// Failures follow the server bulk discipline: an error reply goes out
/// only for local faults; communication failures are left for the
/// client's retransmit machinery, which gets no reply at all.
pub async fn server_bulk_pull(
    req: &mut IncomingRequest,
    portal: u32,
    capacities: Vec<usize>,
) -> Result<Vec<Bytes>> {
    let mut desc = req.prep_bulk(BulkRole::GetSink, portal, BulkIo::Sink(capacities));
    let rc = drive_server_bulk(req, &mut desc).await;
    if rc != 0 {
        return comm_failure(req, rc);
    }
    match desc.take_received() {
        Some(frags) => {
            info!(
                xid = req.xid(),
                nob = desc.nob_transferred(),
                fragments = frags.len(),
                "pulled bulk data"
            );
            Ok(frags)
        }
        None => {
            // The transfer reported success but delivered nothing. That is
            // a local fault, so the client gets told instead of retrying.
            error!(xid = req.xid(), "bulk pull completed without data");
            req.set_status(status::EIO);
            if let Err(e) = req.error_reply().await {
                warn!(xid = req.xid(), error = %e, "error reply failed");
            }
            Err(RpcError::from_status(status::EIO))
        }
    }
}

/// Push `data` into the receive memory a client exposed beside `req`.
/// Returns the bytes moved; the handler still owes a reply. Failure
/// handling matches [`server_bulk_pull`].
pub async fn server_bulk_push(
    req: &mut IncomingRequest,
    portal: u32,
    data: Vec<Bytes>,
) -> Result<usize> {
    let mut desc = req.prep_bulk(BulkRole::PutSource, portal, BulkIo::Source(data));
    let rc = drive_server_bulk(req, &mut desc).await;
    if rc != 0 {
        return comm_failure(req, rc);
    }
    info!(xid = req.xid(), nob = desc.nob_transferred(), "pushed bulk data");
    Ok(desc.nob_transferred())
}

/// Start a server transfer and wait it out: zero on a complete transfer,
/// otherwise not-connected for an eviction (before or during) and
/// timed-out for everything else.
async fn drive_server_bulk(req: &IncomingRequest, desc: &mut BulkDesc) -> i32 {
    let export = Arc::clone(req.export());
    // Eviction during an earlier transfer makes this one pointless.
    if export.is_failed() {
        warn!(xid = req.xid(), peer = %req.peer(), "bulk against evicted peer");
        return status::ENOTCONN;
    }
    let net = Arc::clone(req.net());
    let self_id = req.self_id();
    let limit = req.config().server_bulk_timeout;
    let diagnostic = req.config().diagnostic_timeout;

    desc.start(net.as_ref(), self_id).await;
    let settled = desc.wait_settled(limit, || export.is_failed()).await;
    if !settled {
        error!(xid = req.xid(), "timeout on server bulk");
        desc.abort(net.as_ref(), diagnostic).await;
        return status::ETIMEDOUT;
    }
    if export.is_failed() {
        warn!(xid = req.xid(), "eviction during server bulk");
        desc.abort(net.as_ref(), diagnostic).await;
        return status::ENOTCONN;
    }
    if !desc.is_success() || desc.nob_transferred() != desc.nob() {
        error!(
            xid = req.xid(),
            moved = desc.nob_transferred(),
            expected = desc.nob(),
            partial = desc.is_success(),
            "server bulk failed"
        );
        return status::ETIMEDOUT;
    }
    0
}

fn comm_failure<T>(req: &mut IncomingRequest, rc: i32) -> Result<T> {
    warn!(
        xid = req.xid(),
        peer = %req.peer(),
        rc,
        "ignoring bulk comm error; client will retry"
    );
    req.suppress_reply();
    Err(RpcError::from_status(rc))
}
