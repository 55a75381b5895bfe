//! Message codec: fixed header, buffer-length table, 8-byte rounded regions.
//!
//! A frame is a fixed 56-byte header, a table of `bufcount` u32 region
//! lengths, padding up to an 8-byte boundary, then each region padded to an
//! 8-byte boundary. Frames are emitted little-endian; the decoder also
//! accepts byte-swapped frames from opposite-endian peers, detected by the
//! flipped magic.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Protocol magic, first field of every frame.
pub const MSG_MAGIC: u32 = 0x0BD0_0BD0;

/// Codec version carried in the low bits of the version field.
pub const MSG_VERSION: u32 = 0x0000_0003;

/// High bits of the version field, reserved for the application protocol.
pub const MSG_VERSION_MASK: u32 = 0xffff_0000;

/// Header flag bits.
pub mod flags {
    /// Final replay message of a recovery stream.
    pub const MSG_LAST_REPLAY: u32 = 1;
    /// Retransmission of an earlier send of the same request.
    pub const MSG_RESENT: u32 = 2;
    /// Replay of a request the peer already executed.
    pub const MSG_REPLAY: u32 = 4;
}

/// Wire message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    /// Client-to-server request.
    Request = 4711,
    /// Error reply; status carries the failure.
    Err = 4712,
    /// Normal reply.
    Reply = 4713,
}

impl MsgType {
    /// Parse a raw type field; `None` for anything off-protocol.
    pub fn from_raw(raw: u32) -> Option<MsgType> {
        match raw {
            4711 => Some(MsgType::Request),
            4712 => Some(MsgType::Err),
            4713 => Some(MsgType::Reply),
            _ => None,
        }
    }
}

/// Round up to the codec's 8-byte unit.
pub const fn round8(n: usize) -> usize {
    (n + 7) & !7
}

/// Fixed header bytes before the buffer-length table.
pub const FIXED_HDR_LEN: usize = 56;

/// Header size for a message with `bufcount` regions, including the rounded
/// length table.
pub fn hdr_size(bufcount: usize) -> usize {
    round8(FIXED_HDR_LEN + 4 * bufcount)
}

/// Total frame size for the given region lengths.
pub fn msg_size(lens: &[usize]) -> usize {
    let mut size = hdr_size(lens.len());
    for &len in lens {
        size += round8(len);
    }
    size
}

/// Decoded fixed header.
#[derive(Debug, Clone)]
pub struct MsgHeader {
    /// Protocol magic.
    pub magic: u32,
    /// Codec version in the low bits, application protocol in the high bits.
    pub version: u32,
    /// Raw message type field; see [`MsgHeader::kind`].
    pub msg_type: u32,
    /// Application operation code.
    pub opcode: u32,
    /// Transfer id; replies and bulk transfers match on it.
    pub xid: u64,
    /// Highest transaction the sender has made stable.
    pub last_committed: u64,
    /// Transaction assigned to this operation, replies only.
    pub transno: u64,
    /// Negative errno-style status; see [`crate::error::status`].
    pub status: i32,
    /// Flag bits from [`flags`].
    pub flags: u32,
    /// Connection epoch of the sending import.
    pub conn_cnt: u32,
}

impl MsgHeader {
    /// Typed view of the message type field.
    pub fn kind(&self) -> Option<MsgType> {
        MsgType::from_raw(self.msg_type)
    }

    /// Set flag bits, preserving those already set.
    pub fn add_flags(&mut self, bits: u32) {
        self.flags |= bits;
    }

    /// True when all of `bits` are set.
    pub fn has_flags(&self, bits: u32) -> bool {
        self.flags & bits == bits
    }
}

/// An owned message: header plus payload regions.
#[derive(Debug, Clone)]
pub struct Msg {
    /// Fixed header fields.
    pub hdr: MsgHeader,
    bufs: Vec<Vec<u8>>,
}

impl Msg {
    /// Build a message with zero-filled regions of the given lengths.
    pub fn new(msg_type: MsgType, lens: &[usize]) -> Msg {
        Msg {
            hdr: MsgHeader {
                magic: MSG_MAGIC,
                version: MSG_VERSION,
                msg_type: msg_type as u32,
                opcode: 0,
                xid: 0,
                last_committed: 0,
                transno: 0,
                status: 0,
                flags: 0,
                conn_cnt: 0,
            },
            bufs: lens.iter().map(|&len| vec![0u8; len]).collect(),
        }
    }

    /// Number of payload regions.
    pub fn bufcount(&self) -> usize {
        self.bufs.len()
    }

    /// Length of region `n`; zero for indices past the end.
    pub fn buflen(&self, n: usize) -> usize {
        self.bufs.get(n).map_or(0, Vec::len)
    }

    /// Region `n`, or `None` if absent or shorter than `min_size`.
    pub fn buf(&self, n: usize, min_size: usize) -> Option<&[u8]> {
        match self.bufs.get(n) {
            Some(b) if b.len() >= min_size => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Mutable region `n`.
    pub fn buf_mut(&mut self, n: usize) -> Option<&mut [u8]> {
        self.bufs.get_mut(n).map(Vec::as_mut_slice)
    }

    /// Replace region `n` with `data`, resizing it.
    pub fn set_buf(&mut self, n: usize, data: &[u8]) -> Result<()> {
        match self.bufs.get_mut(n) {
            Some(b) => {
                b.clear();
                b.extend_from_slice(data);
                Ok(())
            }
            None => Err(RpcError::Malformed {
                reason: format!("no buffer {n} in {}-buffer message", self.bufs.len()),
            }),
        }
    }

    /// NUL-terminated string in region `n`.
    ///
    /// With `max_len == 0` the string must exactly fill the region (length
    /// plus terminator); otherwise it may be any length up to `max_len`.
    /// `None` for a missing region, a missing terminator, or a bad size.
    pub fn string(&self, n: usize, max_len: usize) -> Option<&str> {
        let buf = self.buf(n, 0)?;
        let blen = buf.len();
        let slen = buf.iter().position(|&b| b == 0).unwrap_or(blen);
        if slen == blen {
            return None; // not NUL terminated
        }
        if max_len == 0 {
            if slen != blen - 1 {
                return None; // short string in an exact-fit region
            }
        } else if slen > max_len {
            return None;
        }
        std::str::from_utf8(&buf[..slen]).ok()
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        let mut size = hdr_size(self.bufs.len());
        for b in &self.bufs {
            size += round8(b.len());
        }
        size
    }

    /// Encode to a little-endian frame.
    pub fn encode(&self) -> Bytes {
        let total = self.encoded_len();
        let mut out = BytesMut::with_capacity(total);
        out.put_u32_le(self.hdr.magic);
        out.put_u32_le(self.hdr.version);
        out.put_u32_le(self.hdr.msg_type);
        out.put_u32_le(self.hdr.opcode);
        out.put_u64_le(self.hdr.xid);
        out.put_u64_le(self.hdr.last_committed);
        out.put_u64_le(self.hdr.transno);
        out.put_i32_le(self.hdr.status);
        out.put_u32_le(self.hdr.flags);
        out.put_u32_le(self.hdr.conn_cnt);
        out.put_u32_le(self.bufs.len() as u32);
        for b in &self.bufs {
            out.put_u32_le(b.len() as u32);
        }
        out.resize(hdr_size(self.bufs.len()), 0);
        for b in &self.bufs {
            out.extend_from_slice(b);
            out.resize(round8(out.len()), 0);
        }
        debug_assert_eq!(out.len(), total);
        out.freeze()
    }

    /// Decode a frame, validating magic and version before anything else and
    /// the full length table before touching any region.
    ///
    /// Trailing bytes past the declared regions are tolerated.
    pub fn decode(frame: &[u8]) -> Result<Msg> {
        if frame.len() < 8 {
            return Err(RpcError::Truncated {
                len: frame.len(),
                need: 8,
            });
        }
        let raw_magic = read_u32(frame, 0, false);
        let flipped = if raw_magic == MSG_MAGIC {
            false
        } else if raw_magic.swap_bytes() == MSG_MAGIC {
            true
        } else {
            return Err(RpcError::BadMagic { got: raw_magic });
        };
        let version = read_u32(frame, 4, flipped);
        if version & !MSG_VERSION_MASK != MSG_VERSION {
            return Err(RpcError::BadVersion { got: version });
        }
        if frame.len() < hdr_size(0) {
            return Err(RpcError::Truncated {
                len: frame.len(),
                need: hdr_size(0),
            });
        }
        let hdr = MsgHeader {
            magic: MSG_MAGIC,
            version,
            msg_type: read_u32(frame, 8, flipped),
            opcode: read_u32(frame, 12, flipped),
            xid: read_u64(frame, 16, flipped),
            last_committed: read_u64(frame, 24, flipped),
            transno: read_u64(frame, 32, flipped),
            status: read_u32(frame, 40, flipped) as i32,
            flags: read_u32(frame, 44, flipped),
            conn_cnt: read_u32(frame, 48, flipped),
        };
        let bufcount = read_u32(frame, 52, flipped) as usize;
        let table_end = hdr_size(bufcount);
        if frame.len() < table_end {
            return Err(RpcError::Truncated {
                len: frame.len(),
                need: table_end,
            });
        }
        let mut lens = Vec::with_capacity(bufcount);
        let mut need = table_end;
        for i in 0..bufcount {
            let len = read_u32(frame, FIXED_HDR_LEN + 4 * i, flipped) as usize;
            need = need
                .checked_add(round8(len))
                .ok_or_else(|| RpcError::Malformed {
                    reason: "buffer length overflow".into(),
                })?;
            lens.push(len);
        }
        if frame.len() < need {
            return Err(RpcError::Truncated {
                len: frame.len(),
                need,
            });
        }
        let mut bufs = Vec::with_capacity(bufcount);
        let mut offset = table_end;
        for len in lens {
            bufs.push(frame[offset..offset + len].to_vec());
            offset += round8(len);
        }
        Ok(Msg { hdr, bufs })
    }
}

fn read_u32(frame: &[u8], at: usize, flipped: bool) -> u32 {
    let raw = u32::from_le_bytes(frame[at..at + 4].try_into().unwrap());
    if flipped {
        raw.swap_bytes()
    } else {
        raw
    }
}

fn read_u64(frame: &[u8], at: usize, flipped: bool) -> u64 {
    let raw = u64::from_le_bytes(frame[at..at + 8].try_into().unwrap());
    if flipped {
        raw.swap_bytes()
    } else {
        raw
    }
}
