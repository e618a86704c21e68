// Copyright 2024 Oxide Computer Company

//! Wire protocol between replicas and their peers.
//!
//! Every frame starts with a fixed-layout little-endian header.  The two
//! version bytes come first so a receiver can refuse a peer speaking the
//! wrong protocol before consuming anything else from the stream.  Some
//! opcodes are followed by a payload whose length the header carries; see
//! [`Header::wire_payload_len`] for the exact rule.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use replicore_common::ReplicaError;

/// Largest frame payload we will accept or produce.  A peer that claims
/// more is framed wrong and loses its connection.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024; // 100M

/// Replica data protocol version.  A header whose version prefix does not
/// match is rejected before the rest of the header is read.
pub const REPLICA_VERSION: u16 = 1;

/// Encoded header size: version(2) opcode(1) flags(1) status(1) pad(3)
/// io_seq(8) offset(8) len(8) checkpointed_io_seq(8) meta_len(8).
pub const HEADER_LEN: usize = 48;

/// Flag bit: this command belongs to a rebuild transfer.  Writes carrying
/// it are applied without an acknowledgement.
pub const FLAG_REBUILD: u8 = 0x01;

/// Flag bit: the caller wants per-block metadata back with READ data.
pub const FLAG_READ_METADATA: u8 = 0x02;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0,
    Open = 1,
    Read = 2,
    Write = 3,
    Sync = 4,
    RebuildStep = 5,
    RebuildStepDone = 6,
    RebuildComplete = 7,
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum OpStatus {
    Ok = 0,
    Failed = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub opcode: Opcode,
    pub flags: u8,
    pub status: OpStatus,
    /// Per-write monotonic sequence; meaningful on write records and on
    /// rebuild READ frames.
    pub io_seq: u64,
    /// Byte offset into the volume.
    pub offset: u64,
    /// Payload length, read size, or rebuild step size depending on opcode.
    pub len: u64,
    /// Recipient's durable io number, sent to the donor on REBUILD_STEP.
    pub checkpointed_io_seq: u64,
    /// Aggregate byte length of the metadata triples trailing a READ reply.
    pub meta_len: u64,
}

impl Header {
    pub fn new(opcode: Opcode) -> Header {
        Header {
            version: REPLICA_VERSION,
            opcode,
            flags: 0,
            status: OpStatus::Ok,
            io_seq: 0,
            offset: 0,
            len: 0,
            checkpointed_io_seq: 0,
            meta_len: 0,
        }
    }

    pub fn is_rebuild(&self) -> bool {
        self.flags & FLAG_REBUILD != 0
    }

    pub fn wants_metadata(&self) -> bool {
        self.flags & FLAG_READ_METADATA != 0
    }

    /// Number of payload bytes that follow this header on the wire.
    ///
    /// HANDSHAKE, OPEN and WRITE always carry `len` bytes.  A READ frame
    /// carries data only in the rebuild direction (donor to recipient); a
    /// plain READ request's `len` names the read size, not a payload.
    pub fn wire_payload_len(&self) -> usize {
        match self.opcode {
            Opcode::Handshake | Opcode::Open | Opcode::Write => {
                self.len as usize
            }
            Opcode::Read if self.is_rebuild() => self.len as usize,
            _ => 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u16_le(self.version);
        dst.put_u8(self.opcode.into());
        dst.put_u8(self.flags);
        dst.put_u8(self.status.into());
        dst.put_bytes(0, 3);
        dst.put_u64_le(self.io_seq);
        dst.put_u64_le(self.offset);
        dst.put_u64_le(self.len);
        dst.put_u64_le(self.checkpointed_io_seq);
        dst.put_u64_le(self.meta_len);
    }

    /// Parses a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Header, anyhow::Error> {
        assert!(buf.len() >= HEADER_LEN);
        let version = buf.get_u16_le();
        if version != REPLICA_VERSION {
            bail!(ReplicaError::BadVersion(version));
        }
        let opcode = buf.get_u8();
        let opcode = Opcode::try_from(opcode)
            .map_err(|_| ReplicaError::Protocol(format!(
                "unknown opcode {}",
                opcode
            )))?;
        let flags = buf.get_u8();
        let status = buf.get_u8();
        let status = OpStatus::try_from(status)
            .map_err(|_| ReplicaError::Protocol(format!(
                "unknown status {}",
                status
            )))?;
        buf.advance(3);
        Ok(Header {
            version,
            opcode,
            flags,
            status,
            io_seq: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            len: buf.get_u64_le(),
            checkpointed_io_seq: buf.get_u64_le(),
            meta_len: buf.get_u64_le(),
        })
    }
}

/// One decoded frame: a header plus whatever payload the wire carried for
/// it (empty for header-only opcodes).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: BytesMut,
}

/// Incremental frame decoder for use with `FramedRead`.
///
/// The version prefix is checked as soon as two bytes are buffered, so a
/// peer speaking the wrong protocol is cut off before the rest of its
/// header is consumed.
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {}
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let version = u16::from_le_bytes([src[0], src[1]]);
        if version != REPLICA_VERSION {
            bail!(ReplicaError::BadVersion(version));
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        // Parse without consuming so partial payloads leave the buffer
        // intact for the next pass.
        let header = Header::decode(&src[..HEADER_LEN])?;
        let plen = header.wire_payload_len();
        if plen > MAX_FRAME_LEN {
            bail!(
                "frame payload is {} bytes, more than maximum {}",
                plen,
                MAX_FRAME_LEN
            );
        }
        // A READ request's len sizes the reply buffer; cap it the same way.
        if header.opcode == Opcode::Read
            && header.len as usize > MAX_FRAME_LEN
        {
            bail!(
                "read of {} bytes is more than maximum {}",
                header.len,
                MAX_FRAME_LEN
            );
        }

        if src.len() < HEADER_LEN + plen {
            src.reserve(HEADER_LEN + plen - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(plen);
        Ok(Some(Frame { header, payload }))
    }
}

/// Write side of a connection: encodes headers and payloads into a scratch
/// buffer and writes them out whole.
pub struct FrameWriter<W> {
    writer: W,
    scratch: BytesMut,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + std::marker::Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Sends a header-only frame.
    pub async fn send_header(
        &mut self,
        header: &Header,
    ) -> Result<(), ReplicaError> {
        self.scratch.clear();
        header.encode(&mut self.scratch);
        self.writer.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Sends a header followed by its payload.
    pub async fn send(
        &mut self,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), ReplicaError> {
        debug_assert_eq!(header.len as usize, payload.len());
        self.scratch.clear();
        header.encode(&mut self.scratch);
        self.writer.write_all(&self.scratch).await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }

    /// Sends a READ reply: header, data, then the metadata triples whose
    /// aggregate length the header's `meta_len` carries.
    pub async fn send_reply(
        &mut self,
        header: &Header,
        data: &[u8],
        metadata: &[BlockMeta],
    ) -> Result<(), ReplicaError> {
        debug_assert_eq!(
            header.meta_len as usize,
            metadata.len() * BLOCK_META_LEN
        );
        self.scratch.clear();
        header.encode(&mut self.scratch);
        self.writer.write_all(&self.scratch).await?;
        self.writer.write_all(data).await?;
        if !metadata.is_empty() {
            self.scratch.clear();
            for m in metadata {
                m.encode(&mut self.scratch);
            }
            self.writer.write_all(&self.scratch).await?;
        }
        Ok(())
    }
}

/// Encoded size of one [`BlockMeta`] triple.
pub const BLOCK_META_LEN: usize = 24;

/// Per-block metadata returned with READ data: which io number last wrote
/// each byte range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: u64,
    pub len: u64,
    pub io_num: u64,
}

impl BlockMeta {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(BLOCK_META_LEN);
        dst.put_u64_le(self.offset);
        dst.put_u64_le(self.len);
        dst.put_u64_le(self.io_num);
    }

    pub fn decode(buf: &mut impl Buf) -> BlockMeta {
        BlockMeta {
            offset: buf.get_u64_le(),
            len: buf.get_u64_le(),
            io_num: buf.get_u64_le(),
        }
    }
}

/// Encoded size of one write record header.
pub const RW_HEADER_LEN: usize = 16;

/// Header of one record inside a WRITE payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RwHeader {
    pub io_num: u64,
    pub len: u64,
}

impl RwHeader {
    pub fn decode(buf: &mut impl Buf) -> RwHeader {
        RwHeader {
            io_num: buf.get_u64_le(),
            len: buf.get_u64_le(),
        }
    }
}

/// Appends one `{rw_header, data}` record to a WRITE (or rebuild data)
/// payload under construction.
pub fn encode_write_record(dst: &mut BytesMut, io_num: u64, data: &[u8]) {
    dst.reserve(RW_HEADER_LEN + data.len());
    dst.put_u64_le(io_num);
    dst.put_u64_le(data.len() as u64);
    dst.put_slice(data);
}

/// Walks the `{rw_header, data}` records of a WRITE payload.
///
/// A tail shorter than a record header, or a record claiming more data
/// than remains, ends the walk with an error; the iterator yields nothing
/// further after that.
pub struct WriteRecords<'a> {
    rest: &'a [u8],
}

impl<'a> WriteRecords<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        WriteRecords { rest: payload }
    }
}

impl<'a> Iterator for WriteRecords<'a> {
    type Item = Result<(RwHeader, &'a [u8]), ReplicaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < RW_HEADER_LEN {
            self.rest = &[];
            return Some(Err(ReplicaError::BadWritePayload));
        }
        let mut buf = self.rest;
        let rw = RwHeader::decode(&mut buf);
        if (buf.len() as u64) < rw.len {
            self.rest = &[];
            return Some(Err(ReplicaError::BadWritePayload));
        }
        let (data, rest) = buf.split_at(rw.len as usize);
        self.rest = rest;
        Some(Ok((rw, data)))
    }
}
