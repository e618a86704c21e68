// Copyright 2024 Oxide Computer Company
use std::sync::Arc;

use bytes::BytesMut;

use replicore_protocol::{BlockMeta, Header, Opcode};

use crate::volume::VolumeInfo;

/// One request/response unit moving through the dispatch pipeline.
///
/// A command owns its payload buffer and holds a counted reference to its
/// volume; the volume never points back except through the completion
/// queue, which owns queued commands outright.
#[derive(Debug)]
pub struct Command {
    pub header: Header,
    pub payload: BytesMut,
    /// Per-extent metadata collected by a READ, in store order.
    pub metadata: Vec<BlockMeta>,
    pub volume: Arc<VolumeInfo>,
    /// Id of the connection the command arrived on; completions for a
    /// dead connection are discarded by matching on this.
    pub conn: u64,
}

impl Command {
    /// Allocates a command, sizing the payload buffer for the opcodes
    /// that own one (READ's reply data, WRITE's records, OPEN's payload).
    pub fn new(header: Header, volume: Arc<VolumeInfo>, conn: u64) -> Command {
        let payload = match header.opcode {
            Opcode::Read | Opcode::Write | Opcode::Open => {
                BytesMut::zeroed(header.len as usize)
            }
            _ => BytesMut::new(),
        };
        Command {
            header,
            payload,
            metadata: Vec::new(),
            volume,
            conn,
        }
    }

    /// Wraps a payload received off the wire.
    pub fn with_payload(
        header: Header,
        volume: Arc<VolumeInfo>,
        conn: u64,
        payload: BytesMut,
    ) -> Command {
        Command {
            header,
            payload,
            metadata: Vec::new(),
            volume,
            conn,
        }
    }
}
