// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire framing for the half-duplex parent/child pipe.
//!
//! Every integer is little-endian. A per-index stream is:
//! `Header` -> `RepairedBlock`* -> `DeletedBlock`* -> `IndexInfo` -> `Terminator`.
//! Pointer values inside messages are opaque sentinels: the parent looks blocks up
//! by `unique_id`, not by the bytes themselves.

use std::io::{self, Read, Write};

use crate::{ErrorKind, Result};

fn io_err(e: io::Error) -> crate::Error {
    ErrorKind::Io.with_source(e)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Header = 1,
    RepairedBlock = 2,
    DeletedBlock = 3,
    IndexInfo = 4,
    Terminator = 5,
}

impl MessageTag {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Self::Header),
            2 => Ok(Self::RepairedBlock),
            3 => Ok(Self::DeletedBlock),
            4 => Ok(Self::IndexInfo),
            5 => Ok(Self::Terminator),
            other => Err(ErrorKind::Io.with_message(format!("unknown GC pipe message tag {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Header {
    pub unique_id: u64,
    pub cur_ptr: u64,
}

#[derive(Clone, Debug)]
pub struct RepairedBlock {
    pub old_index: u32,
    pub new_index: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct DeletedBlock {
    pub ptr: u64,
    pub old_index: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexInfo {
    pub nblocks_original: u32,
    pub nblocks_repaired: u32,
    pub nbytes_collected: u64,
    pub ndocs_collected: u64,
    pub last_block_docs_removed: u64,
    pub last_block_bytes_collected: u64,
    pub last_block_num_docs: u64,
}

#[derive(Clone, Debug)]
pub enum Message {
    Header(Header),
    RepairedBlock(RepairedBlock),
    DeletedBlock(DeletedBlock),
    IndexInfo(IndexInfo),
    Terminator,
}

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_buffer(w: &mut impl Write, bytes: &[u8]) -> Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes).map_err(io_err)
}

fn read_buffer(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

pub fn send(w: &mut impl Write, msg: &Message) -> Result<()> {
    match msg {
        Message::Header(h) => {
            w.write_all(&[MessageTag::Header as u8]).map_err(io_err)?;
            write_u64(w, h.unique_id)?;
            write_u64(w, h.cur_ptr)?;
        }
        Message::RepairedBlock(b) => {
            w.write_all(&[MessageTag::RepairedBlock as u8]).map_err(io_err)?;
            write_u32(w, b.old_index)?;
            write_u32(w, b.new_index)?;
            write_buffer(w, &b.bytes)?;
        }
        Message::DeletedBlock(b) => {
            w.write_all(&[MessageTag::DeletedBlock as u8]).map_err(io_err)?;
            write_u64(w, b.ptr)?;
            write_u32(w, b.old_index)?;
        }
        Message::IndexInfo(info) => {
            w.write_all(&[MessageTag::IndexInfo as u8]).map_err(io_err)?;
            write_u32(w, info.nblocks_original)?;
            write_u32(w, info.nblocks_repaired)?;
            write_u64(w, info.nbytes_collected)?;
            write_u64(w, info.ndocs_collected)?;
            write_u64(w, info.last_block_docs_removed)?;
            write_u64(w, info.last_block_bytes_collected)?;
            write_u64(w, info.last_block_num_docs)?;
        }
        Message::Terminator => {
            w.write_all(&[MessageTag::Terminator as u8]).map_err(io_err)?;
        }
    }
    Ok(())
}

pub fn recv(r: &mut impl Read) -> Result<Message> {
    let mut tag_buf = [0u8; 1];
    r.read_exact(&mut tag_buf).map_err(io_err)?;
    let tag = MessageTag::from_u8(tag_buf[0])?;
    let msg = match tag {
        MessageTag::Header => Message::Header(Header {
            unique_id: read_u64(r)?,
            cur_ptr: read_u64(r)?,
        }),
        MessageTag::RepairedBlock => Message::RepairedBlock(RepairedBlock {
            old_index: read_u32(r)?,
            new_index: read_u32(r)?,
            bytes: read_buffer(r)?,
        }),
        MessageTag::DeletedBlock => Message::DeletedBlock(DeletedBlock {
            ptr: read_u64(r)?,
            old_index: read_u32(r)?,
        }),
        MessageTag::IndexInfo => Message::IndexInfo(IndexInfo {
            nblocks_original: read_u32(r)?,
            nblocks_repaired: read_u32(r)?,
            nbytes_collected: read_u64(r)?,
            ndocs_collected: read_u64(r)?,
            last_block_docs_removed: read_u64(r)?,
            last_block_bytes_collected: read_u64(r)?,
            last_block_num_docs: read_u64(r)?,
        }),
        MessageTag::Terminator => Message::Terminator,
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_full_per_index_stream() {
        let mut buf = Vec::new();
        let messages = vec![
            Message::Header(Header { unique_id: 7, cur_ptr: 0xdead_beef }),
            Message::RepairedBlock(RepairedBlock { old_index: 0, new_index: 0, bytes: vec![1, 2, 3] }),
            Message::DeletedBlock(DeletedBlock { ptr: 42, old_index: 3 }),
            Message::IndexInfo(IndexInfo { nblocks_original: 5, nblocks_repaired: 1, ..Default::default() }),
            Message::Terminator,
        ];
        for m in &messages {
            send(&mut buf, m).unwrap();
        }

        let mut cursor = io::Cursor::new(buf);
        for expected in &messages {
            let got = recv(&mut cursor).unwrap();
            assert_eq!(format!("{expected:?}"), format!("{got:?}"));
        }
    }

    #[test]
    fn recv_on_truncated_stream_is_an_io_error() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 1).unwrap(); // a lone tag-less u64, not a full message
        let mut cursor = io::Cursor::new(buf);
        let err = recv(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }
}
