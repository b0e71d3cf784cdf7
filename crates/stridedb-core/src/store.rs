//! Key and value stores
//!
//! KeyStore maps node ids to fixed-size blocks of the key file; an id is the
//! block's byte offset, and allocation is a monotonic bump of the file-size
//! cursor. Nodes are allocated in memory first and only reach disk when a
//! flush commits them, so the cursor can run ahead of the file.
//!
//! ValueStore is an append-only log of `u32 length ‖ key ‖ value` records
//! (the length covers all three fields). Records are never rewritten or
//! compacted; overwritten and evicted keys leave their old records behind,
//! so a linear scan may yield several values for one key, in insertion order.

use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::blockfile::BlockFile;
use crate::error::{StrideError, StrideResult};
use crate::key::Key;
use crate::node::Node;

/// Bytes of record framing before the value bytes: the u32 length prefix and
/// the key.
pub const VALUE_RECORD_HEADER: usize = mem::size_of::<u32>() + Key::BYTES;

/// Largest value that still fits a record with a u32 total length.
pub const MAX_VALUE_LEN: usize = u32::MAX as usize - VALUE_RECORD_HEADER;

pub struct KeyStore {
    block_size: u32,
    degree: u32,
    file: BlockFile,
    size: AtomicU64,
}

impl KeyStore {
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> StrideResult<Self> {
        let file = BlockFile::open(path)?;
        let size = file.size();
        Ok(Self {
            block_size,
            degree: Node::calculate_degree(block_size),
            file,
            size: AtomicU64::new(size),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// Allocation cursor; runs ahead of the file until pending nodes commit.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Allocates the next block id and builds an empty in-memory node for it.
    /// Nothing is written until `set`.
    pub fn new_node(&self, level: u32, first: Key, last: Key) -> Node {
        let id = self.size.fetch_add(self.block_size as u64, Ordering::AcqRel);
        Node::new(id, level, self.degree, first, last)
    }

    pub fn get(&self, id: u64) -> StrideResult<Node> {
        let mut buf = vec![0u8; self.block_size as usize];
        let n = self.file.read_at(id, &mut buf)?;
        if n == 0 {
            return Err(StrideError::KeyNotFound);
        }
        if n < self.block_size as usize {
            return Err(StrideError::ShortRead {
                path: self.file.path().to_path_buf(),
                offset: id,
                expected: self.block_size as usize,
                actual: n,
            });
        }
        Node::deserialize(id, self.degree, &buf)
    }

    pub fn set(&self, node: &Node) -> StrideResult<()> {
        let mut buf = vec![0u8; self.block_size as usize];
        node.serialize(&mut buf)?;
        self.file.write_at(node.id(), &buf)
    }

    pub fn clear(&self) -> StrideResult<()> {
        self.file.truncate()?;
        self.size.store(0, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> StrideResult<()> {
        self.file.sync()
    }
}

pub struct ValueStore {
    file: BlockFile,
}

impl ValueStore {
    /// Scan chunk for `each`; grown on demand when a record is larger.
    const SCAN_CHUNK: usize = 64 * 1024;

    pub fn open<P: AsRef<Path>>(path: P) -> StrideResult<Self> {
        Ok(Self {
            file: BlockFile::open(path)?,
        })
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Reads the value bytes of the record at `offset` with on-disk length
    /// `length`.
    pub fn get(&self, offset: u64, length: u32) -> StrideResult<Vec<u8>> {
        let length = length as usize;
        assert!(length > VALUE_RECORD_HEADER, "value record too short to hold a value");
        if offset + length as u64 > self.file.size() {
            return Err(StrideError::ValueNotFound {
                offset,
                length: length as u32,
            });
        }
        let payload = length - VALUE_RECORD_HEADER;
        let mut buf = vec![0u8; payload];
        let n = self
            .file
            .read_at(offset + VALUE_RECORD_HEADER as u64, &mut buf)?;
        if n < payload {
            return Err(StrideError::ShortRead {
                path: self.file.path().to_path_buf(),
                offset: offset + VALUE_RECORD_HEADER as u64,
                expected: payload,
                actual: n,
            });
        }
        Ok(buf)
    }

    /// Appends pre-framed record bytes produced by the staging buffer. Only
    /// the flush thread appends.
    pub fn append(&self, buf: &[u8]) -> StrideResult<()> {
        self.file.append(buf)
    }

    /// Linearly scans the log, invoking `f(key_bytes, value_bytes)` for every
    /// record in insertion order. A truncated trailing record (a crash
    /// between value append and node commit) ends the scan cleanly.
    pub fn each<F>(&self, mut f: F) -> StrideResult<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let size = self.file.size();
        let mut buf = vec![0u8; Self::SCAN_CHUNK];
        let mut file_pos = 0u64;

        while file_pos < size {
            let read = self.file.read_at(file_pos, &mut buf)?;
            let mut pos = 0usize;
            let mut progressed = false;

            while pos + mem::size_of::<u32>() <= read {
                let length = LittleEndian::read_u32(&buf[pos..]) as usize;
                if length <= VALUE_RECORD_HEADER {
                    // Not a possible record; treat as a torn tail.
                    return Ok(());
                }
                if pos + length > read {
                    break;
                }
                let key = &buf[pos + mem::size_of::<u32>()..pos + mem::size_of::<u32>() + Key::BYTES];
                let value = &buf[pos + VALUE_RECORD_HEADER..pos + length];
                f(key, value);
                pos += length;
                file_pos += length as u64;
                progressed = true;
            }

            if !progressed {
                // The chunk holds no complete record. Either the record is
                // larger than the chunk (grow and retry) or the log ends in a
                // torn record (stop).
                if read >= mem::size_of::<u32>() {
                    let length = LittleEndian::read_u32(&buf) as usize;
                    if length > buf.len() && file_pos + length as u64 <= size {
                        buf.resize(length, 0);
                        continue;
                    }
                }
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> StrideResult<()> {
        self.file.truncate()
    }

    pub fn sync(&self) -> StrideResult<()> {
        self.file.sync()
    }
}
