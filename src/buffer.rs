//! Reference-counted packet buffers.
//!
//! A [`Pbuf`] is a chain of [`Chunk`]s. Chunks are shared immutably between
//! the TCP queues and the lower layers by cloning, which bumps the reference
//! count of the underlying storage. TCP only ever mutates a chunk it holds
//! exclusively, and uses [`Pbuf::is_shared`] to tell whether a buffer it handed
//! to IP is still sitting in a transmit queue.
//!
//! Every chunk is carved out of a [`PbufPool`], a byte budget shared by all
//! users of a stack. Running out of budget is how allocation failure shows up
//! in this crate.

use std::collections::VecDeque;

mod chunk;
pub use chunk::Chunk;

mod pool;
pub use pool::{AllocError, PbufPool};

/// A chain of buffer chunks holding (part of) a packet.
#[derive(Debug, Clone, Default)]
pub struct Pbuf {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Pbuf {
    /// Creates an empty buffer chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain holding a single chunk.
    pub fn from_chunk(chunk: Chunk) -> Self {
        let mut pbuf = Self::new();
        pbuf.push_back(chunk);
        pbuf
    }

    /// Prepends a header chunk.
    pub fn header(&mut self, header: Chunk) {
        self.len += header.len();
        self.chunks.push_front(header);
    }

    /// Appends a chunk to the end of the chain.
    pub fn push_back(&mut self, chunk: Chunk) {
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Adds the given chain to the end of this one.
    pub fn chain(&mut self, other: Pbuf) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Drops the first `len` bytes of the chain.
    pub fn remove_front(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while let Some(head) = self.chunks.front_mut() {
            let head_len = head.len();
            if head_len <= to_remove {
                to_remove -= head_len;
                self.chunks.pop_front();
            } else {
                head.advance(to_remove);
                break;
            }
        }
    }

    /// Appends as many bytes of `data` as fit into the spare capacity of the
    /// last chunk, without allocating. Only possible while the chain holds
    /// that chunk exclusively. Returns the number of bytes appended.
    pub fn extend_in_place(&mut self, data: &[u8]) -> usize {
        let appended = match self.chunks.back_mut() {
            Some(last) => last.extend_in_place(data),
            None => 0,
        };
        self.len += appended;
        appended
    }

    /// The number of bytes the last chunk can still take in place.
    pub fn spare_capacity(&self) -> usize {
        self.chunks.back().map_or(0, Chunk::spare_capacity)
    }

    /// The total length of the chain in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chain holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of chunks in the chain.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The highest reference count of any chunk in the chain, or zero for an
    /// empty chain.
    pub fn ref_count(&self) -> usize {
        self.chunks.iter().map(Chunk::ref_count).max().unwrap_or(0)
    }

    /// Whether any chunk is also referenced from outside this chain.
    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// The chunks making up this chain.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Iterates over the bytes of the entire chain.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.as_slice().iter().copied())
    }

    /// Copies the chain into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.iter().collect()
    }
}

impl PartialEq for Pbuf {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Pbuf {}
