use super::pool::Block;
use std::sync::Arc;

/// A piece of a [`Pbuf`](super::Pbuf), either a header or a run of payload
/// bytes. Cloning a chunk shares the storage and raises its reference count.
#[derive(Debug, Clone)]
pub struct Chunk {
    start: usize,
    end: usize,
    block: Arc<Block>,
}

impl Chunk {
    pub(super) fn new(block: Block) -> Self {
        Self {
            start: 0,
            end: block.data.len(),
            block: Arc::new(block),
        }
    }

    /// Returns the visible bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.block.data[self.start..self.end]
    }

    /// The number of visible bytes in the chunk.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many holders the underlying storage has.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }

    /// Bytes that could still be appended without reallocating. Zero unless
    /// this chunk ends at the end of its storage.
    pub fn spare_capacity(&self) -> usize {
        if self.end == self.block.data.len() {
            self.block.reserved - self.block.data.len()
        } else {
            0
        }
    }

    pub(super) fn advance(&mut self, len: usize) {
        assert!(len <= self.len());
        self.start += len;
    }

    pub(super) fn extend_in_place(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.spare_capacity());
        if take == 0 {
            return 0;
        }
        match Arc::get_mut(&mut self.block) {
            Some(block) => {
                block.data.extend_from_slice(&data[..take]);
                self.end += take;
                take
            }
            None => 0,
        }
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice().eq(other.as_slice())
    }
}

impl Eq for Chunk {}
