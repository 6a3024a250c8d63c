//! Mini-transaction local redo buffer.

/// Capacity of one log buffer block.
pub const LOG_BUFFER_BLOCK_SIZE: usize = 512;

#[derive(Debug)]
struct LogBlock {
    data: Vec<u8>,
}

impl LogBlock {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(LOG_BUFFER_BLOCK_SIZE),
        }
    }

    fn remaining(&self) -> usize {
        LOG_BUFFER_BLOCK_SIZE - self.data.len()
    }
}

/// Append-only byte sequence stored as a chain of fixed-capacity blocks.
///
/// Appends never move earlier bytes, and the blocks can be copied out in
/// order without first flattening the buffer.
#[derive(Debug)]
pub struct LogBuffer {
    blocks: Vec<LogBlock>,
    len: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            blocks: vec![LogBlock::new()],
            len: 0,
        }
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.tail().remaining() == 0 {
                self.blocks.push(LogBlock::new());
            }
            let tail = self.tail();
            let n = tail.remaining().min(bytes.len());
            tail.data.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            self.len += n;
        }
    }

    fn tail(&mut self) -> &mut LogBlock {
        // `blocks` is never empty.
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if every byte lives in the first block.
    pub fn is_single_block(&self) -> bool {
        self.blocks.len() == 1
    }

    /// Used bytes of each block, first to last.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks
            .iter()
            .map(|b| b.data.as_slice())
            .filter(|d| !d.is_empty())
    }

    pub fn byte_at(&self, pos: usize) -> Option<u8> {
        let (block, offset) = self.locate(pos)?;
        Some(self.blocks[block].data[offset])
    }

    /// Mutable access to the byte at `pos`, for patching a type byte in place.
    pub fn byte_at_mut(&mut self, pos: usize) -> Option<&mut u8> {
        let (block, offset) = self.locate(pos)?;
        Some(&mut self.blocks[block].data[offset])
    }

    fn locate(&self, pos: usize) -> Option<(usize, usize)> {
        if pos >= self.len {
            return None;
        }
        // Every block but the last is full.
        Some((pos / LOG_BUFFER_BLOCK_SIZE, pos % LOG_BUFFER_BLOCK_SIZE))
    }

    /// Drop every byte from `len` on.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let keep_blocks = len.div_ceil(LOG_BUFFER_BLOCK_SIZE).max(1);
        self.blocks.truncate(keep_blocks);
        let tail_len = len - (keep_blocks - 1) * LOG_BUFFER_BLOCK_SIZE;
        self.tail().data.truncate(tail_len);
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.blocks.truncate(1);
        self.blocks[0].data.clear();
        self.len = 0;
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in self.blocks() {
            out.extend_from_slice(block);
        }
        out
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
