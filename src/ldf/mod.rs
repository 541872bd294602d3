//! HRIBF list-data-format (.ldf) buffer codec
//!
//! File structure:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  DIR buffer   (buffer count patched     │
//! │               at close)                 │
//! ├─────────────────────────────────────────┤
//! │  HEAD buffer  (facility, format, date,  │
//! │               title, run number)        │
//! ├─────────────────────────────────────────┤
//! │  DATA buffer 1                          │
//! │  - (DATA, 8192)                         │
//! │  - chunk: bytes, total, index, payload, │
//! │           0xFFFFFFFF                    │
//! │  - spill footer: 20, total, last, 2,    │
//! │           9999, 0xFFFFFFFF              │
//! │  - 0xFFFFFFFF padding                   │
//! ├─────────────────────────────────────────┤
//! │  ...                                    │
//! ├─────────────────────────────────────────┤
//! │  EOF buffer   (end of run)              │
//! │  EOF buffer   (physical end of file)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every buffer is `buffer_words` 32-bit little-endian words long and starts
//! with a `(kind, declared_size)` pair. A spill that does not fit in the
//! remaining space of a buffer is split into chunks which continue in the
//! next DATA buffer.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{BufferKind, DirBuffer, HeadBuffer};
pub use reader::{LdfReader, ReaderStats, Spill, SpillRead};
pub use writer::{next_file_name, LdfWriter, OutputFile, WriterStats};

use thiserror::Error;

/// Physical size of one buffer in 32-bit words
pub const ACTUAL_BUFF_SIZE: usize = 8194;

/// Sentinel word terminating chunks, spills and buffers
pub const ENDBUFF: u32 = 0xFFFF_FFFF;

/// Declared size of the spill footer chunk in bytes (5 words)
pub const SPILL_FOOTER_BYTES: u32 = 20;

/// Fixed marker words carried by every spill footer
pub const FOOTER_MARKERS: [u32; 2] = [2, 9999];

/// Words in a chunk sub-header (bytes, total chunks, chunk index)
pub const CHUNK_HEADER_WORDS: usize = 3;

/// Smallest payload worth opening a chunk for; less space than this rolls
/// over to a fresh buffer
pub const MIN_CHUNK_PAYLOAD: usize = 1;

/// Buffer geometry
///
/// The on-disk format always uses [`ACTUAL_BUFF_SIZE`]. Smaller layouts exist
/// so that buffer rollover can be exercised with small spills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Physical buffer size in words, including the two header words
    pub buffer_words: usize,
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self {
            buffer_words: ACTUAL_BUFF_SIZE,
        }
    }
}

impl BufferLayout {
    /// Create a layout with the given physical buffer size
    ///
    /// The smallest usable buffer holds the two header words plus a spill
    /// footer (6 words).
    pub fn new(buffer_words: usize) -> Result<Self, LdfError> {
        if buffer_words < 8 {
            return Err(LdfError::InvalidLayout(buffer_words));
        }
        Ok(Self { buffer_words })
    }

    /// Size written in the second word of every buffer
    pub fn declared_words(&self) -> usize {
        self.buffer_words - 2
    }

    /// Physical buffer size in bytes
    pub fn buffer_bytes(&self) -> u64 {
        (self.buffer_words * 4) as u64
    }
}

/// Buffer codec errors
#[derive(Debug, Error)]
pub enum LdfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of stream inside a spill (word {position})")]
    UnexpectedEof { position: u64 },

    #[error("Spill truncated by {kind} buffer at word {position}")]
    Truncated { kind: BufferKind, position: u64 },

    #[error("Invalid chunk of {bytes} bytes at word {position}")]
    InvalidChunk { bytes: u32, position: u64 },

    #[error("Spill of {words} words exceeds limit of {limit} words")]
    SpillTooLarge { words: usize, limit: usize },

    #[error("Cannot write an empty spill")]
    EmptySpill,

    #[error("Stream length {bytes} is not a multiple of the buffer size {buffer_bytes}")]
    Misaligned { bytes: u64, buffer_bytes: u64 },

    #[error("Buffer layout of {0} words is too small")]
    InvalidLayout(usize),

    #[error("File already closed")]
    Closed,
}

impl LdfError {
    /// Whether the stream can still be read after this error
    ///
    /// Only running out of data ends a scan; every other framing error
    /// costs at most the current spill.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LdfError::Io(_) | LdfError::UnexpectedEof { .. })
    }
}
