//! Fixed-layout LDF buffers: DIR, HEAD and EOF
//!
//! DATA buffers are variable in content and live in the writer/reader.

use std::fmt;
use std::io::{Read, Write};

use super::{BufferLayout, ENDBUFF};

/// Buffer kind tags (first word of every buffer)
mod tags {
    pub const DIR: u32 = 0x2052_4944; // "DIR "
    pub const HEAD: u32 = 0x4441_4548; // "HEAD"
    pub const DATA: u32 = 0x4154_4144; // "DATA"
    pub const SCAL: u32 = 0x4C41_4353; // "SCAL"
    pub const DEAD: u32 = 0x4441_4544; // "DEAD"
    pub const EOF: u32 = 0x2046_4F45; // "EOF "
    pub const PAC: u32 = 0x2043_4150; // "PAC "
}

/// Declared size of a HEAD buffer
const HEAD_DECLARED_WORDS: u32 = 64;

/// HEAD buffer field widths in bytes
const FACILITY_LEN: usize = 8;
const FORMAT_LEN: usize = 8;
const TYPE_LEN: usize = 16;
const DATE_LEN: usize = 16;
const TITLE_LEN: usize = 80;

/// Kind of an LDF buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Dir,
    Head,
    Data,
    Scalers,
    Deadtime,
    EndOfFile,
    Pac,
    /// Any tag this codec does not know
    Unknown(u32),
}

impl BufferKind {
    /// Classify a buffer by its first word
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            tags::DIR => BufferKind::Dir,
            tags::HEAD => BufferKind::Head,
            tags::DATA => BufferKind::Data,
            tags::SCAL => BufferKind::Scalers,
            tags::DEAD => BufferKind::Deadtime,
            tags::EOF => BufferKind::EndOfFile,
            tags::PAC => BufferKind::Pac,
            other => BufferKind::Unknown(other),
        }
    }

    /// Tag word written for this kind
    pub fn tag(&self) -> u32 {
        match self {
            BufferKind::Dir => tags::DIR,
            BufferKind::Head => tags::HEAD,
            BufferKind::Data => tags::DATA,
            BufferKind::Scalers => tags::SCAL,
            BufferKind::Deadtime => tags::DEAD,
            BufferKind::EndOfFile => tags::EOF,
            BufferKind::Pac => tags::PAC,
            BufferKind::Unknown(tag) => *tag,
        }
    }

    /// Whether this is one of the kinds the codec understands
    pub fn is_known(&self) -> bool {
        !matches!(self, BufferKind::Unknown(_))
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Dir => write!(f, "DIR"),
            BufferKind::Head => write!(f, "HEAD"),
            BufferKind::Data => write!(f, "DATA"),
            BufferKind::Scalers => write!(f, "SCAL"),
            BufferKind::Deadtime => write!(f, "DEAD"),
            BufferKind::EndOfFile => write!(f, "EOF"),
            BufferKind::Pac => write!(f, "PAC"),
            BufferKind::Unknown(tag) => write!(f, "UNKNOWN(0x{:08x})", tag),
        }
    }
}

/// Write a slice of words in file byte order
pub(crate) fn write_words<W: Write>(writer: &mut W, words: &[u32]) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    writer.write_all(&bytes)
}

/// Write `count` copies of the same word
pub(crate) fn write_fill<W: Write>(writer: &mut W, word: u32, count: usize) -> std::io::Result<()> {
    let bytes: Vec<u8> = std::iter::repeat(word.to_le_bytes())
        .take(count)
        .flatten()
        .collect();
    writer.write_all(&bytes)
}

/// Read one word in file byte order
pub(crate) fn read_word<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Directory buffer
///
/// Layout: `DIR, declared, buffer_words, total_buffers, 0, 1, run, 2`, then
/// zeros. `total_buffers` is only known when the file is closed and is
/// patched in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirBuffer {
    /// Total number of buffers in the file (0 until the file is closed)
    pub total_buffers: u32,
    /// Run number
    pub run_number: u32,
}

impl DirBuffer {
    /// Byte offset of the buffer-count word from the start of the file
    pub const BUFFER_COUNT_OFFSET: u64 = 12;

    /// Create a directory buffer for a new run
    pub fn new(run_number: u32) -> Self {
        Self {
            total_buffers: 0,
            run_number,
        }
    }

    /// Serialize to a full buffer
    pub fn write_to<W: Write>(&self, writer: &mut W, layout: BufferLayout) -> std::io::Result<()> {
        let head = [
            tags::DIR,
            layout.declared_words() as u32,
            layout.buffer_words as u32,
            self.total_buffers,
            0,
            1,
            self.run_number,
            2,
        ];
        write_words(writer, &head)?;
        write_fill(writer, 0, layout.buffer_words - head.len())
    }

    /// Parse the body following a validated `(DIR, declared)` prefix
    pub(crate) fn parse_body(body: &[u32]) -> Self {
        // body[0] is the physical buffer size
        Self {
            total_buffers: body.get(1).copied().unwrap_or(0),
            run_number: body.get(4).copied().unwrap_or(0),
        }
    }
}

/// HEAD buffer with the run description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadBuffer {
    /// Facility name ("HHIRF   ")
    pub facility: String,
    /// Format identifier ("L003    ")
    pub format: String,
    /// Data type ("LIST DATA       ")
    pub kind: String,
    /// Creation date, "MM/DD/YY HH:MM  "
    pub date: String,
    /// Run title
    pub title: String,
    /// Run number
    pub run_number: u32,
}

impl HeadBuffer {
    /// Create a header stamped with the current local time
    pub fn new(title: impl Into<String>, run_number: u32) -> Self {
        let date = chrono::Local::now().format("%m/%d/%y %H:%M").to_string();
        Self {
            facility: "HHIRF".to_string(),
            format: "L003".to_string(),
            kind: "LIST DATA".to_string(),
            date,
            title: title.into(),
            run_number,
        }
    }

    /// Serialize to a full buffer
    ///
    /// The 64 declared words are followed by `ENDBUFF` up to the buffer size.
    pub fn write_to<W: Write>(&self, writer: &mut W, layout: BufferLayout) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(HEAD_DECLARED_WORDS as usize * 4);
        bytes.extend_from_slice(&tags::HEAD.to_le_bytes());
        bytes.extend_from_slice(&HEAD_DECLARED_WORDS.to_le_bytes());
        bytes.extend_from_slice(&padded(&self.facility, FACILITY_LEN));
        bytes.extend_from_slice(&padded(&self.format, FORMAT_LEN));
        bytes.extend_from_slice(&padded(&self.kind, TYPE_LEN));
        bytes.extend_from_slice(&padded(&self.date, DATE_LEN));
        bytes.extend_from_slice(&padded(&self.title, TITLE_LEN));
        bytes.extend_from_slice(&self.run_number.to_le_bytes());
        // Zero up to 64 words (116 bytes)
        bytes.resize(HEAD_DECLARED_WORDS as usize * 4, 0);
        writer.write_all(&bytes)?;

        let fill = layout
            .buffer_words
            .saturating_sub(HEAD_DECLARED_WORDS as usize);
        write_fill(writer, ENDBUFF, fill)
    }

    /// Parse the body following a validated `(HEAD, 64)` prefix
    pub(crate) fn parse_body(body: &[u8]) -> Self {
        let mut offset = 0;
        let mut field = |len: usize| {
            let end = (offset + len).min(body.len());
            let text = String::from_utf8_lossy(&body[offset.min(end)..end])
                .trim_end_matches(|c| c == ' ' || c == '\0')
                .to_string();
            offset += len;
            text
        };
        let facility = field(FACILITY_LEN);
        let format = field(FORMAT_LEN);
        let kind = field(TYPE_LEN);
        let date = field(DATE_LEN);
        let title = field(TITLE_LEN);
        let run_offset = FACILITY_LEN + FORMAT_LEN + TYPE_LEN + DATE_LEN + TITLE_LEN;
        let run_number = body
            .get(run_offset..run_offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);

        Self {
            facility,
            format,
            kind,
            date,
            title,
            run_number,
        }
    }

    /// Size of the fixed text/run fields following the two header words
    pub(crate) const BODY_BYTES: usize =
        FACILITY_LEN + FORMAT_LEN + TYPE_LEN + DATE_LEN + TITLE_LEN + 4;
}

/// Space-pad (or truncate) a string to a fixed width
fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.bytes().take(len).collect();
    bytes.resize(len, b' ');
    bytes
}

/// Write one end-of-file buffer
pub fn write_eof_buffer<W: Write>(writer: &mut W, layout: BufferLayout) -> std::io::Result<()> {
    write_words(writer, &[tags::EOF, layout.declared_words() as u32])?;
    write_fill(writer, ENDBUFF, layout.buffer_words - 2)
}

/// Write the two-word header of a DATA buffer
pub(crate) fn write_data_header<W: Write>(
    writer: &mut W,
    layout: BufferLayout,
) -> std::io::Result<()> {
    write_words(writer, &[tags::DATA, layout.declared_words() as u32])
}

/// Declared size expected for each fixed buffer kind
pub(crate) fn expected_declared(kind: BufferKind, layout: BufferLayout) -> u32 {
    match kind {
        BufferKind::Head => HEAD_DECLARED_WORDS,
        _ => layout.declared_words() as u32,
    }
}
