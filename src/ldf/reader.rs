//! LDF reader: spill reassembly and resynchronisation

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use tracing::{debug, warn};

use super::format::{expected_declared, read_word, DirBuffer, HeadBuffer};
use super::{BufferKind, BufferLayout, LdfError, ENDBUFF, SPILL_FOOTER_BYTES};

/// Reader statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Complete, well-formed spills returned
    pub spills: u64,
    /// Spills returned with `full == false`
    pub fragments: u64,
    /// Spills returned with `corrupt == true`
    pub corrupt_spills: u64,
    /// Chunks missing from the index sequence
    pub missing_chunks: u64,
    /// Non-DATA buffers skipped between or inside spills
    pub skipped_buffers: u64,
    /// Spills discarded for exceeding the word limit
    pub oversize_spills: u64,
    /// Spills cut short by an EOF buffer
    pub truncated_spills: u64,
}

/// One reassembled spill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spill {
    /// Payload words, footer excluded
    pub words: Vec<u32>,
    /// Every chunk from index 0 up to the footer was seen
    pub full: bool,
    /// The footer was malformed and the reader scanned to the sentinel
    pub corrupt: bool,
}

impl Spill {
    /// Full and not corrupt
    pub fn is_good(&self) -> bool {
        self.full && !self.corrupt
    }
}

/// Result of one `read_spill` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpillRead {
    Spill(Spill),
    /// First EOF buffer: end of the run
    EndOfRun,
    /// Second consecutive EOF buffer or physical end of the stream
    EndOfFile,
}

/// What was found at a buffer boundary
enum Boundary {
    Data,
    Skipped,
    EndOfFile,
    Exhausted,
}

enum Fetch {
    Word(u32),
    End(SpillRead),
}

/// Reader for one .ldf stream
pub struct LdfReader<R: Read + Seek> {
    reader: R,
    layout: BufferLayout,
    /// Payload words left in the current DATA buffer, 0 at a boundary
    remaining: usize,
    /// Current offset in words from the start of the stream
    position: u64,
    /// Consecutive EOF buffers seen since the last DATA buffer
    eof_count: u32,
    /// Chunk header of a spill that started before the previous one ended
    pending_header: Option<[u32; 3]>,
    stats: ReaderStats,
}

impl<R: Read + Seek> LdfReader<R> {
    /// Reader for the standard 8194-word layout
    pub fn new(reader: R) -> Self {
        Self::with_layout(reader, BufferLayout::default())
    }

    pub fn with_layout(reader: R, layout: BufferLayout) -> Self {
        Self {
            reader,
            layout,
            remaining: 0,
            position: 0,
            eof_count: 0,
            pending_header: None,
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Current offset in words from the start of the stream
    pub fn position_words(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Seek to a word offset and reset the in-buffer state
    ///
    /// An offset inside a buffer is assumed to point into a DATA buffer.
    pub fn rewind(&mut self, word_offset: u64) -> Result<(), LdfError> {
        self.reader.seek(SeekFrom::Start(word_offset * 4))?;
        self.position = word_offset;
        self.eof_count = 0;
        self.pending_header = None;
        let in_buffer = (word_offset % self.layout.buffer_words as u64) as usize;
        self.remaining = if in_buffer == 0 {
            0
        } else {
            self.layout.buffer_words - in_buffer
        };
        debug!(word_offset, remaining = self.remaining, "Rewound stream");
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Option<u32>, LdfError> {
        match read_word(&mut self.reader) {
            Ok(word) => {
                self.position += 1;
                Ok(Some(word))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn skip_words(&mut self, count: u64) -> Result<(), LdfError> {
        self.reader.seek(SeekFrom::Current((count * 4) as i64))?;
        self.position += count;
        Ok(())
    }

    fn seek_back(&mut self, count: u64) -> Result<(), LdfError> {
        self.reader.seek(SeekFrom::Current(-((count * 4) as i64)))?;
        self.position -= count;
        Ok(())
    }

    /// Drop the rest of the current buffer
    fn skip_rest_of_buffer(&mut self) -> Result<(), LdfError> {
        let remaining = self.remaining as u64;
        self.remaining = 0;
        self.skip_words(remaining)
    }

    /// Read a `(kind, declared)` prefix at a buffer boundary
    fn enter_buffer(&mut self) -> Result<Boundary, LdfError> {
        let start = self.position;
        let Some(tag) = self.read_raw()? else {
            return Ok(Boundary::Exhausted);
        };
        let Some(declared) = self.read_raw()? else {
            return Ok(Boundary::Exhausted);
        };

        match BufferKind::from_tag(tag) {
            BufferKind::Data => {
                self.remaining = self.layout.declared_words();
                Ok(Boundary::Data)
            }
            BufferKind::EndOfFile => Ok(Boundary::EndOfFile),
            BufferKind::Unknown(tag) => {
                warn!(
                    tag = format_args!("0x{:08x}", tag),
                    declared,
                    position = start,
                    "Skipping unrecognized buffer"
                );
                self.skip_words(u64::from(declared))?;
                self.stats.skipped_buffers += 1;
                Ok(Boundary::Skipped)
            }
            kind => {
                // Fixed kinds always occupy a whole physical buffer
                debug!(%kind, position = start, "Skipping buffer");
                self.skip_words(self.layout.declared_words() as u64)?;
                self.stats.skipped_buffers += 1;
                Ok(Boundary::Skipped)
            }
        }
    }

    /// First chunk header word of the next spill
    fn first_header_word(&mut self) -> Result<Fetch, LdfError> {
        loop {
            if self.remaining == 0 {
                match self.enter_buffer()? {
                    Boundary::Data => self.eof_count = 0,
                    Boundary::Skipped => {}
                    Boundary::EndOfFile => {
                        self.skip_words(self.layout.declared_words() as u64)?;
                        self.eof_count += 1;
                        let end = if self.eof_count >= 2 {
                            SpillRead::EndOfFile
                        } else {
                            SpillRead::EndOfRun
                        };
                        debug!(position = self.position, ?end, "EOF buffer");
                        return Ok(Fetch::End(end));
                    }
                    Boundary::Exhausted => return Ok(Fetch::End(SpillRead::EndOfFile)),
                }
                continue;
            }

            let Some(word) = self.read_raw()? else {
                return Ok(Fetch::End(SpillRead::EndOfFile));
            };
            self.remaining -= 1;
            if word != ENDBUFF {
                return Ok(Fetch::Word(word));
            }
        }
    }

    /// Next payload word inside a spill
    fn spill_word(&mut self) -> Result<u32, LdfError> {
        while self.remaining == 0 {
            match self.enter_buffer()? {
                Boundary::Data | Boundary::Skipped => {}
                Boundary::EndOfFile => {
                    self.seek_back(2)?;
                    self.stats.truncated_spills += 1;
                    return Err(LdfError::Truncated {
                        kind: BufferKind::EndOfFile,
                        position: self.position,
                    });
                }
                Boundary::Exhausted => {
                    return Err(LdfError::UnexpectedEof {
                        position: self.position,
                    })
                }
            }
        }

        let word = self.read_raw()?.ok_or(LdfError::UnexpectedEof {
            position: self.position,
        })?;
        self.remaining -= 1;
        Ok(word)
    }

    /// Next chunk header word inside a spill, skipping sentinels
    fn spill_header_word(&mut self) -> Result<u32, LdfError> {
        loop {
            let word = self.spill_word()?;
            if word != ENDBUFF {
                return Ok(word);
            }
        }
    }

    /// Reassemble the next spill
    ///
    /// Buffers of other kinds found on the way are skipped. Framing errors
    /// other than [`LdfError::UnexpectedEof`] leave the reader at a point
    /// from which the next call can resynchronise.
    pub fn read_spill(&mut self, max_words: usize) -> Result<SpillRead, LdfError> {
        let [mut chunk_bytes, mut total, mut index] = match self.pending_header.take() {
            Some(header) => header,
            None => match self.first_header_word()? {
                Fetch::Word(word) => [word, self.spill_word()?, self.spill_word()?],
                Fetch::End(end) => return Ok(end),
            },
        };

        let mut full = index == 0;
        if !full {
            debug!(
                index,
                total,
                position = self.position,
                "Starting read in the middle of a spill"
            );
        }
        let mut corrupt = false;
        let mut expected = index;
        let mut words = Vec::new();
        let mut seen_words = 0usize;

        loop {
            if index != expected {
                warn!(
                    expected,
                    index,
                    total,
                    position = self.position,
                    "Spill chunk out of sequence"
                );
                self.stats.missing_chunks += u64::from(index.saturating_sub(expected).max(1));
                full = false;
                expected = index;
            }

            if index.wrapping_add(1) == total {
                if chunk_bytes != SPILL_FOOTER_BYTES {
                    warn!(
                        bytes = chunk_bytes,
                        position = self.position,
                        "Bad spill footer, scanning for sentinel"
                    );
                    corrupt = true;
                    while self.spill_word()? != ENDBUFF {}
                    chunk_bytes = self.spill_word()?;
                    total = self.spill_word()?;
                    index = self.spill_word()?;
                    if chunk_bytes != SPILL_FOOTER_BYTES {
                        warn!(
                            bytes = chunk_bytes,
                            position = self.position,
                            words = words.len(),
                            "Lost place in spill, keeping copied words"
                        );
                        self.skip_rest_of_buffer()?;
                        break;
                    }
                }
                // Footer markers (2, 9999)
                self.spill_word()?;
                self.spill_word()?;
                debug!(words = seen_words, total, index, "Finished spill");
                break;
            }

            if chunk_bytes <= 12 || (chunk_bytes / 4) as usize > self.remaining + 3 {
                let position = self.position;
                warn!(
                    bytes = chunk_bytes,
                    index,
                    total,
                    position,
                    "Invalid spill chunk size, skipping buffer"
                );
                self.skip_rest_of_buffer()?;
                return Err(LdfError::InvalidChunk {
                    bytes: chunk_bytes,
                    position,
                });
            }

            let payload = ((chunk_bytes - 12) / 4) as usize;
            for _ in 0..payload {
                let word = self.spill_word()?;
                if seen_words < max_words {
                    words.push(word);
                }
                seen_words += 1;
            }

            let next_bytes = self.spill_header_word()?;
            let next_total = self.spill_word()?;
            let next_index = self.spill_word()?;
            if next_total != total {
                warn!(
                    total,
                    next_total,
                    position = self.position,
                    "New spill started without a footer"
                );
                self.stats.missing_chunks += 1;
                self.pending_header = Some([next_bytes, next_total, next_index]);
                full = false;
                break;
            }
            chunk_bytes = next_bytes;
            index = next_index;
            expected = expected.wrapping_add(1);
        }

        if seen_words > max_words {
            self.stats.oversize_spills += 1;
            return Err(LdfError::SpillTooLarge {
                words: seen_words,
                limit: max_words,
            });
        }

        if full && !corrupt {
            self.stats.spills += 1;
        }
        if !full {
            self.stats.fragments += 1;
        }
        if corrupt {
            self.stats.corrupt_spills += 1;
        }
        Ok(SpillRead::Spill(Spill {
            words,
            full,
            corrupt,
        }))
    }

    /// Read a `(kind, declared)` prefix, rewinding when it does not match
    fn expect_prefix(&mut self, kind: BufferKind) -> Result<bool, LdfError> {
        let position = self.position;
        let tag = self
            .read_raw()?
            .ok_or(LdfError::UnexpectedEof { position })?;
        let declared = self
            .read_raw()?
            .ok_or(LdfError::UnexpectedEof { position })?;
        if tag != kind.tag() || declared != expected_declared(kind, self.layout) {
            self.seek_back(2)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn read_body(&mut self) -> Result<Vec<u32>, LdfError> {
        let mut body = Vec::with_capacity(self.layout.declared_words());
        for _ in 0..self.layout.declared_words() {
            let position = self.position;
            body.push(self.read_raw()?.ok_or(LdfError::UnexpectedEof { position })?);
        }
        Ok(body)
    }

    /// Read the DIR buffer, or `None` if the stream is not positioned on one
    pub fn read_directory(&mut self) -> Result<Option<DirBuffer>, LdfError> {
        if !self.expect_prefix(BufferKind::Dir)? {
            return Ok(None);
        }
        let body = self.read_body()?;
        Ok(Some(DirBuffer::parse_body(&body)))
    }

    /// Read the HEAD buffer, or `None` if the stream is not positioned on one
    pub fn read_header(&mut self) -> Result<Option<HeadBuffer>, LdfError> {
        if !self.expect_prefix(BufferKind::Head)? {
            return Ok(None);
        }
        let body = self.read_body()?;
        let bytes: Vec<u8> = body.iter().flat_map(|w| w.to_le_bytes()).collect();
        let end = HeadBuffer::BODY_BYTES.min(bytes.len());
        Ok(Some(HeadBuffer::parse_body(&bytes[..end])))
    }

    /// Consume an EOF buffer, or `None` if the stream is not positioned on one
    pub fn read_end_of_file(&mut self) -> Result<Option<()>, LdfError> {
        if !self.expect_prefix(BufferKind::EndOfFile)? {
            return Ok(None);
        }
        self.skip_words(self.layout.declared_words() as u64)?;
        self.eof_count += 1;
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::format::write_words;
    use super::super::LdfWriter;
    use super::*;
    use std::io::Cursor;

    fn small_stream(buffer_words: usize, spills: &[Vec<u32>]) -> Vec<u8> {
        let layout = BufferLayout::new(buffer_words).unwrap();
        let mut writer = LdfWriter::with_layout(Cursor::new(Vec::new()), layout);
        for spill in spills {
            writer.write_spill(spill).unwrap();
        }
        writer.close().unwrap();
        writer.into_inner().into_inner()
    }

    fn expect_spill(read: SpillRead) -> Spill {
        match read {
            SpillRead::Spill(spill) => spill,
            other => panic!("expected spill, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_with_header() {
        let spills: Vec<Vec<u32>> = vec![
            (0..10).collect(),
            (0..9000).collect(),
            (0..30_000).map(|i| i * 3).collect(),
        ];
        let mut writer = LdfWriter::open(Cursor::new(Vec::new()), "round trip", 42).unwrap();
        for spill in &spills {
            writer.write_spill(spill).unwrap();
        }
        let total = writer.close().unwrap();
        let bytes = writer.into_inner().into_inner();

        let mut reader = LdfReader::new(Cursor::new(bytes));
        let dir = reader.read_directory().unwrap().unwrap();
        assert_eq!(dir.total_buffers as u64, total);
        assert_eq!(dir.run_number, 42);
        let head = reader.read_header().unwrap().unwrap();
        assert_eq!(head.title, "round trip");
        assert_eq!(head.facility, "HHIRF");
        assert_eq!(head.run_number, 42);

        for spill in &spills {
            let read = expect_spill(reader.read_spill(1 << 20).unwrap());
            assert!(read.is_good());
            assert_eq!(&read.words, spill);
        }
        assert_eq!(reader.read_spill(1 << 20).unwrap(), SpillRead::EndOfRun);
        assert_eq!(reader.read_spill(1 << 20).unwrap(), SpillRead::EndOfFile);
        assert_eq!(reader.stats().spills, 3);
        assert_eq!(reader.stats().skipped_buffers, 0);
    }

    #[test]
    fn test_small_buffer_chunks() {
        let bytes = small_stream(8, &[vec![1, 2, 3, 4]]);
        // 3 DATA buffers (two data chunks, one footer) and 2 EOF buffers
        assert_eq!(bytes.len(), 5 * 8 * 4);

        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![1, 2, 3, 4]);
        assert!(spill.is_good());
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
    }

    #[test]
    fn test_skip_header_buffers_without_reading() {
        let mut writer = LdfWriter::open(Cursor::new(Vec::new()), "skip", 1).unwrap();
        writer.write_spill(&[5, 6, 7]).unwrap();
        writer.close().unwrap();
        let bytes = writer.into_inner().into_inner();

        let mut reader = LdfReader::new(Cursor::new(bytes));
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![5, 6, 7]);
        assert_eq!(reader.stats().skipped_buffers, 2);
    }

    #[test]
    fn test_resync_past_unknown_buffer() {
        // Spill filling exactly one buffer
        let spill_a: Vec<u32> = (0..8182).collect();
        let mut first = LdfWriter::with_layout(Cursor::new(Vec::new()), BufferLayout::default());
        first.write_spill(&spill_a).unwrap();
        let mut bytes = first.into_inner().into_inner();
        assert_eq!(bytes.len(), 8194 * 4);

        let declared = 100u32;
        let mut gap = Vec::new();
        write_words(&mut gap, &[0x1234_5678, declared]).unwrap();
        write_words(&mut gap, &vec![0xABCD; declared as usize]).unwrap();
        bytes.extend_from_slice(&gap);

        let spill_b = vec![9u32; 50];
        let mut second = LdfWriter::with_layout(Cursor::new(Vec::new()), BufferLayout::default());
        second.write_spill(&spill_b).unwrap();
        second.close().unwrap();
        bytes.extend_from_slice(&second.into_inner().into_inner());

        let mut reader = LdfReader::new(Cursor::new(bytes));
        assert_eq!(expect_spill(reader.read_spill(1 << 16).unwrap()).words, spill_a);
        assert_eq!(expect_spill(reader.read_spill(1 << 16).unwrap()).words, spill_b);
        assert_eq!(reader.read_spill(1 << 16).unwrap(), SpillRead::EndOfRun);
        assert_eq!(reader.stats().skipped_buffers, 1);
    }

    #[test]
    fn test_corrupt_footer_recovered() {
        let layout = BufferLayout::new(32).unwrap();
        let mut words = vec![BufferKind::Data.tag(), 30];
        words.extend_from_slice(&[20, 2, 0, 5, 6, ENDBUFF]);
        words.extend_from_slice(&[16, 2, 1, 99, ENDBUFF]);
        words.extend_from_slice(&[20, 2, 1, 2, 9999, ENDBUFF]);
        words.resize(32, ENDBUFF);
        let mut bytes = Vec::new();
        write_words(&mut bytes, &words).unwrap();
        super::super::format::write_eof_buffer(&mut bytes, layout).unwrap();

        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![5, 6]);
        assert!(spill.full);
        assert!(spill.corrupt);
        assert_eq!(reader.stats().corrupt_spills, 1);
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
    }

    #[test]
    fn test_lost_place_keeps_copied_words() {
        let layout = BufferLayout::new(32).unwrap();
        let mut words = vec![BufferKind::Data.tag(), 30];
        words.extend_from_slice(&[20, 2, 0, 5, 6, ENDBUFF]);
        words.extend_from_slice(&[16, 2, 1, 99, ENDBUFF]);
        // No valid footer after the sentinel either
        words.extend_from_slice(&[24, 2, 1, 7, 8, ENDBUFF]);
        words.resize(32, ENDBUFF);
        let mut bytes = Vec::new();
        write_words(&mut bytes, &words).unwrap();
        super::super::format::write_eof_buffer(&mut bytes, layout).unwrap();

        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![5, 6]);
        assert!(spill.corrupt);
        assert!(!spill.is_good());
        assert_eq!(reader.stats().corrupt_spills, 1);
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
    }

    #[test]
    fn test_new_spill_without_footer() {
        let layout = BufferLayout::new(32).unwrap();
        let mut words = vec![BufferKind::Data.tag(), 30];
        // Three-chunk spill whose later chunks never arrive
        words.extend_from_slice(&[20, 3, 0, 1, 2, ENDBUFF]);
        words.extend_from_slice(&[20, 2, 0, 7, 8]);
        words.extend_from_slice(&[20, 2, 1, 2, 9999, ENDBUFF]);
        words.resize(32, ENDBUFF);
        let mut bytes = Vec::new();
        write_words(&mut bytes, &words).unwrap();
        super::super::format::write_eof_buffer(&mut bytes, layout).unwrap();

        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        let first = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(first.words, vec![1, 2]);
        assert!(!first.full);

        let second = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(second.words, vec![7, 8]);
        assert!(second.is_good());
        assert_eq!(reader.stats().fragments, 1);
        assert_eq!(reader.stats().spills, 1);
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
    }

    #[test]
    fn test_eof_inside_spill() {
        let bytes = small_stream(8, &[vec![1, 2, 3, 4]]);
        // First DATA buffer followed directly by the EOF pair
        let mut cut = bytes[..8 * 4].to_vec();
        cut.extend_from_slice(&bytes[3 * 8 * 4..]);

        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(cut), layout);
        assert!(matches!(
            reader.read_spill(100),
            Err(LdfError::Truncated {
                kind: BufferKind::EndOfFile,
                position: 8
            })
        ));
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfFile);
    }

    #[test]
    fn test_physical_end_inside_spill() {
        let bytes = small_stream(8, &[vec![1, 2, 3, 4]]);
        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(bytes[..8 * 4].to_vec()), layout);
        let err = reader.read_spill(100).unwrap_err();
        assert!(matches!(err, LdfError::UnexpectedEof { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_rewind_mid_spill() {
        let bytes = small_stream(8, &[vec![1, 2, 3, 4], vec![7]]);
        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);

        reader.rewind(8).unwrap();
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![3, 4]);
        assert!(!spill.full);
        assert_eq!(reader.stats().fragments, 1);

        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![7]);
        assert!(spill.is_good());

        reader.rewind(0).unwrap();
        assert_eq!(reader.position_words(), 0);
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_spill_too_large() {
        let bytes = small_stream(16, &[(0..20).collect(), vec![1]]);
        let layout = BufferLayout::new(16).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        assert!(matches!(
            reader.read_spill(10),
            Err(LdfError::SpillTooLarge {
                words: 20,
                limit: 10
            })
        ));
        // Positioned after the oversize spill
        assert_eq!(expect_spill(reader.read_spill(10).unwrap()).words, vec![1]);
        assert_eq!(reader.stats().oversize_spills, 1);
    }

    #[test]
    fn test_invalid_chunk_size() {
        let layout = BufferLayout::new(16).unwrap();
        let mut words = vec![BufferKind::Data.tag(), 14, 12, 2, 0, ENDBUFF];
        words.resize(16, ENDBUFF);
        let mut bytes = Vec::new();
        write_words(&mut bytes, &words).unwrap();
        super::super::format::write_eof_buffer(&mut bytes, layout).unwrap();

        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        let err = reader.read_spill(100).unwrap_err();
        assert!(matches!(err, LdfError::InvalidChunk { bytes: 12, .. }));
        assert!(err.is_recoverable());
        assert_eq!(reader.read_spill(100).unwrap(), SpillRead::EndOfRun);
    }

    #[test]
    fn test_missing_chunk_counted() {
        let bytes = small_stream(8, &[vec![1, 2, 3, 4, 5, 6]]);
        // Drop the second DATA buffer (chunk index 1)
        let mut cut = bytes[..8 * 4].to_vec();
        cut.extend_from_slice(&bytes[2 * 8 * 4..]);

        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(cut), layout);
        let spill = expect_spill(reader.read_spill(100).unwrap());
        assert_eq!(spill.words, vec![1, 2, 5, 6]);
        assert!(!spill.full);
        assert_eq!(reader.stats().missing_chunks, 1);
    }

    #[test]
    fn test_header_mismatch_rewinds() {
        let bytes = small_stream(8, &[vec![1]]);
        let layout = BufferLayout::new(8).unwrap();
        let mut reader = LdfReader::with_layout(Cursor::new(bytes), layout);
        assert!(reader.read_directory().unwrap().is_none());
        assert!(reader.read_header().unwrap().is_none());
        assert!(reader.read_end_of_file().unwrap().is_none());
        assert_eq!(reader.position_words(), 0);
        assert_eq!(expect_spill(reader.read_spill(10).unwrap()).words, vec![1]);
        assert_eq!(reader.read_spill(10).unwrap(), SpillRead::EndOfRun);
        assert_eq!(reader.read_end_of_file().unwrap(), Some(()));
    }
}
