//! LDF writer: spill chunking and output file management

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::format::{write_data_header, write_eof_buffer, write_fill, write_words, DirBuffer, HeadBuffer};
use super::{
    BufferLayout, LdfError, CHUNK_HEADER_WORDS, ENDBUFF, FOOTER_MARKERS, MIN_CHUNK_PAYLOAD,
    SPILL_FOOTER_BYTES,
};

/// Words taken by the spill footer including its trailing sentinel
const FOOTER_WORDS: usize = 6;

/// Running totals for one writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Buffers completely written (DIR, HEAD, DATA, EOF)
    pub buffers: u64,
    /// Spills written
    pub spills: u64,
    /// Spill payload words written
    pub payload_words: u64,
}

/// One planned chunk of a spill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkPlan {
    /// Start a new DATA buffer before this chunk
    roll_before: bool,
    /// Payload words carried by this chunk (0 for the footer)
    payload: usize,
}

/// Writer for one .ldf stream
///
/// Data is written buffer by buffer; a partially filled DATA buffer is kept
/// open between spills and padded with `ENDBUFF` when it is closed.
pub struct LdfWriter<W: Write + Seek> {
    writer: W,
    layout: BufferLayout,
    /// Words used in the open DATA buffer, 0 when none is open
    buff_pos: usize,
    has_directory: bool,
    closed: bool,
    stats: WriterStats,
}

impl<W: Write + Seek> LdfWriter<W> {
    /// Start a new file: DIR and HEAD buffers in the standard layout
    pub fn open(writer: W, title: &str, run_number: u32) -> Result<Self, LdfError> {
        let mut this = Self::with_layout(writer, BufferLayout::default());
        let layout = this.layout;
        DirBuffer::new(run_number).write_to(&mut this.writer, layout)?;
        HeadBuffer::new(title, run_number).write_to(&mut this.writer, layout)?;
        this.has_directory = true;
        this.stats.buffers += 2;
        debug!(run_number, title, "Wrote DIR and HEAD buffers");
        Ok(this)
    }

    /// Raw data stream without DIR/HEAD buffers
    pub fn with_layout(writer: W, layout: BufferLayout) -> Self {
        Self {
            writer,
            layout,
            buff_pos: 0,
            has_directory: false,
            closed: false,
            stats: WriterStats::default(),
        }
    }

    /// Buffer geometry in use
    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// Statistics so far
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Bytes written so far, counting the open DATA buffer only up to its
    /// current position
    pub fn bytes_written(&self) -> u64 {
        self.stats.buffers * self.layout.buffer_bytes() + (self.buff_pos * 4) as u64
    }

    /// Split the spill into chunks without writing anything
    fn plan_chunks(&self, n_words: usize) -> Vec<ChunkPlan> {
        let buffer_words = self.layout.buffer_words;
        let mut pos = if self.buff_pos == 0 { 2 } else { self.buff_pos };
        let mut remaining = n_words;
        let mut plan = Vec::new();

        while remaining > 0 {
            let mut roll_before = false;
            if buffer_words - pos < CHUNK_HEADER_WORDS + 1 + MIN_CHUNK_PAYLOAD {
                roll_before = true;
                pos = 2;
            }
            let space = buffer_words - pos - CHUNK_HEADER_WORDS - 1;
            let payload = remaining.min(space);
            plan.push(ChunkPlan {
                roll_before,
                payload,
            });
            pos += CHUNK_HEADER_WORDS + payload + 1;
            remaining -= payload;
        }

        plan.push(ChunkPlan {
            roll_before: buffer_words - pos < FOOTER_WORDS,
            payload: 0,
        });
        plan
    }

    /// Pad the open DATA buffer with `ENDBUFF`
    fn close_data_buffer(&mut self) -> Result<(), LdfError> {
        if self.buff_pos == 0 {
            return Ok(());
        }
        write_fill(
            &mut self.writer,
            ENDBUFF,
            self.layout.buffer_words - self.buff_pos,
        )?;
        self.buff_pos = 0;
        self.stats.buffers += 1;
        Ok(())
    }

    fn open_data_buffer(&mut self) -> Result<(), LdfError> {
        write_data_header(&mut self.writer, self.layout)?;
        self.buff_pos = 2;
        Ok(())
    }

    /// Write one spill, splitting it across buffers as needed
    ///
    /// Returns the number of DATA buffers completed by this call.
    pub fn write_spill(&mut self, words: &[u32]) -> Result<u64, LdfError> {
        if self.closed {
            return Err(LdfError::Closed);
        }
        if words.is_empty() {
            return Err(LdfError::EmptySpill);
        }

        let buffers_before = self.stats.buffers;
        let plan = self.plan_chunks(words.len());
        let total_chunks = plan.len() as u32;
        let mut offset = 0;

        if self.buff_pos == 0 {
            self.open_data_buffer()?;
        }

        for (index, chunk) in plan.iter().enumerate() {
            if chunk.roll_before {
                self.close_data_buffer()?;
                self.open_data_buffer()?;
            }

            if index + 1 == plan.len() {
                write_words(
                    &mut self.writer,
                    &[
                        SPILL_FOOTER_BYTES,
                        total_chunks,
                        index as u32,
                        FOOTER_MARKERS[0],
                        FOOTER_MARKERS[1],
                        ENDBUFF,
                    ],
                )?;
                self.buff_pos += FOOTER_WORDS;
                break;
            }

            let chunk_bytes = ((CHUNK_HEADER_WORDS + chunk.payload) * 4) as u32;
            write_words(&mut self.writer, &[chunk_bytes, total_chunks, index as u32])?;
            write_words(&mut self.writer, &words[offset..offset + chunk.payload])?;
            write_words(&mut self.writer, &[ENDBUFF])?;
            offset += chunk.payload;
            self.buff_pos += CHUNK_HEADER_WORDS + chunk.payload + 1;
        }

        self.stats.spills += 1;
        self.stats.payload_words += words.len() as u64;
        debug!(
            words = words.len(),
            chunks = total_chunks,
            "Wrote spill"
        );
        Ok(self.stats.buffers - buffers_before)
    }

    /// Finish the stream
    ///
    /// Closes the open DATA buffer, writes the end-of-run and end-of-file
    /// buffers and patches the buffer count into the DIR buffer. Returns the
    /// total number of buffers in the stream.
    pub fn close(&mut self) -> Result<u64, LdfError> {
        if self.closed {
            return Err(LdfError::Closed);
        }
        self.close_data_buffer()?;
        write_eof_buffer(&mut self.writer, self.layout)?;
        write_eof_buffer(&mut self.writer, self.layout)?;
        self.stats.buffers += 2;
        self.closed = true;

        self.writer.flush()?;
        let stream_bytes = self.writer.seek(SeekFrom::End(0))?;
        let buffer_bytes = self.layout.buffer_bytes();
        if stream_bytes % buffer_bytes != 0 {
            return Err(LdfError::Misaligned {
                bytes: stream_bytes,
                buffer_bytes,
            });
        }

        let total_buffers = stream_bytes / buffer_bytes;
        if self.has_directory {
            self.writer
                .seek(SeekFrom::Start(DirBuffer::BUFFER_COUNT_OFFSET))?;
            self.writer.write_all(&(total_buffers as u32).to_le_bytes())?;
            self.writer.seek(SeekFrom::End(0))?;
            self.writer.flush()?;
        }

        debug!(total_buffers, "Closed LDF stream");
        Ok(total_buffers)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Return the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Next free output file name
///
/// Names follow `prefix_NNN.ldf`. An existing file bumps the run number, or
/// for a continuation run adds a `-N` suffix to the same run. Returns the
/// path and the run number actually used.
pub fn next_file_name(
    directory: &Path,
    prefix: &str,
    run_number: u32,
    continuation: bool,
) -> (PathBuf, u32) {
    let mut run = run_number;
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("{}_{:03}.ldf", prefix, run)
        } else {
            format!("{}_{:03}-{}.ldf", prefix, run, suffix)
        };
        let path = directory.join(name);
        if !path.exists() {
            return (path, run);
        }
        if continuation {
            suffix += 1;
        } else {
            run += 1;
        }
    }
}

/// Output file with automatic naming and size-based rollover
pub struct OutputFile {
    directory: PathBuf,
    prefix: String,
    title: String,
    run_number: u32,
    max_file_bytes: u64,
    path: PathBuf,
    writer: Option<LdfWriter<BufWriter<File>>>,
    files_written: u32,
}

impl OutputFile {
    /// Open the next free file for `run_number`
    pub fn open_new(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        title: impl Into<String>,
        run_number: u32,
        max_file_bytes: u64,
    ) -> Result<Self, LdfError> {
        let mut this = Self {
            directory: directory.into(),
            prefix: prefix.into(),
            title: title.into(),
            run_number,
            max_file_bytes,
            path: PathBuf::new(),
            writer: None,
            files_written: 0,
        };
        this.open_file(false)?;
        Ok(this)
    }

    fn open_file(&mut self, continuation: bool) -> Result<(), LdfError> {
        let (path, run) = next_file_name(&self.directory, &self.prefix, self.run_number, continuation);
        let file = File::create(&path)?;
        let writer = LdfWriter::open(BufWriter::new(file), &self.title, run)?;
        info!(path = %path.display(), run_number = run, "Opened output file");
        self.run_number = run;
        self.path = path;
        self.writer = Some(writer);
        Ok(())
    }

    /// Path of the file currently being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run number of the current file
    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Number of files completed so far
    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    /// Write a spill, rolling over to a continuation file when the size
    /// limit would be exceeded
    pub fn write_spill(&mut self, words: &[u32]) -> Result<(), LdfError> {
        let writer = self.writer.as_ref().ok_or(LdfError::Closed)?;
        let eof_bytes = 2 * writer.layout().buffer_bytes();
        let projected = writer.bytes_written() + (words.len() * 4) as u64 + eof_bytes;
        if projected > self.max_file_bytes && writer.stats().spills > 0 {
            info!(
                size = writer.bytes_written(),
                limit = self.max_file_bytes,
                "File size limit reached, opening continuation file"
            );
            self.close()?;
            self.open_file(true)?;
        }

        let writer = self.writer.as_mut().ok_or(LdfError::Closed)?;
        writer.write_spill(words)?;
        Ok(())
    }

    /// Close the current file
    pub fn close(&mut self) -> Result<(), LdfError> {
        if let Some(mut writer) = self.writer.take() {
            let buffers = writer.close()?;
            self.files_written += 1;
            info!(path = %self.path.display(), buffers, "Closed output file");
        }
        Ok(())
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
