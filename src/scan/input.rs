//! Spill sources for the ingestion loop

use std::fs::File;
use std::io::BufReader;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::socket::{bind_socket, SpillAssembler};
use super::ScanError;
use crate::ldf::{LdfError, LdfReader, SpillRead};

/// One step of a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRead {
    /// Complete spill ready for unpacking
    Spill(Vec<u32>),
    /// Incomplete spill, not delivered
    Fragment,
    /// Spill with a damaged footer, not delivered
    Corrupt,
    /// Nothing available yet
    Idle,
    /// End of a run inside a file; reading continues
    EndOfRun,
    /// No more data will arrive
    Exhausted,
}

/// Where spills come from
pub enum InputSource {
    File {
        path: PathBuf,
        reader: LdfReader<BufReader<File>>,
    },
    Socket {
        port: u16,
        assembler: SpillAssembler<UdpSocket>,
    },
}

impl InputSource {
    /// Open an .ldf file and log its header
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ScanError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut reader = LdfReader::new(BufReader::new(file));

        if let Some(dir) = reader.read_directory()? {
            debug!(buffers = dir.total_buffers, "Directory buffer");
        }
        match reader.read_header()? {
            Some(head) => info!(
                path = %path.display(),
                run_number = head.run_number,
                title = %head.title.trim(),
                date = %head.date.trim(),
                "Opened input file"
            ),
            None => info!(path = %path.display(), "Opened input file without header"),
        }
        Ok(InputSource::File { path, reader })
    }

    /// Listen for spills on a UDP port
    pub fn open_socket(port: u16, timeout: Duration, max_words: usize) -> Result<Self, ScanError> {
        let socket = bind_socket(port, timeout)?;
        let port = socket.local_addr().map(|a| a.port()).unwrap_or(port);
        info!(port, "Listening for spills");
        Ok(InputSource::Socket {
            port,
            assembler: SpillAssembler::new(socket, max_words),
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, InputSource::File { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            InputSource::File { path, .. } => format!("file {}", path.display()),
            InputSource::Socket { port, .. } => format!("socket port {}", port),
        }
    }

    /// Move the file position to `word_offset`
    pub fn rewind(&mut self, word_offset: u64) -> Result<(), ScanError> {
        match self {
            InputSource::File { reader, .. } => {
                reader.rewind(word_offset)?;
                Ok(())
            }
            InputSource::Socket { .. } => Err(ScanError::NotAFile),
        }
    }

    /// Current file position in words
    pub fn position_words(&self) -> Option<u64> {
        match self {
            InputSource::File { reader, .. } => Some(reader.position_words()),
            InputSource::Socket { .. } => None,
        }
    }

    /// Pull at most one spill
    pub fn next(&mut self, max_words: usize) -> SourceRead {
        match self {
            InputSource::File { reader, .. } => match reader.read_spill(max_words) {
                Ok(SpillRead::Spill(spill)) if spill.is_good() => SourceRead::Spill(spill.words),
                Ok(SpillRead::Spill(spill)) if spill.corrupt => SourceRead::Corrupt,
                Ok(SpillRead::Spill(_)) => SourceRead::Fragment,
                Ok(SpillRead::EndOfRun) => SourceRead::EndOfRun,
                Ok(SpillRead::EndOfFile) => SourceRead::Exhausted,
                Err(e @ (LdfError::UnexpectedEof { .. } | LdfError::Io(_))) => {
                    warn!(error = %e, "Input file ended");
                    SourceRead::Exhausted
                }
                Err(e) => {
                    warn!(error = %e, "Discarding spill");
                    SourceRead::Fragment
                }
            },
            InputSource::Socket { assembler, .. } => match assembler.next_spill() {
                Ok(Some(words)) => SourceRead::Spill(words),
                Ok(None) => SourceRead::Idle,
                Err(e) if e.is_fragment() => {
                    warn!(error = %e, "Not processing spill fragment");
                    SourceRead::Fragment
                }
                Err(e) => {
                    warn!(error = %e, "Socket receive failed");
                    SourceRead::Idle
                }
            },
        }
    }
}
