//! Datagram spill transport
//!
//! A spill is broadcast as a sequence of datagrams:
//! ```text
//! ┌────────────┬────────────┬──────────────────────────┐
//! │ chunk: i32 │ total: i32 │ payload (<= 4050 words)  │
//! └────────────┴────────────┴──────────────────────────┘
//! ```
//! Chunk numbers run from 1 to `total`. Short text datagrams
//! (`$OPEN_FILE`, `$CLOSE_FILE`, `$KILL_SOCKET`) announce acquisition
//! state changes and carry no data.

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::unpacker::END_OF_SPILL_VSN;

/// Largest payload of one datagram, in words
pub const MAX_DATAGRAM_WORDS: usize = 4050;

/// Datagram header: chunk number and chunk count
const DATAGRAM_HEADER_BYTES: usize = 8;

const RECV_BUFFER_BYTES: usize = 65536;

/// Acquisition state messages sent between spills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    OpenFile,
    CloseFile,
    KillSocket,
}

impl ControlMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMessage::OpenFile => "$OPEN_FILE",
            ControlMessage::CloseFile => "$CLOSE_FILE",
            ControlMessage::KillSocket => "$KILL_SOCKET",
        }
    }

    /// Recognize a control datagram (NUL terminator optional)
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = match datagram.iter().position(|&b| b == 0) {
            Some(end) => &datagram[..end],
            None => datagram,
        };
        [
            ControlMessage::OpenFile,
            ControlMessage::CloseFile,
            ControlMessage::KillSocket,
        ]
        .into_iter()
        .find(|m| m.as_str().as_bytes() == text)
    }

    /// Wire form, NUL terminated
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.as_str().len() + 1);
        buf.put_slice(self.as_str().as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }
}

/// Socket transport errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind UDP port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Timed out after chunk {received} of {expected}")]
    Timeout { received: i32, expected: i32 },

    #[error("Expected chunk {expected}, received chunk {found}")]
    ChunkGap { expected: i32, found: i32 },

    #[error("Spill of {words} words exceeds the {limit} word limit")]
    TooLarge { words: usize, limit: usize },
}

impl SocketError {
    /// The partial spill was discarded; the socket is still usable
    pub fn is_fragment(&self) -> bool {
        matches!(
            self,
            SocketError::Timeout { .. } | SocketError::ChunkGap { .. } | SocketError::TooLarge { .. }
        )
    }
}

/// Anything that yields datagrams with a bounded wait
pub trait DatagramSource {
    /// Receive one datagram, or `None` when the wait timed out
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl DatagramSource for UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Bind a receiving socket with a read timeout
pub fn bind_socket(port: u16, timeout: Duration) -> Result<UdpSocket, SocketError> {
    let socket =
        UdpSocket::bind(("0.0.0.0", port)).map_err(|source| SocketError::Bind { port, source })?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}

/// Receive-side statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub datagrams: u64,
    pub control_messages: u64,
    /// Datagrams shorter than the header
    pub runts: u64,
    /// Chunks skipped while waiting for the start of a spill
    pub skipped_chunks: u64,
    pub spills: u64,
    pub fragments: u64,
}

struct Chunk {
    number: i32,
    total: i32,
    payload: Vec<u32>,
}

/// Reassembles spills from datagrams
pub struct SpillAssembler<D: DatagramSource> {
    source: D,
    max_words: usize,
    buf: Vec<u8>,
    /// First chunk of the next spill, seen while assembling the previous one
    pending: Option<Chunk>,
    stats: AssemblerStats,
}

impl<D: DatagramSource> SpillAssembler<D> {
    pub fn new(source: D, max_words: usize) -> Self {
        Self {
            source,
            max_words,
            buf: vec![0; RECV_BUFFER_BYTES],
            pending: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn source(&self) -> &D {
        &self.source
    }

    fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        loop {
            let Some(n) = self.source.recv_datagram(&mut self.buf)? else {
                return Ok(None);
            };
            self.stats.datagrams += 1;
            let datagram = &self.buf[..n];

            if let Some(message) = ControlMessage::parse(datagram) {
                debug!(message = message.as_str(), "Control message");
                self.stats.control_messages += 1;
                continue;
            }
            if n < DATAGRAM_HEADER_BYTES {
                self.stats.runts += 1;
                continue;
            }

            let mut cursor = datagram;
            let number = cursor.get_i32_le();
            let total = cursor.get_i32_le();
            let mut payload = Vec::with_capacity(cursor.len() / 4);
            while cursor.remaining() >= 4 {
                payload.push(cursor.get_u32_le());
            }
            return Ok(Some(Chunk {
                number,
                total,
                payload,
            }));
        }
    }

    fn fragment(&mut self, err: SocketError) -> SocketError {
        self.stats.fragments += 1;
        err
    }

    /// Assemble the next spill
    ///
    /// Returns `Ok(None)` if nothing arrived before the timeout. A complete
    /// spill is terminated with the end-of-spill marker `(2, 9999)`.
    pub fn next_spill(&mut self) -> Result<Option<Vec<u32>>, SocketError> {
        let mut words: Vec<u32> = Vec::new();
        let mut previous = 0i32;
        let mut total = 0i32;

        loop {
            let Some(chunk) = self.next_chunk()? else {
                if previous == 0 {
                    return Ok(None);
                }
                return Err(self.fragment(SocketError::Timeout {
                    received: previous,
                    expected: total,
                }));
            };

            if previous == 0 && chunk.number != 1 {
                trace!(chunk = chunk.number, total = chunk.total, "Skipping chunk");
                self.stats.skipped_chunks += 1;
                continue;
            }
            if chunk.number != previous + 1 {
                let expected = previous + 1;
                let found = chunk.number;
                if found == 1 {
                    self.pending = Some(chunk);
                }
                return Err(self.fragment(SocketError::ChunkGap { expected, found }));
            }

            previous = chunk.number;
            total = chunk.total;
            if words.len() + chunk.payload.len() + 2 > self.max_words {
                let words = words.len() + chunk.payload.len();
                let limit = self.max_words;
                return Err(self.fragment(SocketError::TooLarge { words, limit }));
            }
            words.extend_from_slice(&chunk.payload);

            if previous >= total {
                words.push(2);
                words.push(END_OF_SPILL_VSN);
                self.stats.spills += 1;
                return Ok(Some(words));
            }
        }
    }
}

/// Split a spill into datagrams
pub fn encode_datagrams(words: &[u32]) -> Vec<Bytes> {
    let total = words.len().div_ceil(MAX_DATAGRAM_WORDS).max(1);
    let mut datagrams = Vec::with_capacity(total);
    for (index, chunk) in words.chunks(MAX_DATAGRAM_WORDS).enumerate() {
        let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_BYTES + chunk.len() * 4);
        buf.put_i32_le(index as i32 + 1);
        buf.put_i32_le(total as i32);
        for &word in chunk {
            buf.put_u32_le(word);
        }
        datagrams.push(buf.freeze());
    }
    datagrams
}

/// Send a spill to `target`; returns the number of datagrams
pub fn broadcast_spill<A: ToSocketAddrs>(
    socket: &UdpSocket,
    target: A,
    words: &[u32],
) -> Result<usize, SocketError> {
    let addr = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no target address"))?;
    let datagrams = encode_datagrams(words);
    for datagram in &datagrams {
        socket.send_to(datagram, addr)?;
    }
    Ok(datagrams.len())
}

/// Send a control message to `target`
pub fn send_control<A: ToSocketAddrs>(
    socket: &UdpSocket,
    target: A,
    message: ControlMessage,
) -> Result<(), SocketError> {
    socket.send_to(&message.to_bytes(), target)?;
    Ok(())
}
