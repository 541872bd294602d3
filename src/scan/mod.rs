//! Scan controller
//!
//! Two cooperating loops share one `ScanShared`:
//!
//! ```text
//!   stdin ──► CommandLoop (tokio task) ──► ScanController
//!                                             │ watch<ScanState>, kill
//!                                             ▼
//!   file / UDP ──► IngestionLoop (spawn_blocking)
//!                    InputSource ──► Pipeline ──► Unpacker ──► EventProcessor
//!                                       └──► OutputFile (optional)
//! ```
//!
//! The ingestion loop checks `kill` once per iteration, so a kill takes
//! effect between spills. While Stopped it sleeps 10 ms per iteration.

pub mod input;
pub mod socket;

pub use input::{InputSource, SourceRead};
pub use socket::{
    bind_socket, broadcast_spill, encode_datagrams, send_control, AssemblerStats,
    ControlMessage, DatagramSource, SocketError, SpillAssembler, MAX_DATAGRAM_WORDS,
};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builder::EventProcessor;
use crate::common::{
    Command, CommandResponse, CounterSnapshot, ScanCounters, ScanState, ShutdownReceiver,
    HELP_TEXT,
};
use crate::config::SocketConfig;
use crate::ldf::{LdfError, OutputFile};
use crate::unpacker::Unpacker;

/// Scan controller errors
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Not allowed while running")]
    Running,

    #[error("No input is open")]
    NoInput,

    #[error("Input is not a file")]
    NotAFile,

    #[error("Scan has been killed")]
    Killed,

    #[error("Ingestion loop failed: {0}")]
    Ingestion(String),

    #[error(transparent)]
    Ldf(#[from] LdfError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// State shared by the command loop and the ingestion loop
pub struct ScanShared {
    /// Written by controller commands, and by the ingestion loop when the
    /// input is exhausted
    state_tx: watch::Sender<ScanState>,
    /// Written once by `kill`, read by the ingestion loop
    kill: AtomicBool,
    /// Replaced by commands only while Stopped; held by the ingestion loop
    /// for the length of each read
    input: Mutex<Option<InputSource>>,
    /// Description of `input`, written alongside it; status queries read
    /// this instead of waiting on `input`
    input_label: Mutex<Option<String>>,
    /// Incremented by the ingestion loop only
    counters: ScanCounters,
}

/// Handle used by commands; cheap to clone
#[derive(Clone)]
pub struct ScanController {
    shared: Arc<ScanShared>,
    socket_timeout: Duration,
    socket_max_words: usize,
}

impl ScanController {
    pub fn new(socket: &SocketConfig) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Stopped);
        Self {
            shared: Arc::new(ScanShared {
                state_tx,
                kill: AtomicBool::new(false),
                input: Mutex::new(None),
                input_label: Mutex::new(None),
                counters: ScanCounters::new(),
            }),
            socket_timeout: socket.timeout(),
            socket_max_words: socket.max_words,
        }
    }

    pub fn state(&self) -> ScanState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_killed(&self) -> bool {
        self.shared.kill.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    pub fn has_input(&self) -> bool {
        self.shared.input_label.lock().is_some()
    }

    pub fn input_description(&self) -> Option<String> {
        self.shared.input_label.lock().clone()
    }

    fn replace_input(&self, source: InputSource) {
        let label = source.describe();
        *self.shared.input.lock() = Some(source);
        *self.shared.input_label.lock() = Some(label);
    }

    fn set_state(&self, state: ScanState) {
        let previous = self.shared.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "State transition");
        }
    }

    fn require_stopped(&self) -> Result<(), ScanError> {
        if self.is_killed() {
            return Err(ScanError::Killed);
        }
        if self.state() == ScanState::Running {
            return Err(ScanError::Running);
        }
        Ok(())
    }

    pub fn start(&self) -> Result<(), ScanError> {
        if self.is_killed() {
            return Err(ScanError::Killed);
        }
        if !self.has_input() {
            return Err(ScanError::NoInput);
        }
        self.set_state(ScanState::Running);
        Ok(())
    }

    pub fn stop(&self) {
        self.set_state(ScanState::Stopped);
    }

    /// Move the input file to `word_offset`
    pub fn rewind(&self, word_offset: u64) -> Result<(), ScanError> {
        self.require_stopped()?;
        let mut input = self.shared.input.lock();
        let source = input.as_mut().ok_or(ScanError::NoInput)?;
        source.rewind(word_offset)?;
        info!(word_offset, "Rewound input");
        Ok(())
    }

    pub fn open_input_file(&self, path: impl AsRef<Path>) -> Result<(), ScanError> {
        self.require_stopped()?;
        let source = InputSource::open_file(path)?;
        self.replace_input(source);
        Ok(())
    }

    pub fn open_socket(&self, port: u16) -> Result<(), ScanError> {
        self.require_stopped()?;
        let source = InputSource::open_socket(port, self.socket_timeout, self.socket_max_words)?;
        self.replace_input(source);
        Ok(())
    }

    /// Stop and ask the ingestion loop to exit
    pub fn kill(&self) {
        self.stop();
        self.shared.kill.store(true, Ordering::SeqCst);
    }

    /// Wait until the scan leaves Running
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state != ScanState::Running).await;
    }

    pub fn status(&self) -> CommandResponse {
        let input = self
            .input_description()
            .unwrap_or_else(|| "no input".to_string());
        CommandResponse::success(self.state(), input)
            .with_counters(self.counters())
            .with_killed(self.is_killed())
    }

    /// Apply one operator command
    pub fn execute(&self, command: Command) -> CommandResponse {
        let result = match command {
            Command::Open(path) => self
                .open_input_file(&path)
                .map(|_| format!("Opened {}", path)),
            Command::Rewind(offset) => self
                .rewind(offset)
                .map(|_| format!("Rewound to word {}", offset)),
            Command::Run => self.start().map(|_| "Scan running".to_string()),
            Command::Stop => {
                self.stop();
                Ok("Scan stopped".to_string())
            }
            Command::Quit => {
                self.kill();
                Ok("Exiting".to_string())
            }
            Command::Status => return self.status(),
            Command::Help => Ok(HELP_TEXT.to_string()),
        };

        let response = match result {
            Ok(message) => CommandResponse::success(self.state(), message),
            Err(e) => CommandResponse::error(self.state(), e.to_string()),
        };
        response.with_killed(self.is_killed())
    }
}

/// Consumer side of the ingestion loop
pub struct Pipeline {
    unpacker: Unpacker,
    processor: Box<dyn EventProcessor + Send>,
    output: Option<OutputFile>,
    max_spill_words: usize,
}

impl Pipeline {
    pub fn new(
        unpacker: Unpacker,
        processor: Box<dyn EventProcessor + Send>,
        max_spill_words: usize,
    ) -> Self {
        Self {
            unpacker,
            processor,
            output: None,
            max_spill_words,
        }
    }

    /// Also write every accepted spill to `output`
    pub fn with_output(mut self, output: OutputFile) -> Self {
        self.output = Some(output);
        self
    }

    pub fn unpacker(&self) -> &Unpacker {
        &self.unpacker
    }

    fn process_spill(&mut self, words: &[u32], counters: &ScanCounters) {
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.write_spill(words) {
                warn!(error = %e, "Failed to write spill, disabling output");
                self.output = None;
            }
        }

        match self.unpacker.read_spill(words, self.processor.as_mut()) {
            Ok(summary) => {
                counters.add_records(summary.records as u64);
                counters.add_events(summary.events);
            }
            Err(_) => counters.inc_dropped(),
        }
    }

    fn end_of_input(&mut self) {
        self.processor.finish();
    }

    fn finish(&mut self) {
        self.processor.finish();
        if let Some(mut output) = self.output.take() {
            match output.close() {
                Ok(()) => info!(path = %output.path().display(), "Closed output file"),
                Err(e) => warn!(error = %e, "Failed to close output file"),
            }
        }
    }
}

/// Body of the blocking ingestion task
fn ingestion_loop(controller: ScanController, mut pipeline: Pipeline) -> Pipeline {
    let shared = &controller.shared;
    info!("Ingestion loop started");

    loop {
        if shared.kill.load(Ordering::SeqCst) {
            info!("Ingestion loop received kill");
            break;
        }

        if *shared.state_tx.borrow() != ScanState::Running {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        let read = match shared.input.lock().as_mut() {
            Some(source) => source.next(pipeline.max_spill_words),
            None => SourceRead::Exhausted,
        };

        match read {
            SourceRead::Spill(words) => {
                shared.counters.inc_good(words.len() as u64);
                pipeline.process_spill(&words, &shared.counters);
            }
            SourceRead::Fragment => shared.counters.inc_fragments(),
            SourceRead::Corrupt => shared.counters.inc_corrupt(),
            SourceRead::Idle => {}
            SourceRead::EndOfRun => info!("End of run reached"),
            SourceRead::Exhausted => {
                info!("Scan complete");
                pipeline.end_of_input();
                controller.stop();
            }
        }
    }

    pipeline.finish();
    info!("Ingestion loop stopped");
    pipeline
}

/// Controller plus its running ingestion task
pub struct ScanSession {
    controller: ScanController,
    ingestion: JoinHandle<Pipeline>,
}

impl ScanSession {
    /// Spawn the ingestion loop
    pub fn spawn(controller: ScanController, pipeline: Pipeline) -> Self {
        let loop_controller = controller.clone();
        let ingestion =
            tokio::task::spawn_blocking(move || ingestion_loop(loop_controller, pipeline));
        Self {
            controller,
            ingestion,
        }
    }

    pub fn controller(&self) -> &ScanController {
        &self.controller
    }

    /// Kill the scan and wait for the ingestion loop to exit
    pub async fn shutdown(self) -> Result<(Pipeline, CounterSnapshot), ScanError> {
        self.controller.kill();
        let pipeline = self
            .ingestion
            .await
            .map_err(|e| ScanError::Ingestion(e.to_string()))?;
        let counters = self.controller.counters();
        log_summary(&counters);
        Ok((pipeline, counters))
    }
}

/// Final counts at shutdown
pub fn log_summary(counters: &CounterSnapshot) {
    info!(
        good = counters.good_spills,
        fragments = counters.fragments,
        corrupt = counters.corrupt,
        dropped = counters.dropped,
        records = counters.records,
        events = counters.events,
        "Scan summary"
    );
}

/// Read commands line by line until `quit`, end of input or shutdown,
/// then kill the scan and wait for the ingestion loop
pub async fn run_command_loop<R, W>(
    session: ScanSession,
    input: R,
    mut output: W,
    mut shutdown: ShutdownReceiver,
) -> Result<(Pipeline, CounterSnapshot), ScanError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let controller = session.controller().clone();
    let mut lines = input.lines();
    info!("Command loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("Command loop received shutdown signal");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Command input failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let (response, quit) = match line.parse::<Command>() {
                    Ok(command) => {
                        info!(command = %command, "Received command");
                        let quit = command == Command::Quit;
                        (controller.execute(command), quit)
                    }
                    Err(e) => {
                        warn!(error = %e, "Invalid command");
                        (CommandResponse::error(controller.state(), e.to_string()), false)
                    }
                };

                let text = format!("{}\n", response);
                if let Err(e) = output.write_all(text.as_bytes()).await {
                    warn!(error = %e, "Failed to write response");
                }
                let _ = output.flush().await;

                if quit {
                    break;
                }
            }
        }
    }

    info!("Command loop stopped");
    session.shutdown().await
}
