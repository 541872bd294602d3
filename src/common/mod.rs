//! Pieces shared by the scan binaries: commands, counters, CLI

pub mod cli;
pub mod command;
pub mod metrics;
pub mod shutdown;

pub use cli::{CommonArgs, EmulatorArgs, LdfInfoArgs, LdfInfoCommand, ScanArgs};
pub use command::{Command, CommandParseError, CommandResponse, ScanState, HELP_TEXT};
pub use metrics::{CounterSnapshot, ScanCounters};
pub use shutdown::{setup_shutdown, ShutdownReceiver, ShutdownSender};
