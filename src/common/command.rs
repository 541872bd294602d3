//! Scan commands and responses
//!
//! ## State Machine
//! ```text
//!   ┌─────────┐   run    ┌─────────┐
//!   │ Stopped │ ───────► │ Running │
//!   └─────────┘ ◄─────── └─────────┘
//!        │        stop /      │
//!        │     end of input   │
//!        │ quit               │ quit
//!        ▼                    ▼
//!   ┌──────────────────────────────┐
//!   │            Killed            │
//!   └──────────────────────────────┘
//! ```
//! `open` and `rewind` are only accepted while Stopped.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metrics::CounterSnapshot;

/// Scan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScanState {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Stopped => write!(f, "Stopped"),
            ScanState::Running => write!(f, "Running"),
        }
    }
}

/// Command line errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("{command} requires {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("Invalid word offset: {0}")]
    InvalidOffset(String),
}

/// Operator commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Open an input file (Stopped only)
    Open(String),
    /// Move the file position (Stopped only)
    Rewind(u64),
    Run,
    Stop,
    /// Stop, kill and wait for the ingestion loop
    Quit,
    Status,
    Help,
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandParseError::Empty);
        }
        // Everything after the command word, so paths may contain spaces
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(word, rest)| (word, rest.trim()))
            .unwrap_or((line, ""));
        let argument = (!rest.is_empty()).then_some(rest);

        match word.to_ascii_lowercase().as_str() {
            "open" | "file" => argument
                .map(|path| Command::Open(path.to_string()))
                .ok_or(CommandParseError::MissingArgument {
                    command: "open",
                    argument: "a file path",
                }),
            "rewind" => match argument {
                None => Ok(Command::Rewind(0)),
                Some(offset) => offset
                    .parse()
                    .map(Command::Rewind)
                    .map_err(|_| CommandParseError::InvalidOffset(offset.to_string())),
            },
            "run" | "start" => Ok(Command::Run),
            "stop" => Ok(Command::Stop),
            "quit" | "exit" => Ok(Command::Quit),
            "status" => Ok(Command::Status),
            "help" => Ok(Command::Help),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Open(path) => write!(f, "Open({})", path),
            Command::Rewind(offset) => write!(f, "Rewind({})", offset),
            Command::Run => write!(f, "Run"),
            Command::Stop => write!(f, "Stop"),
            Command::Quit => write!(f, "Quit"),
            Command::Status => write!(f, "Status"),
            Command::Help => write!(f, "Help"),
        }
    }
}

/// Usage text for the interactive prompt
pub const HELP_TEXT: &str = "\
Commands:
  open|file <path>   open an .ldf input file
  rewind [offset]    move to a word offset in the file (default 0)
  run                start scanning
  stop               stop scanning
  status             show state and counters
  quit|exit          stop and exit
  help               show this text";

/// Response to a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command succeeded
    pub success: bool,
    /// State after the command
    pub state: ScanState,
    pub killed: bool,
    /// Human-readable message
    pub message: String,
    /// Counters (for status queries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<CounterSnapshot>,
}

impl CommandResponse {
    /// Create a success response
    pub fn success(state: ScanState, message: impl Into<String>) -> Self {
        Self {
            success: true,
            state,
            killed: false,
            message: message.into(),
            counters: None,
        }
    }

    /// Create an error response
    pub fn error(state: ScanState, message: impl Into<String>) -> Self {
        Self {
            success: false,
            state,
            killed: false,
            message: message.into(),
            counters: None,
        }
    }

    pub fn with_counters(mut self, counters: CounterSnapshot) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_killed(mut self, killed: bool) -> Self {
        self.killed = killed;
        self
    }
}

impl std::fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = if self.success { "OK" } else { "ERROR" };
        write!(f, "[{}] {} ({})", tag, self.message, self.state)?;
        if let Some(c) = &self.counters {
            write!(
                f,
                "\n  good={} fragments={} corrupt={} dropped={} records={} events={}",
                c.good_spills, c.fragments, c.corrupt, c.dropped, c.records, c.events
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "open run_001.ldf".parse::<Command>().unwrap(),
            Command::Open("run_001.ldf".into())
        );
        assert_eq!(
            "file /data/a.ldf".parse::<Command>().unwrap(),
            Command::Open("/data/a.ldf".into())
        );
        assert_eq!(
            "open  /data/run 12/run_012.ldf ".parse::<Command>().unwrap(),
            Command::Open("/data/run 12/run_012.ldf".into())
        );
        assert_eq!("rewind".parse::<Command>().unwrap(), Command::Rewind(0));
        assert_eq!("rewind 8194".parse::<Command>().unwrap(), Command::Rewind(8194));
        assert_eq!("RUN".parse::<Command>().unwrap(), Command::Run);
        assert_eq!("  stop ".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);
        assert_eq!("status".parse::<Command>().unwrap(), Command::Status);
        assert_eq!("help".parse::<Command>().unwrap(), Command::Help);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Command>(), Err(CommandParseError::Empty));
        assert!(matches!(
            "open".parse::<Command>(),
            Err(CommandParseError::MissingArgument { .. })
        ));
        assert!(matches!(
            "rewind abc".parse::<Command>(),
            Err(CommandParseError::InvalidOffset(_))
        ));
        assert_eq!(
            "histogram 1".parse::<Command>(),
            Err(CommandParseError::Unknown("histogram".into()))
        );
    }

    #[test]
    fn test_response_display() {
        let response = CommandResponse::success(ScanState::Running, "Scan started");
        assert_eq!(response.to_string(), "[OK] Scan started (Running)");

        let response = CommandResponse::error(ScanState::Stopped, "No input")
            .with_counters(CounterSnapshot::default());
        let text = response.to_string();
        assert!(text.starts_with("[ERROR] No input"));
        assert!(text.contains("good=0"));
    }

    #[test]
    fn test_response_json() {
        let response = CommandResponse::success(ScanState::Stopped, "ok");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("counters"));
        assert!(json.contains("\"Stopped\""));
    }
}
