//! Chain reports and their sinks

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CorrelationChain, EventKind};

/// One entry of a reported chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub kind: EventKind,
    pub energy: f64,
    pub time: f64,
    /// Time since the implant (or previous implant for the implant entry)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dtime: Option<f64>,
    pub generation: u32,
    pub flagged: bool,
}

/// Flagged chain, emitted when it is cleared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub front: u32,
    pub back: u32,
    pub implant_time: f64,
    /// Wall-clock time known when the implant arrived
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wall_clock: Option<DateTime<Utc>>,
    pub entries: Vec<ReportEntry>,
}

impl CorrelationReport {
    pub(crate) fn from_chain(front: u32, back: u32, chain: &CorrelationChain) -> Self {
        Self {
            front,
            back,
            implant_time: chain.implant_time().unwrap_or_default(),
            wall_clock: chain.implant_wall_clock,
            entries: chain
                .entries()
                .iter()
                .map(|e| ReportEntry {
                    kind: e.kind,
                    energy: e.energy,
                    time: e.time,
                    dtime: e.dtime,
                    generation: e.generation,
                    flagged: e.flagged,
                })
                .collect(),
        }
    }

    /// Number of decays in the chain
    pub fn decays(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EventKind::Decay)
            .count()
    }
}

/// Destination for correlation reports
pub trait ReportSink {
    fn report(&mut self, report: CorrelationReport) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReportSink for Vec<CorrelationReport> {
    fn report(&mut self, report: CorrelationReport) -> io::Result<()> {
        self.push(report);
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn report(&mut self, report: CorrelationReport) -> io::Result<()> {
        (**self).report(report)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn report(&mut self, report: CorrelationReport) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &report)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Correlator, CorrelatorConfig, CorrelatorEvent};

    #[test]
    fn test_json_lines_sink() {
        let mut correlator =
            Correlator::with_sink(CorrelatorConfig::default(), JsonLinesSink::new(Vec::new()));
        correlator.correlate(CorrelatorEvent::implant(0.0, 9000.0), 1, 2);
        correlator.correlate(CorrelatorEvent::decay(1.0e6, 1500.0), 1, 2);
        correlator.flag(1, 2);
        correlator.correlate(CorrelatorEvent::implant(1.0e6, 1.0), 3, 4);
        correlator.flag(3, 4);
        correlator.flush_all();

        let sink = correlator.into_sink();
        assert_eq!(sink.written(), 2);
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let reports: Vec<CorrelationReport> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(reports.len(), 2);
        assert_eq!((reports[0].front, reports[0].back), (1, 2));
        assert_eq!(reports[0].decays(), 1);
        assert_eq!(reports[0].entries[1].energy, 1500.0);
        assert_eq!(reports[1].decays(), 0);
    }

    #[test]
    fn test_boxed_sink() {
        let mut sink: Box<dyn ReportSink> = Box::new(Vec::new());
        let report = CorrelationReport {
            front: 0,
            back: 0,
            implant_time: 1.0,
            wall_clock: None,
            entries: Vec::new(),
        };
        sink.report(report).unwrap();
        sink.flush().unwrap();
    }
}
