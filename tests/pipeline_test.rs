//! E2E tests: emulator → .ldf file or UDP → unpacker → correlator

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use pixie_scan::builder::{BuilderConfig, RawEvent};
use pixie_scan::config::SocketConfig;
use pixie_scan::correlator::{
    CorrelationReport, Correlator, CorrelatorConfig, DssdProcessor, JsonLinesSink,
    ProcessorConfig,
};
use pixie_scan::decoder::{Firmware, Frequency, ListModeMask};
use pixie_scan::emulator::{Emulator, EmulatorConfig, SpillSink, UdpSink};
use pixie_scan::ldf::{LdfReader, OutputFile, SpillRead};
use pixie_scan::scan::{bind_socket, Pipeline, ScanController, ScanSession, SpillAssembler};
use pixie_scan::unpacker::{Unpacker, UnpackerConfig};
use tokio::sync::broadcast;

fn mask() -> ListModeMask {
    ListModeMask::new(Firmware::R30474, Frequency::Mhz250)
}

fn emulator_config(spills: u64, seed: u64) -> EmulatorConfig {
    EmulatorConfig {
        spills,
        events_per_spill: 200,
        seed: Some(seed),
        ..Default::default()
    }
}

fn unpacker() -> Unpacker {
    Unpacker::new(UnpackerConfig::default(), mask(), BuilderConfig::default())
}

/// Run the emulator into `<dir>/run_<n>.ldf` and return the file path
async fn emulate_to_file(dir: &Path, spills: u64, seed: u64) -> std::path::PathBuf {
    let mut output = OutputFile::open_new(dir, "run", "pipeline test", 1, 1 << 30).unwrap();
    let mut emulator = Emulator::new(emulator_config(spills, seed), mask()).unwrap();
    let (_tx, rx) = broadcast::channel(1);
    assert_eq!(emulator.run(&mut output, rx).await.unwrap(), spills);
    output.path().to_path_buf()
}

#[tokio::test]
async fn test_emulated_file_unpacks() {
    let dir = tempfile::tempdir().unwrap();
    let path = emulate_to_file(dir.path(), 4, 1).await;

    let mut reader = LdfReader::new(std::io::BufReader::new(File::open(&path).unwrap()));
    let head = reader.read_header().unwrap().unwrap();
    assert_eq!(head.title, "pipeline test");

    let mut unpacker = unpacker();
    let mut events: Vec<RawEvent> = Vec::new();
    let mut spills = 0;
    loop {
        match reader.read_spill(1 << 20).unwrap() {
            SpillRead::Spill(spill) => {
                assert!(spill.is_good());
                let summary = unpacker.read_spill(&spill.words, &mut events).unwrap();
                assert_eq!(summary.records, 400);
                assert!(summary.is_clean());
                assert!(summary.wall_clock.is_some());
                spills += 1;
            }
            SpillRead::EndOfRun | SpillRead::EndOfFile => break,
        }
    }
    assert_eq!(spills, 4);

    // Front and back hits share a timestamp, so every event pairs them
    assert!(events.iter().all(|e| e.len() % 2 == 0));
    for pair in events.windows(2) {
        assert!(pair[0].start_time <= pair[1].start_time);
    }
}

#[tokio::test]
async fn test_scan_file_into_correlator() {
    let dir = tempfile::tempdir().unwrap();
    let path = emulate_to_file(dir.path(), 5, 2).await;
    let reports_path = dir.path().join("chains.jsonl");

    let sink = JsonLinesSink::new(BufWriter::new(File::create(&reports_path).unwrap()));
    let correlator = Correlator::with_sink(CorrelatorConfig::default(), sink);
    let processor_config = ProcessorConfig {
        flag_energy: Some((1000.0, 1400.0)),
        ..Default::default()
    };
    let processor = DssdProcessor::new(processor_config, correlator);
    let pipeline = Pipeline::new(unpacker(), Box::new(processor), 250_000);

    let controller = ScanController::new(&SocketConfig::default());
    controller.open_input_file(&path).unwrap();
    let session = ScanSession::spawn(controller.clone(), pipeline);

    controller.start().unwrap();
    tokio::time::timeout(Duration::from_secs(10), controller.wait_until_stopped())
        .await
        .unwrap();
    let (pipeline, counters) = session.shutdown().await.unwrap();

    assert_eq!(counters.good_spills, 5);
    assert_eq!(counters.fragments, 0);
    assert_eq!(counters.corrupt, 0);
    assert_eq!(counters.dropped, 0);
    assert_eq!(counters.records, 5 * 400);
    assert_eq!(pipeline.unpacker().stats().spills, 5);
    drop(pipeline);

    let reports: Vec<CorrelationReport> = BufReader::new(File::open(&reports_path).unwrap())
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();
    assert!(!reports.is_empty());
    for report in &reports {
        assert!(report.decays() >= 1);
        assert!(report.entries.iter().any(|e| e.flagged));
        assert!(report.wall_clock.is_some());
    }
}

#[tokio::test]
async fn test_rescan_after_rewind() {
    let dir = tempfile::tempdir().unwrap();
    let path = emulate_to_file(dir.path(), 3, 3).await;

    let events: Vec<RawEvent> = Vec::new();
    let pipeline = Pipeline::new(unpacker(), Box::new(events), 250_000);
    let controller = ScanController::new(&SocketConfig::default());
    controller.open_input_file(&path).unwrap();
    let session = ScanSession::spawn(controller.clone(), pipeline);

    for _ in 0..2 {
        controller.start().unwrap();
        tokio::time::timeout(Duration::from_secs(10), controller.wait_until_stopped())
            .await
            .unwrap();
        controller.rewind(0).unwrap();
    }

    let (_, counters) = session.shutdown().await.unwrap();
    assert_eq!(counters.good_spills, 6);
}

#[test]
fn test_udp_spills_assembled() {
    let socket = bind_socket(0, Duration::from_millis(500)).unwrap();
    let port = socket.local_addr().unwrap().port();
    let mut assembler = SpillAssembler::new(socket, 250_000);

    let config = EmulatorConfig {
        events_per_spill: 20,
        ..emulator_config(2, 4)
    };
    let mut emulator = Emulator::new(config, mask()).unwrap();
    let spills: Vec<Vec<u32>> = (0..2).map(|_| emulator.generate_spill()).collect();

    let mut sink = UdpSink::connect(&format!("127.0.0.1:{}", port)).unwrap();
    for spill in &spills {
        sink.send_spill(spill).unwrap();
    }

    let mut unpacker = unpacker();
    for spill in &spills {
        let words = assembler.next_spill().unwrap().unwrap();
        assert_eq!(&words[..words.len() - 2], spill.as_slice());

        let mut events: Vec<RawEvent> = Vec::new();
        let summary = unpacker.read_spill(&words, &mut events).unwrap();
        assert_eq!(summary.records, 40);
    }
    assert_eq!(assembler.stats().control_messages, 1);
}
