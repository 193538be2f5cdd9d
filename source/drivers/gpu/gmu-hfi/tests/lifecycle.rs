//! CONTEXT: Integration tests for link bring-up and teardown
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 8 integration tests
//!
//! TEST_SCOPE:
//!   - Start sequence on protocol 2 and the legacy protocol 1 path
//!   - Version negotiation and its failure modes
//!   - Self-heal of stale ring indices
//!   - Stop semantics for waiting senders
//!
//! TEST_SCENARIOS:
//!   - v2_start_pushes_tables_and_features(): message order and feature payloads
//!   - v1_legacy_start_sends_init_and_test(): INIT, acknowledged tables, TEST, START
//!   - v1_table_rejection_fails_start(): firmware error status on PERF_TBL
//!   - major_version_mismatch_faults(): host expects 2, firmware reports 1
//!   - version_query_status_is_checked(): non-zero status fails start
//!   - restart_resyncs_stale_indices(): unread queue is reset with a warning before start
//!   - stop_cancels_waiting_senders(): waiter receives LinkStopped
//!   - link_is_unavailable_outside_started(): NotStarted before start and after stop, region returned
//!
//! DEPENDENCIES:
//!   - gmu_hfi::sim::SimFirmware: in-process firmware
//!   - log: records captured per thread to check start-up warnings
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use gmu_hfi::cmd::{feature, value};
use gmu_hfi::codec::{self, id, ACK_ERROR};
use gmu_hfi::sim::{FirmwareModel, SimFirmware};
use gmu_hfi::{
    Error, LinkConfig, LinkLifecycle, LinkState, LmConfig, ProtocolVersion, QueueId, Request, StaticTables,
};

fn config() -> LinkConfig {
    LinkConfig { queue_words: 256, response_timeout_ms: 500, long_op_timeout_ms: 500, ..LinkConfig::default() }
}

/// Keeps every record with the thread that logged it; tests run in parallel.
struct CaptureLog(parking_lot::Mutex<Vec<(ThreadId, log::Level, String)>>);

impl log::Log for CaptureLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.0.lock().push((thread::current().id(), record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

fn capture_log() -> &'static CaptureLog {
    static LOG: OnceLock<&'static CaptureLog> = OnceLock::new();
    LOG.get_or_init(|| {
        let log: &'static CaptureLog = Box::leak(Box::new(CaptureLog(parking_lot::Mutex::new(Vec::new()))));
        log::set_logger(log).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
        log
    })
}

/// Warnings logged so far by the calling thread.
fn own_warnings(log: &CaptureLog) -> Vec<String> {
    let me = thread::current().id();
    log.0
        .lock()
        .iter()
        .filter(|(thread, level, _)| *thread == me && *level == log::Level::Warn)
        .map(|(_, _, text)| text.clone())
        .collect()
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn v2_start_pushes_tables_and_features() {
    let fw = SimFirmware::new(FirmwareModel::default());
    let tables = StaticTables {
        perf: vec![0x10, 0x20, 0x30],
        bw: vec![1, 2],
        acd: Some(vec![9; 4]),
        lm: Some(LmConfig { throttle_mask: 0x3, isense_slope: 40 }),
    };
    let lc = LinkLifecycle::new(config(), fw.platform(), tables);
    lc.start().unwrap();

    assert_eq!(lc.state(), LinkState::Started);
    assert_eq!(lc.fw_version(), Some(0x2000_0000));
    assert_eq!(
        fw.received_ids(),
        vec![
            id::H2F_FW_VER,
            id::H2F_PERF_TBL,
            id::H2F_BW_VOTE_TBL,
            id::H2F_ACD_TBL,
            id::H2F_FEATURE_CTRL,
            id::H2F_FEATURE_CTRL,
            id::H2F_SET_VALUE,
            id::H2F_CORE_FW_START,
        ]
    );
    let received = fw.received();
    assert_eq!(&received[0][1..], &[0x2000_0000]);
    assert_eq!(&received[1][1..], &[0x10, 0x20, 0x30]);
    assert_eq!(&received[4][1..], &[feature::ACD, 1, 0]);
    assert_eq!(&received[5][1..], &[feature::LM, 1, 0x3]);
    assert_eq!(&received[6][1..], &[value::LM_CS0, 0, 40]);
    let seqs: Vec<u16> = received.iter().map(|cmd| codec::sequence(cmd[0])).collect();
    assert_eq!(seqs, (1..=8).collect::<Vec<u16>>());

    let stats = lc.link().unwrap().stats();
    assert_eq!((stats.sent, stats.acked, stats.timeouts), (8, 8, 0));
}

#[test]
fn v1_legacy_start_sends_init_and_test() {
    let fw = SimFirmware::new(FirmwareModel::for_protocol(ProtocolVersion::V1));
    let config = LinkConfig {
        protocol_major: 1,
        fw_major: 1,
        legacy_layout: true,
        test_handshake: true,
        dbg_buffer_addr: 0x7000,
        dbg_buffer_size: 0x400,
        ..config()
    };
    let lc = LinkLifecycle::new(config, fw.platform(), StaticTables::default());
    lc.start().unwrap();

    assert_eq!(
        fw.received_ids(),
        vec![id::H2F_INIT, id::H2F_FW_VER, id::H2F_PERF_TBL, id::H2F_BW_VOTE_TBL, id::H2F_TEST, id::H2F_START]
    );
    assert_eq!(&fw.received()[0][1..], &[0, 0x7000, 0x400, 1]);

    // Legacy hardware indices in the type words.
    let (_, queues) = fw.table().unwrap().snapshot();
    let indices: Vec<u32> = queues.iter().map(|(_, q)| q.ty & 0xff).collect();
    assert_eq!(indices, vec![0, 4, 5, 1]);
    let stats = lc.link().unwrap().stats();
    assert_eq!((stats.sent, stats.acked, stats.unmatched), (6, 6, 0));
}

#[test]
fn v1_table_rejection_fails_start() {
    let mut model = FirmwareModel::for_protocol(ProtocolVersion::V1);
    model.status.insert(id::H2F_PERF_TBL, ACK_ERROR);
    let fw = SimFirmware::new(model);
    let config = LinkConfig { protocol_major: 1, fw_major: 1, legacy_layout: true, ..config() };
    let lc = LinkLifecycle::new(config, fw.platform(), StaticTables::default());

    assert_eq!(lc.start(), Err(Error::RemoteError { code: ACK_ERROR }));
    assert_eq!(lc.state(), LinkState::Faulted);
    assert_eq!(fw.received_ids(), vec![id::H2F_INIT, id::H2F_FW_VER, id::H2F_PERF_TBL]);
}

#[test]
fn major_version_mismatch_faults() {
    let mut model = FirmwareModel::default();
    model.version = codec::version_word(1, 0);
    let fw = SimFirmware::new(model);
    let lc = LinkLifecycle::new(config(), fw.platform(), StaticTables::default());

    assert_eq!(lc.start(), Err(Error::VersionMismatch { expected: 2, actual: 0x1000_0000 }));
    assert_eq!(lc.state(), LinkState::Faulted);
    assert_eq!(lc.fw_version(), None);
    assert_eq!(lc.link().unwrap_err(), Error::NotStarted);
    assert_eq!(fw.received_ids(), vec![id::H2F_FW_VER]);
}

#[test]
fn version_query_status_is_checked() {
    let mut model = FirmwareModel::default();
    model.status.insert(id::H2F_FW_VER, 5);
    let fw = SimFirmware::new(model);
    let lc = LinkLifecycle::new(config(), fw.platform(), StaticTables::default());

    assert_eq!(lc.start(), Err(Error::RemoteError { code: 5 }));
    assert_eq!(lc.state(), LinkState::Faulted);

    fw.with_model(|m| m.status.clear());
    lc.start().unwrap();
    assert_eq!(lc.state(), LinkState::Started);
}

#[test]
fn restart_resyncs_stale_indices() {
    let log = capture_log();
    let fw = SimFirmware::new(FirmwareModel::default());
    let lc = LinkLifecycle::new(config(), fw.platform(), StaticTables::default());
    lc.start().unwrap();
    lc.stop();

    fw.with_model(|m| m.interrupts = false);
    fw.post_debug(1, 2, 3).unwrap();
    let table = fw.table().unwrap();
    assert!(!table.queue(QueueId::Debug).unwrap().is_empty());

    fw.with_model(|m| m.interrupts = true);
    let before = fw.received().len();
    let warned = own_warnings(log).len();
    lc.start().unwrap();
    assert!(table.queue(QueueId::Debug).unwrap().is_empty());
    let resets: Vec<String> =
        own_warnings(log).split_off(warned).into_iter().filter(|text| text.contains("resetting")).collect();
    assert_eq!(resets.len(), 1, "{resets:?}");
    assert!(resets[0].contains("queue debug"), "{}", resets[0]);
    // The verified version is cached across restarts.
    assert!(!fw.received_ids()[before..].contains(&id::H2F_FW_VER));
}

#[test]
fn stop_cancels_waiting_senders() {
    let fw = SimFirmware::new(FirmwareModel::default());
    let lc = LinkLifecycle::new(config(), fw.platform(), StaticTables::default());
    lc.start().unwrap();
    let link = lc.link().unwrap();
    fw.with_model(|m| m.hold_acks = true);

    let sender = {
        let link = link.clone();
        thread::spawn(move || link.request(&Request::Test))
    };
    wait_until(|| fw.held_len() == 1);
    lc.stop();

    assert_eq!(sender.join().unwrap(), Err(Error::LinkStopped));
    assert_eq!(lc.state(), LinkState::Stopped);
    assert_eq!(link.request(&Request::Test), Err(Error::LinkStopped));
    assert_eq!(link.pending_len(), 0);
}

#[test]
fn link_is_unavailable_outside_started() {
    let fw = SimFirmware::new(FirmwareModel::default());
    let lc = LinkLifecycle::new(config(), fw.platform(), StaticTables::default());
    assert_eq!(lc.state(), LinkState::Uninitialized);
    assert_eq!(lc.link().unwrap_err(), Error::NotStarted);

    lc.start().unwrap();
    assert!(lc.link().is_ok());
    lc.stop();
    assert_eq!(lc.link().unwrap_err(), Error::NotStarted);

    assert_eq!(fw.allocations(), 1);

    lc.deinit();
    assert_eq!(lc.state(), LinkState::Uninitialized);
    assert!(!fw.irq_line().is_claimed());
    assert_eq!(fw.allocations(), 0);

    // A fresh start after deinit allocates exactly one new region.
    lc.start().unwrap();
    assert_eq!(fw.allocations(), 1);
}
