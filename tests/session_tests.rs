//! Integration tests for the downgrade session state machine.
//!
//! A simulated TV sits behind fake reachability, identification and remote
//! session implementations. Time is paused, so reboot windows and backoff
//! delays elapse instantly.

use async_trait::async_trait;
use lgtv_downgrade::core::discovery::{Discovery, Identify};
use lgtv_downgrade::core::locks::{DeviceLocks, MediaLocks};
use lgtv_downgrade::core::media::MediaInspector;
use lgtv_downgrade::core::session::{
    load_report, save_report, DowngradeSession, SessionConfig, SessionDeps, SessionInputs,
};
use lgtv_downgrade::core::stager::Stager;
use lgtv_downgrade::models::config::{Config, StagingConfig};
use lgtv_downgrade::models::device::{Device, DeviceIdentity};
use lgtv_downgrade::models::firmware::{Confidence, FirmwareRelease};
use lgtv_downgrade::models::payload::StagingErrorKind;
use lgtv_downgrade::models::session::{FailureReason, SessionReport, SessionState, SessionStatus};
use lgtv_downgrade::services::luna::{CommandKind, LunaCommand};
use lgtv_downgrade::services::probe::ReachabilityProbe;
use lgtv_downgrade::services::remote::{
    CommandOutcome, Credentials, RemoteConnector, RemoteSession, ResponsePatterns,
};
use lgtv_downgrade::utils::version::FirmwareVersion;
use lgtv_downgrade::{Error, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MODEL: &str = "OLED55CX6LA";
const CURRENT: &str = "04.40.16";
const TARGET: &str = "03.21.30";

fn address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
}

// ========== SIMULATED TV ==========

#[derive(Debug, Clone, Copy, PartialEq)]
enum TriggerResponse {
    Accept,
    Confirm,
    Silent,
    Reject,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Running,
    /// Still reachable for `up_polls` probes, then goes down.
    Updating { up_polls: u32 },
    /// Unreachable for `polls` probes, then back on the installed firmware.
    Down { polls: u32 },
}

struct Sim {
    online: bool,
    firmware: String,
    /// Firmware after the update; `None` keeps the current one.
    installs: Option<String>,
    phase: Phase,
    trigger_response: TriggerResponse,
    /// Whether an accepted trigger starts the update.
    reboots: bool,
    /// Polls stay reachable this long after the update starts.
    up_polls_after_trigger: u32,
    in_progress: bool,
    awaiting_confirm: bool,
    /// Status polls that still show the prompt; `None` never confirms.
    confirm_polls: Option<u32>,
    open_error: Option<fn() -> Error>,
    /// Opens refused as unreachable before the endpoint answers.
    open_refusals: u32,
    opens: u32,
    /// Status queries go unanswered once a trigger was sent.
    status_silent_after_trigger: bool,
    /// The channel dies while an update is being applied.
    drops_channel_while_updating: bool,
    triggers: u32,
    log: Vec<CommandKind>,
}

impl Sim {
    fn new() -> Self {
        Self {
            online: true,
            firmware: CURRENT.to_string(),
            installs: Some(TARGET.to_string()),
            phase: Phase::Running,
            trigger_response: TriggerResponse::Accept,
            reboots: true,
            up_polls_after_trigger: 0,
            in_progress: false,
            awaiting_confirm: false,
            confirm_polls: Some(2),
            open_error: None,
            open_refusals: 0,
            opens: 0,
            status_silent_after_trigger: false,
            drops_channel_while_updating: false,
            triggers: 0,
            log: Vec::new(),
        }
    }

    fn start_update(&mut self) {
        if self.reboots {
            self.in_progress = true;
            self.phase = Phase::Updating {
                up_polls: self.up_polls_after_trigger,
            };
        }
    }

    fn reachable(&mut self) -> bool {
        if !self.online {
            return false;
        }
        match self.phase {
            Phase::Running => true,
            Phase::Updating { up_polls: 0 } => {
                self.phase = Phase::Down { polls: 2 };
                false
            }
            Phase::Updating { up_polls } => {
                self.phase = Phase::Updating {
                    up_polls: up_polls - 1,
                };
                true
            }
            Phase::Down { polls: 0 } => {
                if let Some(installed) = self.installs.clone() {
                    self.firmware = installed;
                }
                self.in_progress = false;
                self.phase = Phase::Running;
                true
            }
            Phase::Down { polls } => {
                self.phase = Phase::Down { polls: polls - 1 };
                false
            }
        }
    }

    fn status_body(&self) -> String {
        let mut extra = String::new();
        if self.in_progress {
            extra.push_str(r#","updateInProgress":true"#);
        }
        if self.awaiting_confirm {
            extra.push_str(r#","needConfirm":true"#);
        }
        format!(
            r#"{{"returnValue":true,"modelName":"{}","firmwareVersion":"{}"{}}}"#,
            MODEL, self.firmware, extra
        )
    }

    fn status_query(&mut self) -> String {
        if self.awaiting_confirm {
            match self.confirm_polls {
                Some(0) => {
                    self.awaiting_confirm = false;
                    self.start_update();
                }
                Some(n) => self.confirm_polls = Some(n - 1),
                None => {}
            }
        }
        self.status_body()
    }

    fn trigger(&mut self) -> Option<String> {
        self.triggers += 1;
        match self.trigger_response {
            TriggerResponse::Accept => {
                self.start_update();
                Some(r#"{"returnValue":true}"#.to_string())
            }
            TriggerResponse::Confirm => {
                self.awaiting_confirm = true;
                Some(r#"{"returnValue":true,"needConfirm":true}"#.to_string())
            }
            TriggerResponse::Silent => {
                self.start_update();
                None
            }
            TriggerResponse::Reject => Some(r#"{"returnValue":false,"errorText":"busy"}"#.to_string()),
        }
    }
}

type SharedSim = Arc<Mutex<Sim>>;

struct FakeReach(SharedSim);

#[async_trait]
impl ReachabilityProbe for FakeReach {
    async fn is_reachable(&self, _address: IpAddr) -> bool {
        self.0.lock().unwrap().reachable()
    }
}

struct FakeIdentify(SharedSim);

#[async_trait]
impl Identify for FakeIdentify {
    async fn identify(&self, _address: IpAddr) -> Result<DeviceIdentity> {
        let sim = self.0.lock().unwrap();
        Ok(DeviceIdentity {
            model: Some(MODEL.to_string()),
            firmware: Some(FirmwareVersion::parse(&sim.firmware)?),
            serial: None,
        })
    }
}

struct FakeConnector(SharedSim);

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn open(&self, _device: &Device, _credentials: &Credentials) -> Result<Box<dyn RemoteSession>> {
        let mut sim = self.0.lock().unwrap();
        sim.opens += 1;
        if let Some(make_error) = sim.open_error {
            return Err(make_error());
        }
        if sim.open_refusals > 0 {
            sim.open_refusals -= 1;
            return Err(Error::Unreachable("connection refused".to_string()));
        }
        Ok(Box::new(FakeSession(Arc::clone(&self.0))))
    }
}

struct FakeSession(SharedSim);

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(
        &mut self,
        command: &LunaCommand,
        patterns: &ResponsePatterns,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutcome> {
        let mut sim = self.0.lock().unwrap();
        sim.log.push(command.kind);
        let body = match command.kind {
            CommandKind::StatusQuery if sim.status_silent_after_trigger && sim.triggers > 0 => None,
            CommandKind::StatusQuery => Some(sim.status_query()),
            CommandKind::TriggerUpdate => sim.trigger(),
        };
        if sim.drops_channel_while_updating && sim.in_progress {
            return Err(Error::Unreachable("channel closed by peer".to_string()));
        }
        Ok(match body {
            Some(body) => patterns.classify(&body),
            None => CommandOutcome::Timeout,
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FakeInspector;

impl MediaInspector for FakeInspector {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(64 * 1024 * 1024 * 1024)
    }

    fn filesystem_type(&self, _path: &Path) -> Option<String> {
        Some("vfat".to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn test_earlier_payload_is_reused_after_recheck() {
    let h = harness(Sim::new());
    let payload = h
        .deps
        .stager
        .stage(&release(TARGET), &h.inputs.image, &h.inputs.media_root)
        .await
        .unwrap();

    let report = session(&h)
        .with_payload(payload)
        .run(&h.deps, &h.inputs, &CancellationToken::new())
        .await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert!(report.events.iter().any(|e| e.message.starts_with("reusing staged payload")));
    assert_eq!(attempts(&report, SessionState::Staging), 1);
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_earlier_payload_is_staged_again() {
    let h = harness(Sim::new());
    let payload = h
        .deps
        .stager
        .stage(&release(TARGET), &h.inputs.image, &h.inputs.media_root)
        .await
        .unwrap();
    std::fs::write(&payload.path, vec![0x00u8; 64 * 1024]).unwrap();

    let report = session(&h)
        .with_payload(payload)
        .run(&h.deps, &h.inputs, &CancellationToken::new())
        .await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert!(report
        .events
        .iter()
        .any(|e| e.message == "staged payload no longer valid, staging again"));
    let staged = report.payload.as_ref().unwrap();
    assert_eq!(std::fs::read(&staged.path).unwrap(), vec![0x5au8; 64 * 1024]);
}

// ========== HELPERS ==========

struct Harness {
    sim: SharedSim,
    deps: SessionDeps,
    inputs: SessionInputs,
    config: SessionConfig,
    _temp: TempDir,
}

fn harness(sim: Sim) -> Harness {
    let temp = TempDir::new().unwrap();
    let image = temp.path().join(format!("{}-{}.epk", MODEL, TARGET));
    std::fs::write(&image, vec![0x5au8; 64 * 1024]).unwrap();
    let media_root = temp.path().join("usb");
    std::fs::create_dir(&media_root).unwrap();

    let sim = Arc::new(Mutex::new(sim));
    let deps = SessionDeps {
        discovery: Discovery::new(
            Arc::new(FakeReach(Arc::clone(&sim))),
            Arc::new(FakeIdentify(Arc::clone(&sim))),
            4,
        ),
        connector: Arc::new(FakeConnector(Arc::clone(&sim))),
        stager: Arc::new(Stager::with_inspector(
            StagingConfig::default(),
            Arc::new(FakeInspector),
            MediaLocks::new(),
        )),
        device_locks: DeviceLocks::new(),
    };
    let inputs = SessionInputs {
        credentials: Credentials::Key {
            user: "prisoner".to_string(),
            identity_file: None,
        },
        media_root,
        image,
    };

    let mut config = Config::default();
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1000;
    config.retry.jitter = false;
    config.reboot.down_timeout_secs = 10;
    config.reboot.up_timeout_secs = 30;
    config.reboot.poll_interval_ms = 1000;
    config.confirmation.timeout_secs = 20;

    Harness {
        sim,
        deps,
        inputs,
        config: SessionConfig::from_config(&config).unwrap(),
        _temp: temp,
    }
}

fn release(version: &str) -> FirmwareRelease {
    FirmwareRelease {
        models: vec![MODEL.to_string()],
        version: FirmwareVersion::parse(version).unwrap(),
        locator: format!("{}-{}.epk", MODEL, version),
        sha256: None,
        size_bytes: None,
        confidence: Confidence::Exact,
        rootable: Some(true),
    }
}

fn session(h: &Harness) -> DowngradeSession {
    let device = Device::with_identity(address(), MODEL, FirmwareVersion::parse(CURRENT).unwrap());
    DowngradeSession::new(device, release(TARGET), h.config.clone()).unwrap()
}

async fn run(h: &Harness) -> SessionReport {
    session(h).run(&h.deps, &h.inputs, &CancellationToken::new()).await
}

fn attempts(report: &SessionReport, state: SessionState) -> u32 {
    report.attempts.get(&state).copied().unwrap_or(0)
}

/// Every trigger after the first must follow a status query.
fn assert_status_checked_before_resend(log: &[CommandKind]) {
    let mut seen_trigger = false;
    for (i, kind) in log.iter().enumerate() {
        if *kind == CommandKind::TriggerUpdate {
            if seen_trigger {
                assert_eq!(log[i - 1], CommandKind::StatusQuery, "trigger resent blind: {:?}", log);
            }
            seen_trigger = true;
        }
    }
}

// ========== CONSTRUCTION ==========

#[test]
fn test_session_refuses_non_downgrade() {
    let h = harness(Sim::new());
    let device = Device::with_identity(address(), MODEL, FirmwareVersion::parse(CURRENT).unwrap());

    let same = DowngradeSession::new(device.clone(), release("4.40.16"), h.config.clone());
    assert!(matches!(same, Err(Error::NotADowngrade { .. })));

    let newer = DowngradeSession::new(device, release("05.00.00"), h.config.clone());
    assert!(matches!(newer, Err(Error::NotADowngrade { .. })));
}

// ========== HAPPY PATH ==========

#[tokio::test(start_paused = true)]
async fn test_successful_downgrade() {
    let h = harness(Sim::new());
    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert_eq!(report.failure, None);
    assert_eq!(report.triggers_issued, 1);
    assert_eq!(report.pre_downgrade_version.as_deref(), Some("04.40.16"));
    assert!(report.finished_at.is_some());
    assert!(report.payload.as_ref().unwrap().verified);
    assert!(report.payload.as_ref().unwrap().path.exists());

    for state in [
        SessionState::Discovering,
        SessionState::FirmwareSelected,
        SessionState::Staging,
        SessionState::Staged,
        SessionState::Connecting,
        SessionState::Submitting,
        SessionState::AwaitingDeviceReboot,
        SessionState::Verifying,
        SessionState::Succeeded,
    ] {
        assert_eq!(attempts(&report, state), 1, "{}", state);
    }
    assert!(!h.deps.device_locks.is_locked(&address()));
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_every_transition() {
    let h = harness(Sim::new());
    let session = session(&h);
    let mut rx = session.subscribe();

    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            let done = matches!(status, SessionStatus::Finished(_));
            seen.push(status);
            if done {
                break;
            }
        }
        seen
    });

    let report = session.run(&h.deps, &h.inputs, &CancellationToken::new()).await;
    let seen = watcher.await.unwrap();

    assert_eq!(report.state, SessionState::Succeeded);
    assert_eq!(seen.last(), Some(&SessionStatus::Finished(SessionState::Succeeded)));
}

// ========== CONFIRMATION ==========

#[tokio::test(start_paused = true)]
async fn test_expert_mode_confirmation_then_success() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Confirm;
    sim.confirm_polls = Some(2);
    let h = harness(sim);
    let session = session(&h);
    let mut rx = session.subscribe();

    let waited = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() == SessionStatus::WaitingOnDeviceConfirmation {
                return true;
            }
        }
        false
    });

    let report = session.run(&h.deps, &h.inputs, &CancellationToken::new()).await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert_eq!(report.triggers_issued, 1);
    assert_eq!(attempts(&report, SessionState::ExpertModeConfirmPending), 1);
    assert!(waited.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Confirm;
    sim.confirm_polls = None;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::ConfirmationTimeout));
    assert_eq!(report.triggers_issued, 1);
    assert!(!h.deps.device_locks.is_locked(&address()));
}

#[tokio::test(start_paused = true)]
async fn test_channel_lost_after_confirmation_watches_reboot() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Confirm;
    sim.confirm_polls = Some(1);
    sim.drops_channel_while_updating = true;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert_eq!(report.triggers_issued, 1);
    assert_eq!(h.sim.lock().unwrap().triggers, 1);
    assert_eq!(attempts(&report, SessionState::AwaitingDeviceReboot), 1);
    assert_eq!(attempts(&report, SessionState::Verifying), 1);
}

// ========== TRIGGER SAFETY ==========

#[tokio::test(start_paused = true)]
async fn test_unanswered_trigger_is_bounded_and_status_checked() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Silent;
    sim.reboots = false;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::NoDeviceResponse));
    assert_eq!(report.triggers_issued, 3);
    assert_eq!(
        attempts(&report, SessionState::Submitting),
        h.config.limits.max_submit_attempts
    );
    assert_status_checked_before_resend(&h.sim.lock().unwrap().log);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_state_never_resends_trigger() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Silent;
    sim.reboots = false;
    sim.status_silent_after_trigger = true;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::NoDeviceResponse));
    assert_eq!(report.triggers_issued, 1);
    assert_eq!(h.sim.lock().unwrap().triggers, 1);
    assert_eq!(
        attempts(&report, SessionState::Submitting),
        h.config.limits.max_submit_attempts
    );
    let log = h.sim.lock().unwrap().log.clone();
    assert_eq!(
        log.iter().filter(|k| **k == CommandKind::TriggerUpdate).count(),
        1,
        "{:?}",
        log
    );
}

#[tokio::test(start_paused = true)]
async fn test_update_in_progress_is_not_retriggered() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Silent;
    // Outlasts the first reboot window, so the session re-enters Submitting.
    sim.up_polls_after_trigger = 15;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert_eq!(report.triggers_issued, 1);
    assert_eq!(attempts(&report, SessionState::Submitting), 2);
    assert_eq!(attempts(&report, SessionState::AwaitingDeviceReboot), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_trigger_gives_up() {
    let mut sim = Sim::new();
    sim.trigger_response = TriggerResponse::Reject;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.failure, Some(FailureReason::NoDeviceResponse));
    assert_eq!(report.triggers_issued, 3);
    assert_eq!(attempts(&report, SessionState::AwaitingDeviceReboot), 0);
    assert_status_checked_before_resend(&h.sim.lock().unwrap().log);
}

// ========== VERIFICATION ==========

#[tokio::test(start_paused = true)]
async fn test_device_keeps_old_firmware() {
    let mut sim = Sim::new();
    sim.installs = None;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::DowngradeRejected));
}

#[tokio::test(start_paused = true)]
async fn test_device_reports_unexpected_firmware() {
    let mut sim = Sim::new();
    sim.installs = Some("03.25.00".to_string());
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(
        report.failure,
        Some(FailureReason::UnexpectedFirmware {
            reported: "03.25.00".to_string()
        })
    );
}

// ========== EARLY FAILURES ==========

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_fails_before_staging() {
    let mut sim = Sim::new();
    sim.online = false;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::NoCompatibleFirmware));
    assert_eq!(attempts(&report, SessionState::Staging), 0);
    assert_eq!(h.sim.lock().unwrap().opens, 0);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let mut sim = Sim::new();
    sim.open_error = Some(|| Error::Authentication("prisoner@192.168.1.50".to_string()));
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.failure, Some(FailureReason::Authentication));
    assert_eq!(report.triggers_issued, 0);
    assert_eq!(h.sim.lock().unwrap().opens, 1);
}

fn open_failures_logged(report: &SessionReport) -> usize {
    report
        .events
        .iter()
        .filter(|e| e.message.starts_with("remote session open failed"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_are_logged() {
    let mut sim = Sim::new();
    sim.open_refusals = 2;
    let h = harness(sim);

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Succeeded, "{:#?}", report.events);
    assert_eq!(open_failures_logged(&report), 2);
    assert!(report
        .events
        .iter()
        .all(|e| !e.message.starts_with("remote session open failed") || e.state == SessionState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_endpoint_fails_after_logged_retries() {
    let mut sim = Sim::new();
    sim.open_error = Some(|| Error::Unreachable("connection refused".to_string()));
    let h = harness(sim);

    let report = run(&h).await;

    let max = h.config.retry.max_attempts;
    assert_eq!(report.failure, Some(FailureReason::Unreachable));
    assert_eq!(report.triggers_issued, 0);
    assert_eq!(h.sim.lock().unwrap().opens, max);
    assert_eq!(open_failures_logged(&report), max as usize);
}

#[tokio::test(start_paused = true)]
async fn test_staging_failure_stops_before_connecting() {
    let h = harness(Sim::new());
    std::fs::remove_dir(&h.inputs.media_root).unwrap();

    let report = run(&h).await;

    assert_eq!(
        report.failure,
        Some(FailureReason::StagingFailed {
            kind: StagingErrorKind::MediaRemoved
        })
    );
    assert_eq!(h.sim.lock().unwrap().opens, 0);
    assert_eq!(report.triggers_issued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_session_for_same_device_is_busy() {
    let h = harness(Sim::new());
    let _held = h.deps.device_locks.try_acquire(&address()).unwrap();

    let report = run(&h).await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.failure, Some(FailureReason::DeviceBusy));
    assert_eq!(h.sim.lock().unwrap().opens, 0);
}

// ========== CANCELLATION ==========

#[tokio::test(start_paused = true)]
async fn test_cancel_while_awaiting_reboot() {
    let mut sim = Sim::new();
    sim.reboots = false;
    let h = harness(sim);
    let session = session(&h);
    let mut rx = session.subscribe();
    let cancel = CancellationToken::new();

    let trip = cancel.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() == SessionStatus::InProgress(SessionState::AwaitingDeviceReboot) {
                trip.cancel();
                return;
            }
        }
    });

    let report = session.run(&h.deps, &h.inputs, &cancel).await;

    assert_eq!(report.state, SessionState::Abandoned);
    assert_eq!(report.state.exit_code(), 130);
    assert_eq!(report.failure, None);
    assert_eq!(report.triggers_issued, 1);
    assert!(!h.deps.device_locks.is_locked(&address()));
}

// ========== PERSISTENCE ==========

#[tokio::test(start_paused = true)]
async fn test_report_survives_save_and_load() {
    let h = harness(Sim::new());
    let report = run(&h).await;

    let dir = TempDir::new().unwrap();
    let path = save_report(&report, dir.path()).unwrap();
    assert_eq!(path, dir.path().join(&report.id).join("session.json"));

    let loaded = load_report(&path).unwrap();
    assert_eq!(loaded.id, report.id);
    assert_eq!(loaded.state, SessionState::Succeeded);
    assert_eq!(loaded.events.len(), report.events.len());
    assert_eq!(loaded.attempts, report.attempts);
}
