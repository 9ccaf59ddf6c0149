//! Downgrade session state machine.
//!
//! A session moves one device from its current firmware to an older
//! release: probe, stage, connect, trigger the update, watch for the reboot
//! and verify the reported version. It holds the device lock for its whole
//! lifetime and records every transition, attempt and decision in an event
//! log that ends up in the saved [`SessionReport`].
//!
//! The update trigger is the only state-changing command. It is sent at
//! most once per entry into `Submitting`, and a re-entry always asks the
//! device for its status before sending it again.

use crate::core::backoff::{cancellable, retry_idempotent, sleep_or_cancel, Backoff};
use crate::core::discovery::Discovery;
use crate::core::locks::DeviceLocks;
use crate::core::stager::Stager;
use crate::models::config::{Config, RebootConfig, RetryConfig, SessionLimits, UpdateMode};
use crate::models::device::{Device, Reachability};
use crate::models::firmware::FirmwareRelease;
use crate::models::payload::{StagedPayload, StagingErrorKind};
use crate::models::session::{
    FailureReason, SessionEvent, SessionReport, SessionState, SessionStatus,
};
use crate::services::luna::{parse_system_info, LunaCommand};
use crate::services::probe::ReachabilityProbe;
use crate::services::remote::{
    CommandOutcome, Credentials, RemoteConnector, RemoteSession, ResponsePatterns,
};
use crate::utils::version::FirmwareVersion;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Report file name inside a session directory.
pub const REPORT_FILE: &str = "session.json";

/// Policy knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub retry: RetryConfig,
    pub limits: SessionLimits,
    pub reboot: RebootConfig,
    pub confirmation_timeout: Duration,
    pub command_timeout: Duration,
    pub update_mode: UpdateMode,
    pub patterns: ResponsePatterns,
    /// Status response meaning the device is already applying an update.
    pub in_progress: Regex,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let remote = &config.remote;
        let confirm = Some(remote.confirm_pattern.as_str()).filter(|p| !p.is_empty());
        Ok(Self {
            retry: config.retry.clone(),
            limits: config.session.clone(),
            reboot: config.reboot.clone(),
            confirmation_timeout: config.confirmation.timeout(),
            command_timeout: remote.command_timeout(),
            update_mode: remote.update_mode,
            patterns: ResponsePatterns::new(&remote.accept_pattern, confirm)?,
            in_progress: Regex::new(&remote.in_progress_pattern)?,
        })
    }
}

/// Collaborators a session drives.
pub struct SessionDeps {
    pub discovery: Discovery,
    pub connector: Arc<dyn RemoteConnector>,
    pub stager: Arc<Stager>,
    pub device_locks: DeviceLocks,
}

/// Operator-supplied inputs.
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub credentials: Credentials,
    pub media_root: PathBuf,
    pub image: PathBuf,
}

/// Allowed transitions, terminal states excluded.
///
/// `Failed` and `Abandoned` are reachable from every non-terminal state.
pub fn allowed_transitions(from: SessionState) -> Vec<SessionState> {
    use SessionState::*;
    let mut next = match from {
        Idle => vec![Discovering],
        Discovering => vec![FirmwareSelected],
        FirmwareSelected => vec![Staging],
        Staging => vec![Staging, Staged],
        Staged => vec![Connecting],
        Connecting => vec![ExpertModeConfirmPending, Submitting],
        ExpertModeConfirmPending => vec![Submitting],
        Submitting => vec![Submitting, ExpertModeConfirmPending, AwaitingDeviceReboot],
        AwaitingDeviceReboot => vec![Submitting, Verifying],
        Verifying => vec![Succeeded],
        Succeeded | Failed | Abandoned => return vec![],
    };
    next.extend([Failed, Abandoned]);
    next
}

/// Check a transition against the table.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<()> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(Error::other(format!(
            "Illegal session transition: {} -> {}",
            from, to
        )))
    }
}

/// Outcome of one state handler.
enum Step {
    To(SessionState, String),
    Fail(FailureReason, String),
}

/// One end-to-end downgrade attempt for one device.
pub struct DowngradeSession {
    id: String,
    device: Device,
    release: FirmwareRelease,
    payload: Option<StagedPayload>,
    pre_downgrade_version: FirmwareVersion,
    config: SessionConfig,
    state: SessionState,
    failure: Option<FailureReason>,
    attempts: BTreeMap<SessionState, u32>,
    triggers_issued: u32,
    /// The last trigger asked for on-device confirmation.
    trigger_awaiting_confirmation: bool,
    events: Vec<SessionEvent>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: watch::Sender<SessionStatus>,
    remote: Option<Box<dyn RemoteSession>>,
}

impl DowngradeSession {
    /// Create a session.
    ///
    /// Refused unless `release` is strictly older than the device's known
    /// firmware; a device with unknown firmware is refused as well.
    pub fn new(device: Device, release: FirmwareRelease, config: SessionConfig) -> Result<Self> {
        let current = device.firmware.clone().ok_or_else(|| Error::NotADowngrade {
            target: release.version.to_string(),
            current: "unknown".to_string(),
        })?;
        if !release.version.is_older_than(&current) {
            return Err(Error::NotADowngrade {
                target: release.version.to_string(),
                current: current.to_string(),
            });
        }

        let (status, _) = watch::channel(SessionStatus::InProgress(SessionState::Idle));
        Ok(Self {
            id: new_session_id(),
            device,
            release,
            payload: None,
            pre_downgrade_version: current,
            config,
            state: SessionState::Idle,
            failure: None,
            attempts: BTreeMap::new(),
            triggers_issued: 0,
            trigger_awaiting_confirmation: false,
            events: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            status,
            remote: None,
        })
    }

    /// Start from a payload staged earlier. It is re-verified before use.
    pub fn with_payload(mut self, payload: StagedPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Times `state` was entered.
    pub fn attempts(&self, state: SessionState) -> u32 {
        self.attempts.get(&state).copied().unwrap_or(0)
    }

    /// Watch the session's progress.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Drive the session to a terminal state.
    ///
    /// Never returns an error: every failure ends up in the report. The
    /// device lock is held until this returns and the remote session is
    /// closed on every path.
    pub async fn run(
        mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> SessionReport {
        let Some(lease) = deps.device_locks.try_acquire(&self.device.address) else {
            let busy = Error::DeviceBusy(self.device.address.to_string());
            self.fail(FailureReason::from_error(&busy), busy.to_string());
            return self.into_report();
        };

        tracing::info!(
            "Session {}: {} {} -> {}",
            self.id,
            self.device.address,
            self.pre_downgrade_version,
            self.release.version
        );

        match self.drive(deps, inputs, cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => self.abandon(),
            Err(e) => self.fail(FailureReason::from_error(&e), e.to_string()),
        }

        self.close_remote().await;
        drop(lease);
        self.into_report()
    }

    async fn drive(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.transition(SessionState::Discovering, "probing device")?;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let step = match self.state {
                SessionState::Discovering => self.discover(deps, cancel).await?,
                SessionState::FirmwareSelected => {
                    Step::To(SessionState::Staging, "staging payload".to_string())
                }
                SessionState::Staging => self.stage(deps, inputs, cancel).await?,
                SessionState::Staged => {
                    Step::To(SessionState::Connecting, "opening remote session".to_string())
                }
                SessionState::Connecting => self.connect(deps, inputs, cancel).await?,
                SessionState::ExpertModeConfirmPending => self.await_confirmation(cancel).await?,
                SessionState::Submitting => self.submit(deps, inputs, cancel).await?,
                SessionState::AwaitingDeviceReboot => self.await_reboot(deps, cancel).await?,
                SessionState::Verifying => self.verify(deps, inputs, cancel).await?,
                SessionState::Idle => Step::To(SessionState::Discovering, "probing device".to_string()),
                SessionState::Succeeded | SessionState::Failed | SessionState::Abandoned => {
                    return Ok(())
                }
            };

            match step {
                Step::To(next, message) => self.transition(next, message)?,
                Step::Fail(reason, message) => {
                    self.fail(reason, message);
                    return Ok(());
                }
            }
        }
    }

    /// Re-probe the device and re-check the downgrade precondition.
    async fn discover(&mut self, deps: &SessionDeps, cancel: &CancellationToken) -> Result<Step> {
        let discovery = &deps.discovery;
        let known = self.device.clone();
        let probed = retry_idempotent(&self.config.retry, cancel, "device probe", move || {
            let mut device = known.clone();
            async move {
                discovery.refresh(&mut device).await;
                if device.is_reachable() {
                    Ok(device)
                } else {
                    Err(Error::DiscoveryTimeout(device.address.to_string()))
                }
            }
        })
        .await;

        match probed {
            Ok(device) => self.device = device,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.device.record_probe(Reachability::Unreachable, None);
                return Ok(Step::Fail(
                    FailureReason::NoCompatibleFirmware,
                    format!("device is not reachable: {}", e),
                ));
            }
        }

        let Some(current) = self.device.firmware.clone() else {
            return Ok(Step::Fail(
                FailureReason::NoCompatibleFirmware,
                "device firmware is unknown".to_string(),
            ));
        };
        if !self.release.version.is_older_than(&current) {
            return Ok(Step::Fail(
                FailureReason::NoCompatibleFirmware,
                format!(
                    "target {} is not older than the device's firmware {}",
                    self.release.version, current
                ),
            ));
        }
        self.pre_downgrade_version = current;

        if self.release.confidence.needs_warning() {
            tracing::warn!(
                "Release {} matched with {} confidence; make sure it fits model {}",
                self.release.version,
                self.release.confidence,
                self.device.model_label()
            );
            self.record(format!(
                "release {} has {} confidence",
                self.release.version, self.release.confidence
            ));
        }

        Ok(Step::To(
            SessionState::FirmwareSelected,
            format!(
                "{} on {} is reachable, downgrade {} -> {}",
                self.device.model_label(),
                self.device.address,
                self.pre_downgrade_version,
                self.release.version
            ),
        ))
    }

    async fn stage(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        if let Some(payload) = self.payload.take() {
            let same_release = payload.release.version == self.release.version;
            if same_release && reverify(&deps.stager, &payload).await {
                let message = format!("reusing staged payload {:?}", payload.path);
                self.payload = Some(payload);
                return Ok(Step::To(SessionState::Staged, message));
            }
            self.record("staged payload no longer valid, staging again");
        }

        // The copy itself is not interrupted: it only ever writes the .part
        // file and must finish before the media lock is released.
        let result = deps
            .stager
            .stage(&self.release, &inputs.image, &inputs.media_root)
            .await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (kind, detail) = match result {
            Ok(payload) if payload.verified => {
                let message = format!("staged {:?} (sha256 {})", payload.path, payload.sha256);
                self.payload = Some(payload);
                return Ok(Step::To(SessionState::Staged, message));
            }
            Ok(payload) => (
                StagingErrorKind::Io,
                format!("{:?} could not be verified", payload.path),
            ),
            Err(Error::StagingFailed { kind, detail }) => (kind, detail),
            Err(e) => (StagingErrorKind::Io, e.to_string()),
        };

        let attempt = self.attempts(SessionState::Staging);
        if !kind.is_retryable() {
            return Ok(Step::Fail(FailureReason::StagingFailed { kind }, detail));
        }
        if attempt >= self.config.limits.max_staging_attempts {
            return Ok(Step::Fail(
                FailureReason::StagingFailed { kind },
                format!("{} (after {} attempts)", detail, attempt),
            ));
        }

        let delay = self.backoff_delay(attempt);
        self.record(format!("staging failed: {}; retrying in {:?}", detail, delay));
        sleep_or_cancel(delay, cancel).await?;
        Ok(Step::To(SessionState::Staging, format!("staging attempt {}", attempt + 1)))
    }

    async fn connect(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        self.close_remote().await;
        if let Err(e) = self.open_remote(deps, inputs, cancel).await {
            return fail_with(e);
        }

        match self.query_status(cancel).await {
            Ok(CommandOutcome::ConfirmationRequired(_)) => Ok(Step::To(
                SessionState::ExpertModeConfirmPending,
                "device asks for expert mode confirmation".to_string(),
            )),
            Ok(CommandOutcome::Accepted(body)) => {
                if self.config.in_progress.is_match(&body) {
                    self.record("device reports an update already in progress");
                }
                Ok(Step::To(SessionState::Submitting, "device answered status query".to_string()))
            }
            Ok(CommandOutcome::Rejected(body)) => Ok(Step::Fail(
                FailureReason::Protocol,
                format!("status query rejected: {}", body.trim()),
            )),
            Ok(CommandOutcome::Timeout) => Ok(Step::Fail(
                FailureReason::NoDeviceResponse,
                "status query timed out".to_string(),
            )),
            Err(e) => fail_with(e),
        }
    }

    /// Poll until the operator confirms on the TV or the confirmation window closes.
    async fn await_confirmation(&mut self, cancel: &CancellationToken) -> Result<Step> {
        self.status.send_replace(SessionStatus::WaitingOnDeviceConfirmation);
        tracing::warn!("Confirm the update on the TV screen to continue");

        let deadline = Instant::now() + self.config.confirmation_timeout;
        let backoff = Backoff::new(self.config.retry.clone());
        let mut poll = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Step::Fail(
                    FailureReason::ConfirmationTimeout,
                    format!(
                        "no confirmation within {:?}",
                        self.config.confirmation_timeout
                    ),
                ));
            }
            sleep_or_cancel(backoff.delay_for(poll).min(deadline - now), cancel).await?;
            poll += 1;

            match self.query_status(cancel).await {
                Ok(CommandOutcome::Accepted(_)) => {
                    return Ok(Step::To(
                        SessionState::Submitting,
                        format!("confirmed on device after {} polls", poll),
                    ));
                }
                Ok(CommandOutcome::ConfirmationRequired(_)) | Ok(CommandOutcome::Timeout) => {
                    tracing::debug!("Still waiting for confirmation (poll {})", poll);
                }
                Ok(CommandOutcome::Rejected(body)) => {
                    self.record(format!("status poll rejected: {}", body.trim()));
                }
                // A confirmed trigger starts the update, which drops the channel.
                Err(Error::Unreachable(detail)) if self.trigger_awaiting_confirmation => {
                    return Ok(Step::To(
                        SessionState::Submitting,
                        format!("channel dropped after the trigger prompt ({}), update likely started", detail),
                    ));
                }
                Err(e) => return fail_with(e),
            }
        }
    }

    /// Issue the update trigger, at most once for this entry.
    async fn submit(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let attempt = self.attempts(SessionState::Submitting);
        let max = self.config.limits.max_submit_attempts.max(1);

        if std::mem::take(&mut self.trigger_awaiting_confirmation) {
            return Ok(Step::To(
                SessionState::AwaitingDeviceReboot,
                "update confirmed on device".to_string(),
            ));
        }

        if self.remote.is_none() {
            if let Err(e) = self.open_remote(deps, inputs, cancel).await {
                return fail_with(e);
            }
        }

        if self.triggers_issued > 0 {
            // The device may have acted on an earlier trigger; ask before resending.
            match self.query_status(cancel).await {
                Ok(CommandOutcome::Accepted(body)) if self.config.in_progress.is_match(&body) => {
                    return Ok(Step::To(
                        SessionState::AwaitingDeviceReboot,
                        "update already in progress, not resending trigger".to_string(),
                    ));
                }
                Ok(CommandOutcome::ConfirmationRequired(_)) => {
                    self.trigger_awaiting_confirmation = true;
                    return Ok(Step::To(
                        SessionState::ExpertModeConfirmPending,
                        "earlier trigger is waiting for confirmation".to_string(),
                    ));
                }
                // Idle and answering: the earlier trigger was not acted on.
                Ok(CommandOutcome::Accepted(_)) => {}
                Ok(CommandOutcome::Timeout) | Ok(CommandOutcome::Rejected(_)) => {
                    return Ok(Step::To(
                        SessionState::AwaitingDeviceReboot,
                        "device state unknown, not resending trigger".to_string(),
                    ));
                }
                Err(Error::Unreachable(_)) => {
                    return Ok(Step::To(
                        SessionState::AwaitingDeviceReboot,
                        "device went away before status check, watching for reboot".to_string(),
                    ));
                }
                Err(e) => return fail_with(e),
            }
        }

        let command = LunaCommand::trigger_update(self.config.update_mode);
        self.triggers_issued += 1;
        self.record(format!(
            "sending update trigger ({} mode), submit attempt {}/{}",
            self.config.update_mode.as_str(),
            attempt,
            max
        ));

        let Some(remote) = self.remote.as_mut() else {
            return Ok(Step::Fail(FailureReason::Protocol, "no remote session".to_string()));
        };
        let outcome = remote
            .run(&command, &self.config.patterns, self.config.command_timeout, cancel)
            .await;

        match outcome {
            Ok(CommandOutcome::Accepted(_)) => Ok(Step::To(
                SessionState::AwaitingDeviceReboot,
                "trigger accepted".to_string(),
            )),
            Ok(CommandOutcome::Timeout) => Ok(Step::To(
                SessionState::AwaitingDeviceReboot,
                "no answer to trigger, watching for reboot".to_string(),
            )),
            Ok(CommandOutcome::ConfirmationRequired(_)) => {
                self.trigger_awaiting_confirmation = true;
                Ok(Step::To(
                    SessionState::ExpertModeConfirmPending,
                    "trigger needs confirmation on device".to_string(),
                ))
            }
            Ok(CommandOutcome::Rejected(body)) => {
                if attempt >= max {
                    return Ok(Step::Fail(
                        FailureReason::NoDeviceResponse,
                        format!("trigger rejected {} times: {}", attempt, body.trim()),
                    ));
                }
                let delay = self.backoff_delay(attempt);
                self.record(format!("trigger rejected: {}; retrying in {:?}", body.trim(), delay));
                sleep_or_cancel(delay, cancel).await?;
                Ok(Step::To(SessionState::Submitting, "re-checking device status".to_string()))
            }
            Err(Error::Cancelled) => {
                self.record("cancelled while the trigger was in flight");
                Err(Error::Cancelled)
            }
            Err(Error::Unreachable(detail)) => Ok(Step::To(
                SessionState::AwaitingDeviceReboot,
                format!("channel dropped after trigger ({}), watching for reboot", detail),
            )),
            Err(e) => fail_with(e),
        }
    }

    /// Watch for the reboot signature: unreachable, then reachable again.
    async fn await_reboot(&mut self, deps: &SessionDeps, cancel: &CancellationToken) -> Result<Step> {
        // The device drops the channel when it restarts.
        self.close_remote().await;

        let reach = deps.discovery.reachability();
        let reboot = self.config.reboot.clone();

        let went_down = self
            .wait_for_reachability(reach.as_ref(), false, reboot.down_timeout(), reboot.poll_interval(), cancel)
            .await?;

        if !went_down {
            let submits = self.attempts(SessionState::Submitting);
            if submits >= self.config.limits.max_submit_attempts {
                return Ok(Step::Fail(
                    FailureReason::NoDeviceResponse,
                    format!(
                        "device did not restart after {} submit attempts",
                        submits
                    ),
                ));
            }
            let delay = self.backoff_delay(submits);
            self.record(format!(
                "device stayed up for {:?}; retrying in {:?}",
                reboot.down_timeout(),
                delay
            ));
            sleep_or_cancel(delay, cancel).await?;
            return Ok(Step::To(
                SessionState::Submitting,
                "device did not restart, re-checking status".to_string(),
            ));
        }
        self.record("device went offline");

        let came_back = self
            .wait_for_reachability(reach.as_ref(), true, reboot.up_timeout(), reboot.poll_interval(), cancel)
            .await?;
        if !came_back {
            return Ok(Step::Fail(
                FailureReason::NoDeviceResponse,
                format!("device did not come back within {:?}", reboot.up_timeout()),
            ));
        }

        Ok(Step::To(SessionState::Verifying, "device is back online".to_string()))
    }

    /// Compare the firmware the device now reports with the target.
    async fn verify(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        // The SSH service may lag behind the network after boot.
        if let Err(e) = self.open_remote(deps, inputs, cancel).await {
            return fail_with(e);
        }

        let body = match self.query_status(cancel).await {
            Ok(CommandOutcome::Accepted(body)) | Ok(CommandOutcome::ConfirmationRequired(body)) => body,
            Ok(CommandOutcome::Rejected(body)) => {
                return Ok(Step::Fail(
                    FailureReason::Protocol,
                    format!("status query rejected: {}", body.trim()),
                ))
            }
            Ok(CommandOutcome::Timeout) => {
                return Ok(Step::Fail(
                    FailureReason::NoDeviceResponse,
                    "status query timed out after reboot".to_string(),
                ))
            }
            Err(e) => return fail_with(e),
        };

        let identity = parse_system_info(&body);
        let reported = identity.as_ref().and_then(|i| i.firmware.clone());
        self.device.record_probe(Reachability::Reachable, identity);

        let Some(reported) = reported else {
            return Ok(Step::Fail(
                FailureReason::Protocol,
                "status response carries no firmware version".to_string(),
            ));
        };

        if reported == self.release.version {
            Ok(Step::To(
                SessionState::Succeeded,
                format!("device reports firmware {}", reported),
            ))
        } else if reported == self.pre_downgrade_version {
            Ok(Step::Fail(
                FailureReason::DowngradeRejected,
                format!("device still reports firmware {}", reported),
            ))
        } else {
            Ok(Step::Fail(
                FailureReason::UnexpectedFirmware {
                    reported: reported.to_string(),
                },
                format!(
                    "device reports firmware {}, expected {}",
                    reported, self.release.version
                ),
            ))
        }
    }

    async fn wait_for_reachability(
        &self,
        reach: &dyn ReachabilityProbe,
        want_reachable: bool,
        window: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + window;
        loop {
            if reach.is_reachable(self.device.address).await == want_reachable {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep_or_cancel(poll.min(deadline - now), cancel).await?;
        }
    }

    /// Open the remote session, retrying while the device is unreachable.
    ///
    /// Every failed attempt lands in the event log.
    async fn open_remote(
        &mut self,
        deps: &SessionDeps,
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.close_remote().await;
        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            let opened = cancellable(
                cancel,
                deps.connector.open(&self.device, &inputs.credentials),
            )
            .await;
            let error = match opened {
                Ok(remote) => {
                    self.remote = Some(remote);
                    return Ok(());
                }
                Err(e) => e,
            };
            if !error.is_retryable() {
                return Err(error);
            }
            let Some(delay) = backoff.next_delay() else {
                self.record(format!(
                    "remote session open failed after {} attempts: {}",
                    backoff.attempts(),
                    error
                ));
                return Err(error);
            };
            self.record(format!(
                "remote session open failed (attempt {}): {}; retrying in {:?}",
                backoff.attempts() - 1,
                error,
                delay
            ));
            sleep_or_cancel(delay, cancel).await?;
        }
    }

    /// Run the status query, retrying timeouts and transient channel errors.
    async fn query_status(&mut self, cancel: &CancellationToken) -> Result<CommandOutcome> {
        let command = LunaCommand::status_query();
        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            let remote = self
                .remote
                .as_mut()
                .ok_or_else(|| Error::Protocol("no remote session".to_string()))?;
            let result = remote
                .run(&command, &self.config.patterns, self.config.command_timeout, cancel)
                .await;

            let retry_reason = match &result {
                Ok(CommandOutcome::Timeout) => Some("timed out".to_string()),
                Err(e) if e.is_retryable() => Some(e.to_string()),
                _ => None,
            };
            let Some(reason) = retry_reason else {
                return result;
            };
            match backoff.next_delay() {
                Some(delay) => {
                    self.record(format!("status query {}; retrying in {:?}", reason, delay));
                    sleep_or_cancel(delay, cancel).await?;
                }
                None => return result,
            }
        }
    }

    async fn close_remote(&mut self) {
        if let Some(mut remote) = self.remote.take() {
            if let Err(e) = remote.close().await {
                tracing::warn!("Closing remote session failed: {}", e);
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Backoff::new(self.config.retry.clone()).delay_for(attempt.saturating_sub(1))
    }

    fn transition(&mut self, to: SessionState, message: impl Into<String>) -> Result<()> {
        validate_transition(self.state, to)?;
        self.state = to;
        *self.attempts.entry(to).or_insert(0) += 1;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.record(message);

        let status = if to.is_terminal() {
            SessionStatus::Finished(to)
        } else {
            SessionStatus::InProgress(to)
        };
        self.status.send_replace(status);
        Ok(())
    }

    fn fail(&mut self, reason: FailureReason, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let message = message.into();
        tracing::error!("Session {} failed: {} ({})", self.id, reason, message);
        self.failure = Some(reason);
        let _ = self.transition(SessionState::Failed, message);
    }

    fn abandon(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::warn!("Session {} cancelled in state {}", self.id, self.state);
        let _ = self.transition(
            SessionState::Abandoned,
            format!("cancelled by operator in state {}", self.state),
        );
    }

    fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[{}] {}", self.state, message);
        self.events.push(SessionEvent {
            at: Utc::now(),
            state: self.state,
            attempt: self.attempts(self.state),
            message,
        });
    }

    /// Snapshot of the session so far.
    pub fn report(&self) -> SessionReport {
        SessionReport {
            id: self.id.clone(),
            device: self.device.clone(),
            release: self.release.clone(),
            payload: self.payload.clone(),
            pre_downgrade_version: Some(self.pre_downgrade_version.to_string()),
            state: self.state,
            failure: self.failure.clone(),
            attempts: self.attempts.clone(),
            triggers_issued: self.triggers_issued,
            events: self.events.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn into_report(self) -> SessionReport {
        self.report()
    }
}

/// Turn an error from a state handler into a failure, letting cancellation through.
fn fail_with(error: Error) -> Result<Step> {
    match error {
        Error::Cancelled => Err(Error::Cancelled),
        e => Ok(Step::Fail(FailureReason::from_error(&e), e.to_string())),
    }
}

/// Re-check a staged payload on the blocking pool; hashing a full image is slow.
async fn reverify(stager: &Arc<Stager>, payload: &StagedPayload) -> bool {
    let stager = Arc::clone(stager);
    let payload = payload.clone();
    match tokio::task::spawn_blocking(move || stager.verify(&payload)).await {
        Ok(Ok(valid)) => valid,
        Ok(Err(e)) => {
            tracing::warn!("Cannot re-check staged payload: {}", e);
            false
        }
        Err(e) => {
            tracing::warn!("Payload check task failed: {}", e);
            false
        }
    }
}

/// `<yyyymmdd_hhmmss>_<8 hex chars>`; sorts by start time.
fn new_session_id() -> String {
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &Uuid::new_v4().to_string()[..8]
    )
}

/// Save a session report under `sessions_dir/<id>/session.json`.
pub fn save_report(report: &SessionReport, sessions_dir: &Path) -> Result<PathBuf> {
    let session_dir = sessions_dir.join(&report.id);
    fs::create_dir_all(&session_dir)?;

    let path = session_dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    fs::write(&path, json)?;

    tracing::info!("Session saved: {}", report.id);
    Ok(path)
}

/// Load a session report from a JSON file.
pub fn load_report(path: &Path) -> Result<SessionReport> {
    let content = fs::read_to_string(path)?;
    let report: SessionReport = serde_json::from_str(&content)?;
    Ok(report)
}

/// Session directories under `sessions_dir`, newest first.
pub fn list_session_dirs(sessions_dir: &Path) -> Result<Vec<PathBuf>> {
    if !sessions_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(sessions_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs.reverse();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::firmware::Confidence;
    use std::net::{IpAddr, Ipv4Addr};

    fn device(firmware: &str) -> Device {
        Device::with_identity(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)),
            "43UP75006LF",
            FirmwareVersion::parse(firmware).unwrap(),
        )
    }

    fn release(version: &str) -> FirmwareRelease {
        FirmwareRelease {
            models: vec!["43UP75006LF".to_string()],
            version: FirmwareVersion::parse(version).unwrap(),
            locator: format!("K6LP-{}.epk", version),
            sha256: None,
            size_bytes: None,
            confidence: Confidence::Exact,
            rootable: Some(true),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::from_config(&Config::default()).unwrap()
    }

    #[test]
    fn test_construction_requires_strictly_older_release() {
        assert!(DowngradeSession::new(device("3.30.10"), release("3.21.30"), config()).is_ok());
        assert!(matches!(
            DowngradeSession::new(device("3.30.10"), release("03.30.10"), config()),
            Err(Error::NotADowngrade { .. })
        ));
        assert!(matches!(
            DowngradeSession::new(device("3.21.30"), release("3.30.10"), config()),
            Err(Error::NotADowngrade { .. })
        ));

        let mut unknown = device("3.30.10");
        unknown.firmware = None;
        assert!(DowngradeSession::new(unknown, release("3.21.30"), config()).is_err());
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for state in [SessionState::Succeeded, SessionState::Failed, SessionState::Abandoned] {
            assert!(allowed_transitions(state).is_empty());
        }
        assert!(validate_transition(SessionState::Staged, SessionState::Submitting).is_err());
        assert!(validate_transition(SessionState::Verifying, SessionState::Abandoned).is_ok());
        assert!(validate_transition(SessionState::AwaitingDeviceReboot, SessionState::Submitting).is_ok());
    }

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        assert_eq!(id.len(), 24);
        assert_eq!(&id[8..9], "_");
        assert_eq!(&id[15..16], "_");
    }
}
