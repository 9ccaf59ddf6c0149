//! Downgrade session data model.

use super::device::Device;
use super::firmware::FirmwareRelease;
use super::payload::{StagedPayload, StagingErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// States of a downgrade session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Discovering,
    FirmwareSelected,
    Staging,
    Staged,
    Connecting,
    ExpertModeConfirmPending,
    Submitting,
    AwaitingDeviceReboot,
    Verifying,
    Succeeded,
    Failed,
    Abandoned,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Abandoned
        )
    }

    /// Process exit code for a finished session.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionState::Succeeded => 0,
            SessionState::Abandoned => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::FirmwareSelected => "firmware selected",
            SessionState::Staging => "staging",
            SessionState::Staged => "staged",
            SessionState::Connecting => "connecting",
            SessionState::ExpertModeConfirmPending => "expert mode confirmation pending",
            SessionState::Submitting => "submitting",
            SessionState::AwaitingDeviceReboot => "awaiting device reboot",
            SessionState::Verifying => "verifying",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    DiscoveryTimeout,
    NoCompatibleFirmware,
    StagingFailed { kind: StagingErrorKind },
    Authentication,
    Unreachable,
    Protocol,
    ConfirmationTimeout,
    NoDeviceResponse,
    DowngradeRejected,
    UnexpectedFirmware { reported: String },
    DeviceBusy,
}

impl FailureReason {
    /// Map an engine error onto a session failure reason.
    pub fn from_error(error: &crate::Error) -> Self {
        use crate::Error;
        match error {
            Error::DiscoveryTimeout(_) => FailureReason::DiscoveryTimeout,
            Error::NoCompatibleFirmware(_) | Error::NotADowngrade { .. } => {
                FailureReason::NoCompatibleFirmware
            }
            Error::StagingFailed { kind, .. } => FailureReason::StagingFailed { kind: *kind },
            Error::Authentication(_) => FailureReason::Authentication,
            Error::Unreachable(_) => FailureReason::Unreachable,
            Error::DeviceBusy(_) => FailureReason::DeviceBusy,
            _ => FailureReason::Protocol,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DiscoveryTimeout => write!(f, "device not found"),
            FailureReason::NoCompatibleFirmware => write!(f, "no compatible firmware"),
            FailureReason::StagingFailed { kind } => write!(f, "staging failed ({})", kind),
            FailureReason::Authentication => write!(f, "authentication failed"),
            FailureReason::Unreachable => write!(f, "device unreachable"),
            FailureReason::Protocol => write!(f, "protocol error"),
            FailureReason::ConfirmationTimeout => write!(f, "confirmation timed out"),
            FailureReason::NoDeviceResponse => write!(f, "no device response"),
            FailureReason::DowngradeRejected => write!(f, "downgrade rejected by device"),
            FailureReason::UnexpectedFirmware { reported } => {
                write!(f, "device reports unexpected firmware {}", reported)
            }
            FailureReason::DeviceBusy => write!(f, "device busy with another session"),
        }
    }
}

/// One entry of the session event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// State the session was in when the event was recorded.
    pub state: SessionState,
    /// Attempt number within that state.
    pub attempt: u32,
    /// What happened.
    pub message: String,
}

/// Externally visible progress of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Working in the given state.
    InProgress(SessionState),
    /// Blocked on an on-screen prompt only a person at the TV can answer.
    WaitingOnDeviceConfirmation,
    /// Finished in the given terminal state.
    Finished(SessionState),
}

/// Persisted outcome of a session, including its full event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session ID.
    pub id: String,
    /// Device the session targeted.
    pub device: Device,
    /// Target release.
    pub release: FirmwareRelease,
    /// Staged payload, if staging completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagedPayload>,
    /// Firmware the device ran before the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_downgrade_version: Option<String>,
    /// Final state.
    pub state: SessionState,
    /// Failure reason when `state` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Entries per state.
    pub attempts: BTreeMap<SessionState, u32>,
    /// Number of times the update trigger was sent.
    pub triggers_issued: u32,
    /// Event log.
    pub events: Vec<SessionEvent>,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
