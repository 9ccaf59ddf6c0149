//! Integration tests for file I/O operations.
//!
//! Tests cover:
//! - Session report save/load
//! - Session listing
//! - Configuration loading

use chrono::Utc;
use lgtv_downgrade::core::session::{list_session_dirs, load_report, save_report, REPORT_FILE};
use lgtv_downgrade::models::config::{load_config_from, UpdateMode};
use lgtv_downgrade::models::device::Device;
use lgtv_downgrade::models::firmware::{Confidence, FirmwareRelease};
use lgtv_downgrade::models::payload::StagingErrorKind;
use lgtv_downgrade::models::session::{FailureReason, SessionEvent, SessionReport, SessionState};
use lgtv_downgrade::utils::version::FirmwareVersion;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use tempfile::TempDir;

fn report(id: &str, state: SessionState, failure: Option<FailureReason>) -> SessionReport {
    let version = FirmwareVersion::parse("03.21.30").unwrap();
    let mut attempts = BTreeMap::new();
    attempts.insert(SessionState::Discovering, 1);
    attempts.insert(SessionState::Staging, 2);
    attempts.insert(state, 1);

    SessionReport {
        id: id.to_string(),
        device: Device::with_identity(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            "OLED55CX6LA",
            FirmwareVersion::parse("04.40.16").unwrap(),
        ),
        release: FirmwareRelease {
            models: vec!["OLED55CX6LA".to_string()],
            version,
            locator: "/srv/fw/CX-032130.epk".to_string(),
            sha256: None,
            size_bytes: Some(1024),
            confidence: Confidence::Exact,
            rootable: Some(true),
        },
        payload: None,
        pre_downgrade_version: Some("04.40.16".to_string()),
        state,
        failure,
        attempts,
        triggers_issued: 0,
        events: vec![SessionEvent {
            at: Utc::now(),
            state: SessionState::Staging,
            attempt: 2,
            message: "media removed, retrying".to_string(),
        }],
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
    }
}

// ========== REPORT I/O TESTS ==========

#[test]
fn test_save_and_load_failed_report() {
    let temp_dir = TempDir::new().unwrap();
    let failure = FailureReason::StagingFailed {
        kind: StagingErrorKind::MediaRemoved,
    };
    let original = report("20260101_120000_abcd1234", SessionState::Failed, Some(failure.clone()));

    let path = save_report(&original, temp_dir.path()).unwrap();
    assert!(path.ends_with(REPORT_FILE));

    let loaded = load_report(&path).unwrap();
    assert_eq!(loaded.state, SessionState::Failed);
    assert_eq!(loaded.failure, Some(failure));
    assert_eq!(loaded.attempts.get(&SessionState::Staging), Some(&2));
    assert_eq!(loaded.events[0].message, "media removed, retrying");
    assert_eq!(loaded.release.version, original.release.version);
}

#[test]
fn test_report_json_layout() {
    let temp_dir = TempDir::new().unwrap();
    let original = report(
        "20260101_120000_abcd1234",
        SessionState::Failed,
        Some(FailureReason::UnexpectedFirmware {
            reported: "03.25.00".to_string(),
        }),
    );
    let path = save_report(&original, temp_dir.path()).unwrap();

    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["state"], "failed");
    assert_eq!(json["failure"]["reason"], "unexpected_firmware");
    assert_eq!(json["failure"]["reported"], "03.25.00");
    assert_eq!(json["release"]["version"], "03.21.30");
    assert!(json.get("payload").is_none());
}

#[test]
fn test_load_missing_report() {
    assert!(load_report(std::path::Path::new("/nonexistent/session.json")).is_err());
}

// ========== SESSION LISTING TESTS ==========

#[test]
fn test_list_sessions_newest_first() {
    let temp_dir = TempDir::new().unwrap();
    for id in ["20260101_090000_aaaaaaaa", "20260301_090000_cccccccc", "20260201_090000_bbbbbbbb"] {
        save_report(&report(id, SessionState::Succeeded, None), temp_dir.path()).unwrap();
    }
    std::fs::write(temp_dir.path().join("stray.txt"), "x").unwrap();

    let dirs = list_session_dirs(temp_dir.path()).unwrap();
    let names: Vec<String> = dirs
        .iter()
        .map(|d| d.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "20260301_090000_cccccccc",
            "20260201_090000_bbbbbbbb",
            "20260101_090000_aaaaaaaa"
        ]
    );
}

#[test]
fn test_list_sessions_missing_dir() {
    let temp_dir = TempDir::new().unwrap();
    assert!(list_session_dirs(&temp_dir.path().join("sessions")).unwrap().is_empty());
}

// ========== CONFIG TESTS ==========

#[test]
fn test_load_config_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        sessions_dir = "/var/lib/lgtv/sessions"

        [remote]
        identity_file = "/home/me/.ssh/tv_key"
        update_mode = "user"

        [reboot]
        up_timeout_secs = 900

        [catalog]
        file = "/etc/lgtv/catalog.toml"
        "#,
    )
    .unwrap();

    let config = load_config_from(&path);
    assert_eq!(config.remote.update_mode, UpdateMode::User);
    assert_eq!(config.remote.user, "prisoner");
    assert_eq!(config.reboot.up_timeout_secs, 900);
    assert_eq!(config.reboot.down_timeout_secs, 180);
    assert_eq!(config.sessions_dir, std::path::PathBuf::from("/var/lib/lgtv/sessions"));
    assert!(config.catalog.file.is_some());
}

#[test]
fn test_invalid_config_falls_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[remote\nport = ").unwrap();

    let config = load_config_from(&path);
    assert_eq!(config.remote.port, 9922);
}
