//! Per-device install status and its state machine.
//!
//! ```text
//! pending --progress--> installing --progress--> installing
//! pending|installing --result(ok)--> success
//! pending|installing --result(err)--> error
//! ```
//!
//! Removal on batch expiry is handled by the dispatcher, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MSG_SENDING: &str = "Sending command...";
pub const MSG_INSTALLING: &str = "Installing...";
pub const MSG_SUCCESS: &str = "Installed successfully";
pub const MSG_FAILED: &str = "Installation failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Pending,
    Installing,
    Success,
    Error,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallState::Success | InstallState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallState::Pending => "pending",
            InstallState::Installing => "installing",
            InstallState::Success => "success",
            InstallState::Error => "error",
        }
    }
}

/// Tracker row for one (device, command) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub device_id: String,
    /// Snapshot taken at dispatch time; the device may go away afterwards.
    pub device_name: String,
    pub status: InstallState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub issued_at: DateTime<Utc>,
}

/// Outcome of feeding an agent report into an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Entry already terminal; report ignored.
    Ignored,
}

impl InstallStatus {
    pub fn pending(device_id: &str, device_name: &str, issued_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            status: InstallState::Pending,
            message: MSG_SENDING.to_string(),
            progress: None,
            issued_at,
        }
    }

    /// Advisory progress. No monotonicity: a later report simply overwrites.
    pub fn apply_progress(&mut self, progress: Option<f64>, text: Option<&str>) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }
        self.status = InstallState::Installing;
        self.progress = progress.map(clamp_percent);
        self.message = non_blank(text).unwrap_or(MSG_INSTALLING).to_string();
        Transition::Applied
    }

    pub fn apply_result(&mut self, success: bool, text: Option<&str>) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }
        let fallback = if success { MSG_SUCCESS } else { MSG_FAILED };
        self.status = if success {
            InstallState::Success
        } else {
            InstallState::Error
        };
        self.progress = None;
        self.message = non_blank(text).unwrap_or(fallback).to_string();
        Transition::Applied
    }
}

pub fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> InstallStatus {
        InstallStatus::pending("pc-1", "front-desk", Utc::now())
    }

    #[test]
    fn test_pending_defaults() {
        let e = entry();
        assert_eq!(e.status, InstallState::Pending);
        assert_eq!(e.message, MSG_SENDING);
        assert!(e.progress.is_none());
    }

    #[test]
    fn test_progress_moves_to_installing() {
        let mut e = entry();
        assert_eq!(e.apply_progress(Some(50.0), None), Transition::Applied);
        assert_eq!(e.status, InstallState::Installing);
        assert_eq!(e.progress, Some(50));
        assert_eq!(e.message, MSG_INSTALLING);

        // out of order progress is accepted
        e.apply_progress(Some(20.0), Some("Copying files"));
        assert_eq!(e.progress, Some(20));
        assert_eq!(e.message, "Copying files");
    }

    #[test]
    fn test_progress_is_idempotent() {
        let mut once = entry();
        once.apply_progress(Some(40.0), Some("step"));
        let mut twice = entry();
        twice.issued_at = once.issued_at;
        twice.apply_progress(Some(40.0), Some("step"));
        twice.apply_progress(Some(40.0), Some("step"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_result_is_terminal() {
        let mut e = entry();
        e.apply_progress(Some(90.0), None);
        assert_eq!(e.apply_result(true, None), Transition::Applied);
        assert_eq!(e.status, InstallState::Success);
        assert_eq!(e.message, MSG_SUCCESS);
        assert!(e.progress.is_none());

        let before = e.clone();
        assert_eq!(e.apply_progress(Some(10.0), None), Transition::Ignored);
        assert_eq!(e.apply_result(false, Some("late")), Transition::Ignored);
        assert_eq!(e, before);
    }

    #[test]
    fn test_error_result_from_pending() {
        let mut e = entry();
        e.apply_result(false, Some("Driver not found"));
        assert_eq!(e.status, InstallState::Error);
        assert_eq!(e.message, "Driver not found");

        let mut blank = entry();
        blank.apply_result(false, Some("   "));
        assert_eq!(blank.message, MSG_FAILED);
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(-5.0), 0);
        assert_eq!(clamp_percent(49.6), 50);
        assert_eq!(clamp_percent(250.0), 100);
        assert_eq!(clamp_percent(f64::NAN), 0);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let value = serde_json::to_value(entry()).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["deviceName"], "front-desk");
    }
}
