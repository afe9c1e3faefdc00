use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::notify::NoticeLevel;

/// Free-form violation context (e.g. which key was pressed).
pub type Metadata = BTreeMap<String, serde_json::Value>;

pub fn metadata<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    TabSwitched,
    TabReturned,
    WindowLostFocus,
    WindowGainedFocus,
    DevtoolsOpened,
    DevtoolsDebugger,
    SuspiciousHotkey,
    RightClickBlocked,
    TextCopied,
    TextPasted,
    NoFace,
    MultipleFaces,
    HeadTurned,
    LookingAway,
    EyesClosed,
    FullscreenExited,
    FullscreenRequestDenied,
    ScreenShareStopped,
    ScreenShareDenied,
    ScreenShareNotEntire,
    CameraAccessDenied,
    MultipleViolations,
    MediaRecorderInitFailed,
    ScreenRecordingFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    LogOnly,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::LogOnly => "log_only",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl ViolationType {
    pub const ALL: [ViolationType; 24] = [
        ViolationType::TabSwitched,
        ViolationType::TabReturned,
        ViolationType::WindowLostFocus,
        ViolationType::WindowGainedFocus,
        ViolationType::DevtoolsOpened,
        ViolationType::DevtoolsDebugger,
        ViolationType::SuspiciousHotkey,
        ViolationType::RightClickBlocked,
        ViolationType::TextCopied,
        ViolationType::TextPasted,
        ViolationType::NoFace,
        ViolationType::MultipleFaces,
        ViolationType::HeadTurned,
        ViolationType::LookingAway,
        ViolationType::EyesClosed,
        ViolationType::FullscreenExited,
        ViolationType::FullscreenRequestDenied,
        ViolationType::ScreenShareStopped,
        ViolationType::ScreenShareDenied,
        ViolationType::ScreenShareNotEntire,
        ViolationType::CameraAccessDenied,
        ViolationType::MultipleViolations,
        ViolationType::MediaRecorderInitFailed,
        ViolationType::ScreenRecordingFailed,
    ];

    /// Wire name used by the audit endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::TabSwitched => "tab_switched",
            ViolationType::TabReturned => "tab_returned",
            ViolationType::WindowLostFocus => "window_lost_focus",
            ViolationType::WindowGainedFocus => "window_gained_focus",
            ViolationType::DevtoolsOpened => "devtools_opened",
            ViolationType::DevtoolsDebugger => "devtools_debugger",
            ViolationType::SuspiciousHotkey => "suspicious_hotkey",
            ViolationType::RightClickBlocked => "right_click_blocked",
            ViolationType::TextCopied => "text_copied",
            ViolationType::TextPasted => "text_pasted",
            ViolationType::NoFace => "no_face",
            ViolationType::MultipleFaces => "multiple_faces",
            ViolationType::HeadTurned => "head_turned",
            ViolationType::LookingAway => "looking_away",
            ViolationType::EyesClosed => "eyes_closed",
            ViolationType::FullscreenExited => "fullscreen_exited",
            ViolationType::FullscreenRequestDenied => "fullscreen_request_denied",
            ViolationType::ScreenShareStopped => "screen_share_stopped",
            ViolationType::ScreenShareDenied => "screen_share_denied",
            ViolationType::ScreenShareNotEntire => "screen_share_not_entire",
            ViolationType::CameraAccessDenied => "camera_access_denied",
            ViolationType::MultipleViolations => "multiple_violations",
            ViolationType::MediaRecorderInitFailed => "media_recorder_init_failed",
            ViolationType::ScreenRecordingFailed => "screen_recording_failed",
        }
    }

    /// Fixed classification table.
    pub fn severity(self) -> Severity {
        use ViolationType::*;
        match self {
            DevtoolsDebugger | TabSwitched | MultipleViolations | ScreenShareStopped
            | FullscreenExited | WindowLostFocus | SuspiciousHotkey | NoFace | MultipleFaces
            | DevtoolsOpened | CameraAccessDenied | ScreenShareDenied => Severity::Critical,
            HeadTurned | LookingAway | EyesClosed => Severity::High,
            TextCopied | TextPasted | TabReturned | WindowGainedFocus => Severity::LogOnly,
            RightClickBlocked => Severity::Low,
            FullscreenRequestDenied
            | ScreenShareNotEntire
            | MediaRecorderInitFailed
            | ScreenRecordingFailed => Severity::Medium,
        }
    }

    /// Fatal types terminate the attempt on first occurrence.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ViolationType::ScreenShareStopped
                | ViolationType::ScreenShareDenied
                | ViolationType::CameraAccessDenied
                | ViolationType::TabSwitched
        )
    }

    /// Curated toast for the test-taker, if this type has one.
    pub fn notice(self) -> Option<(NoticeLevel, &'static str)> {
        use ViolationType::*;
        let notice = match self {
            TabSwitched => (
                NoticeLevel::Error,
                "Switching tabs is not allowed during the exam.",
            ),
            FullscreenExited => (
                NoticeLevel::Error,
                "You left fullscreen mode. Return to fullscreen to continue.",
            ),
            DevtoolsOpened => (
                NoticeLevel::Error,
                "Developer tools are not allowed during the exam.",
            ),
            NoFace => (NoticeLevel::Error, "Your face is not visible to the camera."),
            MultipleFaces => (
                NoticeLevel::Error,
                "More than one person detected in front of the camera.",
            ),
            ScreenShareStopped => (NoticeLevel::Error, "Screen sharing was stopped."),
            WindowLostFocus => (
                NoticeLevel::Warning,
                "The exam window lost focus. Stay on the exam page.",
            ),
            HeadTurned => (NoticeLevel::Warning, "Please keep your head facing the screen."),
            LookingAway => (NoticeLevel::Warning, "Please keep looking at the screen."),
            EyesClosed => (NoticeLevel::Warning, "Please keep your eyes open."),
            _ => return None,
        };
        Some(notice)
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde() {
        for kind in ViolationType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn fatal_types_are_critical() {
        for kind in ViolationType::ALL.into_iter().filter(|k| k.is_fatal()) {
            assert_eq!(kind.severity(), Severity::Critical, "{kind}");
        }
    }

    #[test]
    fn clipboard_is_log_only() {
        assert_eq!(ViolationType::TextCopied.severity(), Severity::LogOnly);
        assert_eq!(ViolationType::TextPasted.severity(), Severity::LogOnly);
        assert!(ViolationType::TextCopied.notice().is_none());
    }

    #[test]
    fn pose_types_are_high() {
        assert_eq!(ViolationType::HeadTurned.severity(), Severity::High);
        assert_eq!(ViolationType::EyesClosed.severity(), Severity::High);
        assert_eq!(Severity::LogOnly.as_str(), "log_only");
    }
}
