use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "stub://proctoring";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_LOOP_INTERVAL_MS: u64 = 500;
const DEFAULT_STARTUP_GRACE_MS: u64 = 5_000;
const DEFAULT_MIN_FACE_SIZE_PX: f32 = 60.0;
const DEFAULT_NO_FACE_THRESHOLD_FRAMES: u32 = 6;
const DEFAULT_VIOLATION_THRESHOLD_FRAMES: u32 = 4;
const DEFAULT_HEAD_YAW_TURNED_DEG: f32 = 25.0;
const DEFAULT_HEAD_YAW_AWAY_DEG: f32 = 40.0;
const DEFAULT_HEAD_PITCH_AWAY_DEG: f32 = 25.0;
const DEFAULT_EAR_CLOSED: f32 = 0.18;
const DEFAULT_DETECTOR_INPUT_SIZE: u32 = 224;
const DEFAULT_DETECTOR_SCORE_THRESHOLD: f32 = 0.5;

const DEFAULT_DEVTOOLS_POLL_MS: u64 = 2_000;
const DEFAULT_DEVTOOLS_DELTA_PX: u32 = 200;

const DEFAULT_MAX_VIOLATIONS: u32 = 5;
const DEFAULT_TOAST_COOLDOWN_MS: u64 = 5_000;

const DEFAULT_TIMESLICE_MS: u64 = 1_000;
const DEFAULT_AUTO_SAVE_SECS: u64 = 90;
const DEFAULT_AUTO_SAVE_MIN_BYTES: usize = 100 * 1024;
const DEFAULT_UPLOAD_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_LARGE_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_UPLOAD_PART_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 10 * 60;
const DEFAULT_MIME_TYPE: &str = "video/webm;codecs=vp8,opus";
const DEFAULT_VIDEO_BITRATE: u32 = 1_000_000;
const DEFAULT_AUDIO_BITRATE: u32 = 64_000;
const DEFAULT_MARKER_PATH: &str = "failed_screen_recording.json";
const DEFAULT_RECOVERY_WINDOW_SECS: u64 = 60 * 60 * 24;
const DEFAULT_CLEANUP_WINDOW_SECS: u64 = 60 * 60 * 24 * 7;

const DEFAULT_FULLSCREEN_TRANSITION_MS: u64 = 3_000;

#[derive(Debug, Deserialize, Default)]
struct ProctorConfigFile {
    api: Option<ApiConfigFile>,
    perception: Option<PerceptionConfigFile>,
    environment: Option<EnvironmentConfigFile>,
    violations: Option<ViolationConfigFile>,
    recorder: Option<RecorderConfigFile>,
    fullscreen: Option<FullscreenConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    base_url: Option<String>,
    token: Option<String>,
    token_path: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PerceptionConfigFile {
    loop_interval_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
    min_face_size_px: Option<f32>,
    no_face_threshold_frames: Option<u32>,
    violation_threshold_frames: Option<u32>,
    head_yaw_turned_deg: Option<f32>,
    head_yaw_away_deg: Option<f32>,
    head_pitch_away_deg: Option<f32>,
    ear_closed_threshold: Option<f32>,
    detector_input_size: Option<u32>,
    detector_score_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EnvironmentConfigFile {
    devtools_poll_ms: Option<u64>,
    devtools_size_delta_px: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ViolationConfigFile {
    max_violations_allowed: Option<u32>,
    toast_cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    timeslice_ms: Option<u64>,
    auto_save_secs: Option<u64>,
    auto_save_min_bytes: Option<usize>,
    upload_max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    large_upload_bytes: Option<usize>,
    upload_part_bytes: Option<usize>,
    upload_timeout_secs: Option<u64>,
    mime_type: Option<String>,
    video_bitrate: Option<u32>,
    audio_bitrate: Option<u32>,
    marker_path: Option<PathBuf>,
    recovery_window_secs: Option<u64>,
    cleanup_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FullscreenConfigFile {
    transition_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProctorConfig {
    pub api: ApiSettings,
    pub perception: PerceptionSettings,
    pub environment: EnvironmentSettings,
    pub violations: ViolationSettings,
    pub recorder: RecorderSettings,
    pub fullscreen: FullscreenSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PerceptionSettings {
    pub loop_interval: Duration,
    pub startup_grace: Duration,
    pub min_face_size_px: f32,
    pub no_face_threshold_frames: u32,
    pub violation_threshold_frames: u32,
    pub head_yaw_turned_deg: f32,
    pub head_yaw_away_deg: f32,
    pub head_pitch_away_deg: f32,
    pub ear_closed_threshold: f32,
    pub detector_input_size: u32,
    pub detector_score_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub devtools_poll: Duration,
    pub devtools_size_delta_px: u32,
}

#[derive(Debug, Clone)]
pub struct ViolationSettings {
    pub max_violations_allowed: u32,
    pub toast_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub timeslice: Duration,
    pub auto_save_interval: Duration,
    pub auto_save_min_bytes: usize,
    pub upload_max_retries: u32,
    pub retry_base_delay: Duration,
    pub large_upload_bytes: usize,
    pub upload_part_bytes: usize,
    pub upload_timeout: Duration,
    pub mime_type: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub marker_path: PathBuf,
    pub recovery_window: Duration,
    pub cleanup_window: Duration,
}

#[derive(Debug, Clone)]
pub struct FullscreenSettings {
    pub transition_timeout: Duration,
}

impl Default for ProctorConfig {
    fn default() -> Self {
        // Defaults cannot fail; every optional section falls back to constants.
        Self::from_file(ProctorConfigFile::default())
    }
}

impl Default for PerceptionSettings {
    fn default() -> Self {
        ProctorConfig::default().perception
    }
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        ProctorConfig::default().environment
    }
}

impl Default for ViolationSettings {
    fn default() -> Self {
        ProctorConfig::default().violations
    }
}

impl Default for RecorderSettings {
    fn default() -> Self {
        ProctorConfig::default().recorder
    }
}

impl ProctorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProctorConfigFile) -> Self {
        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            base_url: api_file
                .base_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: api_file.token,
            token_path: api_file.token_path,
            request_timeout: Duration::from_secs(
                api_file
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        };

        let p = file.perception.unwrap_or_default();
        let perception = PerceptionSettings {
            loop_interval: Duration::from_millis(
                p.loop_interval_ms.unwrap_or(DEFAULT_LOOP_INTERVAL_MS),
            ),
            startup_grace: Duration::from_millis(
                p.startup_grace_ms.unwrap_or(DEFAULT_STARTUP_GRACE_MS),
            ),
            min_face_size_px: p.min_face_size_px.unwrap_or(DEFAULT_MIN_FACE_SIZE_PX),
            no_face_threshold_frames: p
                .no_face_threshold_frames
                .unwrap_or(DEFAULT_NO_FACE_THRESHOLD_FRAMES),
            violation_threshold_frames: p
                .violation_threshold_frames
                .unwrap_or(DEFAULT_VIOLATION_THRESHOLD_FRAMES),
            head_yaw_turned_deg: p
                .head_yaw_turned_deg
                .unwrap_or(DEFAULT_HEAD_YAW_TURNED_DEG),
            head_yaw_away_deg: p.head_yaw_away_deg.unwrap_or(DEFAULT_HEAD_YAW_AWAY_DEG),
            head_pitch_away_deg: p
                .head_pitch_away_deg
                .unwrap_or(DEFAULT_HEAD_PITCH_AWAY_DEG),
            ear_closed_threshold: p.ear_closed_threshold.unwrap_or(DEFAULT_EAR_CLOSED),
            detector_input_size: p
                .detector_input_size
                .unwrap_or(DEFAULT_DETECTOR_INPUT_SIZE),
            detector_score_threshold: p
                .detector_score_threshold
                .unwrap_or(DEFAULT_DETECTOR_SCORE_THRESHOLD),
        };

        let e = file.environment.unwrap_or_default();
        let environment = EnvironmentSettings {
            devtools_poll: Duration::from_millis(
                e.devtools_poll_ms.unwrap_or(DEFAULT_DEVTOOLS_POLL_MS),
            ),
            devtools_size_delta_px: e
                .devtools_size_delta_px
                .unwrap_or(DEFAULT_DEVTOOLS_DELTA_PX),
        };

        let v = file.violations.unwrap_or_default();
        let violations = ViolationSettings {
            max_violations_allowed: v.max_violations_allowed.unwrap_or(DEFAULT_MAX_VIOLATIONS),
            toast_cooldown: Duration::from_millis(
                v.toast_cooldown_ms.unwrap_or(DEFAULT_TOAST_COOLDOWN_MS),
            ),
        };

        let r = file.recorder.unwrap_or_default();
        let recorder = RecorderSettings {
            timeslice: Duration::from_millis(r.timeslice_ms.unwrap_or(DEFAULT_TIMESLICE_MS)),
            auto_save_interval: Duration::from_secs(
                r.auto_save_secs.unwrap_or(DEFAULT_AUTO_SAVE_SECS),
            ),
            auto_save_min_bytes: r.auto_save_min_bytes.unwrap_or(DEFAULT_AUTO_SAVE_MIN_BYTES),
            upload_max_retries: r.upload_max_retries.unwrap_or(DEFAULT_UPLOAD_MAX_RETRIES),
            retry_base_delay: Duration::from_millis(
                r.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            large_upload_bytes: r.large_upload_bytes.unwrap_or(DEFAULT_LARGE_UPLOAD_BYTES),
            upload_part_bytes: r.upload_part_bytes.unwrap_or(DEFAULT_UPLOAD_PART_BYTES),
            upload_timeout: Duration::from_secs(
                r.upload_timeout_secs.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS),
            ),
            mime_type: r.mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            video_bitrate: r.video_bitrate.unwrap_or(DEFAULT_VIDEO_BITRATE),
            audio_bitrate: r.audio_bitrate.unwrap_or(DEFAULT_AUDIO_BITRATE),
            marker_path: r
                .marker_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MARKER_PATH)),
            recovery_window: Duration::from_secs(
                r.recovery_window_secs
                    .unwrap_or(DEFAULT_RECOVERY_WINDOW_SECS),
            ),
            cleanup_window: Duration::from_secs(
                r.cleanup_window_secs.unwrap_or(DEFAULT_CLEANUP_WINDOW_SECS),
            ),
        };

        let fullscreen = FullscreenSettings {
            transition_timeout: Duration::from_millis(
                file.fullscreen
                    .and_then(|f| f.transition_timeout_ms)
                    .unwrap_or(DEFAULT_FULLSCREEN_TRANSITION_MS),
            ),
        };

        Self {
            api,
            perception,
            environment,
            violations,
            recorder,
            fullscreen,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("PROCTOR_API_URL") {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
        if let Ok(token) = std::env::var("PROCTOR_API_TOKEN") {
            if !token.trim().is_empty() {
                self.api.token = Some(token);
            }
        }
        if let Ok(path) = std::env::var("PROCTOR_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api.token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(max) = std::env::var("PROCTOR_MAX_VIOLATIONS") {
            self.violations.max_violations_allowed = max
                .parse()
                .map_err(|_| anyhow!("PROCTOR_MAX_VIOLATIONS must be a positive integer"))?;
        }
        if let Ok(path) = std::env::var("PROCTOR_MARKER_PATH") {
            if !path.trim().is_empty() {
                self.recorder.marker_path = PathBuf::from(path);
            }
        }
        if let Ok(retries) = std::env::var("PROCTOR_UPLOAD_RETRIES") {
            self.recorder.upload_max_retries = retries
                .parse()
                .map_err(|_| anyhow!("PROCTOR_UPLOAD_RETRIES must be a positive integer"))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        let scheme = self
            .api
            .base_url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_lowercase())
            .ok_or_else(|| anyhow!("api base_url '{}' has no scheme", self.api.base_url))?;
        if !matches!(scheme.as_str(), "http" | "https" | "stub") {
            return Err(anyhow!(
                "unsupported api scheme '{}'; expected http(s) or stub",
                scheme
            ));
        }
        if self.api.token.is_none() {
            if let Some(path) = &self.api.token_path {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    anyhow!("failed to read api token {}: {}", path.display(), e)
                })?;
                self.api.token = Some(token.trim().to_string());
            }
        }

        if self.perception.loop_interval.is_zero() {
            return Err(anyhow!("perception loop interval must be greater than zero"));
        }
        if self.perception.no_face_threshold_frames == 0
            || self.perception.violation_threshold_frames == 0
        {
            return Err(anyhow!("debounce thresholds must be at least one frame"));
        }
        if self.perception.head_yaw_away_deg < self.perception.head_yaw_turned_deg {
            return Err(anyhow!(
                "head_yaw_away_deg must be >= head_yaw_turned_deg"
            ));
        }
        if self.environment.devtools_poll.is_zero() {
            return Err(anyhow!("devtools poll interval must be greater than zero"));
        }
        if self.violations.max_violations_allowed == 0 {
            return Err(anyhow!("max_violations_allowed must be greater than zero"));
        }
        if self.recorder.timeslice.is_zero() || self.recorder.auto_save_interval.is_zero() {
            return Err(anyhow!("recorder timeslice and auto-save interval must be > 0"));
        }
        if self.recorder.upload_max_retries == 0 {
            return Err(anyhow!("upload_max_retries must be at least 1"));
        }
        if self.recorder.upload_part_bytes == 0 {
            return Err(anyhow!("upload_part_bytes must be greater than zero"));
        }
        if self.recorder.cleanup_window < self.recorder.recovery_window {
            return Err(anyhow!(
                "failed-upload cleanup window must not be shorter than the recovery window"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ProctorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = ProctorConfig::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.violations.max_violations_allowed, 5);
        assert_eq!(cfg.recorder.auto_save_interval, Duration::from_secs(90));
        assert_eq!(cfg.recorder.upload_timeout, Duration::from_secs(600));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let mut cfg = ProctorConfig::default();
        cfg.api.base_url = "ftp://backend".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cleanup_shorter_than_recovery() {
        let mut cfg = ProctorConfig::default();
        cfg.recorder.cleanup_window = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: ProctorConfigFile =
            toml::from_str("[violations]\nmax_violations_allowed = 3\n").unwrap();
        let cfg = ProctorConfig::from_file(file);
        assert_eq!(cfg.violations.max_violations_allowed, 3);
        assert_eq!(cfg.violations.toast_cooldown, Duration::from_secs(5));
        assert_eq!(cfg.perception.no_face_threshold_frames, 6);
    }
}
