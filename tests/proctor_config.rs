use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use exam_proctor::config::ProctorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PROCTOR_CONFIG",
        "PROCTOR_API_URL",
        "PROCTOR_API_TOKEN",
        "PROCTOR_API_TOKEN_PATH",
        "PROCTOR_MAX_VIOLATIONS",
        "PROCTOR_MARKER_PATH",
        "PROCTOR_UPLOAD_RETRIES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    std::fs::write(&token_path, "secret-token\n").expect("write token");
    let json = format!(
        r#"{{
            "api": {{
                "base_url": "https://proctor.example.edu/api",
                "token_path": "{}",
                "request_timeout_secs": 12
            }},
            "perception": {{
                "loop_interval_ms": 250,
                "no_face_threshold_frames": 3
            }},
            "violations": {{
                "max_violations_allowed": 7
            }},
            "recorder": {{
                "auto_save_secs": 30,
                "upload_max_retries": 5
            }},
            "fullscreen": {{
                "transition_timeout_ms": 1500
            }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("PROCTOR_CONFIG", file.path());
    std::env::set_var("PROCTOR_MAX_VIOLATIONS", "3");
    std::env::set_var("PROCTOR_MARKER_PATH", "/var/lib/proctor/marker.json");

    let cfg = ProctorConfig::load().expect("load config");

    assert_eq!(cfg.api.base_url, "https://proctor.example.edu/api");
    assert_eq!(cfg.api.token.as_deref(), Some("secret-token"));
    assert_eq!(cfg.api.request_timeout, Duration::from_secs(12));
    assert_eq!(cfg.perception.loop_interval, Duration::from_millis(250));
    assert_eq!(cfg.perception.no_face_threshold_frames, 3);
    assert_eq!(cfg.perception.violation_threshold_frames, 4);
    assert_eq!(cfg.violations.max_violations_allowed, 3);
    assert_eq!(cfg.recorder.auto_save_interval, Duration::from_secs(30));
    assert_eq!(cfg.recorder.upload_max_retries, 5);
    assert_eq!(
        cfg.recorder.marker_path,
        std::path::PathBuf::from("/var/lib/proctor/marker.json")
    );
    assert_eq!(cfg.fullscreen.transition_timeout, Duration::from_millis(1500));

    clear_env();
    let _ = std::fs::remove_file(token_path);
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [api]
        base_url = "stub://local"

        [environment]
        devtools_poll_ms = 500

        [recorder]
        timeslice_ms = 2000
        mime_type = "video/webm"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("PROCTOR_CONFIG", file.path());

    let cfg = ProctorConfig::load().expect("load config");
    assert_eq!(cfg.api.base_url, "stub://local");
    assert_eq!(cfg.environment.devtools_poll, Duration::from_millis(500));
    assert_eq!(cfg.recorder.timeslice, Duration::from_secs(2));
    assert_eq!(cfg.recorder.mime_type, "video/webm");
    assert_eq!(cfg.violations.max_violations_allowed, 5);

    clear_env();
}

#[test]
fn defaults_without_any_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ProctorConfig::load().expect("load defaults");
    assert!(cfg.api.base_url.starts_with("stub://"));
    assert_eq!(cfg.recorder.upload_max_retries, 3);
    assert_eq!(cfg.recorder.recovery_window, Duration::from_secs(24 * 60 * 60));
    assert_eq!(cfg.recorder.cleanup_window, Duration::from_secs(7 * 24 * 60 * 60));
}

#[test]
fn rejects_invalid_overrides_and_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PROCTOR_UPLOAD_RETRIES", "many");
    assert!(ProctorConfig::load().is_err());
    std::env::set_var("PROCTOR_UPLOAD_RETRIES", "0");
    assert!(ProctorConfig::load().is_err());
    clear_env();

    std::env::set_var("PROCTOR_API_URL", "ftp://backend");
    assert!(ProctorConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("PROCTOR_CONFIG", file.path());
    assert!(ProctorConfig::load().is_err());

    std::env::set_var("PROCTOR_CONFIG", "/nonexistent/proctor.json");
    assert!(ProctorConfig::load().is_err());

    clear_env();
}
