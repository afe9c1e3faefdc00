//! proctor_demo - simulated exam session driving the full supervision stack

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use exam_proctor::environment::{FixedWindowMetrics, KeyPress, MemoryPage, PageSignal};
use exam_proctor::perception::scripted::{
    CountingOverlay, SceneScript, ScriptedDetector, SyntheticCamera, SyntheticFace,
};
use exam_proctor::perception::{GeometricEstimator, RenderTargets};
use exam_proctor::recording::{FileMarkerStore, ProgressSink};
use exam_proctor::sim::{SimulatedCapture, SimulatedDevices, SimulatedFullscreen};
use exam_proctor::transport::{self, MemoryApi, ProctoringApi, UploadFailure};
use exam_proctor::{clock, ProctorConfig, ProctoringDeps, ProctoringOrchestrator};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Well-behaved candidate.
    Clean,
    /// Candidate looks away, then presses a devtools hotkey.
    Distracted,
    /// Candidate switches tabs mid-exam.
    TabSwitch,
    /// Candidate leaves the camera frame.
    NoFace,
    /// Recording server rejects every upload.
    UploadFailure,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Exam length in seconds.
    #[arg(long, default_value_t = 8)]
    seconds: u64,
    /// Behaviour to simulate.
    #[arg(long, value_enum, default_value_t = Scenario::Clean)]
    scenario: Scenario,
    /// Preliminary session id (recordings stay attributed to it).
    #[arg(long, default_value = "prelim-demo")]
    preliminary_session: String,
    /// Main exam session id, switched to at the halfway point.
    #[arg(long, default_value = "main-demo")]
    main_session: String,
    /// Bytes the simulated encoder emits per timeslice.
    #[arg(long, default_value_t = 64 * 1024)]
    bytes_per_slice: usize,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut config = {
        let _stage = ui.stage("Load configuration");
        ProctorConfig::load()?
    };
    // Keep the simulated exam lively.
    config.perception.loop_interval = Duration::from_millis(200);
    config.perception.startup_grace = Duration::from_secs(1);
    config.recorder.timeslice = Duration::from_millis(250);
    config.recorder.retry_base_delay = Duration::from_millis(200);

    let memory_api = config
        .api
        .base_url
        .starts_with("stub://")
        .then(|| Arc::new(MemoryApi::new()));
    let api: Arc<dyn ProctoringApi> = match &memory_api {
        Some(memory) => memory.clone() as Arc<dyn ProctoringApi>,
        None => transport::connect(&config)?,
    };
    if args.scenario == Scenario::UploadFailure {
        let memory = memory_api
            .as_ref()
            .ok_or_else(|| anyhow!("upload-failure scenario needs a stub:// api url"))?;
        memory.set_upload_failure(UploadFailure::Always(500));
    }

    let page = Arc::new(MemoryPage::new());
    let devices = Arc::new(SimulatedDevices::new());
    let fullscreen = Arc::new(SimulatedFullscreen::new(Some(page.clone())));
    let script = SceneScript::new();
    script.push(vec![SyntheticFace::default()]);
    let upload_bar: Arc<dyn ProgressSink> = Arc::new(ui.upload_bar());

    let orchestrator = ProctoringOrchestrator::new(
        config.clone(),
        ProctoringDeps {
            api,
            devices,
            fullscreen,
            page: page.clone(),
            window: Arc::new(FixedWindowMetrics::new((1440, 900), (1440, 820))),
            capture: Arc::new(SimulatedCapture::generating(args.bytes_per_slice)),
            markers: Arc::new(FileMarkerStore::new(config.recorder.marker_path.clone())),
            notifier: Arc::new(ui::ConsoleNotifier),
            clock: clock::system(),
            detector: Box::new(ScriptedDetector::new(script.clone())),
            estimator: Box::new(GeometricEstimator),
            progress: Some(upload_bar),
            audit: None,
        },
    )?;

    let (tx, rx) = mpsc::channel();
    let logout_tx = tx.clone();
    orchestrator.set_exam_callbacks(
        Some(Arc::new(move || {
            let _ = logout_tx.send(());
        })),
        None,
    );
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    {
        let _stage = ui.stage("Acquire camera and screen");
        orchestrator.set_session(&args.preliminary_session, true);
        let camera = orchestrator
            .request_camera_stream()
            .ok_or_else(|| anyhow!("camera unavailable"))?;
        let screen = orchestrator
            .request_screen_stream()
            .ok_or_else(|| anyhow!("screen share unavailable"))?;
        if !orchestrator.load_models() {
            return Err(anyhow!("face models failed to load"));
        }
        orchestrator.attach_render_targets(RenderTargets {
            video: Box::new(SyntheticCamera::new()),
            overlay: Box::new(CountingOverlay::default()),
        });
        orchestrator.set_exam_active(true);
        orchestrator.start_monitoring(Some(camera), Some(screen));
    }

    let total = Duration::from_secs(args.seconds.max(2));
    let halfway = total / 2;
    let started = Instant::now();
    let mut switched = false;
    let mut incident = false;
    log::info!("exam running for {:?} ({:?} scenario); Ctrl-C ends early", total, args.scenario);
    loop {
        if rx.recv_timeout(Duration::from_millis(250)).is_ok() {
            log::info!("exam ended early");
            break;
        }
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        if !switched && elapsed >= halfway {
            switched = true;
            let _stage = ui.stage("Switch to main exam session");
            orchestrator.pause_keep_recording();
            orchestrator.set_session(&args.main_session, false);
            orchestrator.resume_monitoring();
        }
        if !incident && elapsed >= total / 4 {
            incident = true;
            run_incident(args.scenario, &page, &script);
        }
    }

    {
        let _stage = ui.stage("Finish exam and upload recording");
        orchestrator.stop_proctoring_session();
    }

    let snapshot = orchestrator.snapshot();
    let summary = serde_json::json!({
        "scenario": format!("{:?}", args.scenario),
        "lifecycle": format!("{:?}", snapshot.lifecycle),
        "violation_count": snapshot.violations.violation_count,
        "terminated": snapshot.violations.is_terminated,
        "recording_session": snapshot.session.recording_session_id(),
        "upload_status": orchestrator.check_upload_status().map(|s| format!("{:?}", s.status)),
        "accepted_uploads": memory_api.as_ref().map(|m| m.accepted_uploads().len()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_incident(scenario: Scenario, page: &MemoryPage, script: &SceneScript) {
    match scenario {
        Scenario::Clean | Scenario::UploadFailure => {}
        Scenario::Distracted => {
            let away = SyntheticFace {
                yaw_deg: 55.0,
                ..SyntheticFace::default()
            };
            script.push_repeated(vec![away], 8);
            script.push(vec![SyntheticFace::default()]);
            page.dispatch(PageSignal::KeyDown(KeyPress::plain("F12")));
        }
        Scenario::TabSwitch => {
            page.dispatch(PageSignal::VisibilityChanged { hidden: true });
            page.dispatch(PageSignal::VisibilityChanged { hidden: false });
        }
        Scenario::NoFace => {
            script.push(vec![]);
        }
    }
}
