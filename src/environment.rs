//! Page-level behavior signals: visibility, focus, fullscreen, keyboard, clipboard.
//!
//! The devtools checks are heuristics. A docked inspector widens the outer/inner window
//! delta and a console that evaluates the probe object trips its getter, but neither is a
//! reliable detector and both are treated as advisory signals only.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::EnvironmentSettings;
use crate::schedule::PeriodicTask;
use crate::violation::{metadata, Metadata, ViolationType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Visibility,
    Blur,
    Focus,
    Fullscreen,
    KeyDown,
    ContextMenu,
    Copy,
    Paste,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPress {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    pub meta: bool,
}

impl KeyPress {
    pub fn plain(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn with_ctrl_shift(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ctrl: true,
            shift: true,
            meta: false,
        }
    }

    /// F12, or Ctrl/Cmd+Shift+{I,J,C}.
    pub fn is_devtools_hotkey(&self) -> bool {
        if self.key == "F12" {
            return true;
        }
        (self.ctrl || self.meta)
            && self.shift
            && matches!(self.key.to_ascii_uppercase().as_str(), "I" | "J" | "C")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageSignal {
    VisibilityChanged { hidden: bool },
    WindowBlur,
    WindowFocus,
    FullscreenChanged { active: bool },
    KeyDown(KeyPress),
    ContextMenu,
    Copy,
    Paste,
}

impl PageSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            PageSignal::VisibilityChanged { .. } => SignalKind::Visibility,
            PageSignal::WindowBlur => SignalKind::Blur,
            PageSignal::WindowFocus => SignalKind::Focus,
            PageSignal::FullscreenChanged { .. } => SignalKind::Fullscreen,
            PageSignal::KeyDown(_) => SignalKind::KeyDown,
            PageSignal::ContextMenu => SignalKind::ContextMenu,
            PageSignal::Copy => SignalKind::Copy,
            PageSignal::Paste => SignalKind::Paste,
        }
    }
}

/// What the page should do with the native event after handlers ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalResponse {
    Allow,
    PreventDefault,
}

pub type SignalHandler = Arc<dyn Fn(&PageSignal) -> SignalResponse + Send + Sync>;
pub type ViolationCallback = Arc<dyn Fn(ViolationType, Metadata) + Send + Sync>;
pub type FullscreenCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Document/window event registry.
pub trait PageEvents: Send + Sync {
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Window geometry for the devtools heuristic.
pub trait WindowMetrics: Send + Sync {
    fn outer_size(&self) -> (u32, u32);
    fn inner_size(&self) -> (u32, u32);

    /// Logs a probe object whose getter records evaluation; true when it fired.
    fn inspector_probe(&self) -> bool {
        false
    }
}

/// Disposer for a running watcher. Dropping it has the same effect as `stop`.
pub struct EnvironmentGuard {
    page: Arc<dyn PageEvents>,
    subscriptions: Vec<SubscriptionId>,
    devtools_task: Option<PeriodicTask>,
}

impl EnvironmentGuard {
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn stop(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(task) = self.devtools_task.take() {
            task.stop();
        }
        for id in self.subscriptions.drain(..) {
            self.page.unsubscribe(id);
        }
        log::debug!("environment detectors cleaned up");
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if !self.subscriptions.is_empty() || self.devtools_task.is_some() {
            self.teardown();
        }
    }
}

pub struct EnvironmentWatcher {
    page: Arc<dyn PageEvents>,
    metrics: Arc<dyn WindowMetrics>,
    settings: EnvironmentSettings,
}

impl EnvironmentWatcher {
    pub fn new(
        page: Arc<dyn PageEvents>,
        metrics: Arc<dyn WindowMetrics>,
        settings: EnvironmentSettings,
    ) -> Self {
        Self {
            page,
            metrics,
            settings,
        }
    }

    /// Subscribes every page signal and starts the devtools poll.
    pub fn start(
        &self,
        on_violation: ViolationCallback,
        on_fullscreen: Option<FullscreenCallback>,
    ) -> Result<EnvironmentGuard> {
        let mut guard = EnvironmentGuard {
            page: self.page.clone(),
            subscriptions: Vec::new(),
            devtools_task: None,
        };

        let report = on_violation.clone();
        let handler: SignalHandler = Arc::new(move |signal| classify(signal, report.as_ref()));
        for kind in [
            SignalKind::Visibility,
            SignalKind::Blur,
            SignalKind::Focus,
            SignalKind::KeyDown,
            SignalKind::ContextMenu,
            SignalKind::Copy,
            SignalKind::Paste,
        ] {
            guard
                .subscriptions
                .push(self.page.subscribe(kind, handler.clone()));
        }

        if let Some(on_fullscreen) = on_fullscreen {
            let fullscreen: SignalHandler = Arc::new(move |signal| {
                if let PageSignal::FullscreenChanged { active } = signal {
                    on_fullscreen(*active);
                }
                SignalResponse::Allow
            });
            guard
                .subscriptions
                .push(self.page.subscribe(SignalKind::Fullscreen, fullscreen));
        }

        let metrics = self.metrics.clone();
        let threshold = self.settings.devtools_size_delta_px;
        let report = on_violation;
        guard.devtools_task = Some(PeriodicTask::spawn(
            "devtools-probe",
            self.settings.devtools_poll,
            move || {
                if devtools_suspected(metrics.as_ref(), threshold) {
                    report(ViolationType::DevtoolsOpened, Metadata::new());
                }
            },
        )?);
        log::info!("environment detectors started");
        Ok(guard)
    }
}

/// Maps one page signal to a violation report and the native-event response.
pub fn classify(
    signal: &PageSignal,
    report: &(dyn Fn(ViolationType, Metadata) + Send + Sync),
) -> SignalResponse {
    match signal {
        PageSignal::VisibilityChanged { hidden: true } => {
            report(
                ViolationType::TabSwitched,
                metadata([("force_count", serde_json::Value::Bool(true))]),
            );
            SignalResponse::Allow
        }
        PageSignal::VisibilityChanged { hidden: false } => {
            report(ViolationType::TabReturned, Metadata::new());
            SignalResponse::Allow
        }
        PageSignal::WindowBlur => {
            report(ViolationType::WindowLostFocus, Metadata::new());
            SignalResponse::Allow
        }
        PageSignal::WindowFocus => {
            report(ViolationType::WindowGainedFocus, Metadata::new());
            SignalResponse::Allow
        }
        PageSignal::KeyDown(key) if key.is_devtools_hotkey() => {
            report(
                ViolationType::SuspiciousHotkey,
                metadata([("key", serde_json::Value::String(key.key.clone()))]),
            );
            SignalResponse::PreventDefault
        }
        PageSignal::KeyDown(_) => SignalResponse::Allow,
        PageSignal::ContextMenu => {
            report(ViolationType::RightClickBlocked, Metadata::new());
            SignalResponse::PreventDefault
        }
        PageSignal::Copy => {
            report(ViolationType::TextCopied, Metadata::new());
            SignalResponse::Allow
        }
        PageSignal::Paste => {
            report(ViolationType::TextPasted, Metadata::new());
            SignalResponse::Allow
        }
        PageSignal::FullscreenChanged { .. } => SignalResponse::Allow,
    }
}

pub fn devtools_suspected(metrics: &dyn WindowMetrics, threshold_px: u32) -> bool {
    let (outer_w, outer_h) = metrics.outer_size();
    let (inner_w, inner_h) = metrics.inner_size();
    if outer_w.saturating_sub(inner_w) > threshold_px
        || outer_h.saturating_sub(inner_h) > threshold_px
    {
        return true;
    }
    metrics.inspector_probe()
}

/// In-memory page: handlers are invoked synchronously by `dispatch`.
#[derive(Default)]
pub struct MemoryPage {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<SubscriptionId, (SignalKind, SignalHandler)>>,
}

impl MemoryPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every handler subscribed to the signal's kind. `PreventDefault` wins.
    pub fn dispatch(&self, signal: PageSignal) -> SignalResponse {
        let kind = signal.kind();
        let handlers: Vec<SignalHandler> = self
            .handlers
            .lock()
            .map(|h| {
                h.values()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, handler)| handler.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut response = SignalResponse::Allow;
        for handler in handlers {
            if handler(&signal) == SignalResponse::PreventDefault {
                response = SignalResponse::PreventDefault;
            }
        }
        response
    }

    pub fn listener_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl PageEvents for MemoryPage {
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(id, (kind, handler));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.remove(&id);
        }
    }
}

/// Window metrics with settable sizes.
#[derive(Debug)]
pub struct FixedWindowMetrics {
    sizes: Mutex<((u32, u32), (u32, u32))>,
}

impl FixedWindowMetrics {
    pub fn new(outer: (u32, u32), inner: (u32, u32)) -> Self {
        Self {
            sizes: Mutex::new((outer, inner)),
        }
    }

    pub fn set(&self, outer: (u32, u32), inner: (u32, u32)) {
        if let Ok(mut sizes) = self.sizes.lock() {
            *sizes = (outer, inner);
        }
    }
}

impl WindowMetrics for FixedWindowMetrics {
    fn outer_size(&self) -> (u32, u32) {
        self.sizes.lock().map(|s| s.0).unwrap_or_default()
    }

    fn inner_size(&self) -> (u32, u32) {
        self.sizes.lock().map(|s| s.1).unwrap_or_default()
    }
}
