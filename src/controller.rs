//! Control Loop.
//!
//! One tick: scroll the chat to the bottom, capture, fingerprint, detect the
//! actionable buttons, apply the decision policy, reactivate on stall, then
//! sleep until the next absolute tick boundary.
//!
//! The loop owns all mutable state (stall history, per-button phases and
//! click times). Collaborators are injected through the builder so tests can
//! drive it with scripted screens, detections and a manual clock.

use crate::capture::{CaptureError, Fingerprint, Point, ScreenCapture, Screenshot};
use crate::clock::{self, Clock, SystemClock};
use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::executor::ActionExecutor;
use crate::input::InputSimulator;
use crate::locator::{ButtonDetector, DetectedButton, Detections};
use crate::signals::Shutdown;
use crate::stall::{StallDetector, StallReason, StallState};
use crate::templates::ButtonKind;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted sleep; the stop flag is polled in between.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// What the decision policy wants done this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Accept All and Continue are both visible and close together.
    Proceed {
        accept_all: DetectedButton,
        cont: DetectedButton,
    },
    /// Click a single button.
    Click(DetectedButton),
    /// Nothing to click.
    Idle,
}

/// Immediate-action rules, first match wins.
pub fn decide(detections: &Detections, proximity_threshold: f64) -> Decision {
    let accept_all = detections.get(ButtonKind::AcceptAll);
    let cont = detections.get(ButtonKind::Continue);

    if let (Some(a), Some(c)) = (accept_all, cont) {
        if a.center.distance_to(c.center) <= proximity_threshold {
            return Decision::Proceed {
                accept_all: a.clone(),
                cont: c.clone(),
            };
        }
    }

    if let Some(c) = cont {
        return Decision::Click(c.clone());
    }

    if let Some(a) = accept_all {
        return Decision::Click(a.clone());
    }

    ButtonKind::RECOVERY
        .iter()
        .filter_map(|&kind| detections.get(kind))
        .fold(None::<&DetectedButton>, |best, candidate| match best {
            Some(b) if !candidate.outranks(b) => Some(b),
            _ => Some(candidate),
        })
        .map_or(Decision::Idle, |b| Decision::Click(b.clone()))
}

/// Lifecycle of one logical button across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonPhase {
    #[default]
    Absent,
    Present,
    Clicked,
}

/// Per-button phases plus the repeat-click guard.
#[derive(Debug)]
pub struct ButtonTracker {
    guard: Duration,
    phases: BTreeMap<ButtonKind, ButtonPhase>,
    last_clicks: BTreeMap<ButtonKind, Instant>,
}

impl ButtonTracker {
    pub fn new(guard: Duration) -> Self {
        Self {
            guard,
            phases: BTreeMap::new(),
            last_clicks: BTreeMap::new(),
        }
    }

    /// Advance phases from this tick's detections.
    pub fn observe(&mut self, detections: &Detections) {
        for kind in ButtonKind::ACTIONABLE {
            let phase = self.phases.entry(kind).or_default();
            let next = match (*phase, detections.contains(kind)) {
                (_, false) => ButtonPhase::Absent,
                (ButtonPhase::Absent, true) => ButtonPhase::Present,
                (current, true) => current,
            };
            if next != *phase {
                debug!(button = %kind, from = ?*phase, to = ?next, "Button phase change");
                *phase = next;
            }
        }
    }

    /// False while the button is inside its repeat-click guard.
    pub fn may_click(&self, kind: ButtonKind, now: Instant) -> bool {
        self.last_clicks
            .get(&kind)
            .map_or(true, |last| now.saturating_duration_since(*last) >= self.guard)
    }

    pub fn record_click(&mut self, kind: ButtonKind, at: Instant) {
        self.phases.insert(kind, ButtonPhase::Clicked);
        self.last_clicks.insert(kind, at);
    }

    pub fn phase(&self, kind: ButtonKind) -> ButtonPhase {
        self.phases.get(&kind).copied().unwrap_or_default()
    }

    pub fn last_click(&self, kind: ButtonKind) -> Option<Instant> {
        self.last_clicks.get(&kind).copied()
    }
}

/// What a tick ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    None,
    /// Buttons clicked, in order, with the point actually clicked
    Clicked(Vec<(ButtonKind, Point)>),
    /// Buttons the repeat-click guard held back
    Suppressed(Vec<ButtonKind>),
    /// Reactivation phrase submitted at the chat input
    Reactivated { at: Point, reason: StallReason },
    /// Stalled but the chat input was not found
    InputNotFound(StallReason),
    /// Tick abandoned after a transient error
    Skipped(&'static str),
}

impl TickAction {
    pub fn clicked(&self) -> bool {
        matches!(self, TickAction::Clicked(_))
    }
}

impl fmt::Display for TickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickAction::None => write!(f, "none"),
            TickAction::Clicked(clicks) => {
                let parts: Vec<String> = clicks
                    .iter()
                    .map(|(kind, at)| format!("{}@{}", kind, at))
                    .collect();
                write!(f, "click {}", parts.join(","))
            }
            TickAction::Suppressed(kinds) => {
                let parts: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                write!(f, "suppressed {}", parts.join(","))
            }
            TickAction::Reactivated { at, reason } => write!(f, "reactivate@{} ({})", at, reason),
            TickAction::InputNotFound(reason) => write!(f, "chat_input_not_found ({})", reason),
            TickAction::Skipped(category) => write!(f, "skipped ({})", category),
        }
    }
}

/// Everything observable about one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub fingerprint: Option<Fingerprint>,
    pub detections: Detections,
    pub action: TickAction,
    pub stall: StallState,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            fingerprint: None,
            detections: Detections::new(),
            action: TickAction::None,
            stall: StallState::Fresh,
        }
    }

    /// The per-tick structured log line.
    pub fn emit(&self) {
        let fingerprint = self
            .fingerprint
            .map(|fp| fp.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            target: "tick",
            tick = self.tick,
            fingerprint = %fingerprint,
            detections = %self.detections.summary(),
            action = %self.action,
            stall = %self.stall,
            "tick"
        );
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// SIGINT, SIGTERM or [`Shutdown::trigger`]
    Signal,
    /// Corner fail-safe
    AbortedByUser(String),
    /// `max_ticks` reached
    MaxTicks,
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Signal => write!(f, "signal"),
            LoopExit::AbortedByUser(reason) => write!(f, "aborted by user: {}", reason),
            LoopExit::MaxTicks => write!(f, "max ticks reached"),
        }
    }
}

/// Counters kept across the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub clicks: u64,
    pub reactivations: u64,
    pub skipped: u64,
    pub suppressed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub stats: LoopStats,
    pub exit: LoopExit,
}

pub struct ControlLoop {
    config: LoopConfig,
    capture: Box<dyn ScreenCapture>,
    detector: Box<dyn ButtonDetector>,
    executor: ActionExecutor,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    stall: StallDetector,
    tracker: ButtonTracker,
    last_screen: Option<Screenshot>,
    anchor: Option<Point>,
    stats: LoopStats,
}

impl ControlLoop {
    pub fn builder(config: LoopConfig) -> ControlLoopBuilder {
        ControlLoopBuilder::new(config)
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn stall_detector(&self) -> &StallDetector {
        &self.stall
    }

    pub fn tracker(&self) -> &ButtonTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run ticks until a signal, the fail-safe, `max_ticks` or a fatal error.
    /// Input is released on every exit path.
    pub async fn run(&mut self) -> Result<LoopSummary> {
        info!(
            tick_interval = self.config.tick_interval_seconds,
            stall_frames = self.config.stall_identical_frames,
            stall_age = self.config.stall_age_seconds,
            dry_run = self.config.dry_run,
            "Autoclicker loop starting"
        );

        let outcome = self.run_ticks().await;

        if let Err(e) = self.executor.release().await {
            warn!(category = e.category(), error = %e, "Failed to release input");
        }

        let stats = self.stats.clone();
        match outcome {
            Ok(exit) => {
                info!(
                    ticks = stats.ticks,
                    clicks = stats.clicks,
                    reactivations = stats.reactivations,
                    skipped = stats.skipped,
                    suppressed = stats.suppressed,
                    exit = %exit,
                    "Autoclicker loop stopped"
                );
                Ok(LoopSummary { stats, exit })
            }
            Err(e) => {
                error!(
                    ticks = stats.ticks,
                    clicks = stats.clicks,
                    reactivations = stats.reactivations,
                    category = e.category(),
                    error = %e,
                    "Autoclicker loop failed"
                );
                Err(e)
            }
        }
    }

    async fn run_ticks(&mut self) -> Result<LoopExit> {
        let interval = self.config.tick_interval();
        let mut deadline = self.clock.now();

        loop {
            if self.shutdown.requested() {
                return Ok(LoopExit::Signal);
            }
            if self.max_ticks_reached() {
                return Ok(LoopExit::MaxTicks);
            }

            match self.tick().await {
                Ok(report) => report.emit(),
                Err(Error::AbortedByUser(reason)) => return Ok(LoopExit::AbortedByUser(reason)),
                Err(e) => return Err(e),
            }

            if self.max_ticks_reached() {
                return Ok(LoopExit::MaxTicks);
            }

            deadline += interval;
            let now = self.clock.now();
            if deadline <= now {
                warn!(
                    overrun_ms = now.saturating_duration_since(deadline).as_millis() as u64,
                    "Tick overran its interval, starting the next one immediately"
                );
                deadline = now;
                continue;
            }

            if !self.sleep_until(deadline).await {
                return Ok(LoopExit::Signal);
            }
        }
    }

    /// Sleep in slices; false if a stop was requested meanwhile.
    async fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.shutdown.requested() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            self.clock.sleep((deadline - now).min(SLEEP_SLICE)).await;
        }
    }

    fn max_ticks_reached(&self) -> bool {
        self.config
            .max_ticks
            .map_or(false, |max| self.stats.ticks >= max)
    }

    /// One perception-and-action cycle. Transient errors end the tick and are
    /// reported in the returned [`TickReport`]; terminal errors propagate.
    pub async fn tick(&mut self) -> Result<TickReport> {
        self.stats.ticks += 1;
        let mut report = TickReport::new(self.stats.ticks);

        match self.run_tick(&mut report).await {
            Ok(()) => Ok(report),
            Err(e) if e.is_transient() => {
                warn!(category = e.category(), tick = report.tick, error = %e, "Tick skipped");
                self.stats.skipped += 1;
                report.action = TickAction::Skipped(e.category());
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_tick(&mut self, report: &mut TickReport) -> Result<()> {
        // 1. Scroll
        let anchor = self.anchor().await?;
        self.executor
            .scroll_to_bottom(anchor, self.capture.as_ref(), self.config.chat_region())
            .await?;

        // 2. Capture + observe
        let (screen, fresh) = self.capture_screen().await?;
        let fingerprint = Fingerprint::of(&screen);
        report.fingerprint = Some(fingerprint);
        if fresh {
            self.stall.observe(fingerprint, self.clock.now());
        }
        report.stall = self.stall.state();

        // 3. Detect
        let detections = self.detector.locate_all(&ButtonKind::ACTIONABLE, &screen);
        self.tracker.observe(&detections);
        report.detections = detections;

        // 4. Immediate-action rules
        let decision = decide(&report.detections, self.config.proximity_threshold_pixels);
        report.action = self.apply(decision).await?;
        if report.action.clicked() {
            self.stall.reset(self.clock.now());
            return Ok(());
        }

        // 5. Stall handling
        if let StallState::Stalled(reason) = report.stall {
            report.action = self.reactivate(&screen, reason).await?;
        }

        Ok(())
    }

    /// Screenshot for this tick, and whether it is new. A capture slower than
    /// the budget falls back to the previous tick's screenshot; one that never
    /// returns is abandoned once the budget runs out.
    async fn capture_screen(&mut self) -> Result<(Screenshot, bool)> {
        let budget = self.config.capture_budget();
        let started = self.clock.now();
        let grab = self.capture.capture_full();
        let captured = clock::timeout(self.clock.as_ref(), budget, grab).await;
        let elapsed = self.clock.now().saturating_duration_since(started);

        if captured.is_none() || elapsed > budget {
            if let Some(previous) = &self.last_screen {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.config.capture_budget_ms,
                    "Capture exceeded budget, reusing previous screenshot"
                );
                return Ok((previous.clone(), false));
            }
        }

        let screen = captured.ok_or(CaptureError::TimedOut(self.config.capture_budget_ms))??;
        self.last_screen = Some(screen.clone());
        Ok((screen, true))
    }

    async fn anchor(&mut self) -> Result<Point> {
        if let Some(anchor) = self.anchor {
            return Ok(anchor);
        }
        let anchor = match self.config.chat_anchor() {
            Some(anchor) => anchor,
            None => self.executor.display_center().await?,
        };
        self.anchor = Some(anchor);
        Ok(anchor)
    }

    async fn apply(&mut self, decision: Decision) -> Result<TickAction> {
        let targets = match decision {
            Decision::Idle => return Ok(TickAction::None),
            Decision::Click(button) => vec![button],
            Decision::Proceed { accept_all, cont } => vec![accept_all, cont],
        };

        let mut clicked = Vec::new();
        let mut suppressed = Vec::new();
        for button in targets {
            if !self.tracker.may_click(button.kind, self.clock.now()) {
                debug!(button = %button.kind, "Click suppressed by repeat guard");
                suppressed.push(button.kind);
                continue;
            }

            if !clicked.is_empty() {
                self.clock.sleep(self.config.combined_click_pause()).await;
            }

            let at = self.executor.click(button.center).await?;
            self.tracker.record_click(button.kind, self.clock.now());
            self.stats.clicks += 1;
            info!(
                button = %button.kind,
                confidence = button.confidence,
                x = at.x,
                y = at.y,
                "Clicked button"
            );
            clicked.push((button.kind, at));
        }

        self.stats.suppressed += suppressed.len() as u64;
        Ok(if clicked.is_empty() {
            TickAction::Suppressed(suppressed)
        } else {
            TickAction::Clicked(clicked)
        })
    }

    async fn reactivate(&mut self, screen: &Screenshot, reason: StallReason) -> Result<TickAction> {
        let input = match self.detector.locate_one(ButtonKind::ChatInput, screen) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    category = "DetectionError",
                    button = %ButtonKind::ChatInput,
                    error = %e,
                    "Treating chat input as absent"
                );
                None
            }
        };

        let Some(input) = input else {
            warn!(%reason, "Chat stalled but the chat input was not found; will retry next tick");
            return Ok(TickAction::InputNotFound(reason));
        };

        info!(%reason, x = input.center.x, y = input.center.y, "Chat stalled, reactivating");
        self.executor
            .focus_and_type(input.center, &self.config.reactivation_phrase)
            .await?;
        self.stall.reset(self.clock.now());
        self.stats.reactivations += 1;

        Ok(TickAction::Reactivated {
            at: input.center,
            reason,
        })
    }
}

/// Assembles a [`ControlLoop`] from its collaborators.
pub struct ControlLoopBuilder {
    config: LoopConfig,
    capture: Option<Box<dyn ScreenCapture>>,
    detector: Option<Box<dyn ButtonDetector>>,
    input: Option<Box<dyn InputSimulator>>,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
    seed: Option<u64>,
}

impl ControlLoopBuilder {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            capture: None,
            detector: None,
            input: None,
            clock: Arc::new(SystemClock),
            shutdown: Shutdown::new(),
            seed: None,
        }
    }

    pub fn capture(mut self, capture: Box<dyn ScreenCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn detector(mut self, detector: Box<dyn ButtonDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn input(mut self, input: Box<dyn InputSimulator>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Seed for click jitter and travel timing.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        self.config.validate()?;

        let capture = self
            .capture
            .ok_or_else(|| Error::unexpected("control loop built without a screen capture"))?;
        let detector = self
            .detector
            .ok_or_else(|| Error::unexpected("control loop built without a button detector"))?;
        let input = self
            .input
            .ok_or_else(|| Error::unexpected("control loop built without an input simulator"))?;

        let mut executor =
            ActionExecutor::new(input, self.clock.clone(), self.config.executor_settings());
        if let Some(seed) = self.seed {
            executor = executor.with_seed(seed);
        }

        let stall = StallDetector::new(self.config.stall_identical_frames, self.config.stall_age());
        let tracker = ButtonTracker::new(self.config.tick_interval() / 2);

        Ok(ControlLoop {
            config: self.config,
            capture,
            detector,
            executor,
            clock: self.clock,
            shutdown: self.shutdown,
            stall,
            tracker,
            last_screen: None,
            anchor: None,
            stats: LoopStats::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Region;
    use chrono::Utc;

    fn button(kind: ButtonKind, x: i32, y: i32, confidence: f32) -> DetectedButton {
        DetectedButton {
            kind,
            template: kind.to_string(),
            bounding_box: Region::new(x - 10, y - 5, 20, 10),
            center: Point::new(x, y),
            confidence,
            captured_at: Utc::now(),
        }
    }

    fn detections(buttons: Vec<DetectedButton>) -> Detections {
        buttons.into_iter().collect()
    }

    #[test]
    fn test_combined_proceed_at_threshold() {
        let d = detections(vec![
            button(ButtonKind::AcceptAll, 500, 600, 0.91),
            button(ButtonKind::Continue, 650, 600, 0.89),
        ]);
        assert!(matches!(decide(&d, 150.0), Decision::Proceed { .. }));
    }

    #[test]
    fn test_combined_not_triggered_past_threshold() {
        let d = detections(vec![
            button(ButtonKind::AcceptAll, 500, 600, 0.91),
            button(ButtonKind::Continue, 651, 600, 0.89),
        ]);
        match decide(&d, 150.0) {
            Decision::Click(b) => assert_eq!(b.kind, ButtonKind::Continue),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_accept_all_alone_is_single_click() {
        let d = detections(vec![button(ButtonKind::AcceptAll, 500, 600, 0.91)]);
        match decide(&d, 150.0) {
            Decision::Click(b) => assert_eq!(b.kind, ButtonKind::AcceptAll),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_recovery_picks_highest_confidence() {
        let d = detections(vec![
            button(ButtonKind::TryAgain, 100, 100, 0.82),
            button(ButtonKind::Run, 300, 300, 0.95),
            button(ButtonKind::Resume, 200, 200, 0.90),
        ]);
        match decide(&d, 150.0) {
            Decision::Click(b) => assert_eq!(b.kind, ButtonKind::Run),
            other => panic!("unexpected decision {:?}", other),
        }
        assert_eq!(decide(&Detections::new(), 150.0), Decision::Idle);
    }

    #[test]
    fn test_tracker_phases_and_guard() {
        let t0 = Instant::now();
        let mut tracker = ButtonTracker::new(Duration::from_secs(10));
        let present = detections(vec![button(ButtonKind::Continue, 1, 1, 0.9)]);

        assert_eq!(tracker.phase(ButtonKind::Continue), ButtonPhase::Absent);
        tracker.observe(&present);
        assert_eq!(tracker.phase(ButtonKind::Continue), ButtonPhase::Present);

        assert!(tracker.may_click(ButtonKind::Continue, t0));
        tracker.record_click(ButtonKind::Continue, t0);
        assert_eq!(tracker.phase(ButtonKind::Continue), ButtonPhase::Clicked);
        assert!(!tracker.may_click(ButtonKind::Continue, t0 + Duration::from_secs(9)));
        assert!(tracker.may_click(ButtonKind::Continue, t0 + Duration::from_secs(10)));
        assert!(tracker.may_click(ButtonKind::AcceptAll, t0));

        tracker.observe(&present);
        assert_eq!(tracker.phase(ButtonKind::Continue), ButtonPhase::Clicked);
        tracker.observe(&Detections::new());
        assert_eq!(tracker.phase(ButtonKind::Continue), ButtonPhase::Absent);
    }

    #[test]
    fn test_tick_action_display() {
        let action = TickAction::Clicked(vec![
            (ButtonKind::AcceptAll, Point::new(500, 600)),
            (ButtonKind::Continue, Point::new(560, 615)),
        ]);
        assert_eq!(action.to_string(), "click accept_all@(500, 600),continue@(560, 615)");
        assert_eq!(
            TickAction::InputNotFound(StallReason::AgeExceeded).to_string(),
            "chat_input_not_found (AgeExceeded)"
        );
    }
}
