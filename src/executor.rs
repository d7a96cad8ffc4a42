//! Action Executor.
//!
//! Turns decisions into paced, humanized input: scroll-to-bottom, jittered
//! clicks, focus-and-type. Every injected event is preceded by the corner
//! fail-safe check and spaced at least `min_event_gap` from the previous one.

use crate::capture::{CaptureError, Fingerprint, Point, Region, ScreenCapture};
use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::input::{EasingCurve, InputSimulator, KeyInput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Pacing and humanization knobs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Minimum gap between any two input events
    pub min_event_gap: Duration,
    /// Click jitter, in pixels, on each axis
    pub jitter_px: i32,
    /// Cursor travel time range
    pub travel: (Duration, Duration),
    /// Pause between focusing the input and typing
    pub settle: (Duration, Duration),
    /// Wheel clicks per scroll (positive is down)
    pub scroll_clicks: i32,
    /// Upper bound on scroll repetitions
    pub scroll_iterations: u32,
    /// Abort when the cursor sits in a screen corner
    pub corner_failsafe: bool,
    /// Longest wait for a post-scroll capture
    pub capture_budget: Duration,
    pub easing: EasingCurve,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            min_event_gap: Duration::from_millis(50),
            jitter_px: 3,
            travel: (Duration::from_millis(100), Duration::from_millis(300)),
            settle: (Duration::from_millis(150), Duration::from_millis(300)),
            scroll_clicks: 15,
            scroll_iterations: 5,
            corner_failsafe: true,
            capture_budget: Duration::from_secs(2),
            easing: EasingCurve::EaseInOut,
        }
    }
}

/// Result of a scroll-to-bottom pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    /// Scroll events issued
    pub iterations: u32,
    /// Two consecutive post-scroll captures matched
    pub bottom_reached: bool,
    /// Fingerprint of the last post-scroll capture
    pub fingerprint: Option<Fingerprint>,
}

pub struct ActionExecutor {
    input: Box<dyn InputSimulator>,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
    rng: StdRng,
    last_event: Option<Instant>,
    last_click: Option<Instant>,
}

impl ActionExecutor {
    pub fn new(
        input: Box<dyn InputSimulator>,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            input,
            clock,
            settings,
            rng: StdRng::from_entropy(),
            last_event: None,
            last_click: None,
        }
    }

    /// Deterministic jitter and timing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Time of the most recent click.
    pub fn last_click(&self) -> Option<Instant> {
        self.last_click
    }

    /// Center of the primary display, the default scroll anchor.
    pub async fn display_center(&self) -> Result<Point> {
        let (width, height) = self.input.display_size().await?;
        Ok(Point::new(width / 2, height / 2))
    }

    /// Abort if the real cursor sits exactly in a screen corner.
    pub async fn corner_failsafe(&self) -> Result<()> {
        if !self.settings.corner_failsafe {
            return Ok(());
        }

        let position = self.input.mouse_position().await?;
        let (width, height) = self.input.display_size().await?;
        let on_x_edge = position.x <= 0 || position.x >= width - 1;
        let on_y_edge = position.y <= 0 || position.y >= height - 1;
        if on_x_edge && on_y_edge {
            warn!(
                category = "AbortedByUser",
                x = position.x,
                y = position.y,
                "Cursor in screen corner, aborting"
            );
            return Err(Error::aborted(format!(
                "cursor reached screen corner {}",
                position
            )));
        }
        Ok(())
    }

    /// Scroll the chat pane at `anchor` until the view stops changing.
    pub async fn scroll_to_bottom(
        &mut self,
        anchor: Point,
        capture: &dyn ScreenCapture,
        region: Option<Region>,
    ) -> Result<ScrollOutcome> {
        self.travel_to(anchor).await?;

        let mut outcome = ScrollOutcome {
            iterations: 0,
            bottom_reached: false,
            fingerprint: None,
        };

        for _ in 0..self.settings.scroll_iterations.max(1) {
            self.pace(self.settings.min_event_gap).await?;
            self.input.mouse_scroll(self.settings.scroll_clicks).await?;
            self.mark_event();
            outcome.iterations += 1;

            let budget = self.settings.capture_budget;
            let grab = async {
                match region {
                    Some(region) => capture.capture_region(region).await,
                    None => capture.capture_full().await,
                }
            };
            let shot = clock::timeout(self.clock.as_ref(), budget, grab)
                .await
                .ok_or(CaptureError::TimedOut(budget.as_millis() as u64))??;
            let fingerprint = Fingerprint::of(&shot);
            if outcome.fingerprint == Some(fingerprint) {
                outcome.bottom_reached = true;
                break;
            }
            outcome.fingerprint = Some(fingerprint);
        }

        debug!(
            iterations = outcome.iterations,
            bottom_reached = outcome.bottom_reached,
            "Scrolled chat pane"
        );
        Ok(outcome)
    }

    /// Humanized move to a jittered target, then one primary click.
    /// Returns the point actually clicked.
    pub async fn click(&mut self, point: Point) -> Result<Point> {
        let target = self.jittered(point).await?;
        self.travel_to(target).await?;

        self.pace(self.settings.min_event_gap).await?;
        self.input.mouse_click().await?;
        self.mark_event();
        self.last_click = self.last_event;

        debug!(x = target.x, y = target.y, "Clicked");
        Ok(target)
    }

    /// Click into a field, let it settle, type `phrase`, submit.
    pub async fn focus_and_type(&mut self, point: Point, phrase: &str) -> Result<()> {
        self.click(point).await?;

        let settle = self.random_between(self.settings.settle);
        self.clock.sleep(settle).await;

        for c in phrase.chars() {
            self.pace(self.settings.min_event_gap).await?;
            self.input.key_press(KeyInput::Char(c)).await?;
            self.mark_event();
        }

        self.pace(self.settings.min_event_gap).await?;
        self.input.press_enter().await?;
        self.mark_event();

        debug!(chars = phrase.chars().count(), "Typed reactivation phrase");
        Ok(())
    }

    /// Release held input. Called on every loop exit path.
    pub async fn release(&self) -> Result<()> {
        self.input.release_all().await?;
        Ok(())
    }

    /// Eased multi-step travel from the current cursor position.
    async fn travel_to(&mut self, target: Point) -> Result<()> {
        self.corner_failsafe().await?;
        let start = self.input.mouse_position().await?;

        let travel = self.random_between(self.settings.travel);
        let gap = self.settings.min_event_gap.max(Duration::from_millis(1));
        let steps = (travel.as_millis() / gap.as_millis()).max(1) as u32;
        let step_gap = (travel / steps).max(self.settings.min_event_gap);

        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            let next = self.settings.easing.interpolate(start, target, t);
            self.pace(step_gap).await?;
            self.input.mouse_move(next.x, next.y).await?;
            self.mark_event();
        }
        Ok(())
    }

    /// Fail-safe check, then wait until `gap` has passed since the last event.
    async fn pace(&self, gap: Duration) -> Result<()> {
        if let Some(last) = self.last_event {
            self.clock.sleep_until(last + gap).await;
        }
        self.corner_failsafe().await
    }

    fn mark_event(&mut self) {
        self.last_event = Some(self.clock.now());
    }

    async fn jittered(&mut self, point: Point) -> Result<Point> {
        let j = self.settings.jitter_px.abs();
        let (dx, dy) = if j > 0 {
            (self.rng.gen_range(-j..=j), self.rng.gen_range(-j..=j))
        } else {
            (0, 0)
        };

        // Stay off the corners so our own moves never trip the fail-safe.
        let (width, height) = self.input.display_size().await?;
        let clamp = |v: i32, max: i32| v.clamp(1, (max - 2).max(1));
        Ok(Point::new(
            clamp(point.x + dx, width),
            clamp(point.y + dy, height),
        ))
    }

    fn random_between(&mut self, (low, high): (Duration, Duration)) -> Duration {
        if high <= low {
            return low;
        }
        let ms = self.rng.gen_range(low.as_millis() as u64..=high.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::ScriptedCapture;
    use crate::clock::ManualClock;
    use crate::input::mock::{InputEvent, MockSimulator};

    fn executor(sim: &MockSimulator, clock: &Arc<ManualClock>) -> ActionExecutor {
        ActionExecutor::new(
            Box::new(sim.clone()),
            clock.clone(),
            ExecutorSettings::default(),
        )
        .with_seed(7)
    }

    #[tokio::test]
    async fn test_click_is_jittered_and_paced() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let mut exec = executor(&sim, &clock);

        let clicked = exec.click(Point::new(820, 940)).await.unwrap();
        assert!((clicked.x - 820).abs() <= 3 && (clicked.y - 940).abs() <= 3);
        assert_eq!(sim.clicks().await, vec![clicked]);

        // Travel is 100-300 ms in >= 50 ms steps, then the click.
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(400), "{:?}", elapsed);
        assert_eq!(exec.last_click(), Some(clock.now()));
    }

    #[tokio::test]
    async fn test_focus_and_type_sequence() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let mut exec = executor(&sim, &clock);

        exec.focus_and_type(Point::new(400, 1000), "go on").await.unwrap();

        assert_eq!(sim.clicks().await.len(), 1);
        assert_eq!(sim.typed().await, "go on\n");

        // Five characters plus Enter, 50 ms apart, after the settle.
        assert!(clock.elapsed() >= Duration::from_millis(100 + 150 + 5 * 50));
    }

    #[tokio::test]
    async fn test_corner_aborts_before_any_event() {
        let sim = MockSimulator::new();
        sim.set_position(Point::new(1919, 0)).await;
        let clock = Arc::new(ManualClock::new());
        let mut exec = executor(&sim, &clock);

        let err = exec.click(Point::new(500, 500)).await.unwrap_err();
        assert!(matches!(err, Error::AbortedByUser(_)));
        assert!(sim.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_failsafe_disabled_ignores_corner() {
        let sim = MockSimulator::new();
        sim.set_position(Point::new(0, 1079)).await;
        let clock = Arc::new(ManualClock::new());
        let mut exec = ActionExecutor::new(
            Box::new(sim.clone()),
            clock.clone(),
            ExecutorSettings {
                corner_failsafe: false,
                ..Default::default()
            },
        );

        exec.click(Point::new(500, 500)).await.unwrap();
        assert_eq!(sim.clicks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_jitter_never_lands_on_corner() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let mut exec = executor(&sim, &clock);

        for _ in 0..10 {
            let clicked = exec.click(Point::new(0, 0)).await.unwrap();
            assert!(clicked.x >= 1 && clicked.y >= 1);
        }
    }

    #[tokio::test]
    async fn test_scroll_stops_when_view_is_static() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let capture = ScriptedCapture::solid(64, 48, [12, 12, 12, 255]);
        let mut exec = executor(&sim, &clock);

        let first = exec
            .scroll_to_bottom(Point::new(960, 540), &capture, None)
            .await
            .unwrap();
        assert_eq!(first.iterations, 2);
        assert!(first.bottom_reached);

        let second = exec
            .scroll_to_bottom(Point::new(960, 540), &capture, Some(Region::new(0, 0, 64, 48)))
            .await
            .unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);

        let scrolls = sim
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, InputEvent::Scroll { delta_y: 15, .. }))
            .count();
        assert_eq!(scrolls, 4);
    }

    #[tokio::test]
    async fn test_scroll_respects_iteration_cap() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let capture = ScriptedCapture::solid(8, 8, [0, 0, 0, 255]);
        let mut exec = ActionExecutor::new(
            Box::new(sim.clone()),
            clock.clone(),
            ExecutorSettings {
                scroll_iterations: 1,
                ..Default::default()
            },
        );

        let outcome = exec
            .scroll_to_bottom(Point::new(100, 100), &capture, None)
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.bottom_reached);
    }

    #[tokio::test]
    async fn test_hung_scroll_capture_times_out() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let capture = ScriptedCapture::solid(8, 8, [0, 0, 0, 255]);
        capture.hang();
        let mut exec = executor(&sim, &clock);

        let err = exec
            .scroll_to_bottom(Point::new(100, 100), &capture, None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.category(), "CaptureUnavailable");
        assert!(clock.elapsed() >= Duration::from_secs(2));
        assert_eq!(capture.captures(), 1);
    }

    #[tokio::test]
    async fn test_rejected_input_surfaces_as_input_rejected() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let mut exec = executor(&sim, &clock);

        sim.reject_next("secure input active").await;
        let err = exec.click(Point::new(300, 300)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.category(), "InputRejected");
    }

    #[tokio::test]
    async fn test_release_reaches_simulator() {
        let sim = MockSimulator::new();
        let clock = Arc::new(ManualClock::new());
        let exec = executor(&sim, &clock);
        exec.release().await.unwrap();
        assert_eq!(sim.events().await, vec![InputEvent::ReleaseAll]);
    }
}
