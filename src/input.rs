//! Input simulation.
//!
//! This module provides:
//! - The `InputSimulator` seam (cursor queries, moves, clicks, scroll, keys)
//! - Easing curves for humanized cursor travel
//! - An enigo-backed implementation
//! - A dry-run wrapper that reads the real cursor but injects nothing
//! - A recording mock for tests
//!
//! Simulators are thin. Pacing between events is owned by the action
//! executor, which sleeps on the injected clock.

use crate::capture::Point;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::info;

/// Errors that can occur during input simulation.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Input simulation not available on this platform")]
    NotAvailable,

    #[error("Failed to simulate input: {0}")]
    SimulationFailed(String),
}

/// Result type for input operations.
pub type InputResult<T> = Result<T, InputError>;

/// Easing curve for cursor travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EasingCurve {
    /// Constant speed
    Linear,

    /// Starts fast, slows down at the end
    EaseOut,

    /// Slow start, fast middle, slow end
    #[default]
    EaseInOut,
}

impl EasingCurve {
    /// Apply the easing function to a progress value in [0.0, 1.0].
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            EasingCurve::Linear => t,
            EasingCurve::EaseOut => 1.0 - (1.0 - t).powi(2),
            EasingCurve::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }

    /// Interpolate between two points.
    pub fn interpolate(&self, start: Point, end: Point, t: f64) -> Point {
        let eased = self.apply(t);
        let lerp = |a: i32, b: i32| (a as f64 + (b - a) as f64 * eased).round() as i32;
        Point::new(lerp(start.x, end.x), lerp(start.y, end.y))
    }
}

/// A key the reactivation sequence presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    /// A regular character
    Char(char),
    /// Submit
    Enter,
}

impl From<char> for KeyInput {
    fn from(c: char) -> Self {
        Self::Char(c)
    }
}

/// Trait for platform-specific input simulation.
#[async_trait]
pub trait InputSimulator: Send + Sync {
    /// Check if input simulation is available.
    fn is_available(&self) -> bool;

    /// Size of the primary display.
    async fn display_size(&self) -> InputResult<(i32, i32)>;

    /// Get the current mouse position.
    async fn mouse_position(&self) -> InputResult<Point>;

    /// Move the mouse to an absolute position.
    async fn mouse_move(&self, x: i32, y: i32) -> InputResult<()>;

    /// Primary-button click at the current position.
    async fn mouse_click(&self) -> InputResult<()>;

    /// Scroll vertically at the current position. Positive is down.
    async fn mouse_scroll(&self, delta_y: i32) -> InputResult<()>;

    /// Press and release a key.
    async fn key_press(&self, key: KeyInput) -> InputResult<()>;

    /// Release any button or key this simulator may still hold.
    async fn release_all(&self) -> InputResult<()>;

    async fn press_enter(&self) -> InputResult<()> {
        self.key_press(KeyInput::Enter).await
    }
}

#[async_trait]
impl<T: InputSimulator + ?Sized> InputSimulator for Box<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    async fn display_size(&self) -> InputResult<(i32, i32)> {
        (**self).display_size().await
    }

    async fn mouse_position(&self) -> InputResult<Point> {
        (**self).mouse_position().await
    }

    async fn mouse_move(&self, x: i32, y: i32) -> InputResult<()> {
        (**self).mouse_move(x, y).await
    }

    async fn mouse_click(&self) -> InputResult<()> {
        (**self).mouse_click().await
    }

    async fn mouse_scroll(&self, delta_y: i32) -> InputResult<()> {
        (**self).mouse_scroll(delta_y).await
    }

    async fn key_press(&self, key: KeyInput) -> InputResult<()> {
        (**self).key_press(key).await
    }

    async fn release_all(&self) -> InputResult<()> {
        (**self).release_all().await
    }
}

/// Platform-specific input simulation using enigo.
#[cfg(feature = "gui-automation")]
pub mod platform {
    use super::*;
    use enigo::{
        Axis, Button, Coordinate, Direction, Enigo, Key as EnigoKey, Keyboard, Mouse, Settings,
    };
    use std::sync::Mutex as StdMutex;

    /// Enigo-based input simulator.
    pub struct EnigoSimulator {
        enigo: StdMutex<Enigo>,
        /// Button pressed but not yet released
        held: StdMutex<Option<Button>>,
    }

    impl EnigoSimulator {
        /// Create a new Enigo-based simulator.
        pub fn new() -> InputResult<Self> {
            let settings = Settings::default();
            let enigo =
                Enigo::new(&settings).map_err(|e| InputError::SimulationFailed(e.to_string()))?;

            Ok(Self {
                enigo: StdMutex::new(enigo),
                held: StdMutex::new(None),
            })
        }

        fn lock(&self) -> InputResult<std::sync::MutexGuard<'_, Enigo>> {
            self.enigo.lock().map_err(|e| {
                InputError::SimulationFailed(format!("Failed to lock enigo: {}", e))
            })
        }

        fn set_held(&self, button: Option<Button>) {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            *held = button;
        }

        fn convert_key(key: KeyInput) -> EnigoKey {
            match key {
                KeyInput::Char(c) => EnigoKey::Unicode(c),
                KeyInput::Enter => EnigoKey::Return,
            }
        }
    }

    #[async_trait]
    impl InputSimulator for EnigoSimulator {
        fn is_available(&self) -> bool {
            true
        }

        async fn display_size(&self) -> InputResult<(i32, i32)> {
            self.lock()?
                .main_display()
                .map_err(|e| InputError::SimulationFailed(e.to_string()))
        }

        async fn mouse_position(&self) -> InputResult<Point> {
            let (x, y) = self
                .lock()?
                .location()
                .map_err(|e| InputError::SimulationFailed(e.to_string()))?;
            Ok(Point::new(x, y))
        }

        async fn mouse_move(&self, x: i32, y: i32) -> InputResult<()> {
            self.lock()?
                .move_mouse(x, y, Coordinate::Abs)
                .map_err(|e| InputError::SimulationFailed(e.to_string()))
        }

        async fn mouse_click(&self) -> InputResult<()> {
            let button = Button::Left;
            let mut enigo = self.lock()?;

            enigo
                .button(button, Direction::Press)
                .map_err(|e| InputError::SimulationFailed(e.to_string()))?;
            self.set_held(Some(button));

            enigo
                .button(button, Direction::Release)
                .map_err(|e| InputError::SimulationFailed(e.to_string()))?;
            self.set_held(None);
            Ok(())
        }

        async fn mouse_scroll(&self, delta_y: i32) -> InputResult<()> {
            if delta_y == 0 {
                return Ok(());
            }
            self.lock()?
                .scroll(delta_y, Axis::Vertical)
                .map_err(|e| InputError::SimulationFailed(e.to_string()))
        }

        async fn key_press(&self, key: KeyInput) -> InputResult<()> {
            self.lock()?
                .key(Self::convert_key(key), Direction::Click)
                .map_err(|e| InputError::SimulationFailed(e.to_string()))
        }

        async fn release_all(&self) -> InputResult<()> {
            let held = self.held.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(button) = held {
                self.lock()?
                    .button(button, Direction::Release)
                    .map_err(|e| InputError::SimulationFailed(e.to_string()))?;
            }
            Ok(())
        }
    }
}

/// Create the default input simulator for the current platform.
#[cfg(feature = "gui-automation")]
pub fn create_input_simulator() -> InputResult<Box<dyn InputSimulator>> {
    Ok(Box::new(platform::EnigoSimulator::new()?))
}

#[cfg(not(feature = "gui-automation"))]
pub fn create_input_simulator() -> InputResult<Box<dyn InputSimulator>> {
    Err(InputError::NotAvailable)
}

/// Reads cursor state from the wrapped simulator and logs everything else.
pub struct DryRunSimulator<S> {
    inner: S,
    suppressed: AtomicUsize,
}

impl<S: InputSimulator> DryRunSimulator<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            suppressed: AtomicUsize::new(0),
        }
    }

    /// Number of events that were logged instead of injected.
    pub fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn suppress(&self, event: std::fmt::Arguments<'_>) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        info!(target: "dry_run", "Suppressed {}", event);
    }
}

#[async_trait]
impl<S: InputSimulator> InputSimulator for DryRunSimulator<S> {
    fn is_available(&self) -> bool {
        true
    }

    async fn display_size(&self) -> InputResult<(i32, i32)> {
        self.inner.display_size().await
    }

    async fn mouse_position(&self) -> InputResult<Point> {
        self.inner.mouse_position().await
    }

    async fn mouse_move(&self, x: i32, y: i32) -> InputResult<()> {
        self.suppress(format_args!("mouse_move({}, {})", x, y));
        Ok(())
    }

    async fn mouse_click(&self) -> InputResult<()> {
        self.suppress(format_args!("mouse_click()"));
        Ok(())
    }

    async fn mouse_scroll(&self, delta_y: i32) -> InputResult<()> {
        self.suppress(format_args!("mouse_scroll({})", delta_y));
        Ok(())
    }

    async fn key_press(&self, key: KeyInput) -> InputResult<()> {
        self.suppress(format_args!("key_press({:?})", key));
        Ok(())
    }

    async fn release_all(&self) -> InputResult<()> {
        Ok(())
    }
}

/// Mock input simulator for testing.
/// Always available for tests, even when gui-automation is enabled.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// An injected event, as recorded by [`MockSimulator`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum InputEvent {
        Move(Point),
        Click { at: Point },
        Scroll { delta_y: i32, at: Point },
        Key(KeyInput),
        ReleaseAll,
    }

    struct State {
        position: Point,
        display: (i32, i32),
        events: Vec<InputEvent>,
        rejections: VecDeque<String>,
        park_after_scroll: Option<Point>,
    }

    /// Records events and tracks a virtual cursor.
    #[derive(Clone)]
    pub struct MockSimulator {
        state: Arc<Mutex<State>>,
    }

    impl MockSimulator {
        /// 1920x1080 display, cursor in the middle.
        pub fn new() -> Self {
            Self::with_display(1920, 1080)
        }

        pub fn with_display(width: i32, height: i32) -> Self {
            Self {
                state: Arc::new(Mutex::new(State {
                    position: Point::new(width / 2, height / 2),
                    display: (width, height),
                    events: Vec::new(),
                    rejections: VecDeque::new(),
                    park_after_scroll: None,
                })),
            }
        }

        /// Every event recorded so far.
        pub async fn events(&self) -> Vec<InputEvent> {
            self.state.lock().await.events.clone()
        }

        /// Positions of every click so far.
        pub async fn clicks(&self) -> Vec<Point> {
            self.state
                .lock()
                .await
                .events
                .iter()
                .filter_map(|e| match e {
                    InputEvent::Click { at, .. } => Some(*at),
                    _ => None,
                })
                .collect()
        }

        /// Characters typed, in order, with Enter as a newline.
        pub async fn typed(&self) -> String {
            let state = self.state.lock().await;
            let mut out = String::new();
            for event in &state.events {
                match event {
                    InputEvent::Key(KeyInput::Char(c)) => out.push(*c),
                    InputEvent::Key(KeyInput::Enter) => out.push('\n'),
                    _ => {}
                }
            }
            out
        }

        /// Events other than cursor queries and release.
        pub async fn injected_count(&self) -> usize {
            self.state
                .lock()
                .await
                .events
                .iter()
                .filter(|e| !matches!(e, InputEvent::ReleaseAll))
                .count()
        }

        pub async fn clear_log(&self) {
            self.state.lock().await.events.clear();
        }

        /// Teleport the cursor, as a user grabbing the mouse would.
        pub async fn set_position(&self, point: Point) {
            self.state.lock().await.position = point;
        }

        /// After the next scroll, the user yanks the cursor to `point`.
        pub async fn park_after_scroll(&self, point: Point) {
            self.state.lock().await.park_after_scroll = Some(point);
        }

        /// The next injected event fails with `reason`.
        pub async fn reject_next(&self, reason: impl Into<String>) {
            self.state.lock().await.rejections.push_back(reason.into());
        }

        async fn record(&self, event: InputEvent) -> InputResult<()> {
            let mut state = self.state.lock().await;
            if let Some(reason) = state.rejections.pop_front() {
                return Err(InputError::SimulationFailed(reason));
            }
            match &event {
                InputEvent::Move(p) => state.position = *p,
                InputEvent::Scroll { .. } => {
                    if let Some(p) = state.park_after_scroll.take() {
                        state.position = p;
                    }
                }
                _ => {}
            }
            state.events.push(event);
            Ok(())
        }

        async fn position(&self) -> Point {
            self.state.lock().await.position
        }
    }

    impl Default for MockSimulator {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl InputSimulator for MockSimulator {
        fn is_available(&self) -> bool {
            true // Mock is always available
        }

        async fn display_size(&self) -> InputResult<(i32, i32)> {
            Ok(self.state.lock().await.display)
        }

        async fn mouse_position(&self) -> InputResult<Point> {
            Ok(self.position().await)
        }

        async fn mouse_move(&self, x: i32, y: i32) -> InputResult<()> {
            self.record(InputEvent::Move(Point::new(x, y))).await
        }

        async fn mouse_click(&self) -> InputResult<()> {
            let at = self.position().await;
            self.record(InputEvent::Click { at }).await
        }

        async fn mouse_scroll(&self, delta_y: i32) -> InputResult<()> {
            let at = self.position().await;
            self.record(InputEvent::Scroll { delta_y, at }).await
        }

        async fn key_press(&self, key: KeyInput) -> InputResult<()> {
            self.record(InputEvent::Key(key)).await
        }

        async fn release_all(&self) -> InputResult<()> {
            self.state.lock().await.events.push(InputEvent::ReleaseAll);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{InputEvent, MockSimulator};
    use super::*;

    #[test]
    fn test_easing_curves() {
        for curve in [EasingCurve::Linear, EasingCurve::EaseOut, EasingCurve::EaseInOut] {
            assert_eq!(curve.apply(0.0), 0.0);
            assert!((curve.apply(1.0) - 1.0).abs() < 1e-9);
        }
        assert_eq!(EasingCurve::EaseInOut.apply(0.5), 0.5);
        assert!(EasingCurve::EaseOut.apply(0.5) > 0.5);
    }

    #[test]
    fn test_easing_interpolation() {
        let start = Point::new(0, 100);
        let end = Point::new(100, 0);
        assert_eq!(EasingCurve::Linear.interpolate(start, end, 0.25), Point::new(25, 75));
        assert_eq!(EasingCurve::EaseInOut.interpolate(start, end, 1.0), end);
    }

    #[tokio::test]
    async fn test_mock_simulator() {
        let sim = MockSimulator::new();
        assert_eq!(sim.mouse_position().await.unwrap(), Point::new(960, 540));

        sim.mouse_move(100, 200).await.unwrap();
        sim.mouse_click().await.unwrap();
        sim.key_press('h'.into()).await.unwrap();
        sim.press_enter().await.unwrap();

        assert_eq!(sim.mouse_position().await.unwrap(), Point::new(100, 200));
        assert_eq!(sim.clicks().await, vec![Point::new(100, 200)]);
        assert_eq!(sim.typed().await, "h\n");
        assert_eq!(sim.injected_count().await, 4);
    }

    #[tokio::test]
    async fn test_mock_rejection_and_park() {
        let sim = MockSimulator::new();
        sim.reject_next("access denied").await;
        assert!(matches!(
            sim.mouse_click().await,
            Err(InputError::SimulationFailed(_))
        ));

        sim.park_after_scroll(Point::new(0, 0)).await;
        sim.mouse_scroll(15).await.unwrap();
        assert_eq!(sim.mouse_position().await.unwrap(), Point::new(0, 0));
        assert_eq!(
            sim.events().await,
            vec![InputEvent::Scroll {
                delta_y: 15,
                at: Point::new(960, 540)
            }]
        );
    }

    #[tokio::test]
    async fn test_dry_run_injects_nothing() {
        let inner = MockSimulator::new();
        let dry = DryRunSimulator::new(inner.clone());

        inner.set_position(Point::new(5, 6)).await;
        assert_eq!(dry.mouse_position().await.unwrap(), Point::new(5, 6));
        assert_eq!(dry.display_size().await.unwrap(), (1920, 1080));

        dry.mouse_move(10, 10).await.unwrap();
        dry.mouse_click().await.unwrap();
        dry.key_press('h'.into()).await.unwrap();

        assert_eq!(dry.suppressed(), 3);
        assert!(inner.events().await.is_empty());
    }
}
