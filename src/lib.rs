//! VentAI Autoclicker
//!
//! Keeps an IDE chat session moving. Every tick the loop scrolls the chat to
//! the bottom, grabs the screen, looks for the Continue / Accept All /
//! recovery buttons and clicks them. When the chat has stopped changing it
//! types a reactivation phrase into the chat input.
//!
//! Moving the physical cursor into any screen corner stops the loop.

pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod input;
pub mod locator;
pub mod logging;
pub mod signals;
pub mod stall;
pub mod startup;
pub mod templates;

pub use capture::{Fingerprint, Point, Region, ScreenCapture, Screenshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigOverlay, LoopConfig, Preset};
pub use controller::{
    ControlLoop, ControlLoopBuilder, LoopExit, LoopSummary, TickAction, TickReport,
};
pub use error::{Error, Result};
pub use executor::{ActionExecutor, ExecutorSettings};
pub use input::{DryRunSimulator, InputSimulator};
pub use locator::{ButtonDetector, ButtonLocator, DetectedButton, Detections};
pub use signals::Shutdown;
pub use stall::{StallDetector, StallReason, StallState};
pub use templates::{ButtonKind, TemplateAsset, TemplateSet};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
