//! Screen Capture Surface.
//!
//! This module provides:
//! - Pixel geometry (`Point`, `Region`)
//! - Full-screen and region capture via the `ScreenCapture` trait
//! - Content fingerprints used for change tracking
//! - An xcap-backed implementation and a scripted mock for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during screen capture.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Screen capture not available on this platform")]
    NotAvailable,

    #[error("Failed to capture screen: {0}")]
    CaptureFailed(String),

    #[error("Primary monitor not found")]
    MonitorNotFound,

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Screen capture timed out after {0} ms")]
    TimedOut(u64),
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// A point on the screen, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// A rectangular region on the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// X coordinate of the top-left corner
    pub x: i32,
    /// Y coordinate of the top-left corner
    pub y: i32,
    /// Width of the region
    pub width: u32,
    /// Height of the region
    pub height: u32,
}

impl Region {
    /// Create a new region.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Check if this region is valid (has positive dimensions).
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Check if a point is within this region.
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.x < self.x + self.width as i32
            && point.y >= self.y
            && point.y < self.y + self.height as i32
    }

    /// Get the center point of this region.
    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// A captured bitmap.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// The captured pixels
    pub image: RgbaImage,
    /// Screen region that was captured
    pub region: Region,
    /// Wall time of the capture
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    /// Create a screenshot of a full screen anchored at the origin.
    pub fn new(image: RgbaImage, captured_at: DateTime<Utc>) -> Self {
        let region = Region::new(0, 0, image.width(), image.height());
        Self {
            image,
            region,
            captured_at,
        }
    }

    /// Get the width of the screenshot.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Get the height of the screenshot.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luminance copy used by the locator.
    pub fn to_luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// Crop to a region given in screen coordinates.
    pub fn crop(&self, region: Region) -> CaptureResult<Screenshot> {
        if !region.is_valid() {
            return Err(CaptureError::InvalidRegion(format!(
                "{} has no area",
                region
            )));
        }

        let local_x = region.x - self.region.x;
        let local_y = region.y - self.region.y;
        if local_x < 0 || local_y < 0 {
            return Err(CaptureError::InvalidRegion(format!(
                "{} starts outside the captured area {}",
                region, self.region
            )));
        }

        let (x, y) = (local_x as u32, local_y as u32);
        if x + region.width > self.width() || y + region.height > self.height() {
            return Err(CaptureError::InvalidRegion(format!(
                "{} extends beyond the captured area {}",
                region, self.region
            )));
        }

        let cropped = image::imageops::crop_imm(&self.image, x, y, region.width, region.height)
            .to_image();

        Ok(Screenshot {
            image: cropped,
            region,
            captured_at: self.captured_at,
        })
    }
}

/// SHA-256 digest of a bitmap's dimensions and pixels.
///
/// Equality only: two fingerprints are equal iff the bitmaps are
/// pixel-identical (up to hash collisions). No ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a screenshot.
    pub fn of(shot: &Screenshot) -> Self {
        fingerprint(&shot.image)
    }

    /// First 64 bits of the digest.
    pub fn prefix(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Full digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.prefix())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.prefix())
    }
}

/// Deterministic content hash of a bitmap.
pub fn fingerprint(image: &RgbaImage) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_be_bytes());
    hasher.update(image.height().to_be_bytes());
    hasher.update(image.as_raw());
    Fingerprint(hasher.finalize().into())
}

/// Trait for platform-specific screen capture implementations.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Check if screen capture is available on this platform.
    fn is_available(&self) -> bool;

    /// Blocking pixel grab of the primary display.
    async fn capture_full(&self) -> CaptureResult<Screenshot>;

    /// Capture a bounded region of the primary display.
    async fn capture_region(&self, region: Region) -> CaptureResult<Screenshot> {
        if !region.is_valid() {
            return Err(CaptureError::InvalidRegion(
                "Region must have positive dimensions".to_string(),
            ));
        }

        let full = self.capture_full().await?;
        full.crop(region)
    }
}

/// Platform-specific screen capture implementation using xcap.
#[cfg(feature = "gui-automation")]
pub mod platform {
    use super::*;

    /// Primary-monitor capture through xcap.
    pub struct XcapCapture;

    impl XcapCapture {
        pub fn new() -> Self {
            Self
        }

        fn primary_monitor() -> CaptureResult<xcap::Monitor> {
            xcap::Monitor::all()
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?
                .into_iter()
                .find(|m| m.is_primary())
                .ok_or(CaptureError::MonitorNotFound)
        }
    }

    impl Default for XcapCapture {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ScreenCapture for XcapCapture {
        fn is_available(&self) -> bool {
            Self::primary_monitor().is_ok()
        }

        async fn capture_full(&self) -> CaptureResult<Screenshot> {
            // xcap blocks; keep it off the loop's thread so a stuck grab can be timed out.
            tokio::task::spawn_blocking(grab_primary)
                .await
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?
        }
    }

    fn grab_primary() -> CaptureResult<Screenshot> {
        let monitor = XcapCapture::primary_monitor()?;

        let capture = monitor
            .capture_image()
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        let width = capture.width();
        let height = capture.height();
        // Rebuild the buffer so we are independent of xcap's image version.
        let image = RgbaImage::from_raw(width, height, capture.into_raw()).ok_or_else(|| {
            CaptureError::CaptureFailed("Failed to create image buffer".to_string())
        })?;

        Ok(Screenshot {
            image,
            region: Region::new(monitor.x(), monitor.y(), width, height),
            captured_at: Utc::now(),
        })
    }
}

/// Create the default screen capture implementation for the current platform.
#[cfg(feature = "gui-automation")]
pub fn create_screen_capture() -> CaptureResult<Box<dyn ScreenCapture>> {
    Ok(Box::new(platform::XcapCapture::new()))
}

#[cfg(not(feature = "gui-automation"))]
pub fn create_screen_capture() -> CaptureResult<Box<dyn ScreenCapture>> {
    Err(CaptureError::NotAvailable)
}

/// Scripted screen for tests.
/// Always available, even when gui-automation is enabled.
pub mod mock {
    use super::*;
    use crate::clock::Clock;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        frame: Option<RgbaImage>,
        failures: VecDeque<String>,
        captures: usize,
        hang_after: Option<usize>,
    }

    /// Serves the current frame on every capture until the test swaps it.
    #[derive(Clone)]
    pub struct ScriptedCapture {
        script: Arc<Mutex<Script>>,
        delay: Option<(Arc<dyn Clock>, Duration)>,
    }

    impl ScriptedCapture {
        pub fn new(frame: RgbaImage) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script {
                    frame: Some(frame),
                    ..Default::default()
                })),
                delay: None,
            }
        }

        /// A uniform frame of the given size and color.
        pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
            Self::new(solid_frame(width, height, rgba))
        }

        /// Every capture takes `delay` on `clock`.
        pub fn with_delay(mut self, clock: Arc<dyn Clock>, delay: Duration) -> Self {
            self.delay = Some((clock, delay));
            self
        }

        /// Replace the frame served from now on.
        pub fn set_frame(&self, frame: RgbaImage) {
            self.lock().frame = Some(frame);
        }

        /// Make the next capture fail.
        pub fn fail_next(&self, reason: impl Into<String>) {
            self.lock().failures.push_back(reason.into());
        }

        /// Captures from now on never complete.
        pub fn hang(&self) {
            self.hang_after(0);
        }

        /// Serve `served` more captures, then hang.
        pub fn hang_after(&self, served: usize) {
            let mut script = self.lock();
            script.hang_after = Some(script.captures + served);
        }

        /// Number of capture calls served (including failures).
        pub fn captures(&self) -> usize {
            self.lock().captures
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    /// Build a uniform frame.
    pub fn solid_frame(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba(rgba))
    }

    #[async_trait]
    impl ScreenCapture for ScriptedCapture {
        fn is_available(&self) -> bool {
            true
        }

        async fn capture_full(&self) -> CaptureResult<Screenshot> {
            if let Some((clock, delay)) = &self.delay {
                clock.sleep(*delay).await;
            }

            let (frame, failure, hung) = {
                let mut script = self.lock();
                script.captures += 1;
                let hung = script.hang_after.map_or(false, |after| script.captures > after);
                (script.frame.clone(), script.failures.pop_front(), hung)
            };

            if hung {
                std::future::pending::<()>().await;
            }

            if let Some(reason) = failure {
                return Err(CaptureError::CaptureFailed(reason));
            }

            let frame = frame.ok_or(CaptureError::NotAvailable)?;
            let captured_at = match &self.delay {
                Some((clock, _)) => clock.wall(),
                None => Utc::now(),
            };
            Ok(Screenshot::new(frame, captured_at))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{solid_frame, ScriptedCapture};
    use super::*;

    #[test]
    fn test_region_contains() {
        let region = Region::new(100, 100, 200, 200);
        assert!(region.contains(Point::new(150, 150)));
        assert!(region.contains(Point::new(100, 100)));
        assert!(!region.contains(Point::new(50, 50)));
        assert!(!region.contains(Point::new(300, 150)));
    }

    #[test]
    fn test_region_center() {
        let region = Region::new(100, 100, 200, 200);
        assert_eq!(region.center(), Point::new(200, 200));
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(500, 600);
        assert_eq!(a.distance_to(Point::new(650, 600)), 150.0);
        assert_eq!(a.distance_to(Point::new(503, 604)), 5.0);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = solid_frame(64, 32, [10, 20, 30, 255]);
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        b.put_pixel(63, 31, image::Rgba([10, 20, 31, 255]));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_includes_dimensions() {
        // Same raw bytes, different shape.
        let wide = solid_frame(4, 1, [0, 0, 0, 255]);
        let tall = solid_frame(1, 4, [0, 0, 0, 255]);
        assert_ne!(fingerprint(&wide), fingerprint(&tall));
    }

    #[test]
    fn test_fingerprint_display_is_prefix() {
        let fp = fingerprint(&solid_frame(8, 8, [1, 2, 3, 4]));
        let shown = fp.to_string();
        assert_eq!(shown.len(), 16);
        assert_eq!(u64::from_str_radix(&shown, 16).unwrap(), fp.prefix());
    }

    #[test]
    fn test_crop_bounds() {
        let shot = Screenshot::new(solid_frame(100, 50, [0, 0, 0, 255]), Utc::now());
        let cropped = shot.crop(Region::new(10, 10, 20, 20)).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (20, 20));
        assert_eq!(cropped.region, Region::new(10, 10, 20, 20));

        assert!(shot.crop(Region::new(90, 10, 20, 20)).is_err());
        assert!(shot.crop(Region::new(-1, 0, 5, 5)).is_err());
        assert!(shot.crop(Region::new(0, 0, 0, 5)).is_err());
    }

    #[tokio::test]
    async fn test_capture_region_default_crops_full_frame() {
        let capture = ScriptedCapture::solid(200, 100, [5, 5, 5, 255]);
        let shot = capture.capture_region(Region::new(50, 25, 40, 30)).await.unwrap();
        assert_eq!((shot.width(), shot.height()), (40, 30));
        assert!(capture
            .capture_region(Region::new(0, 0, 0, 0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_scripted_capture_failures() {
        let capture = ScriptedCapture::solid(10, 10, [0, 0, 0, 255]);
        capture.fail_next("display asleep");
        assert!(matches!(
            capture.capture_full().await,
            Err(CaptureError::CaptureFailed(_))
        ));
        assert!(capture.capture_full().await.is_ok());
        assert_eq!(capture.captures(), 2);
    }
}
