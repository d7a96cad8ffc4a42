//! Button Locator.
//!
//! Finds template bitmaps on a screenshot with zero-mean normalized
//! cross-correlation. Each template is tried at a few scales to absorb
//! DPI and anti-aliasing drift. Large templates are searched coarse-to-fine:
//! a downsampled pass proposes candidates, a full-resolution pass around them
//! picks the winner.

use crate::capture::{Point, Region, Screenshot};
use crate::templates::{ButtonKind, TemplateAsset, TemplateSet};
use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while matching. Treated as "not present" for the tick.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Screen has no pixels")]
    EmptyScreen,

    #[error("Invalid match scale {scale} for template {template}")]
    InvalidScale { template: String, scale: f32 },

    #[error("Image processing failed for template {template}: {reason}")]
    ImageError { template: String, reason: String },
}

/// Result type for detection operations.
pub type DetectionResult<T> = Result<T, DetectionError>;

/// A button found on screen. Produced per tick, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedButton {
    /// Logical button
    pub kind: ButtonKind,
    /// Template (or variant) that produced the match
    pub template: String,
    /// Match rectangle in screen coordinates
    pub bounding_box: Region,
    /// Click target
    pub center: Point,
    /// Normalized correlation, in [0, 1]
    pub confidence: f32,
    /// Wall time of the screenshot this came from
    pub captured_at: DateTime<Utc>,
}

impl DetectedButton {
    /// Higher confidence wins, then lower top, then lower left.
    pub fn outranks(&self, other: &DetectedButton) -> bool {
        rank(
            self.confidence as f64,
            self.bounding_box.y,
            self.bounding_box.x,
            other.confidence as f64,
            other.bounding_box.y,
            other.bounding_box.x,
        ) == Ordering::Greater
    }
}

/// Scores closer than this are ties.
const SCORE_EPSILON: f64 = 1e-5;

/// Coarse candidates scoring within this of the best coarse score are always
/// refined, whatever their rank.
const COARSE_MARGIN: f64 = 0.25;

/// Upper bound on refined coarse candidates per template and scale.
const MAX_REFINED: usize = 64;

fn compare_scores(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= SCORE_EPSILON {
        Ordering::Equal
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}

fn rank(conf_a: f64, top_a: i32, left_a: i32, conf_b: f64, top_b: i32, left_b: i32) -> Ordering {
    compare_scores(conf_a, conf_b)
        .then_with(|| top_b.cmp(&top_a))
        .then_with(|| left_b.cmp(&left_a))
}

/// Per-tick detections keyed by logical button.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections(BTreeMap<ButtonKind, DetectedButton>);

impl Detections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ButtonKind) -> Option<&DetectedButton> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: ButtonKind) -> bool {
        self.0.contains_key(&kind)
    }

    /// Keep the better of the existing and new detection for this button.
    pub fn insert(&mut self, detection: DetectedButton) {
        match self.0.get(&detection.kind) {
            Some(existing) if !detection.outranks(existing) => {}
            _ => {
                self.0.insert(detection.kind, detection);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectedButton> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `name:confidence` list for log lines.
    pub fn summary(&self) -> String {
        self.iter()
            .map(|d| format!("{}:{:.2}", d.kind, d.confidence))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<DetectedButton> for Detections {
    fn from_iter<I: IntoIterator<Item = DetectedButton>>(iter: I) -> Self {
        let mut detections = Detections::new();
        for detection in iter {
            detections.insert(detection);
        }
        detections
    }
}

/// Matching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Template scales tried for every template
    pub scales: Vec<f32>,
    /// Coarse candidates refined at full resolution
    pub coarse_candidates: usize,
    /// Largest pyramid downsampling factor
    pub max_pyramid_factor: u32,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            scales: vec![0.9, 1.0, 1.1],
            coarse_candidates: 5,
            max_pyramid_factor: 4,
        }
    }
}

/// Summed-area tables over intensity and squared intensity.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = image.get_pixel(x as u32, y as u32).0[0] as f64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }

        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    /// (Σv, Σv²) over a window.
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let (a, b, c, d) = (y * s + x, y * s + x + w, (y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sum_sq[d] - self.sum_sq[b] - self.sum_sq[c] + self.sum_sq[a],
        )
    }
}

/// One pyramid level of the screen.
struct Level {
    image: GrayImage,
    integral: Integral,
}

impl Level {
    fn new(image: GrayImage) -> Self {
        let integral = Integral::new(&image);
        Self { image, integral }
    }
}

/// Screen prepared once per tick and shared by every template.
pub struct PreparedScreen {
    origin: Point,
    captured_at: DateTime<Utc>,
    /// Index 0 is full resolution, index n is downsampled by n + 1.
    levels: Vec<Level>,
}

impl PreparedScreen {
    pub fn new(screen: &Screenshot, max_factor: u32) -> DetectionResult<Self> {
        if screen.width() == 0 || screen.height() == 0 {
            return Err(DetectionError::EmptyScreen);
        }

        let full = screen.to_luma();
        let (w, h) = full.dimensions();
        let mut levels = vec![];
        for factor in 2..=max_factor.max(1) {
            let (lw, lh) = (w / factor, h / factor);
            if lw == 0 || lh == 0 {
                break;
            }
            levels.push(Level::new(imageops::resize(&full, lw, lh, FilterType::Triangle)));
        }
        levels.insert(0, Level::new(full));

        Ok(Self {
            origin: Point::new(screen.region.x, screen.region.y),
            captured_at: screen.captured_at,
            levels,
        })
    }

    fn level(&self, factor: u32) -> Option<&Level> {
        self.levels.get(factor.saturating_sub(1) as usize)
    }

    fn full(&self) -> &Level {
        &self.levels[0]
    }
}

/// Zero-mean template ready for correlation.
struct PreparedTemplate {
    width: usize,
    height: usize,
    centered: Vec<f64>,
    energy: f64,
}

impl PreparedTemplate {
    fn new(image: &GrayImage) -> Option<Self> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width == 0 || height == 0 {
            return None;
        }
        let n = (width * height) as f64;
        let mean = image.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
        let centered: Vec<f64> = image.pixels().map(|p| p.0[0] as f64 - mean).collect();
        let energy: f64 = centered.iter().map(|v| v * v).sum();
        if energy <= f64::EPSILON {
            return None;
        }
        Some(Self {
            width,
            height,
            centered,
            energy,
        })
    }

    /// Correlation at (x, y). A flat window scores 0.
    fn score(&self, level: &Level, x: usize, y: usize) -> f64 {
        let n = (self.width * self.height) as f64;
        let (sum, sum_sq) = level.integral.window(x, y, self.width, self.height);
        let variance = sum_sq - sum * sum / n;
        if variance <= 1e-6 {
            return 0.0;
        }

        // Σ t'·I equals Σ t'·(I - mean) since Σ t' = 0.
        let raw = level.image.as_raw();
        let stride = level.image.width() as usize;
        let mut acc = 0.0;
        for row in 0..self.height {
            let screen_row = &raw[(y + row) * stride + x..(y + row) * stride + x + self.width];
            let tpl_row = &self.centered[row * self.width..(row + 1) * self.width];
            for (t, s) in tpl_row.iter().zip(screen_row) {
                acc += t * (*s as f64);
            }
        }

        acc / (self.energy * variance).sqrt()
    }

    /// Best position over a window of top-left candidates, raster order.
    fn best_in(
        &self,
        level: &Level,
        xs: std::ops::RangeInclusive<usize>,
        ys: std::ops::RangeInclusive<usize>,
    ) -> Option<(f64, usize, usize)> {
        let mut best: Option<(f64, usize, usize)> = None;
        for y in ys {
            for x in xs.clone() {
                let score = self.score(level, x, y);
                if best.map_or(true, |(b, _, _)| compare_scores(score, b) == Ordering::Greater) {
                    best = Some((score, x, y));
                }
            }
        }
        best
    }
}

/// Template matcher over a loaded [`TemplateSet`].
pub struct ButtonLocator {
    templates: TemplateSet,
    confidence_floor: f32,
    settings: MatchSettings,
}

impl ButtonLocator {
    pub fn new(templates: TemplateSet, confidence_floor: f32) -> Self {
        Self {
            templates,
            confidence_floor,
            settings: MatchSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: MatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Best match for one template at or above `min_confidence`.
    pub fn locate(
        &self,
        template: &TemplateAsset,
        screen: &Screenshot,
        min_confidence: f32,
    ) -> DetectionResult<Option<DetectedButton>> {
        let prepared = PreparedScreen::new(screen, self.settings.max_pyramid_factor)?;
        self.locate_prepared(template, &prepared, min_confidence)
    }

    /// Best variant of one logical button.
    pub fn locate_kind(
        &self,
        kind: ButtonKind,
        screen: &PreparedScreen,
    ) -> DetectionResult<Option<DetectedButton>> {
        let mut best: Option<DetectedButton> = None;
        for template in self.templates.variants(kind) {
            let cutoff = self.confidence_floor.max(template.expected_confidence_floor);
            if let Some(found) = self.locate_prepared(template, screen, cutoff)? {
                if best.as_ref().map_or(true, |b| found.outranks(b)) {
                    best = Some(found);
                }
            }
        }
        Ok(best)
    }

    /// Detections for each requested logical button. Errors count as absent.
    pub fn locate_all(&self, kinds: &[ButtonKind], screen: &Screenshot) -> Detections {
        let prepared = match PreparedScreen::new(screen, self.settings.max_pyramid_factor) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    category = "DetectionError",
                    error = %e,
                    "Screen could not be prepared for matching"
                );
                return Detections::new();
            }
        };

        let mut detections = Detections::new();
        for &kind in kinds {
            match self.locate_kind(kind, &prepared) {
                Ok(Some(found)) => detections.insert(found),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        category = "DetectionError",
                        button = %kind,
                        error = %e,
                        "Treating button as absent"
                    );
                }
            }
        }
        detections
    }

    fn locate_prepared(
        &self,
        template: &TemplateAsset,
        screen: &PreparedScreen,
        min_confidence: f32,
    ) -> DetectionResult<Option<DetectedButton>> {
        let full = screen.full();
        let (sw, sh) = (full.image.width(), full.image.height());

        let mut best: Option<(f64, usize, usize, usize, usize)> = None;
        for &scale in &self.settings.scales {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(DetectionError::InvalidScale {
                    template: template.name.clone(),
                    scale,
                });
            }

            let tw = (template.width() as f32 * scale).round() as u32;
            let th = (template.height() as f32 * scale).round() as u32;
            if tw < 2 || th < 2 || tw > sw || th > sh {
                continue;
            }

            let scaled = if tw == template.width() && th == template.height() {
                template.image().clone()
            } else {
                imageops::resize(template.image(), tw, th, FilterType::Triangle)
            };

            let Some(found) = self.search(&scaled, screen) else {
                continue;
            };
            let (score, x, y) = found;
            let better = match best {
                None => true,
                Some((b, bx, by, _, _)) => {
                    rank(score, y as i32, x as i32, b, by as i32, bx as i32) == Ordering::Greater
                }
            };
            if better {
                best = Some((score, x, y, tw as usize, th as usize));
            }
        }

        let Some((score, x, y, w, h)) = best else {
            return Ok(None);
        };

        let confidence = score.clamp(0.0, 1.0) as f32;
        debug!(template = %template.name, confidence, x, y, "Best template match");
        if confidence < min_confidence {
            return Ok(None);
        }

        let bounding_box = Region::new(
            screen.origin.x + x as i32,
            screen.origin.y + y as i32,
            w as u32,
            h as u32,
        );
        Ok(Some(DetectedButton {
            kind: template.kind,
            template: template.name.clone(),
            bounding_box,
            center: bounding_box.center(),
            confidence,
            captured_at: screen.captured_at,
        }))
    }

    /// Best (score, x, y) for an already-scaled template on the full level.
    fn search(&self, template: &GrayImage, screen: &PreparedScreen) -> Option<(f64, usize, usize)> {
        let full = screen.full();
        let tpl = PreparedTemplate::new(template)?;
        let max_x = full.image.width() as usize - tpl.width;
        let max_y = full.image.height() as usize - tpl.height;

        let min_side = template.width().min(template.height());
        let factor = pyramid_factor(min_side, self.settings.max_pyramid_factor);
        let coarse = if factor > 1 {
            screen.level(factor).and_then(|level| {
                let small = imageops::resize(
                    template,
                    template.width() / factor,
                    template.height() / factor,
                    FilterType::Triangle,
                );
                PreparedTemplate::new(&small).map(|t| (level, t))
            })
        } else {
            None
        };

        let Some((level, small)) = coarse else {
            return tpl.best_in(full, 0..=max_x, 0..=max_y);
        };
        if small.width > level.image.width() as usize
            || small.height > level.image.height() as usize
        {
            return tpl.best_in(full, 0..=max_x, 0..=max_y);
        }

        let candidates = top_candidates(
            &small,
            level,
            self.settings.coarse_candidates.max(1),
        );

        let f = factor as usize;
        let mut best: Option<(f64, usize, usize)> = None;
        for (_, cx, cy) in candidates {
            let (x0, y0) = ((cx * f).saturating_sub(f), (cy * f).saturating_sub(f));
            let (x1, y1) = ((cx * f + f).min(max_x), (cy * f + f).min(max_y));
            if x0 > x1 || y0 > y1 {
                continue;
            }
            if let Some((score, x, y)) = tpl.best_in(full, x0..=x1, y0..=y1) {
                let better = best.map_or(true, |(b, bx, by)| {
                    rank(score, y as i32, x as i32, b, by as i32, bx as i32) == Ordering::Greater
                });
                if better {
                    best = Some((score, x, y));
                }
            }
        }
        best
    }
}

/// Downsampling factor for a template whose shorter side is `min_side`.
/// The coarse template keeps at least 4 px on its shorter side.
fn pyramid_factor(min_side: u32, max_factor: u32) -> u32 {
    let factor = match min_side {
        0..=7 => 1,
        8..=15 => 2,
        _ => min_side / 8,
    };
    factor.min(max_factor).max(1)
}

/// Coarse positions worth refining, best first.
///
/// Positions overlapping the core of a better candidate are suppressed so one
/// match cannot take every slot. Beyond the top `n`, every survivor within
/// [`COARSE_MARGIN`] of the best score is kept, so equally good matches off the
/// pyramid grid still reach the full-resolution pass.
fn top_candidates(tpl: &PreparedTemplate, level: &Level, n: usize) -> Vec<(f64, usize, usize)> {
    let max_x = level.image.width() as usize - tpl.width;
    let max_y = level.image.height() as usize - tpl.height;

    let mut scored: Vec<(f64, usize, usize)> = Vec::with_capacity((max_x + 1) * (max_y + 1));
    for y in 0..=max_y {
        for x in 0..=max_x {
            scored.push((tpl.score(level, x, y), x, y));
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let (rx, ry) = ((tpl.width + 1) / 2, (tpl.height + 1) / 2);
    let best = scored.first().map_or(0.0, |c| c.0);
    let mut kept: Vec<(f64, usize, usize)> = Vec::new();
    for candidate in scored {
        let (score, x, y) = candidate;
        if kept.len() >= MAX_REFINED || (kept.len() >= n && score < best - COARSE_MARGIN) {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|&(_, kx, ky)| x.abs_diff(kx) < rx && y.abs_diff(ky) < ry);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Detection seam used by the control loop.
pub trait ButtonDetector: Send + Sync {
    /// Detect each of `kinds` on `screen`.
    fn locate_all(&self, kinds: &[ButtonKind], screen: &Screenshot) -> Detections;

    /// Detect a single logical button.
    fn locate_one(
        &self,
        kind: ButtonKind,
        screen: &Screenshot,
    ) -> DetectionResult<Option<DetectedButton>>;
}

impl ButtonDetector for ButtonLocator {
    fn locate_all(&self, kinds: &[ButtonKind], screen: &Screenshot) -> Detections {
        ButtonLocator::locate_all(self, kinds, screen)
    }

    fn locate_one(
        &self,
        kind: ButtonKind,
        screen: &Screenshot,
    ) -> DetectionResult<Option<DetectedButton>> {
        let prepared = PreparedScreen::new(screen, self.settings.max_pyramid_factor)?;
        self.locate_kind(kind, &prepared)
    }
}

/// Scripted detections for tests.
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        buttons: BTreeMap<ButtonKind, (Point, f32)>,
        failing: HashSet<ButtonKind>,
        calls: usize,
    }

    /// Reports whatever the test placed on screen, filtered by the floor.
    #[derive(Clone)]
    pub struct ScriptedDetector {
        script: Arc<Mutex<Script>>,
        confidence_floor: f32,
    }

    impl ScriptedDetector {
        pub fn new(confidence_floor: f32) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script::default())),
                confidence_floor,
            }
        }

        /// Place a button centered at `center`.
        pub fn set(&self, kind: ButtonKind, center: impl Into<Point>, confidence: f32) {
            self.lock().buttons.insert(kind, (center.into(), confidence));
        }

        /// Remove a button from the screen.
        pub fn clear(&self, kind: ButtonKind) {
            self.lock().buttons.remove(&kind);
        }

        /// Remove every button.
        pub fn clear_all(&self) {
            self.lock().buttons.clear();
        }

        /// Make matching for `kind` fail until cleared.
        pub fn fail(&self, kind: ButtonKind) {
            self.lock().failing.insert(kind);
        }

        /// Number of detection calls served.
        pub fn calls(&self) -> usize {
            self.lock().calls
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn detect(
            &self,
            kind: ButtonKind,
            screen: &Screenshot,
        ) -> DetectionResult<Option<DetectedButton>> {
            let mut script = self.lock();
            script.calls += 1;
            if script.failing.contains(&kind) {
                return Err(DetectionError::ImageError {
                    template: kind.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }

            Ok(script
                .buttons
                .get(&kind)
                .filter(|(_, confidence)| *confidence >= self.confidence_floor)
                .map(|&(center, confidence)| DetectedButton {
                    kind,
                    template: kind.to_string(),
                    bounding_box: Region::new(center.x - 40, center.y - 12, 80, 24),
                    center,
                    confidence,
                    captured_at: screen.captured_at,
                }))
        }
    }

    impl ButtonDetector for ScriptedDetector {
        fn locate_all(&self, kinds: &[ButtonKind], screen: &Screenshot) -> Detections {
            kinds
                .iter()
                .filter_map(|&kind| self.detect(kind, screen).ok().flatten())
                .collect()
        }

        fn locate_one(
            &self,
            kind: ButtonKind,
            screen: &Screenshot,
        ) -> DetectionResult<Option<DetectedButton>> {
            self.detect(kind, screen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::solid_frame;
    use image::{Luma, Rgba, RgbaImage};

    /// A button-like glyph: dark border, light body, dark bar.
    fn glyph(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let border = x < 2 || y < 2 || x >= width - 2 || y >= height - 2;
            let bar = y > height / 3 && y < 2 * height / 3 && (x + seed) % 7 < 4;
            if border || bar {
                Luma([20])
            } else {
                Luma([200 - (seed % 50) as u8])
            }
        })
    }

    fn paste(screen: &mut RgbaImage, glyph: &GrayImage, at: (u32, u32)) {
        for (x, y, p) in glyph.enumerate_pixels() {
            let v = p.0[0];
            screen.put_pixel(at.0 + x, at.1 + y, Rgba([v, v, v, 255]));
        }
    }

    fn noisy_background(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = ((x * 31 + y * 17) % 23 + 110) as u8;
            Rgba([v, v, v, 255])
        })
    }

    fn screenshot(image: RgbaImage) -> Screenshot {
        Screenshot::new(image, Utc::now())
    }

    fn asset(kind: ButtonKind, image: GrayImage) -> TemplateAsset {
        TemplateAsset::from_image(kind, None, image).unwrap()
    }

    #[test]
    fn test_exact_match_reports_center() {
        let tpl = glyph(40, 16, 3);
        let mut screen = noisy_background(200, 120);
        paste(&mut screen, &tpl, (60, 50));

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8);
        let found = locator
            .locate(&asset(ButtonKind::Continue, tpl), &screenshot(screen), 0.8)
            .unwrap()
            .expect("template should be found");

        assert_eq!(found.bounding_box, Region::new(60, 50, 40, 16));
        assert_eq!(found.center, Point::new(80, 58));
        assert!(found.confidence > 0.99);
    }

    #[test]
    fn test_absent_template_returns_none() {
        let locator = ButtonLocator::new(TemplateSet::new(), 0.8);
        let found = locator
            .locate(
                &asset(ButtonKind::Run, glyph(30, 12, 1)),
                &screenshot(noisy_background(160, 90)),
                0.8,
            )
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_uniform_screen_scores_zero() {
        let locator = ButtonLocator::new(TemplateSet::new(), 0.8);
        let found = locator
            .locate(
                &asset(ButtonKind::Run, glyph(30, 12, 1)),
                &screenshot(solid_frame(120, 60, [90, 90, 90, 255])),
                0.01,
            )
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_scaled_match_tolerated() {
        let tpl = glyph(40, 20, 2);
        let bigger = imageops::resize(&tpl, 44, 22, FilterType::Triangle);
        let mut screen = noisy_background(220, 140);
        paste(&mut screen, &bigger, (100, 70));

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8);
        let found = locator
            .locate(&asset(ButtonKind::AcceptAll, tpl), &screenshot(screen), 0.8)
            .unwrap()
            .expect("scaled template should match");

        assert_eq!((found.bounding_box.width, found.bounding_box.height), (44, 22));
        assert!(found.center.distance_to(Point::new(122, 81)) <= 2.0);
    }

    #[test]
    fn test_tie_prefers_upper_left() {
        let tpl = glyph(24, 10, 5);
        let mut screen = noisy_background(200, 120);
        paste(&mut screen, &tpl, (150, 20));
        paste(&mut screen, &tpl, (10, 20));
        paste(&mut screen, &tpl, (80, 90));

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8)
            .with_settings(MatchSettings {
                scales: vec![1.0],
                ..Default::default()
            });
        let found = locator
            .locate(&asset(ButtonKind::Resume, tpl), &screenshot(screen), 0.8)
            .unwrap()
            .unwrap();
        assert_eq!((found.bounding_box.x, found.bounding_box.y), (10, 20));
    }

    #[test]
    fn test_tie_prefers_upper_left_off_pyramid_grid() {
        // 48x24 searches at factor 3; only the upper-left copy is off the grid.
        let tpl = glyph(48, 24, 6);
        let mut screen = noisy_background(320, 260);
        for at in [(60, 150), (150, 150), (240, 150), (60, 210), (150, 210)] {
            paste(&mut screen, &tpl, at);
        }
        paste(&mut screen, &tpl, (10, 10));

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8).with_settings(MatchSettings {
            scales: vec![1.0],
            ..Default::default()
        });
        let found = locator
            .locate(&asset(ButtonKind::Run, tpl), &screenshot(screen), 0.8)
            .unwrap()
            .unwrap();
        assert_eq!((found.bounding_box.x, found.bounding_box.y), (10, 10));
        assert!(found.confidence > 0.99);
    }

    #[test]
    fn test_small_templates_use_coarse_level() {
        assert_eq!(pyramid_factor(6, 4), 1);
        assert_eq!(pyramid_factor(8, 4), 2);
        assert_eq!(pyramid_factor(14, 4), 2);
        assert_eq!(pyramid_factor(24, 4), 3);
        assert_eq!(pyramid_factor(64, 4), 4);
        assert_eq!(pyramid_factor(14, 1), 1);
    }

    #[test]
    fn test_small_template_found_off_grid() {
        let tpl = glyph(40, 14, 9);
        let mut screen = noisy_background(320, 200);
        paste(&mut screen, &tpl, (61, 137));

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8).with_settings(MatchSettings {
            scales: vec![1.0],
            ..Default::default()
        });
        let found = locator
            .locate(&asset(ButtonKind::Continue, tpl), &screenshot(screen), 0.8)
            .unwrap()
            .expect("small template should be found through the coarse level");
        assert_eq!(found.bounding_box, Region::new(61, 137, 40, 14));
    }

    #[test]
    fn test_locate_all_picks_best_variant_and_respects_floor() {
        let light = glyph(40, 16, 3);
        let dark = glyph(40, 16, 30);
        let mut screen = noisy_background(240, 160);
        paste(&mut screen, &dark, (120, 100));

        let templates = TemplateSet::new()
            .with(asset(ButtonKind::AcceptAll, light))
            .with(TemplateAsset::from_image(ButtonKind::AcceptAll, Some("dark"), dark).unwrap())
            .with(asset(ButtonKind::Continue, glyph(32, 14, 11)).with_floor(0.99));

        let locator = ButtonLocator::new(templates, 0.8);
        let detections = locator.locate_all(&ButtonKind::ACTIONABLE, &screenshot(screen));

        let accept = detections.get(ButtonKind::AcceptAll).unwrap();
        assert_eq!(accept.template, "accept_all.dark");
        assert!(accept.confidence >= 0.8);
        assert!(!detections.contains(ButtonKind::Continue));
        assert!(detections.iter().all(|d| d.confidence >= 0.8));
    }

    #[test]
    fn test_offset_screen_reports_screen_coordinates() {
        let tpl = glyph(30, 12, 4);
        let mut image = noisy_background(120, 80);
        paste(&mut image, &tpl, (20, 30));
        let shot = Screenshot {
            image,
            region: Region::new(1920, 100, 120, 80),
            captured_at: Utc::now(),
        };

        let locator = ButtonLocator::new(TemplateSet::new(), 0.8);
        let found = locator
            .locate(&asset(ButtonKind::TryAgain, tpl), &shot, 0.8)
            .unwrap()
            .unwrap();
        assert_eq!((found.bounding_box.x, found.bounding_box.y), (1940, 130));
    }

    #[test]
    fn test_invalid_scale_is_detection_error() {
        let locator = ButtonLocator::new(TemplateSet::new(), 0.8).with_settings(MatchSettings {
            scales: vec![0.0],
            ..Default::default()
        });
        let err = locator
            .locate(
                &asset(ButtonKind::Run, glyph(20, 10, 1)),
                &screenshot(noisy_background(60, 40)),
                0.8,
            )
            .unwrap_err();
        assert!(matches!(err, DetectionError::InvalidScale { .. }));
    }

    #[test]
    fn test_detections_keep_highest_confidence() {
        let at = |conf: f32, x: i32| DetectedButton {
            kind: ButtonKind::Run,
            template: "run".into(),
            bounding_box: Region::new(x, 0, 10, 10),
            center: Point::new(x + 5, 5),
            confidence: conf,
            captured_at: Utc::now(),
        };
        let detections: Detections = vec![at(0.85, 50), at(0.95, 90), at(0.95, 10)]
            .into_iter()
            .collect();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections.get(ButtonKind::Run).unwrap().bounding_box.x, 10);
        assert_eq!(detections.summary(), "run:0.95");
    }
}
