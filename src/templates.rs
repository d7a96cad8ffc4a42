//! Template assets: the bitmaps used to find buttons on screen.
//!
//! A template directory holds one primary file per logical button
//! (`continue.png`, `accept_all.png`, ...) and any number of theme variants
//! named `<button>.<variant>.png`. All primary files are required.

use crate::config::ConfigError;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Default acceptance floor for a single template.
pub const DEFAULT_TEMPLATE_FLOOR: f32 = 0.8;

/// Logical buttons the autoclicker knows how to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonKind {
    Continue,
    AcceptAll,
    TryAgain,
    Resume,
    Run,
    /// The chat input field, used only for reactivation.
    ChatInput,
}

impl ButtonKind {
    /// Every logical button, in file-validation order.
    pub const ALL: [ButtonKind; 6] = [
        ButtonKind::Continue,
        ButtonKind::AcceptAll,
        ButtonKind::TryAgain,
        ButtonKind::Resume,
        ButtonKind::Run,
        ButtonKind::ChatInput,
    ];

    /// Buttons detected every tick.
    pub const ACTIONABLE: [ButtonKind; 5] = [
        ButtonKind::Continue,
        ButtonKind::AcceptAll,
        ButtonKind::TryAgain,
        ButtonKind::Resume,
        ButtonKind::Run,
    ];

    /// Lower-priority recovery affordances.
    pub const RECOVERY: [ButtonKind; 3] =
        [ButtonKind::TryAgain, ButtonKind::Resume, ButtonKind::Run];

    /// File stem / log name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonKind::Continue => "continue",
            ButtonKind::AcceptAll => "accept_all",
            ButtonKind::TryAgain => "try_again",
            ButtonKind::Resume => "resume",
            ButtonKind::Run => "run",
            ButtonKind::ChatInput => "chat_input",
        }
    }
}

impl fmt::Display for ButtonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ButtonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ButtonKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown button '{}'", s))
    }
}

/// A named template bitmap loaded at startup. Read-only afterwards.
#[derive(Debug, Clone)]
pub struct TemplateAsset {
    /// Logical button this template finds
    pub kind: ButtonKind,
    /// Display name, `accept_all` or `accept_all.dark`
    pub name: String,
    /// Source file (empty for in-memory templates)
    pub path: PathBuf,
    /// Minimum confidence for this template
    pub expected_confidence_floor: f32,
    /// Set for theme variants
    pub variant_of: Option<ButtonKind>,
    image: GrayImage,
}

impl TemplateAsset {
    /// Build a template from an in-memory bitmap.
    pub fn from_image(
        kind: ButtonKind,
        variant: Option<&str>,
        image: GrayImage,
    ) -> Result<Self, ConfigError> {
        let name = match variant {
            Some(v) => format!("{}.{}", kind, v),
            None => kind.to_string(),
        };
        check_usable(&name, &image)?;

        Ok(Self {
            kind,
            name,
            path: PathBuf::new(),
            expected_confidence_floor: DEFAULT_TEMPLATE_FLOOR,
            variant_of: variant.map(|_| kind),
            image,
        })
    }

    /// Load a template file.
    pub fn load(kind: ButtonKind, variant: Option<&str>, path: &Path) -> Result<Self, ConfigError> {
        let image = image::open(path)
            .map_err(|e| ConfigError::UnreadableTemplate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_luma8();

        let mut asset = Self::from_image(kind, variant, image).map_err(|e| match e {
            ConfigError::UnreadableTemplate { reason, .. } => ConfigError::UnreadableTemplate {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        asset.path = path.to_path_buf();
        Ok(asset)
    }

    /// Override the acceptance floor.
    pub fn with_floor(mut self, floor: f32) -> Self {
        self.expected_confidence_floor = floor;
        self
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Reject bitmaps that correlation cannot score.
fn check_usable(name: &str, image: &GrayImage) -> Result<(), ConfigError> {
    let unreadable = |reason: String| ConfigError::UnreadableTemplate {
        path: PathBuf::from(name),
        reason,
    };

    if image.width() == 0 || image.height() == 0 {
        return Err(unreadable("template has no pixels".to_string()));
    }

    let mut pixels = image.pixels().map(|p| p.0[0]);
    let first = pixels.next().unwrap_or(0);
    if pixels.all(|v| v == first) {
        return Err(unreadable("template has no contrast".to_string()));
    }

    Ok(())
}

/// All templates, grouped by logical button.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    by_kind: BTreeMap<ButtonKind, Vec<TemplateAsset>>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template (primary or variant).
    pub fn insert(&mut self, asset: TemplateAsset) {
        self.by_kind.entry(asset.kind).or_default().push(asset);
    }

    /// Builder form of [`TemplateSet::insert`].
    pub fn with(mut self, asset: TemplateAsset) -> Self {
        self.insert(asset);
        self
    }

    /// Load a template directory. Every primary file must exist and decode.
    pub fn load_dir(dir: &Path, floors: &BTreeMap<ButtonKind, f32>) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::NotFound(format!(
                "template directory {}",
                dir.display()
            )));
        }

        let mut set = Self::new();
        for kind in ButtonKind::ALL {
            let path = dir.join(format!("{}.png", kind));
            if !path.is_file() {
                return Err(ConfigError::MissingTemplate {
                    name: kind.to_string(),
                    path,
                });
            }
            let floor = floors.get(&kind).copied().unwrap_or(DEFAULT_TEMPLATE_FLOOR);
            set.insert(TemplateAsset::load(kind, None, &path)?.with_floor(floor));
        }

        for (kind, variant, path) in scan_variants(dir)? {
            let floor = floors.get(&kind).copied().unwrap_or(DEFAULT_TEMPLATE_FLOOR);
            debug!(
                template = %kind,
                variant = %variant,
                path = %path.display(),
                "Loading template variant"
            );
            set.insert(TemplateAsset::load(kind, Some(&variant), &path)?.with_floor(floor));
        }

        Ok(set)
    }

    /// Templates for one logical button (primary first).
    pub fn variants(&self, kind: ButtonKind) -> &[TemplateAsset] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Logical buttons with at least one template.
    pub fn kinds(&self) -> impl Iterator<Item = ButtonKind> + '_ {
        self.by_kind.keys().copied()
    }

    /// Total number of templates.
    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Find `<button>.<variant>.png` files in a directory, sorted by file name.
fn scan_variants(dir: &Path) -> Result<Vec<(ButtonKind, String, PathBuf)>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ConfigError::FileError(format!("cannot list {}: {}", dir.display(), e))
    })?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(".png") else {
            continue;
        };
        let Some((base, variant)) = stem.split_once('.') else {
            continue;
        };
        if variant.is_empty() {
            continue;
        }
        if let Ok(kind) = base.parse::<ButtonKind>() {
            found.push((kind, variant.to_string(), path.clone()));
        }
    }

    found.sort_by(|a, b| a.2.cmp(&b.2));
    Ok(found)
}
