//! # Loop Configuration
//!
//! Configuration loading and validation for the autoclicker.
//!
//! Sources, lowest precedence first: built-in defaults, preset, config file,
//! `AUTOCLICKER_*` environment variables, command-line flags. Everything above
//! the defaults is expressed as a [`ConfigOverlay`] whose set fields win.

use crate::capture::{Point, Region};
use crate::executor::ExecutorSettings;
use crate::locator::MatchSettings;
use crate::templates::ButtonKind;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing template '{name}' (expected {})", path.display())]
    MissingTemplate { name: String, path: PathBuf },

    #[error("Unreadable template {}: {reason}", path.display())]
    UnreadableTemplate { path: PathBuf, reason: String },
}

/// Named bundles of timing defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    #[default]
    Standard,
    /// 5 s ticks, 20 s stall age
    Demo,
    /// 5 s ticks, 15 s stall age
    DemoFast,
    /// 3 s ticks, 10 s stall age
    DemoRapid,
}

impl Preset {
    /// (tick interval, stall age) in seconds.
    fn timings(&self) -> (f64, f64) {
        match self {
            Preset::Standard => (20.0, 60.0),
            Preset::Demo => (5.0, 20.0),
            Preset::DemoFast => (5.0, 15.0),
            Preset::DemoRapid => (3.0, 10.0),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Preset as ValueEnum>::from_str(s, true)
            .map_err(|_| ConfigError::InvalidValue(format!("unknown preset '{}'", s)))
    }
}

/// Effective loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Preset the defaults came from
    pub preset: Preset,

    /// Control loop cadence
    pub tick_interval_seconds: f64,

    /// K: identical consecutive fingerprints that mean "stalled"
    pub stall_identical_frames: usize,

    /// T: time without a screen change that means "stalled"
    pub stall_age_seconds: f64,

    /// Continue counts as "near" Accept All at or under this distance
    pub proximity_threshold_pixels: f64,

    /// Global template-match acceptance cutoff
    pub confidence_floor: f32,

    /// Typed into the chat input on stall
    pub reactivation_phrase: String,

    /// Abort when the cursor is parked in a screen corner
    pub corner_failsafe_enabled: bool,

    /// Directory holding `<button>.png` templates
    pub template_dir: PathBuf,

    /// Scales tried for every template
    pub match_scales: Vec<f32>,

    /// Scroll anchor `[x, y]`; defaults to the display center
    pub chat_anchor: Option<[i32; 2]>,

    /// `[left, top, width, height]` fingerprinted while scrolling
    pub chat_region: Option<[i32; 4]>,

    /// Captures slower than this reuse the previous screenshot
    pub capture_budget_ms: u64,

    /// Pause between Accept All and Continue in the combined click
    pub combined_click_pause_ms: u64,

    /// Wheel clicks per scroll, positive is down
    pub scroll_clicks: i32,

    /// Upper bound on scroll repetitions per tick
    pub scroll_iterations: u32,

    /// Stop after this many ticks
    pub max_ticks: Option<u64>,

    /// Log input events instead of injecting them
    pub dry_run: bool,

    /// Per-button `expected_confidence_floor` overrides
    pub template_floors: BTreeMap<String, f32>,
}

pub const DEFAULT_REACTIVATION_PHRASE: &str = "Continue where you left off.";

/// Longest accepted interval, age or budget.
const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;
const MAX_MILLIS: u64 = MAX_SECONDS as u64 * 1000;

fn valid_seconds(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= MAX_SECONDS
}

/// Seconds as a `Duration`, clamped into the accepted range. Never panics.
fn bounded_seconds(value: f64) -> Duration {
    if value.is_finite() {
        Duration::from_secs_f64(value.clamp(0.0, MAX_SECONDS))
    } else {
        Duration::ZERO
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::for_preset(Preset::Standard)
    }
}

impl LoopConfig {
    /// Defaults for a preset.
    pub fn for_preset(preset: Preset) -> Self {
        let (tick, stall_age) = preset.timings();
        Self {
            preset,
            tick_interval_seconds: tick,
            stall_identical_frames: 3,
            stall_age_seconds: stall_age,
            proximity_threshold_pixels: 150.0,
            confidence_floor: 0.8,
            reactivation_phrase: DEFAULT_REACTIVATION_PHRASE.to_string(),
            corner_failsafe_enabled: true,
            template_dir: PathBuf::from("templates"),
            match_scales: vec![0.9, 1.0, 1.1],
            chat_anchor: None,
            chat_region: None,
            capture_budget_ms: 2000,
            combined_click_pause_ms: 500,
            scroll_clicks: 15,
            scroll_iterations: 5,
            max_ticks: None,
            dry_run: false,
            template_floors: BTreeMap::new(),
        }
    }

    /// Load from the config file, environment and CLI overlay, then validate.
    pub async fn load(
        explicit_path: Option<&Path>,
        cli: ConfigOverlay,
    ) -> Result<Self, ConfigError> {
        let env = ConfigOverlay::from_env_with(|key| std::env::var(key).ok())?;
        Self::load_with(explicit_path, env, cli).await
    }

    /// [`LoopConfig::load`] with the environment overlay supplied by the caller.
    pub async fn load_with(
        explicit_path: Option<&Path>,
        env: ConfigOverlay,
        cli: ConfigOverlay,
    ) -> Result<Self, ConfigError> {
        let file = match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(format!(
                        "config file {}",
                        path.display()
                    )));
                }
                ConfigOverlay::from_file(path).await?
            }
            None => match Self::global_config_path() {
                Some(path) if path.exists() => ConfigOverlay::from_file(&path).await?,
                _ => ConfigOverlay::default(),
            },
        };

        let preset = cli.preset.or(env.preset).or(file.preset).unwrap_or_default();
        let mut config = Self::for_preset(preset);
        file.apply(&mut config);
        env.apply(&mut config);
        cli.apply(&mut config);

        config.validate()?;
        debug!(?preset, "Configuration loaded");
        Ok(config)
    }

    /// Get global config path
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ventai-autoclicker").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidValue(msg.to_string()));

        if !valid_seconds(self.tick_interval_seconds) {
            return invalid("tick_interval_seconds must be > 0 and at most one week");
        }

        if self.stall_identical_frames == 0 {
            return invalid("stall_identical_frames must be > 0");
        }

        if !valid_seconds(self.stall_age_seconds) {
            return invalid("stall_age_seconds must be > 0 and at most one week");
        }

        if !(self.proximity_threshold_pixels.is_finite() && self.proximity_threshold_pixels > 0.0) {
            return invalid("proximity_threshold_pixels must be > 0");
        }

        if !valid_floor(self.confidence_floor) {
            return invalid("confidence_floor must be in (0, 1]");
        }

        if self.reactivation_phrase.trim().is_empty() {
            return invalid("reactivation_phrase must not be empty");
        }

        if self.reactivation_phrase.contains(['\n', '\r']) {
            return invalid("reactivation_phrase must be a single line");
        }

        if self.match_scales.is_empty() {
            return invalid("match_scales must not be empty");
        }

        if self.match_scales.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return invalid("match_scales must all be > 0");
        }

        if let Some([_, _, w, h]) = self.chat_region {
            if w <= 0 || h <= 0 {
                return invalid("chat_region width and height must be > 0");
            }
        }

        if self.scroll_iterations == 0 {
            return invalid("scroll_iterations must be > 0");
        }

        if self.capture_budget_ms == 0 || self.capture_budget_ms > MAX_MILLIS {
            return invalid("capture_budget_ms must be > 0 and at most one week");
        }

        if self.combined_click_pause_ms > MAX_MILLIS {
            return invalid("combined_click_pause_ms must be at most one week");
        }

        self.template_floors()?;

        if !self.corner_failsafe_enabled && !self.dry_run {
            warn!("Corner fail-safe disabled; the loop can only be stopped by a signal");
        }

        Ok(())
    }

    /// Per-button floors keyed by logical button.
    pub fn template_floors(&self) -> Result<BTreeMap<ButtonKind, f32>, ConfigError> {
        self.template_floors
            .iter()
            .map(|(name, floor)| {
                let kind = name
                    .parse::<ButtonKind>()
                    .map_err(|e| ConfigError::InvalidValue(format!("template_floors: {}", e)))?;
                if !valid_floor(*floor) {
                    return Err(ConfigError::InvalidValue(format!(
                        "template_floors.{} must be in (0, 1]",
                        name
                    )));
                }
                Ok((kind, *floor))
            })
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        bounded_seconds(self.tick_interval_seconds)
    }

    pub fn stall_age(&self) -> Duration {
        bounded_seconds(self.stall_age_seconds)
    }

    pub fn capture_budget(&self) -> Duration {
        Duration::from_millis(self.capture_budget_ms)
    }

    pub fn combined_click_pause(&self) -> Duration {
        Duration::from_millis(self.combined_click_pause_ms)
    }

    pub fn chat_anchor(&self) -> Option<Point> {
        self.chat_anchor.map(|[x, y]| Point::new(x, y))
    }

    pub fn chat_region(&self) -> Option<Region> {
        self.chat_region
            .filter(|[_, _, w, h]| *w > 0 && *h > 0)
            .map(|[x, y, w, h]| Region::new(x, y, w as u32, h as u32))
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            scroll_clicks: self.scroll_clicks,
            scroll_iterations: self.scroll_iterations,
            corner_failsafe: self.corner_failsafe_enabled,
            capture_budget: self.capture_budget(),
            ..Default::default()
        }
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            scales: self.match_scales.clone(),
            ..Default::default()
        }
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

fn valid_floor(floor: f32) -> bool {
    floor.is_finite() && floor > 0.0 && floor <= 1.0
}

/// A partial configuration. Set fields override the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    pub preset: Option<Preset>,
    pub tick_interval_seconds: Option<f64>,
    pub stall_identical_frames: Option<usize>,
    pub stall_age_seconds: Option<f64>,
    pub proximity_threshold_pixels: Option<f64>,
    pub confidence_floor: Option<f32>,
    pub reactivation_phrase: Option<String>,
    pub corner_failsafe_enabled: Option<bool>,
    pub template_dir: Option<PathBuf>,
    pub match_scales: Option<Vec<f32>>,
    pub chat_anchor: Option<[i32; 2]>,
    pub chat_region: Option<[i32; 4]>,
    pub capture_budget_ms: Option<u64>,
    pub combined_click_pause_ms: Option<u64>,
    pub scroll_clicks: Option<i32>,
    pub scroll_iterations: Option<u32>,
    pub max_ticks: Option<u64>,
    pub dry_run: Option<bool>,
    pub template_floors: Option<BTreeMap<String, f32>>,
}

macro_rules! overlay_fields {
    ($self:ident, $config:ident, $($field:ident),* $(,)?) => {
        $(
            if let Some(value) = $self.$field.clone() {
                $config.$field = value;
            }
        )*
    };
}

impl ConfigOverlay {
    /// Parse a TOML config file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::FileError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Read `AUTOCLICKER_*` variables through `lookup`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            key: &str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            raw.map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|_| ConfigError::InvalidValue(format!("{}={:?}", key, v)))
            })
            .transpose()
        }

        fn flag(key: &str, raw: Option<String>) -> Result<Option<bool>, ConfigError> {
            match raw.as_deref().map(|v| v.trim().to_lowercase()) {
                None => Ok(None),
                Some(v) if v == "1" || v == "true" || v == "yes" => Ok(Some(true)),
                Some(v) if v == "0" || v == "false" || v == "no" => Ok(Some(false)),
                Some(v) => Err(ConfigError::InvalidValue(format!("{}={:?}", key, v))),
            }
        }

        let var = |key: &str| lookup(key);
        Ok(Self {
            preset: parse("AUTOCLICKER_PRESET", var("AUTOCLICKER_PRESET"))?,
            tick_interval_seconds: parse(
                "AUTOCLICKER_TICK_INTERVAL",
                var("AUTOCLICKER_TICK_INTERVAL"),
            )?,
            stall_identical_frames: parse(
                "AUTOCLICKER_STALL_FRAMES",
                var("AUTOCLICKER_STALL_FRAMES"),
            )?,
            stall_age_seconds: parse("AUTOCLICKER_STALL_AGE", var("AUTOCLICKER_STALL_AGE"))?,
            proximity_threshold_pixels: parse(
                "AUTOCLICKER_PROXIMITY",
                var("AUTOCLICKER_PROXIMITY"),
            )?,
            confidence_floor: parse("AUTOCLICKER_CONFIDENCE", var("AUTOCLICKER_CONFIDENCE"))?,
            reactivation_phrase: var("AUTOCLICKER_PHRASE"),
            corner_failsafe_enabled: flag("AUTOCLICKER_FAILSAFE", var("AUTOCLICKER_FAILSAFE"))?,
            template_dir: var("AUTOCLICKER_TEMPLATE_DIR").map(PathBuf::from),
            max_ticks: parse("AUTOCLICKER_MAX_TICKS", var("AUTOCLICKER_MAX_TICKS"))?,
            dry_run: flag("AUTOCLICKER_DRY_RUN", var("AUTOCLICKER_DRY_RUN"))?,
            ..Default::default()
        })
    }

    /// Write every set field into `config`.
    pub fn apply(&self, config: &mut LoopConfig) {
        overlay_fields!(
            self,
            config,
            preset,
            tick_interval_seconds,
            stall_identical_frames,
            stall_age_seconds,
            proximity_threshold_pixels,
            confidence_floor,
            reactivation_phrase,
            corner_failsafe_enabled,
            template_dir,
            match_scales,
            capture_budget_ms,
            combined_click_pause_ms,
            scroll_clicks,
            scroll_iterations,
            dry_run,
            template_floors,
        );

        if self.chat_anchor.is_some() {
            config.chat_anchor = self.chat_anchor;
        }
        if self.chat_region.is_some() {
            config.chat_region = self.chat_region;
        }
        if self.max_ticks.is_some() {
            config.max_ticks = self.max_ticks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> ConfigOverlay {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConfigOverlay::from_env_with(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(20));
        assert_eq!(config.stall_identical_frames, 3);
        assert_eq!(config.stall_age(), Duration::from_secs(60));
        assert_eq!(config.proximity_threshold_pixels, 150.0);
        assert_eq!(config.confidence_floor, 0.8);
        assert!(config.corner_failsafe_enabled);
    }

    #[test]
    fn test_presets() {
        let demo = LoopConfig::for_preset(Preset::Demo);
        assert_eq!((demo.tick_interval_seconds, demo.stall_age_seconds), (5.0, 20.0));
        let fast = LoopConfig::for_preset(Preset::DemoFast);
        assert_eq!(fast.stall_age_seconds, 15.0);
        let rapid = LoopConfig::for_preset(Preset::DemoRapid);
        assert_eq!((rapid.tick_interval_seconds, rapid.stall_age_seconds), (3.0, 10.0));
        assert_eq!("demo-fast".parse::<Preset>().unwrap(), Preset::DemoFast);
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<fn(&mut LoopConfig)> = vec![
            |c| c.tick_interval_seconds = 0.0,
            |c| c.tick_interval_seconds = 1e30,
            |c| c.tick_interval_seconds = f64::INFINITY,
            |c| c.stall_age_seconds = 1e30,
            |c| c.capture_budget_ms = u64::MAX,
            |c| c.combined_click_pause_ms = u64::MAX,
            |c| c.stall_identical_frames = 0,
            |c| c.stall_age_seconds = -1.0,
            |c| c.proximity_threshold_pixels = f64::NAN,
            |c| c.confidence_floor = 1.5,
            |c| c.confidence_floor = 0.0,
            |c| c.reactivation_phrase = "   ".into(),
            |c| c.reactivation_phrase = "two\nlines".into(),
            |c| c.match_scales = vec![],
            |c| c.match_scales = vec![1.0, -0.5],
            |c| c.chat_region = Some([0, 0, 0, 100]),
            |c| c.scroll_iterations = 0,
            |c| {
                c.template_floors.insert("cancel".into(), 0.9);
            },
            |c| {
                c.template_floors.insert("run".into(), 1.2);
            },
        ];

        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = LoopConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidValue(_))),
                "case {} should be rejected",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_huge_interval_is_configuration_error() {
        let cli = ConfigOverlay {
            tick_interval_seconds: Some(1e30),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        let err = LoopConfig::load_with(Some(&path), ConfigOverlay::default(), cli)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let unchecked = LoopConfig {
            tick_interval_seconds: 1e30,
            stall_age_seconds: f64::NAN,
            ..LoopConfig::default()
        };
        assert_eq!(unchecked.tick_interval(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(unchecked.stall_age(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_precedence_file_env_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
preset = "demo"
stall_age_seconds = 30.0
proximity_threshold_pixels = 120.0
reactivation_phrase = "from file"
chat_region = [0, 100, 800, 600]

[template_floors]
accept_all = 0.9
"#,
        )
        .unwrap();

        let env = env(&[
            ("AUTOCLICKER_PROXIMITY", "140"),
            ("AUTOCLICKER_PHRASE", "from env"),
        ]);
        let cli = ConfigOverlay {
            reactivation_phrase: Some("from cli".into()),
            max_ticks: Some(3),
            ..Default::default()
        };

        let config = LoopConfig::load_with(Some(&path), env, cli).await.unwrap();
        assert_eq!(config.preset, Preset::Demo);
        // Preset default survives where nothing overrides it.
        assert_eq!(config.tick_interval_seconds, 5.0);
        assert_eq!(config.stall_age_seconds, 30.0);
        assert_eq!(config.proximity_threshold_pixels, 140.0);
        assert_eq!(config.reactivation_phrase, "from cli");
        assert_eq!(config.max_ticks, Some(3));
        assert_eq!(config.chat_region(), Some(Region::new(0, 100, 800, 600)));
        assert_eq!(
            config.template_floors().unwrap().get(&ButtonKind::AcceptAll),
            Some(&0.9)
        );
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_error() {
        let err = LoopConfig::load_with(
            Some(Path::new("/nope/config.toml")),
            ConfigOverlay::default(),
            ConfigOverlay::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let err = ConfigOverlay::from_toml("tick_interval = 5").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_env_parse_errors() {
        let map: HashMap<&str, &str> = [("AUTOCLICKER_STALL_FRAMES", "three")].into();
        let err = ConfigOverlay::from_env_with(|k| map.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(err.to_string().contains("AUTOCLICKER_STALL_FRAMES"));

        let overlay = env(&[
            ("AUTOCLICKER_FAILSAFE", "false"),
            ("AUTOCLICKER_PRESET", "demo-rapid"),
        ]);
        assert_eq!(overlay.corner_failsafe_enabled, Some(false));
        assert_eq!(overlay.preset, Some(Preset::DemoRapid));
    }

    #[test]
    fn test_toml_output_round_trips() {
        let mut config = LoopConfig::for_preset(Preset::DemoFast);
        config.chat_anchor = Some([640, 480]);
        config.template_floors.insert("continue".into(), 0.85);

        let text = config.to_toml().unwrap();
        let parsed: LoopConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
