//! Startup sequence: templates, then devices, then the loop.
//!
//! Templates are loaded before either device factory runs, so a missing or
//! unreadable asset stops the process before the screen or the input devices
//! are opened.

use crate::capture::ScreenCapture;
use crate::config::LoopConfig;
use crate::controller::ControlLoop;
use crate::error::{Error, Result};
use crate::input::{DryRunSimulator, InputSimulator};
use crate::locator::ButtonLocator;
use crate::signals::Shutdown;
use crate::templates::TemplateSet;
use tracing::{info, warn};

/// Load `<button>.png` templates with the configured floors.
pub fn load_templates(config: &LoopConfig) -> Result<TemplateSet> {
    let floors = config.template_floors()?;
    let templates = TemplateSet::load_dir(&config.template_dir, &floors)?;
    info!(
        dir = %config.template_dir.display(),
        templates = templates.len(),
        "Templates loaded"
    );
    Ok(templates)
}

/// Build a ready-to-run loop. `open_capture` and `open_input` are only called
/// once every template has loaded.
pub fn assemble<C, I>(
    config: LoopConfig,
    shutdown: Shutdown,
    open_capture: C,
    open_input: I,
) -> Result<ControlLoop>
where
    C: FnOnce() -> Result<Box<dyn ScreenCapture>>,
    I: FnOnce() -> Result<Box<dyn InputSimulator>>,
{
    let templates = load_templates(&config)?;
    let locator = ButtonLocator::new(templates, config.confidence_floor)
        .with_settings(config.match_settings());

    let capture = open_capture()?;
    if !capture.is_available() {
        return Err(Error::unexpected("screen capture is not available on this display"));
    }

    let device = open_input()?;
    let input: Box<dyn InputSimulator> = if config.dry_run {
        warn!("Dry run: input events will be logged, not injected");
        Box::new(DryRunSimulator::new(device))
    } else {
        device
    };

    if config.corner_failsafe_enabled {
        info!("Move the mouse into any screen corner to stop");
    }

    ControlLoop::builder(config)
        .capture(capture)
        .detector(Box::new(locator))
        .input(input)
        .shutdown(shutdown)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::ScriptedCapture;
    use crate::input::mock::MockSimulator;

    #[tokio::test]
    async fn test_empty_template_dir_opens_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoopConfig {
            template_dir: dir.path().to_path_buf(),
            ..LoopConfig::default()
        };
        let mut opened = 0;

        let result = assemble(
            config,
            Shutdown::new(),
            || {
                opened += 1;
                Ok(Box::new(ScriptedCapture::solid(8, 8, [0, 0, 0, 255])) as Box<dyn ScreenCapture>)
            },
            || Ok(Box::new(MockSimulator::new()) as Box<dyn InputSimulator>),
        );

        let err = result.err().unwrap();
        assert_eq!(err.category(), "ConfigurationError");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(opened, 0);
    }
}
