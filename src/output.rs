//! # Output Configuration
//!
//! Controls whether user-facing progress lines are colorized. The job's own
//! container output is always passed through untouched; only the engine's
//! stage banners and outcome lines go through this gate.
//!
//! Respects `--color=always|never|auto`, `NO_COLOR` (https://no-color.org/),
//! `CLICOLOR`/`CLICOLOR_FORCE`, and `TERM=dumb`.

use std::env;

use console::Style;

/// Output configuration for the engine's own console lines.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Whether styling should be applied.
    pub use_color: bool,
}

impl OutputConfig {
    /// Build a configuration from the `--color` flag value, falling back to
    /// environment detection in `auto` mode.
    pub fn from_env_and_flag(color_flag: &str) -> Self {
        let use_color = match color_flag.to_lowercase().as_str() {
            "always" => true,
            "never" => false,
            _ => Self::detect_color_support(),
        };
        Self { use_color }
    }

    fn detect_color_support() -> bool {
        // The presence of NO_COLOR, even empty, disables colors.
        if env::var_os("NO_COLOR").is_some() {
            return false;
        }
        if env::var("CLICOLOR").is_ok_and(|v| v == "0") {
            return false;
        }
        if env::var("CLICOLOR_FORCE").is_ok_and(|v| v != "0" && !v.is_empty()) {
            return true;
        }
        if env::var("TERM").is_ok_and(|v| v == "dumb") {
            return false;
        }
        console::Term::stdout().features().colors_supported()
    }

    /// Apply `style` to `text` when colors are enabled, pass through
    /// otherwise.
    pub fn paint(&self, style: &Style, text: &str) -> String {
        if self.use_color {
            style.apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    #[cfg(test)]
    pub fn with_color() -> Self {
        Self { use_color: true }
    }

    #[cfg(test)]
    pub fn without_color() -> Self {
        Self { use_color: false }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::from_env_and_flag("auto")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_always() {
        let config = OutputConfig::from_env_and_flag("always");
        assert!(config.use_color);
    }

    #[test]
    fn test_color_never() {
        let config = OutputConfig::from_env_and_flag("never");
        assert!(!config.use_color);
    }

    #[test]
    fn test_paint_without_color_passes_through() {
        let config = OutputConfig::without_color();
        assert_eq!(config.paint(&Style::new().green(), "done"), "done");
    }

    #[test]
    fn test_paint_with_color_styles() {
        let config = OutputConfig::with_color();
        let painted = config.paint(&Style::new().force_styling(true).green(), "done");
        assert!(painted.contains("done"));
        assert!(painted.len() > "done".len());
    }
}
