use std::fmt;

use serde::Deserialize;

/// Compiler configuration, read from a TOML string (loading the file is the
/// driver's job):
///
/// ```toml
/// [general]
/// variable_prefix = "content."
/// skin = "mirror"
/// output_mode = "html"
/// ```
///
/// `skin` plays the role of the `-s` switch; `output_mode` is the default
/// used when the template carries no `html`/`xhtml`/`text` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub variable_prefix: String,
    pub skin: Option<String>,
    pub output_mode: Option<String>,
}

impl Config {
    pub fn new(s: &str) -> Result<Config, ConfigError> {
        let raw = if s.is_empty() {
            RawConfig::default()
        } else {
            RawConfig::from_toml_str(s)?
        };

        let general = raw.general.unwrap_or_default();
        let output_mode = match general.output_mode {
            None => None,
            Some(mode @ ("html" | "xhtml" | "text")) => Some(mode.to_string()),
            Some(mode) => {
                return Err(ConfigError(format!(
                    "invalid value for `output_mode`: {mode:?}"
                )))
            }
        };
        if let Some("") = general.skin {
            return Err(ConfigError("`skin` may not be empty".to_string()));
        }

        Ok(Config {
            variable_prefix: general
                .variable_prefix
                .unwrap_or("content.")
                .to_string(),
            skin: general.skin.map(str::to_string),
            output_mode,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variable_prefix: "content.".to_string(),
            skin: None,
            output_mode: None,
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig<'a> {
    #[serde(borrow)]
    general: Option<General<'a>>,
}

impl RawConfig<'_> {
    fn from_toml_str(s: &str) -> Result<RawConfig<'_>, ConfigError> {
        basic_toml::from_str(s)
            .map_err(|e| ConfigError(format!("invalid TOML in configuration: {e}")))
    }
}

#[derive(Deserialize, Default)]
struct General<'a> {
    #[serde(borrow)]
    variable_prefix: Option<&'a str>,
    skin: Option<&'a str>,
    output_mode: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {}
