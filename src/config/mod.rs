//! Configuration management for Moto.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tunnel::{AcceleratorConfig, AdaptationConfig, Role};

/// Default read deadline for regex mode, milliseconds.
const DEFAULT_REGEX_TIMEOUT_MS: u64 = 500;

/// Main configuration structure, loaded from a JSON settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,

    /// Accelerator overlay configuration.
    #[serde(default)]
    pub accelerator: AcceleratorConfig,

    /// Loss adaptation configuration.
    #[serde(default)]
    pub adaptation: AdaptationConfig,

    /// Listener rules.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Config {
    /// Load and validate configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Re-read configuration from a path, returning the validated result.
    pub fn reload<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(path)
    }

    /// Parse and validate a JSON configuration document.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole surface and precompile rule regexes.
    pub fn validate(&mut self) -> Result<()> {
        if self.accelerator.enabled {
            match self.accelerator.role {
                Role::Client if self.accelerator.remotes.is_empty() => {
                    return Err(Error::InvalidConfig(
                        "accelerator client enabled but no remotes".into(),
                    ));
                }
                Role::Server if self.accelerator.listen.is_empty() => {
                    return Err(Error::InvalidConfig(
                        "accelerator server enabled but no listen address".into(),
                    ));
                }
                _ => {}
            }
        }
        self.adaptation.validate()?;

        for (i, rule) in self.rules.iter_mut().enumerate() {
            rule.verify()
                .map_err(|e| Error::InvalidConfig(format!("rule at pos {i}: {e}")))?;
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (e.g. "info", "moto=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format, "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for text output.
    #[serde(default = "default_log_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_log_color() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_log_color(),
        }
    }
}

/// Routing policy for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Try targets in order, first success wins.
    #[default]
    Normal,
    /// Route by first-packet regex match.
    Regex,
    /// Race all targets, first connect wins.
    Boost,
    /// Rotate through targets, falling back to boost on failure.
    #[serde(rename = "roundrobin")]
    RoundRobin,
}

/// One upstream target of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Target address, `host:port`.
    pub address: String,

    /// Regex source for regex mode.
    #[serde(default)]
    pub regexp: Option<String>,

    /// Compiled pattern, populated by [`Rule::verify`].
    #[serde(skip)]
    pub pattern: Option<regex::bytes::Regex>,
}

/// One listener and its routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    /// Listen address, `host:port`.
    pub listen: String,

    #[serde(default)]
    pub mode: RuleMode,

    /// Keep warm idle connections to every target.
    #[serde(default)]
    pub prewarm: bool,

    pub targets: Vec<Target>,

    /// Policy timeout in milliseconds: the regex read deadline and the
    /// boost race budget.
    #[serde(default)]
    pub timeout: u64,

    /// Client IPs to reject at accept time.
    #[serde(default)]
    pub blacklist: HashSet<String>,
}

impl Rule {
    /// Validate the rule and compile regex-mode patterns.
    pub fn verify(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("empty name".into()));
        }
        if self.listen.is_empty() {
            return Err(Error::InvalidConfig("invalid listen address".into()));
        }
        if self.targets.is_empty() {
            return Err(Error::InvalidConfig("invalid targets".into()));
        }
        if self.mode == RuleMode::Regex && self.timeout == 0 {
            self.timeout = DEFAULT_REGEX_TIMEOUT_MS;
        }
        for (i, target) in self.targets.iter_mut().enumerate() {
            if target.address.is_empty() {
                return Err(Error::InvalidConfig(format!("invalid address at pos {i}")));
            }
            if self.mode == RuleMode::Regex {
                let source = target.regexp.as_deref().unwrap_or_default();
                let pattern = regex::bytes::Regex::new(source).map_err(|e| {
                    Error::InvalidConfig(format!("invalid regexp at pos {i}: {e}"))
                })?;
                target.pattern = Some(pattern);
            }
        }
        Ok(())
    }
}

/// Initialize the global tracing subscriber from the log configuration.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "log": { "level": "debug" },
            "accelerator": {
                "enabled": true,
                "role": "client",
                "remotes": ["relay.example.com:9000"],
                "transport": "tcp"
            },
            "adaptation": {
                "enabled": true,
                "windowSeconds": 10,
                "probeIntervalMs": 1000,
                "rules": [
                    { "lossBelow": 1.0, "dup": 1, "frameSize": 32768 },
                    { "lossBelow": 101.0, "dup": 3, "frameSize": 8192 }
                ]
            },
            "rules": [
                {
                    "name": "web",
                    "listen": "0.0.0.0:8080",
                    "mode": "regex",
                    "targets": [
                        { "address": "10.0.0.1:22", "regexp": "^SSH" },
                        { "address": "10.0.0.2:80", "regexp": "^(GET|POST)" }
                    ]
                },
                {
                    "name": "db",
                    "listen": "0.0.0.0:5432",
                    "mode": "boost",
                    "prewarm": true,
                    "timeout": 1000,
                    "targets": [
                        { "address": "10.0.1.1:5432" },
                        { "address": "10.0.1.2:5432" }
                    ],
                    "blacklist": ["192.0.2.7"]
                }
            ]
        }"#
    }

    #[test]
    fn test_parse_full_surface() {
        let config = Config::parse(sample()).unwrap();
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].mode, RuleMode::Regex);
        // Regex mode with no timeout gets the default deadline.
        assert_eq!(config.rules[0].timeout, DEFAULT_REGEX_TIMEOUT_MS);
        assert!(config.rules[0].targets[0].pattern.is_some());
        assert!(config.rules[1].blacklist.contains("192.0.2.7"));
        assert!(config.accelerator.enabled);
        assert_eq!(config.adaptation.rules.len(), 2);
    }

    #[test]
    fn test_bad_regex_rejected() {
        let mut rule = Rule {
            name: "r".into(),
            listen: "0.0.0.0:1".into(),
            mode: RuleMode::Regex,
            prewarm: false,
            targets: vec![Target {
                address: "a:1".into(),
                regexp: Some("(".into()),
                pattern: None,
            }],
            timeout: 0,
            blacklist: HashSet::new(),
        };
        assert!(rule.verify().is_err());
    }

    #[test]
    fn test_empty_rule_fields_rejected() {
        let mut rule = Rule {
            name: String::new(),
            listen: "0.0.0.0:1".into(),
            mode: RuleMode::Normal,
            prewarm: false,
            targets: vec![],
            timeout: 0,
            blacklist: HashSet::new(),
        };
        assert!(rule.verify().is_err());
    }

    #[test]
    fn test_client_without_remotes_rejected() {
        let mut config = Config::default();
        config.accelerator.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundrobin_mode_name() {
        let rule: Rule = serde_json::from_str(
            r#"{ "name": "r", "listen": "l:1", "mode": "roundrobin",
                 "targets": [{ "address": "a:1" }] }"#,
        )
        .unwrap();
        assert_eq!(rule.mode, RuleMode::RoundRobin);
    }
}
