use std::env;

use regex::Regex;
use thiserror::Error;
use tokio::time::Duration;

use crate::provisioner::HashPolicy;
use crate::utils::parse_duration_string;
use crate::vpc::VpcMode;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },

    #[error("Invalid regex for {var}: {message}")]
    InvalidRegex { var: String, message: String },
}

/// Configuration for a release-test run (Section 6, CLI surface owned by an
/// external collaborator; this struct is the shape it resolves into).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub regexes: Vec<String>,
    pub invert_regex: bool,
    pub results_file: Option<String>,
    pub extended: bool,
    pub fail_fast: bool,
    pub pause_on_failure: bool,
    pub hash_policy: HashPolicy,
    pub vpc_mode: VpcMode,
    pub applied_for: Duration,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

fn parse_hash_policy(s: &str) -> Result<HashPolicy, ConfigError> {
    match s {
        "layer2" => Ok(HashPolicy::Layer2),
        "layer2+3" => Ok(HashPolicy::Layer2Plus3),
        "layer3+4" => Ok(HashPolicy::Layer3Plus4),
        "encap2+3" => Ok(HashPolicy::Encap2Plus3),
        "encap3+4" => Ok(HashPolicy::Encap3Plus4),
        "vlan+srcmac" => Ok(HashPolicy::VlanSrcMac),
        other => Err(ConfigError::InvalidValue {
            var: "HASH_POLICY".into(),
            message: format!(
                "unknown hash policy '{other}'. Valid options: layer2, layer2+3, layer3+4, encap2+3, encap3+4, vlan+srcmac"
            ),
        }),
    }
}

fn parse_vpc_mode(s: &str) -> Result<VpcMode, ConfigError> {
    match s {
        "l2vni" => Ok(VpcMode::L2Vni),
        "l3vni" => Ok(VpcMode::L3Vni),
        "l3flat" => Ok(VpcMode::L3Flat),
        other => Err(ConfigError::InvalidValue {
            var: "VPC_MODE".into(),
            message: format!("unknown vpc mode '{other}'. Valid options: l2vni, l3vni, l3flat"),
        }),
    }
}

impl RunnerConfig {
    /// Loads configuration from environment variables (the CLI glue that
    /// parses `--regex`/`--hash-policy`/etc. is an external collaborator;
    /// it is expected to set these env vars before invoking the core).
    pub fn from_env() -> Result<Self, ConfigError> {
        let regexes: Vec<String> = env::var("RELEASE_TEST_REGEX")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        // Validate eagerly so a malformed pattern fails fast at config load,
        // not mid-suite.
        for pattern in &regexes {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
                var: "RELEASE_TEST_REGEX".into(),
                message: e.to_string(),
            })?;
        }

        let invert_regex = env_bool("RELEASE_TEST_INVERT_REGEX", false);
        let results_file = env::var("RELEASE_TEST_RESULTS_FILE").ok();
        let extended = env_bool("RELEASE_TEST_EXTENDED", false);
        let fail_fast = env_bool("RELEASE_TEST_FAIL_FAST", false);
        let pause_on_failure = env_bool("RELEASE_TEST_PAUSE_ON_FAILURE", false);

        let hash_policy_str =
            env::var("RELEASE_TEST_HASH_POLICY").unwrap_or_else(|_| "layer2+3".to_string());
        let hash_policy = parse_hash_policy(&hash_policy_str)?;

        let vpc_mode_str = env::var("RELEASE_TEST_VPC_MODE").unwrap_or_else(|_| "l2vni".to_string());
        let vpc_mode = parse_vpc_mode(&vpc_mode_str)?;

        let applied_for_str =
            env::var("RELEASE_TEST_APPLIED_FOR").unwrap_or_else(|_| "15s".to_string());
        let applied_for = parse_duration_string(&applied_for_str).map_err(|e| {
            ConfigError::InvalidDuration {
                var: "RELEASE_TEST_APPLIED_FOR".into(),
                message: e,
            }
        })?;

        let readiness_timeout_str =
            env::var("RELEASE_TEST_READINESS_TIMEOUT").unwrap_or_else(|_| "600s".to_string());
        let readiness_timeout = parse_duration_string(&readiness_timeout_str).map_err(|e| {
            ConfigError::InvalidDuration {
                var: "RELEASE_TEST_READINESS_TIMEOUT".into(),
                message: e,
            }
        })?;

        let poll_interval_secs: u64 = env_parse_or("RELEASE_TEST_POLL_INTERVAL_SECS", 5)?;

        let config = RunnerConfig {
            regexes,
            invert_regex,
            results_file,
            extended,
            fail_fast,
            pause_on_failure,
            hash_policy,
            vpc_mode,
            applied_for,
            readiness_timeout,
            poll_interval: Duration::from_secs(poll_interval_secs),
        };

        Ok(config)
    }

    pub fn compiled_regexes(&self) -> Result<Vec<Regex>, ConfigError> {
        self.regexes
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidRegex {
                    var: "RELEASE_TEST_REGEX".into(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        RunnerConfig {
            regexes: Vec::new(),
            invert_regex: false,
            results_file: None,
            extended: false,
            fail_fast: false,
            pause_on_failure: false,
            hash_policy: HashPolicy::Layer2Plus3,
            vpc_mode: VpcMode::L2Vni,
            applied_for: Duration::from_secs(15),
            readiness_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        let vars = [
            "RELEASE_TEST_REGEX",
            "RELEASE_TEST_INVERT_REGEX",
            "RELEASE_TEST_RESULTS_FILE",
            "RELEASE_TEST_EXTENDED",
            "RELEASE_TEST_FAIL_FAST",
            "RELEASE_TEST_PAUSE_ON_FAILURE",
            "RELEASE_TEST_HASH_POLICY",
            "RELEASE_TEST_VPC_MODE",
            "RELEASE_TEST_APPLIED_FOR",
            "RELEASE_TEST_READINESS_TIMEOUT",
            "RELEASE_TEST_POLL_INTERVAL_SECS",
        ];
        for var in vars {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_with_no_env() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        let config = RunnerConfig::from_env().unwrap();
        assert!(config.regexes.is_empty());
        assert!(!config.invert_regex);
        assert!(!config.extended);
        assert!(!config.fail_fast);
        assert_eq!(config.hash_policy, HashPolicy::Layer2Plus3);
        assert_eq!(config.vpc_mode, VpcMode::L2Vni);
        assert_eq!(config.applied_for, Duration::from_secs(15));
        assert_eq!(config.readiness_timeout, Duration::from_secs(600));

        clear_env_vars();
    }

    #[test]
    fn parses_comma_separated_regex_list() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RELEASE_TEST_REGEX", "LAG$, ^No restrictions");
        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.regexes, vec!["LAG$", "^No restrictions"]);
        assert_eq!(config.compiled_regexes().unwrap().len(), 2);

        clear_env_vars();
    }

    #[test]
    fn invalid_hash_policy_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RELEASE_TEST_HASH_POLICY", "bogus");
        let result = RunnerConfig::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        clear_env_vars();
    }

    #[test]
    fn invalid_regex_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("RELEASE_TEST_REGEX", "(unterminated");
        let result = RunnerConfig::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidRegex { .. })));

        clear_env_vars();
    }
}
