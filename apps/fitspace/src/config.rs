use std::env;
use thiserror::Error;
use url::Url;

const PROVISION_BASE_VAR: &str = "FITSPACE_PROVISION_BASE";
const TEARDOWN_URL_VAR: &str = "FITSPACE_TEARDOWN_URL";
const API_BASE_VAR: &str = "FITSPACE_API_BASE";
const SIGNALLING_URL_VAR: &str = "FITSPACE_SIGNALLING_URL";
const LOCALHOST_MODE_VAR: &str = "FITSPACE_LOCALHOST_MODE";

const DEFAULT_PROVISION_BASE: &str = "provision.fitspace.app";

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the provisioning endpoints.
    pub provision_base: Url,
    /// Endpoint the release beacon posts to on shutdown, if any.
    pub teardown_url: Option<Url>,
    /// Base URL of the avatar API (`.../api/`), if any.
    pub api_base: Option<Url>,
    /// Fallback signalling URL used when provisioning is bypassed.
    pub signalling_url: String,
    /// Developer escape hatch: activates the settings override layer so
    /// loopback signalling URLs are accepted.
    pub localhost_mode: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} is not a valid url: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provision_base = env::var(PROVISION_BASE_VAR)
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROVISION_BASE.to_string());
        let provision_base = normalize_base_url(&provision_base, PROVISION_BASE_VAR)?;

        let teardown_url = match env::var(TEARDOWN_URL_VAR) {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(normalize_base_url(&raw, TEARDOWN_URL_VAR)?)
            }
            _ => None,
        };

        let api_base = match env::var(API_BASE_VAR) {
            Ok(raw) if !raw.trim().is_empty() => Some(normalize_base_url(&raw, API_BASE_VAR)?),
            _ => None,
        };

        let signalling_url = env::var(SIGNALLING_URL_VAR).unwrap_or_default();

        let localhost_mode = env::var(LOCALHOST_MODE_VAR)
            .map(|raw| matches!(raw.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            provision_base,
            teardown_url,
            api_base,
            signalling_url,
            localhost_mode,
        })
    }
}

/// Parse a base URL, inferring a scheme when the operator left it off and
/// guaranteeing a trailing slash so joined paths append instead of
/// replacing.
pub fn normalize_base_url(raw: &str, var: &'static str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{}", infer_scheme(trimmed), trimmed)
    };
    let with_slash = if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    };
    Url::parse(&with_slash).map_err(|err| ConfigError::InvalidUrl {
        var,
        reason: err.to_string(),
    })
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_all() {
        for var in [
            PROVISION_BASE_VAR,
            TEARDOWN_URL_VAR,
            API_BASE_VAR,
            SIGNALLING_URL_VAR,
            LOCALHOST_MODE_VAR,
        ] {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.provision_base.as_str(),
            "https://provision.fitspace.app/"
        );
        assert!(config.teardown_url.is_none());
        assert!(config.api_base.is_none());
        assert!(config.signalling_url.is_empty());
        assert!(!config.localhost_mode);
    }

    #[test]
    fn env_values_are_normalized() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();
        unsafe {
            env::set_var(PROVISION_BASE_VAR, "127.0.0.1:9000");
            env::set_var(API_BASE_VAR, "https://fitspace.app/api");
            env::set_var(LOCALHOST_MODE_VAR, "1");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.provision_base.as_str(), "http://127.0.0.1:9000/");
        assert_eq!(
            config.api_base.as_ref().unwrap().as_str(),
            "https://fitspace.app/api/"
        );
        assert!(config.localhost_mode);

        clear_all();
    }

    #[test]
    fn invalid_url_is_reported_with_the_variable_name() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_all();
        unsafe {
            env::set_var(TEARDOWN_URL_VAR, "http://exa mple/");
        }

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains(TEARDOWN_URL_VAR));

        clear_all();
    }

    #[test]
    fn scheme_inference_prefers_https_for_public_hosts() {
        assert_eq!(infer_scheme("provision.fitspace.app"), "https://");
        assert_eq!(infer_scheme("localhost:9000"), "http://");
        assert_eq!(infer_scheme("10.1.2.3"), "http://");
        assert_eq!(infer_scheme("172.20.0.1"), "http://");
        assert_eq!(infer_scheme("172.40.0.1"), "https://");
        assert_eq!(infer_scheme("[::1]:9000"), "http://");
    }
}
