//! Tracer-wide defaults.
//!
//! A [`TracerConfig`] can be built in code or loaded from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `RUNLINK_ENABLED` | `false` turns every tracer call into a no-op |
//! | `RUNLINK_SESSION_NAME` | Session runs are filed under when the trace options name none |
//! | `RUNLINK_TAGS` | Comma separated tags added to every run |
//! | `RUNLINK_METADATA` | Comma separated `key=value` pairs added to every run's extra |
//!
//! Trace options set on a context take precedence: their session name replaces the configured
//! one, their tags are added to the configured tags, and their metadata keys replace configured
//! keys of the same name.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::api::JsonMap;

pub const ENV_PREFIX: &str = "RUNLINK_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load tracer configuration from the environment")]
    Env(#[from] envy::Error),

    #[error("Malformed metadata entry '{0}', expected key=value")]
    MalformedMetadata(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TracerConfig {
    enabled: bool,
    session_name: Option<String>,
    tags: BTreeSet<String>,
    metadata: JsonMap,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            enabled: true,
            session_name: None,
            tags: BTreeSet::new(),
            metadata: JsonMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct EnvConfig {
    // RUNLINK_ENABLED
    enabled: Option<bool>,

    // RUNLINK_SESSION_NAME
    session_name: Option<String>,

    // RUNLINK_TAGS
    #[serde(default)]
    tags: Vec<String>,

    // RUNLINK_METADATA
    metadata: Option<String>,
}

impl TracerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `RUNLINK_*` environment variables. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_prefixed(ENV_PREFIX)
    }

    /// Load from environment variables with a custom prefix, e.g. `MY_APP_` for
    /// `MY_APP_SESSION_NAME`.
    pub fn from_env_prefixed(prefix: &str) -> Result<Self, ConfigError> {
        let env = envy::prefixed(prefix).from_env::<EnvConfig>()?;
        Self::from_env_config(env)
    }

    /// Like [from_env_prefixed](Self::from_env_prefixed), reading from the given variables
    /// instead of the process environment.
    pub fn from_iter_prefixed<I, K, V>(prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars.into_iter().map(|(k, v)| (k.into(), v.into()));
        let env = envy::prefixed(prefix).from_iter::<_, EnvConfig>(vars)?;
        Self::from_env_config(env)
    }

    fn from_env_config(env: EnvConfig) -> Result<Self, ConfigError> {
        let mut cfg = TracerConfig::new();
        if let Some(enabled) = env.enabled {
            cfg.set_enabled(enabled);
        }
        if let Some(name) = env.session_name.filter(|n| !n.is_empty()) {
            cfg.set_session_name(name);
        }
        for tag in env.tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                cfg.add_tag(tag);
            }
        }
        for entry in env.metadata.iter().flat_map(|m| m.split(',')) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .ok_or_else(|| ConfigError::MalformedMetadata(entry.to_owned()))?;
            cfg.add_metadata(key.trim(), value.trim());
        }
        Ok(cfg)
    }

    /// Enable or disable tracing as a whole.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
    /// A chainable version of [set_enabled](Self::set_enabled).
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.set_enabled(enabled);
        self
    }

    /// The session used when the trace options don't name one.
    pub fn set_session_name<S: Into<String>>(&mut self, name: S) {
        self.session_name = Some(name.into());
    }
    /// A chainable version of [set_session_name](Self::set_session_name).
    pub fn with_session_name<S: Into<String>>(mut self, name: S) -> Self {
        self.set_session_name(name);
        self
    }

    /// Add a tag to every run.
    pub fn add_tag<S: Into<String>>(&mut self, tag: S) {
        self.tags.insert(tag.into());
    }
    /// A chainable version of [add_tag](Self::add_tag).
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.add_tag(tag);
        self
    }

    /// Add metadata to every run's extra.
    pub fn add_metadata<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.metadata.insert(key.into(), value.into());
    }
    /// A chainable version of [add_metadata](Self::add_metadata).
    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.add_metadata(key, value);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }
}

#[doc(hidden)]
#[cfg(feature = "init_tracing")]
pub use tracing_subscriber as __tracing_subscriber;

/// Initialize the `tracing` crate with `tracing_subscriber::EnvFilter`. If
/// `RUST_LOG` is not set, default to setting the calling crate and `runlink` to 'info'.
/// Will panic if the tracing subscriber cannot be initialized.
#[cfg(feature = "init_tracing")]
#[macro_export]
macro_rules! init_tracing {
    () => {
        $crate::init_tracing!($crate::config::__tracing_subscriber::EnvFilter::new(format!(
            "{}=info,runlink=info",
            env!("CARGO_PKG_NAME").replace('-', "_"),
        )))
    };
    ($env_filter:expr) => {
        let builder = $crate::config::__tracing_subscriber::fmt::Subscriber::builder();
        let env_filter =
            ::std::env::var($crate::config::__tracing_subscriber::EnvFilter::DEFAULT_ENV)
                .map($crate::config::__tracing_subscriber::EnvFilter::new)
                .unwrap_or_else(|_| $env_filter);
        let builder = builder.with_env_filter(env_filter);
        let subscriber = builder.finish();
        use $crate::config::__tracing_subscriber::util::SubscriberInitExt;
        subscriber
            .try_init()
            .expect("Unable to initialize tracing subscriber");
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TracerConfig::default();
        assert!(cfg.enabled());
        assert_eq!(None, cfg.session_name());
        assert!(cfg.tags().is_empty());
        assert!(cfg.metadata().is_empty());
    }

    #[test]
    fn load_from_vars() {
        let cfg = TracerConfig::from_iter_prefixed(
            ENV_PREFIX,
            [
                ("RUNLINK_ENABLED", "false"),
                ("RUNLINK_SESSION_NAME", "checkout"),
                ("RUNLINK_TAGS", "env_test, cid_test"),
                ("RUNLINK_METADATA", "user=test-user,region = eu"),
                ("UNRELATED", "ignored"),
            ],
        )
        .unwrap();

        assert!(!cfg.enabled());
        assert_eq!(Some("checkout"), cfg.session_name());
        assert_eq!(
            vec!["cid_test", "env_test"],
            cfg.tags().iter().map(String::as_str).collect::<Vec<_>>()
        );
        assert_eq!(Some(&Value::from("test-user")), cfg.metadata().get("user"));
        assert_eq!(Some(&Value::from("eu")), cfg.metadata().get("region"));
    }

    #[test]
    fn malformed_metadata() {
        let err = TracerConfig::from_iter_prefixed(
            ENV_PREFIX,
            [("RUNLINK_METADATA", "user=a,oops")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedMetadata(e) if e == "oops"));

        let err = TracerConfig::from_iter_prefixed(ENV_PREFIX, [("RUNLINK_ENABLED", "maybe")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
    }

    #[test]
    #[serial_test::serial]
    fn load_from_process_env() {
        std::env::set_var("RUNLINK_TEST_SESSION_NAME", "from-env");
        std::env::set_var("RUNLINK_TEST_TAGS", "a,b");
        let cfg = TracerConfig::from_env_prefixed("RUNLINK_TEST_");
        std::env::remove_var("RUNLINK_TEST_SESSION_NAME");
        std::env::remove_var("RUNLINK_TEST_TAGS");

        let cfg = cfg.unwrap();
        assert!(cfg.enabled());
        assert_eq!(Some("from-env"), cfg.session_name());
        assert_eq!(2, cfg.tags().len());
    }
}
