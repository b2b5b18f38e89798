use std::env;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ENV_THREAD_PREFIX: &str = "WORKERPORT_THREAD_PREFIX";
pub const ENV_STACK_SIZE: &str = "WORKERPORT_STACK_SIZE";
pub const ENV_EXTENSIONS: &str = "WORKERPORT_EXTENSIONS";
pub const ENV_FORWARD_STDIO: &str = "WORKERPORT_FORWARD_STDIO";

/// Process-wide settings shared by every worker spawned from one [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads are named `{prefix}-{thread_id}`.
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    /// File extensions accepted for non-eval targets, without the dot.
    pub allowed_extensions: Vec<String>,
    /// Copy unconfigured worker stdout/stderr to the owner's own streams.
    pub forward_inherited_stdio: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "workerport".to_string(),
            stack_size: None,
            allowed_extensions: vec!["js".to_string(), "mjs".to_string()],
            forward_inherited_stdio: true,
        }
    }
}

impl RuntimeConfig {
    /// Loads `.env` if present, then reads the `WORKERPORT_*` variables.
    pub fn from_env() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("could not load .env: {e}"),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(prefix) = lookup(ENV_THREAD_PREFIX).filter(|p| !p.trim().is_empty()) {
            config.thread_name_prefix = prefix.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(0) => config.stack_size = None,
                Ok(size) => config.stack_size = Some(size),
                Err(e) => warn!("ignoring {ENV_STACK_SIZE}={raw}: {e}"),
            }
        }
        if let Some(raw) = lookup(ENV_EXTENSIONS) {
            let exts: Vec<String> = raw
                .split(',')
                .map(|e| e.trim().trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty())
                .collect();
            if exts.is_empty() {
                warn!("ignoring empty {ENV_EXTENSIONS}");
            } else {
                config.allowed_extensions = exts;
            }
        }
        if let Some(raw) = lookup(ENV_FORWARD_STDIO) {
            match parse_bool(&raw) {
                Some(v) => config.forward_inherited_stdio = v,
                None => warn!("ignoring {ENV_FORWARD_STDIO}={raw}: expected a boolean"),
            }
        }
        config
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        assert_eq!(RuntimeConfig::from_lookup(lookup(&[])), RuntimeConfig::default());
    }

    #[test]
    fn test_reads_every_variable() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_THREAD_PREFIX, "jobs"),
            (ENV_STACK_SIZE, "4194304"),
            (ENV_EXTENSIONS, ".js, cjs ,"),
            (ENV_FORWARD_STDIO, "off"),
        ]));
        assert_eq!(config.thread_name_prefix, "jobs");
        assert_eq!(config.stack_size, Some(4 * 1024 * 1024));
        assert_eq!(config.allowed_extensions, vec!["js", "cjs"]);
        assert!(!config.forward_inherited_stdio);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_STACK_SIZE, "huge"),
            (ENV_FORWARD_STDIO, "maybe"),
            (ENV_EXTENSIONS, " , "),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"thread_name_prefix":"w"}"#).unwrap();
        assert_eq!(config.thread_name_prefix, "w");
        assert!(config.forward_inherited_stdio);
    }
}
