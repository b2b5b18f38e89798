//! Script loading. The worker machinery only knows the [`ScriptLoader`]
//! trait; [`RegistryLoader`] is the in-process implementation used by the
//! demo binary and the tests.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::ConfigurationError;
use crate::error_bridge::Thrown;
use crate::worker::WorkerScope;

/// Body of a worker. Returning `Err` (or panicking) is an uncaught failure.
pub type Script = Arc<dyn Fn(&WorkerScope) -> Result<(), Thrown> + Send + Sync>;

pub trait ScriptLoader: Send + Sync {
    /// Checks addressing and returns the canonical form of `target`.
    /// Runs synchronously on the spawning thread.
    fn resolve(&self, target: &str, eval: bool) -> Result<String, ConfigurationError>;

    /// Runs a resolved script on the worker thread.
    fn execute(&self, resolved: &str, eval: bool, scope: &WorkerScope) -> Result<(), Thrown>;
}

pub struct RegistryLoader {
    files: DashMap<PathBuf, Script>,
    evals: DashMap<String, Script>,
    allowed_extensions: Vec<String>,
    base_dir: PathBuf,
}

impl Default for RegistryLoader {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            files: DashMap::new(),
            evals: DashMap::new(),
            allowed_extensions: config.allowed_extensions.clone(),
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Directory relative targets are resolved against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = normalize(&dir.into());
        self
    }

    /// Registers a script reachable through a file target such as `./job.js`.
    pub fn register_file<F>(&self, path: impl AsRef<Path>, script: F) -> &Self
    where
        F: Fn(&WorkerScope) -> Result<(), Thrown> + Send + Sync + 'static,
    {
        let key = normalize(&self.base_dir.join(path));
        self.files.insert(key, Arc::new(script));
        self
    }

    /// Registers a script reachable with `eval` set and `name` as the target.
    pub fn register_eval<F>(&self, name: impl Into<String>, script: F) -> &Self
    where
        F: Fn(&WorkerScope) -> Result<(), Thrown> + Send + Sync + 'static,
    {
        self.evals.insert(name.into(), Arc::new(script));
        self
    }

    fn lookup(&self, resolved: &str, eval: bool) -> Option<Script> {
        if eval {
            self.evals.get(resolved).map(|s| s.value().clone())
        } else {
            self.files
                .get(Path::new(resolved))
                .map(|s| s.value().clone())
        }
    }
}

impl ScriptLoader for RegistryLoader {
    fn resolve(&self, target: &str, eval: bool) -> Result<String, ConfigurationError> {
        if eval {
            if !self.evals.contains_key(target) {
                return Err(ConfigurationError::UnknownScript(target.to_string()));
            }
            return Ok(target.to_string());
        }

        let path = Path::new(target);
        if !path.is_absolute() && !is_explicitly_relative(target) {
            return Err(ConfigurationError::InvalidPath(target.to_string()));
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.allowed_extensions.iter().any(|allowed| allowed == ext) {
            return Err(ConfigurationError::UnsupportedExtension(target.to_string()));
        }
        let resolved = normalize(&self.base_dir.join(path));
        debug!(target, resolved = %resolved.display(), "resolved worker script");
        Ok(resolved.to_string_lossy().into_owned())
    }

    fn execute(&self, resolved: &str, eval: bool, scope: &WorkerScope) -> Result<(), Thrown> {
        match self.lookup(resolved, eval) {
            Some(script) => script(scope),
            None => Err(Thrown::error("Error", format!("Cannot find module '{resolved}'"))),
        }
    }
}

fn is_explicitly_relative(target: &str) -> bool {
    ["./", "../", ".\\", "..\\"]
        .iter()
        .any(|prefix| target.starts_with(prefix))
}

/// Lexical normalization; never touches the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
