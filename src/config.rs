//! Node configuration and its resolution into per-node settings.
//!
//! [`TailscaleConfig`] is the application-level document: process-wide
//! defaults plus optional per-node overrides keyed by node name.
//! [`ConfigResolver`] turns it into [`NodeSettings`] for one node, applying
//! placeholder substitution through a [`Replacer`] and falling back to
//! environment variables for the auth key.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;

/// Application name used when deriving a default state directory.
pub const DEFAULT_APP_NAME: &str = "tsnet-mux";

/// Environment variable holding the process-wide auth key.
pub const AUTH_KEY_ENV: &str = "TS_AUTHKEY";

/// Environment lookup used for placeholders and auth key fallbacks.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment lookup backed by the process environment and an optional
/// `.env` file.
#[must_use]
pub fn process_env() -> EnvLookup {
    Arc::new(|key: &str| dotenvy::var(key).ok())
}

/// Application-level configuration shared by every node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TailscaleConfig {
    /// Auth key used by nodes without their own.
    pub auth_key: String,

    /// Coordination server URL; empty means the runtime's default.
    pub control_url: String,

    /// Register nodes as ephemeral unless overridden.
    pub ephemeral: bool,

    /// Parent directory for node state; each node gets a subdirectory.
    pub state_dir: String,

    /// Run the node web UI unless overridden.
    pub webui: bool,

    /// Per-node overrides keyed by node name.
    pub nodes: HashMap<String, NodeConfig>,
}

impl TailscaleConfig {
    /// Parses the JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or unknown keys.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Overrides for a single node. Empty strings and `None` defer to
/// [`TailscaleConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Auth key for this node.
    pub auth_key: String,

    /// Coordination server URL for this node.
    pub control_url: String,

    /// Ephemeral registration override.
    pub ephemeral: Option<bool>,

    /// Web UI override.
    pub webui: Option<bool>,

    /// Tailnet hostname; defaults to the node name.
    pub hostname: String,

    /// Exact state directory for this node.
    pub state_dir: String,
}

/// Fully resolved settings for one node, handed to the runtime launcher.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeSettings {
    /// Pool key of the node.
    pub name: String,
    /// Auth key used to register the node (may be empty).
    pub auth_key: String,
    /// Coordination server URL (may be empty).
    pub control_url: String,
    /// Hostname the node registers as.
    pub hostname: String,
    /// Directory holding the node's identity state.
    pub state_dir: PathBuf,
    /// Register as an ephemeral node.
    pub ephemeral: bool,
    /// Run the node web UI.
    pub webui: bool,
}

impl fmt::Debug for NodeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth_key = if self.auth_key.is_empty() {
            ""
        } else {
            "[REDACTED]"
        };
        f.debug_struct("NodeSettings")
            .field("name", &self.name)
            .field("auth_key", &auth_key)
            .field("control_url", &self.control_url)
            .field("hostname", &self.hostname)
            .field("state_dir", &self.state_dir)
            .field("ephemeral", &self.ephemeral)
            .field("webui", &self.webui)
            .finish()
    }
}

/// Placeholder substitution applied to every configured string.
pub trait Replacer: Send + Sync + fmt::Debug {
    /// Substitutes all placeholders in `input`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPlaceholder`] or
    /// [`ConfigError::EmptyPlaceholder`].
    fn replace_or_err(&self, input: &str) -> Result<String, ConfigError>;
}

/// Replacer for `{env.NAME}`, `{system.os}` and `{system.arch}`.
///
/// `\{` and `\}` produce literal braces. A `{` without a closing brace and
/// the empty `{}` are kept as written.
#[derive(Clone)]
pub struct EnvReplacer {
    env: EnvLookup,
}

impl EnvReplacer {
    /// Replacer reading environment placeholders through `env`.
    #[must_use]
    pub fn new(env: EnvLookup) -> Self {
        Self { env }
    }

    fn lookup(&self, key: &str) -> Result<String, ConfigError> {
        let value = if let Some(var) = key.strip_prefix("env.") {
            (self.env)(var).unwrap_or_default()
        } else {
            match key {
                "system.os" => std::env::consts::OS.to_string(),
                "system.arch" => std::env::consts::ARCH.to_string(),
                _ => return Err(ConfigError::UnknownPlaceholder(key.to_string())),
            }
        };
        if value.is_empty() {
            return Err(ConfigError::EmptyPlaceholder(key.to_string()));
        }
        Ok(value)
    }
}

impl Default for EnvReplacer {
    fn default() -> Self {
        Self::new(process_env())
    }
}

impl fmt::Debug for EnvReplacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvReplacer").finish_non_exhaustive()
    }
}

impl Replacer for EnvReplacer {
    fn replace_or_err(&self, input: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(pos) = rest.find(['{', '\\']) {
            let (head, tail) = rest.split_at(pos);
            out.push_str(head);

            if let Some(after) = tail.strip_prefix('\\') {
                match after.chars().next() {
                    Some(c @ ('{' | '}')) => {
                        out.push(c);
                        rest = after.get(1..).unwrap_or_default();
                    }
                    _ => {
                        out.push('\\');
                        rest = after;
                    }
                }
                continue;
            }

            let body = tail.strip_prefix('{').unwrap_or(tail);
            match body.split_once('}') {
                Some(("", after)) => {
                    out.push_str("{}");
                    rest = after;
                }
                Some((key, after)) => {
                    out.push_str(&self.lookup(key)?);
                    rest = after;
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Resolves [`NodeSettings`] for node names against a [`TailscaleConfig`].
#[derive(Clone)]
pub struct ConfigResolver {
    config: TailscaleConfig,
    replacer: Arc<dyn Replacer>,
    env: EnvLookup,
    app_name: String,
    config_dir: Option<PathBuf>,
}

impl ConfigResolver {
    /// Resolver reading the process environment and the platform's user
    /// configuration directory.
    #[must_use]
    pub fn new(config: TailscaleConfig) -> Self {
        let env = process_env();
        Self {
            config,
            replacer: Arc::new(EnvReplacer::new(Arc::clone(&env))),
            env,
            app_name: DEFAULT_APP_NAME.to_string(),
            config_dir: dirs::config_dir(),
        }
    }

    /// Replaces the environment lookup. The default [`EnvReplacer`] is
    /// rebound to the new lookup; call [`Self::with_replacer`] afterwards to
    /// install a different replacer.
    #[must_use]
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.replacer = Arc::new(EnvReplacer::new(Arc::clone(&env)));
        self.env = env;
        self
    }

    /// Replaces the placeholder replacer.
    #[must_use]
    pub fn with_replacer(mut self, replacer: Arc<dyn Replacer>) -> Self {
        self.replacer = replacer;
        self
    }

    /// Sets the application name used in derived state directories.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Overrides the user configuration directory (`None` disables the
    /// derived default).
    #[must_use]
    pub fn with_config_dir(mut self, config_dir: Option<PathBuf>) -> Self {
        self.config_dir = config_dir;
        self
    }

    /// The underlying configuration document.
    #[must_use]
    pub fn config(&self) -> &TailscaleConfig {
        &self.config
    }

    /// Resolves every setting for `name`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if substitution fails or no state directory
    /// can be derived.
    pub fn resolve(&self, name: &str) -> Result<NodeSettings, ConfigError> {
        Ok(NodeSettings {
            name: name.to_string(),
            auth_key: self.auth_key(name)?,
            control_url: self.control_url(name)?,
            hostname: self.hostname(name)?,
            state_dir: self.state_dir(name)?,
            ephemeral: self.ephemeral(name),
            webui: self.webui(name),
        })
    }

    fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.config.nodes.get(name)
    }

    fn node_str<'a>(&'a self, name: &str, field: fn(&NodeConfig) -> &str) -> Option<&'a str> {
        self.node(name).map(field).filter(|v| !v.is_empty())
    }

    fn auth_key(&self, name: &str) -> Result<String, ConfigError> {
        if let Some(key) = self.node_str(name, |n| n.auth_key.as_str()) {
            return self.replacer.replace_or_err(key);
        }
        if !self.config.auth_key.is_empty() {
            return self.replacer.replace_or_err(&self.config.auth_key);
        }

        let per_node = format!("{AUTH_KEY_ENV}_{}", name.to_uppercase());
        if let Some(key) = (self.env)(&per_node).filter(|k| !k.is_empty()) {
            tracing::warn!(
                node = name,
                var = %per_node,
                "per-node auth key environment variable is deprecated; set auth_key in the configuration"
            );
            return Ok(key);
        }

        Ok((self.env)(AUTH_KEY_ENV).unwrap_or_default())
    }

    fn control_url(&self, name: &str) -> Result<String, ConfigError> {
        let url = self
            .node_str(name, |n| n.control_url.as_str())
            .unwrap_or(&self.config.control_url);
        self.replacer.replace_or_err(url)
    }

    fn hostname(&self, name: &str) -> Result<String, ConfigError> {
        match self.node_str(name, |n| n.hostname.as_str()) {
            Some(hostname) => self.replacer.replace_or_err(hostname),
            None => Ok(name.to_string()),
        }
    }

    fn state_dir(&self, name: &str) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = self.node_str(name, |n| n.state_dir.as_str()) {
            return self.replacer.replace_or_err(dir).map(PathBuf::from);
        }
        if !self.config.state_dir.is_empty() {
            let parent = self.replacer.replace_or_err(&self.config.state_dir)?;
            return Ok(PathBuf::from(parent).join(name));
        }

        // Include the node name so one process can host several nodes.
        let config_dir = self.config_dir.as_ref().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(format!("{}-{name}", self.app_name)))
    }

    fn ephemeral(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|n| n.ephemeral)
            .unwrap_or(self.config.ephemeral)
    }

    fn webui(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|n| n.webui)
            .unwrap_or(self.config.webui)
    }
}

impl fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("nodes", &self.config.nodes.keys().collect::<Vec<_>>())
            .field("replacer", &self.replacer)
            .field("app_name", &self.app_name)
            .field("config_dir", &self.config_dir)
            .finish_non_exhaustive()
    }
}
