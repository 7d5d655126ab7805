//! Gateway configuration loading.
//!
//! Reads the provider file (JSON, or YAML when the extension says so) and
//! resolves environment variables. The file lists one entry per backend plus
//! an optional `gateway` section with listener and timing settings:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "filesystem": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "~"] },
//!     "time": { "command": "uvx", "args": ["mcp-server-time"], "enabled": false }
//!   },
//!   "gateway": { "port": 3020, "session_grace_secs": 30 }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::{McpError, ServerConfig};

// ─── Public Types ────────────────────────────────────────────────────────────

/// Listener and timing settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    /// Per-request deadline for backend calls.
    pub request_timeout_secs: u64,
    /// How long a session survives with no attached endpoint.
    pub session_grace_secs: u64,
    /// Upper bound on how long `tools/list` waits for backends to come up.
    pub tools_list_wait_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3020,
            request_timeout_secs: 90,
            session_grace_secs: 30,
            tools_list_wait_secs: 30,
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session_grace_secs)
    }

    pub fn tools_list_wait(&self) -> Duration {
        Duration::from_secs(self.tools_list_wait_secs)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Providers keyed by name. Ordered by name, which is also the order
    /// links are registered in a session's catalog.
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl GatewayConfig {
    /// Providers that should get a link in new sessions, in name order.
    pub fn enabled_servers(&self) -> Vec<(String, ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, cfg)| cfg.is_enabled())
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect()
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse the configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}`, then resolves relative working directories
/// against the directory containing the file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let mut config = parse_config(&interpolated, is_yaml(path)).map_err(|reason| {
        McpError::Config {
            reason: format!("failed to parse {}: {reason}", path.display()),
        }
    })?;

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    resolve_relative_dirs(&mut config, &base_dir);

    // Disabled entries are placeholders and may be incomplete.
    for (name, server) in config.servers.iter().filter(|(_, s)| s.is_enabled()) {
        if server.command.trim().is_empty() {
            return Err(McpError::Config {
                reason: format!("server '{name}' has an empty command"),
            });
        }
    }

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        enabled = config.enabled_servers().len(),
        "loaded gateway config"
    );

    Ok(config)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn parse_config(text: &str, yaml: bool) -> Result<GatewayConfig, String> {
    if yaml {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }
}

fn resolve_relative_dirs(config: &mut GatewayConfig, base_dir: &Path) {
    for server in config.servers.values_mut() {
        if let Some(ref cwd) = server.cwd {
            let cwd_path = Path::new(cwd);
            if !cwd_path.is_absolute() {
                server.cwd = Some(base_dir.join(cwd_path).to_string_lossy().into_owned());
            }
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
