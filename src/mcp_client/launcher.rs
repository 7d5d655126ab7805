//! Launch command resolution.
//!
//! Turns a `ServerConfig` into the concrete program, arguments, environment
//! and working directory for `tokio::process::Command`. Package runners such
//! as `npx` are batch scripts on Windows and need their `.cmd` suffix, and a
//! configured virtual environment replaces the bare interpreter name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::ServerConfig;

/// Runners shipped as `.cmd` shims on Windows.
const CMD_SHIMS: &[&str] = &["npx", "npm", "pnpm", "yarn", "bunx"];

/// Runners shipped as native executables on Windows.
const EXE_LAUNCHERS: &[&str] = &["uvx", "uv"];

/// Fully resolved launch parameters for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Resolve a launch spec for the host platform.
pub fn resolve(config: &ServerConfig) -> LaunchSpec {
    resolve_for(config, cfg!(target_os = "windows"))
}

/// Resolve a launch spec, with the platform given explicitly.
pub fn resolve_for(config: &ServerConfig, windows: bool) -> LaunchSpec {
    let mut env = config.env.clone();
    let cwd = config.cwd.as_ref().map(PathBuf::from);

    let command = match config.venv.as_deref() {
        Some(venv) => resolve_venv(&config.command, venv, cwd.as_deref(), windows, &mut env),
        None => config.command.clone(),
    };

    let (program, args) = platform_command(&command, &config.args, windows);

    LaunchSpec {
        program,
        args,
        env,
        cwd,
    }
}

/// Apply the platform-specific suffix or shell indirection.
fn platform_command(command: &str, args: &[String], windows: bool) -> (String, Vec<String>) {
    if !windows {
        return (command.to_string(), args.to_vec());
    }

    let path = Path::new(command);
    if path.is_absolute() || path.extension().is_some() {
        return (command.to_string(), args.to_vec());
    }

    let lower = command.to_ascii_lowercase();
    if CMD_SHIMS.contains(&lower.as_str()) {
        return (format!("{command}.cmd"), args.to_vec());
    }
    if EXE_LAUNCHERS.contains(&lower.as_str()) {
        return (format!("{command}.exe"), args.to_vec());
    }

    // Anything else may be a script on PATH; let cmd.exe find it.
    let mut shell_args = vec!["/C".to_string(), command.to_string()];
    shell_args.extend(args.iter().cloned());
    ("cmd".to_string(), shell_args)
}

/// Rewrite `command` to the venv's binary and inject `VIRTUAL_ENV` + `PATH`.
///
/// Falls back to the bare command when the venv binary does not exist.
fn resolve_venv(
    command: &str,
    venv: &str,
    cwd: Option<&Path>,
    windows: bool,
    env: &mut HashMap<String, String>,
) -> String {
    let venv_path = Path::new(venv);
    let abs_venv = if venv_path.is_absolute() {
        venv_path.to_path_buf()
    } else {
        cwd.map(|dir| dir.join(venv_path))
            .unwrap_or_else(|| venv_path.to_path_buf())
    };

    // Windows venvs use Scripts\ instead of bin/
    let venv_bin = if windows {
        abs_venv.join("Scripts")
    } else {
        abs_venv.join("bin")
    };
    let candidate = if windows && Path::new(command).extension().is_none() {
        venv_bin.join(format!("{command}.exe"))
    } else {
        venv_bin.join(command)
    };

    if !candidate.exists() {
        tracing::warn!(
            venv = %abs_venv.display(),
            command,
            "venv binary not found, using command as-is"
        );
        return command.to_string();
    }

    let separator = if windows { ';' } else { ':' };
    let system_path = std::env::var("PATH").unwrap_or_default();
    env.insert(
        "VIRTUAL_ENV".to_string(),
        abs_venv.to_string_lossy().into_owned(),
    );
    env.insert(
        "PATH".to_string(),
        format!("{}{separator}{system_path}", venv_bin.to_string_lossy()),
    );
    candidate.to_string_lossy().into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
