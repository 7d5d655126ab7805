pub mod config;
pub mod gateway;
pub mod http;
pub mod mcp_client;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use config::GatewayConfig;
use gateway::SessionRegistry;

/// Where and how log lines are written.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
    /// Write to this file (rotated on startup) instead of stderr.
    pub file: Option<PathBuf>,
}

/// Initialize the tracing subscriber.
///
/// Filtering comes from `RUST_LOG`, defaulting to `stdio_gateway=info,warn`.
/// When a log file is configured, existing logs are rotated first
/// (gateway.log → gateway.log.1 → .2 → .3, keeps last 3) and the fresh file
/// is written through a line-flushing writer.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stdio_gateway=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let result = match &options.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            rotate_logs(path, 3);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let writer = LineFlushedFile::new(log_file);
            let builder = builder.with_writer(writer).with_ansi(false);
            if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?options.file,
        pid = std::process::id(),
        "=== stdio-gateway starting ==="
    );
    Ok(())
}

/// `base` with a numeric generation suffix: `gateway.log` → `gateway.log.2`.
fn rotated_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift previous logs up one generation, dropping anything past `keep`.
///
/// Gaps in the chain are fine; a missing generation is simply not moved.
fn rotate_logs(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base);
        return;
    }
    let _ = std::fs::remove_file(rotated_path(base, keep));
    for generation in (1..=keep).rev() {
        let source = match generation {
            1 => base.to_path_buf(),
            n => rotated_path(base, n - 1),
        };
        if source.exists() {
            let _ = std::fs::rename(&source, rotated_path(base, generation));
        }
    }
}

/// Log sink that pushes every record to disk before returning, so a crash
/// loses at most the line being written.
#[derive(Clone)]
struct LineFlushedFile(Arc<std::sync::Mutex<std::fs::File>>);

impl LineFlushedFile {
    fn new(file: std::fs::File) -> Self {
        Self(Arc::new(std::sync::Mutex::new(file)))
    }

    fn with_file<T>(
        &self,
        op: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut file = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        op(&mut file)
    }
}

impl Write for LineFlushedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LineFlushedFile {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Bind the listener and serve until Ctrl-C / SIGTERM, then destroy every
/// session so no backend process outlives the gateway.
pub async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let enabled = config.enabled_servers();
    if enabled.is_empty() {
        tracing::warn!("no providers enabled; every new session will be refused");
    }

    let registry = SessionRegistry::new(&config);
    let app = http::router(Arc::clone(&registry));

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        addr = %addr,
        providers = ?enabled.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    registry.shutdown_all().await;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_three_generations() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("gateway.log");
        for run in 0..5 {
            std::fs::write(&base, format!("run {run}")).unwrap();
            rotate_logs(&base, 3);
        }
        assert!(!base.exists());
        let contents: Vec<String> = (1..=3)
            .map(|n| std::fs::read_to_string(rotated_path(&base, n)).unwrap())
            .collect();
        assert_eq!(contents, ["run 4", "run 3", "run 2"]);
        assert!(!rotated_path(&base, 4).exists());
    }

    #[test]
    fn test_rotation_skips_missing_generations() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("gateway.log");
        std::fs::write(rotated_path(&base, 2), "old").unwrap();
        std::fs::write(&base, "current").unwrap();
        rotate_logs(&base, 3);
        assert_eq!(std::fs::read_to_string(rotated_path(&base, 1)).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(rotated_path(&base, 3)).unwrap(), "old");
        assert!(!rotated_path(&base, 2).exists());
    }

    #[test]
    fn test_line_flushed_file_is_visible_immediately() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let sink = LineFlushedFile::new(std::fs::File::create(&path).unwrap());
        let mut a = sink.clone();
        let mut b = sink;
        a.write_all(b"first\n").unwrap();
        b.write_all(b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
