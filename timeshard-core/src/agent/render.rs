//! Worker config rendering
//!
//! Files are written to a sibling temp file, read back and checked with
//! CRC32C, then renamed into place. The worker either sees the old file or
//! the complete new one.

use chrono::SecondsFormat;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::coordinator::ShardWindow;
use crate::error::{Result, TimeshardError};

/// File name of the env-style companion written next to the worker config
pub const ENV_FILE_NAME: &str = "time-range.env";

fn render_error(path: &Path, reason: impl Into<String>) -> TimeshardError {
    TimeshardError::RenderFailure {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rendered".into());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Replace `path` with `bytes` atomically
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    let result = write_verified(path, &tmp, bytes).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_verified(path: &Path, tmp: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| render_error(path, format!("cannot create directory: {}", e)))?;
    }

    let expected = crc32c::crc32c(bytes);
    {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| render_error(path, format!("cannot create temp file: {}", e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| render_error(path, format!("write failed: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| render_error(path, format!("sync failed: {}", e)))?;
    }

    let written = tokio::fs::read(tmp)
        .await
        .map_err(|e| render_error(path, format!("read-back failed: {}", e)))?;
    let actual = crc32c::crc32c(&written);
    if actual != expected {
        return Err(render_error(
            path,
            format!("checksum mismatch: expected {:08x}, got {:08x}", expected, actual),
        ));
    }

    tokio::fs::rename(tmp, path)
        .await
        .map_err(|e| render_error(path, format!("rename failed: {}", e)))?;

    debug!("Wrote {} ({} bytes, crc32c={:08x})", path.display(), bytes.len(), actual);
    Ok(())
}

fn rfc3339(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Renders the worker config for one window
#[derive(Debug, Clone)]
pub struct Renderer {
    config_path: PathBuf,
    env_path: PathBuf,
}

impl Renderer {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let config_path = config_path.into();
        let env_path = config_path.with_file_name(ENV_FILE_NAME);
        Self { config_path, env_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn env_path(&self) -> &Path {
        &self.env_path
    }

    /// Worker config YAML: `settings` with the window bounds merged over it
    pub fn render_yaml(&self, window: &ShardWindow, settings: &serde_json::Value) -> Result<String> {
        if window.min_time >= window.max_time {
            return Err(render_error(
                &self.config_path,
                format!("empty window for shard {}", window.shard_index),
            ));
        }

        let mut mapping = match serde_yaml::to_value(settings) {
            Ok(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
            Ok(serde_yaml::Value::Mapping(mapping)) => mapping,
            Ok(other) => {
                return Err(render_error(
                    &self.config_path,
                    format!("worker settings must be a mapping, got {:?}", other),
                ))
            }
            Err(e) => return Err(render_error(&self.config_path, e.to_string())),
        };
        mapping.insert("min_time".into(), rfc3339(&window.min_time).into());
        mapping.insert("max_time".into(), rfc3339(&window.max_time).into());

        serde_yaml::to_string(&mapping).map_err(|e| render_error(&self.config_path, e.to_string()))
    }

    /// Env companion with the same bounds
    pub fn render_env(window: &ShardWindow) -> String {
        format!(
            "MIN_TIME={}\nMAX_TIME={}\n",
            rfc3339(&window.min_time),
            rfc3339(&window.max_time)
        )
    }

    /// Write both files for `window`
    ///
    /// Rendering the same window twice produces identical files. The env file
    /// is only written once the worker config is in place.
    pub async fn render(&self, window: &ShardWindow, settings: &serde_json::Value) -> Result<()> {
        let yaml = self.render_yaml(window, settings)?;
        write_atomically(&self.config_path, yaml.as_bytes()).await?;
        write_atomically(&self.env_path, Self::render_env(window).as_bytes()).await?;

        info!(
            "Rendered shard {} window {} .. {} into {}",
            window.shard_index,
            rfc3339(&window.min_time),
            rfc3339(&window.max_time),
            self.config_path.display()
        );
        Ok(())
    }
}
