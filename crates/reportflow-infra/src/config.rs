//! Configuration loading for reportflow.
//!
//! Reads `config.toml` from the data directory (`~/.reportflow/` in
//! production) into [`ReportflowConfig`]. A missing or malformed file falls
//! back to defaults; the process still starts.

use std::path::{Path, PathBuf};

use reportflow_types::config::ReportflowConfig;

/// Data directory: `REPORTFLOW_DATA_DIR`, else `~/.reportflow`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("REPORTFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".reportflow");
    }

    PathBuf::from(".reportflow")
}

/// Load configuration from `{data_dir}/config.toml`.
pub async fn load_config(data_dir: &Path) -> ReportflowConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return ReportflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return ReportflowConfig::default();
        }
    };

    match toml::from_str::<ReportflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            ReportflowConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.scheduler.workflow_queue, "workflows");
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[queue]
worker_concurrency = 16
default_max_attempts = 5

[engine]
lock_ttl_ms = 60000

[scheduler]
catch_up_missed = false
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.queue.worker_concurrency, 16);
        assert_eq!(config.queue.default_max_attempts, 5);
        assert_eq!(config.engine.lock_ttl_ms, 60_000);
        assert!(!config.scheduler.catch_up_missed);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[tokio::test]
    async fn malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[queue\nworker_concurrency = ")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.queue.worker_concurrency, 4);
    }
}
