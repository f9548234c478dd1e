//! [`TopologyManager`] driving the `tiup` command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::TopologyManager;
use crate::error::{Result, TuneError};

/// Runs `tiup <component> show-config | edit-config | reload`.
#[derive(Debug, Clone)]
pub struct TiupManager {
    binary: PathBuf,
    component: String,
    timeout: Option<Duration>,
}

impl Default for TiupManager {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tiup"),
            component: "cluster".to_string(),
            timeout: None,
        }
    }
}

impl TiupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Component that manages the cluster, `cluster` unless overridden.
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Bound every command by `timeout`; `reload` also passes it as `--wait-timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn show_config_args(&self, cluster: &str) -> Vec<String> {
        vec![self.component.clone(), "show-config".into(), cluster.into()]
    }

    fn edit_config_args(&self, cluster: &str, topology_file: &Path) -> Vec<String> {
        vec![
            self.component.clone(),
            "edit-config".into(),
            cluster.into(),
            "--topology-file".into(),
            topology_file.display().to_string(),
            "--yes".into(),
        ]
    }

    fn reload_args(&self, cluster: &str, roles: &[String]) -> Vec<String> {
        let mut args = vec![
            self.component.clone(),
            "reload".into(),
            cluster.into(),
            "-R".into(),
            roles.join(","),
            "--yes".into(),
        ];
        if let Some(limit) = self.timeout {
            args.push("--wait-timeout".into());
            args.push(limit.as_secs().max(1).to_string());
        }
        args
    }

    /// Run one command; the error string is the failure detail.
    async fn run(&self, args: Vec<String>) -> std::result::Result<String, String> {
        debug!(binary = %self.binary.display(), args = ?args, "running deployment tool");
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| format!("timed out after {limit:?}"))?,
            None => cmd.output().await,
        }
        .map_err(|e| format!("cannot run {}: {e}", self.binary.display()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} exited with {}: {}", self.binary.display(), output.status, stderr.trim()))
        }
    }
}

#[async_trait]
impl TopologyManager for TiupManager {
    async fn show_config(&self, cluster: &str) -> Result<String> {
        self.run(self.show_config_args(cluster))
            .await
            .map_err(|detail| TuneError::TopologyFetchFailed {
                cluster: cluster.to_string(),
                detail,
            })
    }

    async fn edit_config(&self, cluster: &str, topology: &str) -> Result<()> {
        let persist_failed = |detail: String| TuneError::TopologyPersistFailed {
            cluster: cluster.to_string(),
            detail,
        };

        // Removed when `file` drops, on every path.
        let mut file = tempfile::Builder::new()
            .prefix("smarttune-topology-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| persist_failed(e.to_string()))?;
        file.write_all(topology.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| persist_failed(e.to_string()))?;

        self.run(self.edit_config_args(cluster, file.path()))
            .await
            .map_err(persist_failed)?;
        info!(cluster, "topology persisted");
        Ok(())
    }

    async fn reload(&self, cluster: &str, roles: &[String]) -> Result<()> {
        self.run(self.reload_args(cluster, roles))
            .await
            .map_err(|detail| TuneError::ReloadFailed {
                cluster: cluster.to_string(),
                roles: roles.to_vec(),
                detail,
            })?;
        info!(cluster, roles = %roles.join(","), "roles reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_config_command_line() {
        let m = TiupManager::new();
        assert_eq!(m.show_config_args("prod"), vec!["cluster", "show-config", "prod"]);
    }

    #[test]
    fn edit_config_command_line() {
        let m = TiupManager::new().component("dm");
        assert_eq!(
            m.edit_config_args("prod", Path::new("/tmp/t.yaml")),
            vec!["dm", "edit-config", "prod", "--topology-file", "/tmp/t.yaml", "--yes"]
        );
    }

    #[test]
    fn reload_scoped_to_roles() {
        let m = TiupManager::new();
        let roles = vec!["tidb".to_string(), "tikv".to_string()];
        assert_eq!(
            m.reload_args("prod", &roles),
            vec!["cluster", "reload", "prod", "-R", "tidb,tikv", "--yes"]
        );
    }

    #[test]
    fn reload_carries_wait_timeout() {
        let m = TiupManager::new().timeout(Some(Duration::from_secs(600)));
        let args = m.reload_args("prod", &["tikv".to_string()]);
        assert_eq!(&args[args.len() - 2..], &["--wait-timeout", "600"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_maps_to_phase_errors() {
        let m = TiupManager::new().binary("false");
        assert!(matches!(
            m.show_config("c").await,
            Err(TuneError::TopologyFetchFailed { .. })
        ));
        assert!(matches!(
            m.edit_config("c", "a: 1\n").await,
            Err(TuneError::TopologyPersistFailed { .. })
        ));
        match m.reload("c", &["tikv".to_string()]).await {
            Err(TuneError::ReloadFailed { roles, .. }) => assert_eq!(roles, vec!["tikv"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_tool_is_fetch_failure() {
        let m = TiupManager::new().binary("/nonexistent/tiup");
        let err = tokio_test::block_on(m.show_config("c")).unwrap_err();
        assert!(err.to_string().contains("cannot run"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn succeeding_tool_is_ok() {
        let m = TiupManager::new().binary("true");
        assert_eq!(m.show_config("c").await.unwrap(), "");
        m.edit_config("c", "a: 1\n").await.unwrap();
        m.reload("c", &["tidb".to_string()]).await.unwrap();
    }
}
