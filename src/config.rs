//! Runtime configuration, loaded from an optional TOML file.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Command-line flags are applied on top by [`crate::cli`].
//!
//! ```toml
//! journal = "/var/lib/smarttune/journal.db"
//! templates = "/opt/smarttune/resource/templates"
//!
//! [server]
//! backend = "10.0.0.5:5000"
//!
//! [database]
//! dsn = "root:secret@tcp(10.0.0.7:4000)/test"
//!
//! [cluster]
//! name = "prod"
//!
//! [tuning]
//! max_iterations = 20
//! observation_secs = 600
//!
//! [roles]
//! tidb = "tidb_servers"
//! tikv = "tikv_servers"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::knob::RoleMap;
use crate::recommend::PollPolicy;
use crate::source::DatabaseTarget;

/// Template root used when `templates` is not configured.
pub const DEFAULT_TEMPLATES: &str = "resource/templates";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuneConfig {
    /// SQLite journal path; journaling is off when unset.
    pub journal: Option<PathBuf>,
    /// Per-system catalog templates; `resource/templates` when unset.
    pub templates: Option<PathBuf>,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cluster: ClusterConfig,
    pub tuning: TuningConfig,
    /// Role prefix → topology section. A `[roles]` table replaces the defaults.
    pub roles: RoleMap,
}

/// The recommendation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub backend: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: "127.0.0.1:5000".to_string(),
            connect_timeout_secs: 3,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// `user:password@tcp(host:port)/dbname`
    pub dsn: Option<String>,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            connect_timeout_secs: 5,
            query_timeout_secs: None,
        }
    }
}

/// The deployment tool and the cluster it manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub tiup_bin: PathBuf,
    pub component: String,
    pub timeout_secs: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            tiup_bin: PathBuf::from("tiup"),
            component: "cluster".to_string(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningConfig {
    pub max_iterations: u32,
    pub observation_secs: u64,
    pub workload: String,
    pub poll_max_wait_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            observation_secs: 300,
            workload: "tpcc".to_string(),
            poll_max_wait_secs: 180,
            poll_interval_secs: 5,
        }
    }
}

impl TuneConfig {
    /// Read and parse `path`.
    ///
    /// # Errors
    /// [`TuneError::Config`] if the file cannot be read or is not valid TOML
    /// for this schema.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TuneError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|e| TuneError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Checks shared by every command.
    pub fn validate(&self) -> Result<()> {
        if self.server.backend.trim().is_empty() {
            return Err(TuneError::Config("server.backend must not be empty".into()));
        }
        let t = &self.tuning;
        if t.max_iterations == 0 {
            return Err(TuneError::Config("tuning.max_iterations must be at least 1".into()));
        }
        if t.poll_interval_secs == 0 {
            return Err(TuneError::Config("tuning.poll_interval_secs must be positive".into()));
        }
        if t.poll_interval_secs > t.poll_max_wait_secs {
            return Err(TuneError::Config(format!(
                "tuning.poll_interval_secs ({}) exceeds tuning.poll_max_wait_secs ({})",
                t.poll_interval_secs, t.poll_max_wait_secs
            )));
        }
        Ok(())
    }

    /// Parsed database target; required by commands that touch the database.
    pub fn database_target(&self) -> Result<DatabaseTarget> {
        match self.database.dsn.as_deref() {
            Some(dsn) if !dsn.trim().is_empty() => DatabaseTarget::from_dsn(dsn),
            _ => Err(TuneError::Config("database.dsn is required".into())),
        }
    }

    /// Cluster name; required by commands that apply configuration.
    pub fn cluster_name(&self) -> Result<&str> {
        let name = self.cluster.name.trim();
        if name.is_empty() {
            return Err(TuneError::Config("cluster.name is required".into()));
        }
        Ok(name)
    }

    pub fn templates_dir(&self) -> &Path {
        self.templates
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_TEMPLATES))
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_wait: Duration::from_secs(self.tuning.poll_max_wait_secs),
            interval: Duration::from_secs(self.tuning.poll_interval_secs),
        }
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_secs(self.tuning.observation_secs)
    }
}
