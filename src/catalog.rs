//! # Stage: Provision
//!
//! ## Responsibility
//! Read the per-system JSON templates that describe a tunable system to the
//! optimizer, and send them in the order the optimizer expects:
//!
//! ```text
//! <templates>/<system>/
//!     system_catalog.json   -> /api/system/register
//!     knobs_catalog.json    -> /api/knob/register/catalog
//!     metrics_catalog.json  -> /api/metric/register/catalog
//!     session.json          -> /api/session/create      (rendered)
//!     tuning_knobs.json     -> /api/knob/tuning         (rendered)
//! ```
//!
//! `<system>` is a directory name such as `tidb@v6.1.0`, matched
//! case-insensitively. Rendered templates may use `{{.SessionName}}`,
//! `{{.System}}`, `{{.Target}}` and `{{.Backend}}`; substitution happens on
//! the raw text before it is parsed as JSON.
//!
//! ## Guarantees
//! - The first rejected request stops provisioning. Later documents are
//!   not sent.
//! - A template that is missing or not valid JSON fails before anything is
//!   sent for that step.
//!
//! ## NOT Responsible For
//! - Validating catalog contents (the optimizer does)
//! - Removing a partially provisioned session

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::{Result, TuneError};
use crate::recommend::{HttpRecommendationClient, Session};

pub const SYSTEM_CATALOG: &str = "system_catalog.json";
pub const KNOBS_CATALOG: &str = "knobs_catalog.json";
pub const METRICS_CATALOG: &str = "metrics_catalog.json";
pub const SESSION_TEMPLATE: &str = "session.json";
pub const TUNING_KNOBS_TEMPLATE: &str = "tuning_knobs.json";

/// Root directory holding one subdirectory per supported system.
#[derive(Debug, Clone)]
pub struct TemplateDir {
    root: PathBuf,
}

impl TemplateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Names of the supported systems, sorted.
    pub fn systems(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            TuneError::Config(format!("cannot read templates at {}: {e}", self.root.display()))
        })?;
        let mut systems = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TuneError::Config(e.to_string()))?;
            if entry.path().is_dir() {
                systems.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        systems.sort();
        Ok(systems)
    }

    /// Templates of `system`.
    ///
    /// # Errors
    /// [`TuneError::Config`] naming the supported systems when there is no
    /// directory for `system`.
    pub fn system(&self, system: &str) -> Result<SystemTemplates> {
        let systems = self.systems()?;
        let wanted = system.to_lowercase();
        match systems.iter().find(|s| s.to_lowercase() == wanted) {
            Some(found) => Ok(SystemTemplates {
                name: found.clone(),
                dir: self.root.join(found),
            }),
            None => Err(TuneError::Config(format!(
                "unable to register '{system}', supported systems are [{}]",
                systems.join(", ")
            ))),
        }
    }
}

/// Values substituted into rendered templates.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub session_name: String,
    pub system: String,
    pub target: String,
    pub backend: String,
}

impl TemplateVars {
    fn render(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (field, value) in [
            ("SessionName", &self.session_name),
            ("System", &self.system),
            ("Target", &self.target),
            ("Backend", &self.backend),
        ] {
            out = out
                .replace(&format!("{{{{.{field}}}}}"), value)
                .replace(&format!("{{{{ .{field} }}}}"), value);
        }
        out
    }
}

/// The template files of one system.
#[derive(Debug, Clone)]
pub struct SystemTemplates {
    name: String,
    dir: PathBuf,
}

impl SystemTemplates {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_catalog(&self) -> Result<Value> {
        parse(&self.path(SYSTEM_CATALOG), &read(&self.path(SYSTEM_CATALOG))?)
    }

    pub fn knobs_catalog(&self) -> Result<Value> {
        parse(&self.path(KNOBS_CATALOG), &read(&self.path(KNOBS_CATALOG))?)
    }

    pub fn metrics_catalog(&self) -> Result<Value> {
        parse(&self.path(METRICS_CATALOG), &read(&self.path(METRICS_CATALOG))?)
    }

    pub fn session(&self, vars: &TemplateVars) -> Result<Value> {
        self.rendered(SESSION_TEMPLATE, vars)
    }

    pub fn tuning_knobs(&self, vars: &TemplateVars) -> Result<Value> {
        self.rendered(TUNING_KNOBS_TEMPLATE, vars)
    }

    fn rendered(&self, file: &str, vars: &TemplateVars) -> Result<Value> {
        let path = self.path(file);
        parse(&path, &vars.render(&read(&path)?))
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| TuneError::Config(format!("cannot read {}: {e}", path.display())))
}

fn parse(path: &Path, text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| TuneError::Config(format!("{} is not valid JSON: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Register `templates`' system on the optimizer. Returns the response text.
pub async fn register_system(
    client: &HttpRecommendationClient,
    templates: &SystemTemplates,
) -> Result<String> {
    let out = client.register_system(&templates.system_catalog()?).await?;
    info!(system = templates.name(), "system registered");
    Ok(out)
}

/// Register the system and its catalogs, then create `session` and choose
/// its tuning knobs. Returns the response text of each step, in order.
pub async fn create_session(
    client: &HttpRecommendationClient,
    templates: &SystemTemplates,
    session: &Session,
    target: &str,
) -> Result<Vec<String>> {
    let vars = TemplateVars {
        session_name: session.name().to_string(),
        system: templates.name().to_string(),
        target: target.to_string(),
        backend: client.base_url().to_string(),
    };

    let mut responses = Vec::with_capacity(5);
    responses.push(register_system(client, templates).await?);
    responses.push(client.register_knob_catalog(&templates.knobs_catalog()?).await?);
    responses.push(client.register_metric_catalog(&templates.metrics_catalog()?).await?);
    responses.push(client.create_session(&templates.session(&vars)?).await?);
    responses.push(client.register_tuning_knobs(&templates.tuning_knobs(&vars)?).await?);
    info!(session = %session, system = templates.name(), target, "session created");
    Ok(responses)
}
