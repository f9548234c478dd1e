use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::TuneConfig;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "smartctl")]
#[command(version)]
#[command(about = "Observe a TiDB cluster, ask the tuning server for knobs, apply them back")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Tuning server address (host:port or URL)
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// SQLite journal of iterations
    #[arg(long, global = true)]
    pub journal: Option<PathBuf>,

    /// Directory of per-system catalog templates
    #[arg(long, global = true)]
    pub templates: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the tuning loop for a session
    Run(RunArgs),
    /// Print a session as the tuning server sees it
    Show {
        session: String,
    },
    /// Re-apply the last journaled recommendation of a session
    Reapply {
        session: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List the journaled iterations of a session
    History {
        session: String,
    },
    /// Register a system type and version, e.g. tidb@v6.1.0
    Register {
        system: String,
    },
    /// Register a system's catalogs and create a tuning session for it
    Create(CreateArgs),
    /// Change the algorithm, target or tuned knobs of a session
    Modify(ModifyArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub session: String,

    /// System catalog to tune, a directory under the templates root
    #[arg(long, default_value = "tidb@v6.1.0")]
    pub system: String,

    /// Target objective
    #[arg(long, default_value = "tidb.tidb_qps")]
    pub target: String,
}

#[derive(Args, Debug)]
pub struct ModifyArgs {
    pub session: String,

    /// New target objective
    #[arg(long)]
    pub target: Option<String>,

    /// Direction of the target objective; only sent with --target
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub more_is_better: bool,

    /// Tuning algorithm, e.g. gpr or ddpg
    #[arg(long)]
    pub algo: Option<String>,

    /// Knobs to tune, comma separated
    #[arg(long, value_delimiter = ',')]
    pub tuning_knobs: Vec<String>,
}

/// Where recommendations are applied.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Database DSN, e.g. root:pw@tcp(127.0.0.1:4000)/test
    #[arg(long)]
    pub dsn: Option<String>,

    /// Cluster name known to tiup
    #[arg(long)]
    pub cluster: Option<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub session: String,

    #[command(flatten)]
    pub target: TargetArgs,

    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Seconds between the before and after metric snapshots
    #[arg(long)]
    pub observation_secs: Option<u64>,

    /// Workload label sent with every observation
    #[arg(long)]
    pub workload: Option<String>,

    #[arg(long)]
    pub poll_max_wait_secs: Option<u64>,

    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
}

impl Cli {
    /// Session named by the subcommand, if it names one.
    pub fn session(&self) -> Option<&str> {
        match &self.command {
            Command::Run(args) => Some(&args.session),
            Command::Create(args) => Some(&args.session),
            Command::Modify(args) => Some(&args.session),
            Command::Show { session }
            | Command::Reapply { session, .. }
            | Command::History { session } => Some(session),
            Command::Register { .. } => None,
        }
    }

    /// Load the config file (if any), apply flag overrides and validate.
    pub fn resolve_config(&self) -> Result<TuneConfig> {
        let mut cfg = match &self.config {
            Some(path) => TuneConfig::load(path)?,
            None => TuneConfig::default(),
        };
        self.apply_overrides(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&self, cfg: &mut TuneConfig) {
        if let Some(backend) = &self.backend {
            cfg.server.backend = backend.clone();
        }
        if let Some(journal) = &self.journal {
            cfg.journal = Some(journal.clone());
        }
        if let Some(templates) = &self.templates {
            cfg.templates = Some(templates.clone());
        }
        match &self.command {
            Command::Run(args) => {
                args.target.apply(cfg);
                let t = &mut cfg.tuning;
                if let Some(n) = args.max_iterations {
                    t.max_iterations = n;
                }
                if let Some(secs) = args.observation_secs {
                    t.observation_secs = secs;
                }
                if let Some(workload) = &args.workload {
                    t.workload = workload.clone();
                }
                if let Some(secs) = args.poll_max_wait_secs {
                    t.poll_max_wait_secs = secs;
                }
                if let Some(secs) = args.poll_interval_secs {
                    t.poll_interval_secs = secs;
                }
            }
            Command::Reapply { target, .. } => target.apply(cfg),
            Command::Show { .. }
            | Command::History { .. }
            | Command::Register { .. }
            | Command::Create(_)
            | Command::Modify(_) => {}
        }
    }
}

impl TargetArgs {
    fn apply(&self, cfg: &mut TuneConfig) {
        if let Some(dsn) = &self.dsn {
            cfg.database.dsn = Some(dsn.clone());
        }
        if let Some(cluster) = &self.cluster {
            cfg.cluster.name = cluster.clone();
        }
    }
}
