use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use smarttune::catalog::{self, TemplateDir};
use smarttune::cli::{Cli, Command, CreateArgs, ModifyArgs};
use smarttune::collector::TidbCollector;
use smarttune::config::TuneConfig;
use smarttune::driver::{reapply_last, ApplyReport, ConfigDriver};
use smarttune::journal::Journal;
use smarttune::recommend::{HttpRecommendationClient, Session, SessionChanges};
use smarttune::source::MySqlConnector;
use smarttune::topology::TiupManager;
use smarttune::tuning_loop::{LoopConfig, RunSummary, TuningLoop};
use smarttune::{LoopError, TuneError};

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "smarttune=debug" } else { "smarttune=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), BoxError> {
    let cfg = cli.resolve_config()?;
    let session = Session::new(cli.session().unwrap_or_default());

    match &cli.command {
        Command::Run(_) => run(&cfg, session).await,
        Command::Show { .. } => show(&cfg, &session).await,
        Command::Reapply { .. } => reapply(&cfg, &session).await,
        Command::History { .. } => history(&cfg, &session),
        Command::Register { system } => register(&cfg, system).await,
        Command::Create(args) => create(&cfg, &session, args).await,
        Command::Modify(args) => modify(&cfg, &session, args).await,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

fn client(cfg: &TuneConfig) -> HttpRecommendationClient {
    HttpRecommendationClient::builder(cfg.server.backend.clone())
        .connect_timeout(Duration::from_secs(cfg.server.connect_timeout_secs))
        .request_timeout(Duration::from_secs(cfg.server.request_timeout_secs))
        .build()
}

fn connector(cfg: &TuneConfig) -> smarttune::Result<MySqlConnector> {
    Ok(MySqlConnector::new(cfg.database_target()?)
        .connect_timeout(Some(Duration::from_secs(cfg.database.connect_timeout_secs)))
        .statement_timeout(secs(cfg.database.query_timeout_secs)))
}

fn driver(
    cfg: &TuneConfig,
    connector: MySqlConnector,
) -> smarttune::Result<ConfigDriver<MySqlConnector, TiupManager>> {
    let manager = TiupManager::new()
        .binary(cfg.cluster.tiup_bin.clone())
        .component(cfg.cluster.component.clone())
        .timeout(secs(cfg.cluster.timeout_secs));
    Ok(ConfigDriver::new(connector, manager, cfg.cluster_name()?).with_roles(cfg.roles.clone()))
}

fn open_journal(cfg: &TuneConfig) -> smarttune::Result<Journal> {
    match &cfg.journal {
        Some(path) => Journal::open(path),
        None => Err(TuneError::Config(
            "no journal configured (set `journal` or pass --journal)".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(cfg: &TuneConfig, session: Session) -> Result<(), BoxError> {
    let connector = connector(cfg)?;
    let driver = driver(cfg, connector.clone())?;
    let collector = TidbCollector::new(connector);

    let mut tuning = TuningLoop::new(session, collector, client(cfg), driver, LoopConfig::from(cfg));
    if cfg.journal.is_some() {
        tuning = tuning.with_journal(open_journal(cfg)?);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let summary = tuning.run(&cancel).await?;
    print_summary(&summary);
    Ok(())
}

async fn show(cfg: &TuneConfig, session: &Session) -> Result<(), BoxError> {
    let doc = client(cfg).show_session(session).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn reapply(cfg: &TuneConfig, session: &Session) -> Result<(), BoxError> {
    let journal = open_journal(cfg)?;
    let driver = driver(cfg, connector(cfg)?)?;
    let report = reapply_last(&journal, session.name(), &driver).await?;
    println!("{} {}", "reapplied".green().bold(), session);
    print_report("  ", &report);
    Ok(())
}

async fn register(cfg: &TuneConfig, system: &str) -> Result<(), BoxError> {
    let templates = TemplateDir::new(cfg.templates_dir()).system(system)?;
    let out = catalog::register_system(&client(cfg), &templates).await?;
    println!("{}", out.trim_end());
    Ok(())
}

async fn create(cfg: &TuneConfig, session: &Session, args: &CreateArgs) -> Result<(), BoxError> {
    let templates = TemplateDir::new(cfg.templates_dir()).system(&args.system)?;
    let responses = catalog::create_session(&client(cfg), &templates, session, &args.target).await?;
    for out in responses {
        println!("{}", out.trim_end());
    }
    println!("{} session {} for {}", "created".green().bold(), session, templates.name());
    Ok(())
}

async fn modify(cfg: &TuneConfig, session: &Session, args: &ModifyArgs) -> Result<(), BoxError> {
    let mut changes = SessionChanges::new(session);
    if let Some(algo) = &args.algo {
        changes = changes.algorithm(algo.clone());
    }
    if let Some(target) = &args.target {
        changes = changes.target(target.clone(), args.more_is_better);
    }
    if !args.tuning_knobs.is_empty() {
        changes = changes.tuning_knobs(args.tuning_knobs.clone());
    }
    if changes.is_empty() {
        return Err(TuneError::Config(
            "nothing to modify (pass --algo, --target or --tuning-knobs)".into(),
        )
        .into());
    }
    let out = client(cfg).modify_session(&changes).await?;
    println!("{}", out.trim_end());
    Ok(())
}

fn history(cfg: &TuneConfig, session: &Session) -> Result<(), BoxError> {
    let journal = open_journal(cfg)?;
    let entries = journal.entries(session.name())?;
    if entries.is_empty() {
        println!("no journaled iterations for session {session}");
        return Ok(());
    }
    for e in entries {
        let state = match e.state.as_str() {
            "applied" => e.state.green(),
            "failed" => e.state.red(),
            _ => e.state.yellow(),
        };
        let knobs = e.recommendation.as_ref().map_or(0, |k| k.len());
        println!(
            "{:>4}  {}  #{:<3} {:<8} {} knobs",
            e.id,
            e.run_id.dimmed(),
            e.iteration,
            state,
            knobs
        );
        if !e.globals_applied.is_empty() {
            println!("      globals: {}", e.globals_applied.join(", "));
        }
        if !e.roles_reloaded.is_empty() {
            println!("      reloaded: {}", e.roles_reloaded.join(", "));
        }
        if let Some(err) = &e.error {
            println!("      {}", err.red());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_summary(summary: &RunSummary) {
    println!(
        "{} session {} finished {} iteration(s) (run {})",
        "done".green().bold(),
        summary.session,
        summary.iterations.len(),
        summary.run_id.dimmed()
    );
    for record in &summary.iterations {
        println!("  iteration {}: {} knobs", record.iteration, record.recommendation.len());
        print_report("    ", &record.report);
    }
}

fn print_report(indent: &str, report: &ApplyReport) {
    if !report.globals_applied.is_empty() {
        println!("{indent}globals: {}", report.globals_applied.join(", "));
    }
    if !report.roles_reloaded.is_empty() {
        println!(
            "{indent}reloaded: {} ({} nodes)",
            report.roles_reloaded.join(", "),
            report.nodes_updated
        );
    }
}

fn report_error(e: &(dyn std::error::Error + 'static)) {
    eprintln!("{} {}", "error:".red().bold(), e);

    let tune = e
        .downcast_ref::<LoopError>()
        .map(|le| &le.source)
        .or_else(|| e.downcast_ref::<TuneError>());
    if let Some(err) = tune {
        if err.is_partial_apply() {
            eprintln!(
                "{} these global variables were already changed and were not rolled back:",
                "warning:".yellow().bold()
            );
            for name in err.applied_globals() {
                eprintln!("  - {name}");
            }
            eprintln!("  run `smartctl reapply <session>` to apply the recommendation again");
        }
    }
}
