mod collaborators;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quarry_batch::{BatchCoordinator, EmitOutcome};
use quarry_classify::select_variant;
use quarry_config::AppConfig;
use quarry_embed::{Embedder, HashEmbedder, HttpEmbedder};
use quarry_runtime::{
    GitVersionStore, Pipeline, VersionStore, shutdown_channel, spawn_backup_job,
    spawn_classify_retry, spawn_drift_job, spawn_inbox_poll,
};
use quarry_store::{
    Archetype, ErrorKind, NewCallLog, OutcomeStage, RoleType, Store, StoreError,
};

use collaborators::{CommandInbox, CommandSubmitter};

#[derive(Debug, Parser)]
#[command(
    name = "quarry",
    version,
    about = "Self-improving job application pipeline"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/quarry.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest scraped listings (JSON array) from a file or stdin; each is
    /// classified before it becomes queue-visible.
    Ingest {
        /// Path to a JSON file of listings; stdin when omitted.
        file: Option<String>,
    },
    /// Per-archetype queue depths and top-score averages.
    Queue,
    /// Open, fill, and close submission batches under the profile invariant.
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },
    /// Funnel metrics: outcomes, response and interview rates.
    Status,
    /// Latest centroid shifts and variant staleness per archetype.
    Drift,
    /// Score an ad-hoc job description file and print archetype weights.
    Classify {
        /// Path to a plain-text job description.
        file: String,
        #[arg(long, value_enum, default_value = "unknown")]
        role_type: CliRoleType,
    },
    /// Record a phone-call outcome; matched through the same cascade.
    LogCall {
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        company: String,
        #[arg(long)]
        title: String,
        #[arg(long, value_enum)]
        outcome: CliOutcome,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Force a flush of the offline spool into the store.
    Sync,
    /// Per-variant per-version response and interview rates.
    Versions,
    /// Unacknowledged drift alerts.
    Alerts {
        /// Acknowledge one alert by id.
        #[arg(long)]
        ack: Option<i64>,
    },
    /// Re-embed stored vectors after an embedding model change.
    Reembed,
    /// Run the scheduler: inbox poll, drift cycle, retries, backups.
    Run,
}

#[derive(Debug, Subcommand)]
enum BatchCommands {
    /// Open a batch; asserts the external profile currently advertises this
    /// archetype.
    Open {
        archetype: CliArchetype,
        /// Externally advertised profile state, when it differs from the
        /// batch archetype (which is an error the store will report).
        #[arg(long)]
        profile: Option<CliArchetype>,
    },
    /// Emit queued listings through the configured submitter.
    Emit {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Close the open batch.
    Close,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliArchetype {
    Builder,
    Fixer,
    Operator,
    Translator,
}

impl From<CliArchetype> for Archetype {
    fn from(value: CliArchetype) -> Self {
        match value {
            CliArchetype::Builder => Archetype::Builder,
            CliArchetype::Fixer => Archetype::Fixer,
            CliArchetype::Operator => Archetype::Operator,
            CliArchetype::Translator => Archetype::Translator,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRoleType {
    Contract,
    Permanent,
    Unknown,
}

impl From<CliRoleType> for RoleType {
    fn from(value: CliRoleType) -> Self {
        match value {
            CliRoleType::Contract => RoleType::Contract,
            CliRoleType::Permanent => RoleType::Permanent,
            CliRoleType::Unknown => RoleType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOutcome {
    Acknowledged,
    Viewed,
    Rejected,
    Interview,
    Offer,
}

impl From<CliOutcome> for OutcomeStage {
    fn from(value: CliOutcome) -> Self {
        match value {
            CliOutcome::Acknowledged => OutcomeStage::Acknowledged,
            CliOutcome::Viewed => OutcomeStage::Viewed,
            CliOutcome::Rejected => OutcomeStage::Rejected,
            CliOutcome::Interview => OutcomeStage::Interview,
            CliOutcome::Offer => OutcomeStage::Offer,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 2 = invalid invocation, 3 = transient store, 4 = permanent store, 1 = other.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<StoreError>() {
        Some(store_err) => match store_err.kind() {
            ErrorKind::Transient => 3,
            ErrorKind::Permanent => 4,
            ErrorKind::Validation | ErrorKind::UniqueConflict | ErrorKind::Invariant => 2,
            ErrorKind::Internal => 1,
        },
        None => 1,
    }
}

fn build_embedder(config: &AppConfig) -> Arc<dyn Embedder> {
    if config.embed.base_url.is_empty() {
        // Offline mode: deterministic vectors, no semantic signal.
        Arc::new(HashEmbedder::new(config.embed.dimension))
    } else {
        Arc::new(HttpEmbedder::new(
            &config.embed.base_url,
            &config.embed.model,
            config.embed.dimension,
            std::time::Duration::from_secs(config.embed.timeout_secs),
            config.embed.cache_size,
        ))
    }
}

struct App {
    config: AppConfig,
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
}

impl App {
    fn build(config_path: &str) -> Result<Self> {
        let config = AppConfig::load_from(config_path)?;
        let embedder = build_embedder(&config);
        let store = Arc::new(Store::open(
            &config.store.db_path,
            embedder.model_version(),
            embedder.dimension(),
        )?);
        let pipeline = Arc::new(Pipeline::new(config.clone(), store.clone(), embedder)?);
        Ok(Self {
            config,
            store,
            pipeline,
        })
    }

    fn coordinator(&self) -> Result<BatchCoordinator> {
        if self.config.collaborators.submit_command.is_empty() {
            return Err(StoreError::Validation(
                "no submitter configured ([collaborators] submit_command)".to_string(),
            )
            .into());
        }
        Ok(BatchCoordinator::new(
            self.store.clone(),
            Arc::new(CommandSubmitter::new(
                &self.config.collaborators.submit_command,
            )),
        ))
    }

    fn version_store(&self) -> Option<GitVersionStore> {
        let path = Path::new(&self.config.versions.repo_path);
        path.join(".git")
            .exists()
            .then(|| GitVersionStore::new(path))
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let app = App::build(&cli.config)?;

    // Every top-level operation is a chance to drain the offline spool.
    if let Err(err) = app.pipeline.sync_spool().await {
        warn!(%err, "spool flush failed");
    }

    match cli.command {
        Commands::Ingest { file } => cmd_ingest(&app, file.as_deref()).await,
        Commands::Queue => cmd_queue(&app),
        Commands::Batch { command } => cmd_batch(&app, command).await,
        Commands::Status => cmd_status(&app),
        Commands::Drift => cmd_drift(&app),
        Commands::Classify { file, role_type } => cmd_classify(&app, &file, role_type.into()),
        Commands::LogCall {
            phone,
            company,
            title,
            outcome,
            notes,
        } => cmd_log_call(&app, phone, company, title, outcome.into(), notes).await,
        Commands::Sync => cmd_sync(&app).await,
        Commands::Versions => cmd_versions(&app),
        Commands::Alerts { ack } => cmd_alerts(&app, ack),
        Commands::Reembed => cmd_reembed(&app).await,
        Commands::Run => cmd_run(app).await,
    }
}

async fn cmd_ingest(app: &App, file: Option<&str>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => std::io::read_to_string(std::io::stdin()).context("reading stdin")?,
    };
    let listings: Vec<quarry_store::NewListing> =
        serde_json::from_str(&raw).context("decoding listings")?;

    let mut classified = 0usize;
    let mut held = 0usize;
    let mut spooled = 0usize;
    let mut conflicts = 0usize;
    for listing in listings {
        let external_id = listing.external_id.clone();
        match app.pipeline.ingest_listing(listing).await {
            Ok(quarry_runtime::IngestOutcome::Classified(_)) => classified += 1,
            Ok(quarry_runtime::IngestOutcome::Unclassified(_)) => held += 1,
            Ok(quarry_runtime::IngestOutcome::Spooled) => spooled += 1,
            Err(err)
                if err
                    .downcast_ref::<StoreError>()
                    .is_some_and(|e| e.kind() == ErrorKind::UniqueConflict) =>
            {
                warn!(listing = %external_id, "duplicate external id; skipped");
                conflicts += 1;
            }
            Err(err) => return Err(err),
        }
    }
    println!(
        "ingested {classified} listings ({held} held for retry, {spooled} spooled, {conflicts} duplicates)"
    );
    Ok(())
}

fn cmd_queue(app: &App) -> Result<()> {
    let report = app.store.queue_report()?;
    println!("{:<12} {:>6} {:>10}", "archetype", "count", "avg score");
    for line in &report.per_archetype {
        println!(
            "{:<12} {:>6} {:>10.3}",
            line.archetype.slug(),
            line.count,
            line.avg_top_score
        );
    }
    println!();
    println!("intelligence-only: {}", report.intelligence_only);
    println!("unclassified:      {}", report.unclassified);
    Ok(())
}

async fn cmd_batch(app: &App, command: BatchCommands) -> Result<()> {
    match command {
        BatchCommands::Open { archetype, profile } => {
            let archetype: Archetype = archetype.into();
            let profile: Archetype = profile.map(Into::into).unwrap_or(archetype);
            let batch = app.store.open_batch(archetype, profile)?;
            println!("opened batch {} for {}", batch.id, batch.archetype.slug());
            Ok(())
        }
        BatchCommands::Emit { limit } => {
            let Some(batch) = app.store.open_batch_row()? else {
                bail!(StoreError::Invariant("no batch is open".to_string()));
            };
            let coordinator = app.coordinator()?;
            let variant = app.store.variant(batch.archetype)?.ok_or_else(|| {
                StoreError::Validation(format!(
                    "no resume variant registered for {}",
                    batch.archetype.slug()
                ))
            })?;

            let queued = app.store.queue_for(batch.archetype, limit)?;
            if queued.is_empty() {
                println!("queue for {} is empty", batch.archetype.slug());
                return Ok(());
            }
            for listing in queued {
                let Some(scores) = listing.scores else {
                    continue;
                };
                let decision = select_variant(
                    &scores,
                    variant.alignment,
                    app.config.tuning.close_call_delta,
                    app.config.tuning.combined_score_threshold,
                );
                match coordinator.emit(&batch, &listing, &variant, &decision).await? {
                    EmitOutcome::Submitted(application) => {
                        println!(
                            "submitted  {} ({}) version={}{}",
                            listing.external_id,
                            listing.company,
                            application.version_id,
                            if decision.needs_review { "  [close call]" } else { "" },
                        );
                    }
                    EmitOutcome::AlreadySubmitted(_) => {
                        println!("skipped    {} (already in this batch)", listing.external_id);
                    }
                    EmitOutcome::Failed { error } => {
                        println!("failed     {}: {error}", listing.external_id);
                    }
                }
            }
            Ok(())
        }
        BatchCommands::Close => {
            let Some(batch) = app.store.open_batch_row()? else {
                bail!(StoreError::Invariant("no batch is open".to_string()));
            };
            let closed = app.store.close_batch(batch.id)?;
            println!(
                "closed batch {} ({} applications)",
                closed.id, closed.app_count
            );
            Ok(())
        }
    }
}

fn cmd_status(app: &App) -> Result<()> {
    let funnel = app.store.funnel()?;
    println!(
        "{:<12} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "archetype", "sent", "ack", "viewed", "reject", "interv", "ghost"
    );
    for archetype in Archetype::ALL {
        let count = |stage: OutcomeStage| {
            funnel
                .iter()
                .filter(|row| row.archetype == archetype && row.outcome == stage)
                .map(|row| row.count)
                .sum::<usize>()
        };
        let total: usize = funnel
            .iter()
            .filter(|row| row.archetype == archetype)
            .map(|row| row.count)
            .sum();
        println!(
            "{:<12} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
            archetype.slug(),
            total,
            count(OutcomeStage::Acknowledged),
            count(OutcomeStage::Viewed),
            count(OutcomeStage::Rejected),
            count(OutcomeStage::Interview) + count(OutcomeStage::Offer),
            count(OutcomeStage::Ghost),
        );
    }

    let total: usize = funnel.iter().map(|row| row.count).sum();
    let responded: usize = funnel
        .iter()
        .filter(|row| !matches!(row.outcome, OutcomeStage::Submitted | OutcomeStage::Ghost))
        .map(|row| row.count)
        .sum();
    let interviews: usize = funnel
        .iter()
        .filter(|row| matches!(row.outcome, OutcomeStage::Interview | OutcomeStage::Offer))
        .map(|row| row.count)
        .sum();
    println!();
    if total > 0 {
        println!(
            "response rate:  {:.1}%",
            100.0 * responded as f64 / total as f64
        );
        println!(
            "interview rate: {:.1}%",
            100.0 * interviews as f64 / total as f64
        );
    }
    let mut lags = app.store.response_lags_days()?;
    if !lags.is_empty() {
        lags.sort_unstable();
        println!("median days to first response: {}", lags[lags.len() / 2]);
    }
    Ok(())
}

fn cmd_drift(app: &App) -> Result<()> {
    for archetype in Archetype::ALL {
        match app.store.latest_centroid(archetype)? {
            Some((centroid, _)) => {
                let staleness = app
                    .store
                    .variant(archetype)?
                    .and_then(|v| v.staleness())
                    .map(|s| format!("{s:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} window {} → {}  jds={:<3} shift={}  staleness={}",
                    archetype.slug(),
                    centroid.window_start.format("%Y-%m-%d"),
                    centroid.window_end.format("%Y-%m-%d"),
                    centroid.jd_count,
                    centroid
                        .shift
                        .map(|s| format!("{s:.3}"))
                        .unwrap_or_else(|| "-".to_string()),
                    staleness,
                );
                if !centroid.gained_terms.is_empty() {
                    println!("             gained: {}", centroid.gained_terms.join(", "));
                }
                if !centroid.lost_terms.is_empty() {
                    println!("             lost:   {}", centroid.lost_terms.join(", "));
                }
            }
            None => println!("{:<12} no centroid yet", archetype.slug()),
        }
    }
    Ok(())
}

fn cmd_classify(app: &App, file: &str, role_type: RoleType) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    let scores = app.pipeline.classifier().classify_text(&text, role_type);
    for archetype in Archetype::ALL {
        println!("{:<12} {:.3}", archetype.slug(), scores.get(archetype));
    }
    let (top, top_score, second) = scores.top_two();
    println!();
    println!(
        "primary: {}{}",
        top.slug(),
        if top_score - second < app.config.tuning.close_call_delta {
            "  (close call)"
        } else {
            ""
        }
    );
    Ok(())
}

async fn cmd_log_call(
    app: &App,
    phone: Option<String>,
    company: String,
    title: String,
    outcome: OutcomeStage,
    notes: String,
) -> Result<()> {
    let matched = app
        .pipeline
        .log_call(NewCallLog {
            phone,
            company,
            title,
            outcome,
            notes,
            called_at: Utc::now(),
        })
        .await?;
    match matched {
        Some(application_id) => println!("matched application {application_id}"),
        None => println!("recorded; no confident application match"),
    }
    Ok(())
}

async fn cmd_sync(app: &App) -> Result<()> {
    let outcome = app.pipeline.sync_spool().await?;
    println!(
        "flushed {} spooled writes ({} duplicates dropped, {} still spooled)",
        outcome.flushed, outcome.duplicates, outcome.remaining
    );
    Ok(())
}

fn cmd_versions(app: &App) -> Result<()> {
    let metrics = app.store.version_metrics()?;
    if metrics.is_empty() {
        println!("no applications recorded yet");
        return Ok(());
    }
    println!(
        "{:<12} {:<12} {:>5} {:>9} {:>10}",
        "variant", "version", "sent", "responses", "interviews"
    );
    for row in metrics {
        println!(
            "{:<12} {:<12} {:>5} {:>9} {:>10}",
            row.variant.slug(),
            &row.version_id[..row.version_id.len().min(12)],
            row.sent,
            row.responses,
            row.interviews
        );
    }
    Ok(())
}

fn cmd_alerts(app: &App, ack: Option<i64>) -> Result<()> {
    if let Some(alert_id) = ack {
        app.store.acknowledge_alert(alert_id)?;
        println!("acknowledged alert {alert_id}");
        return Ok(());
    }
    let alerts = app.store.unacknowledged_alerts()?;
    if alerts.is_empty() {
        println!("no unacknowledged alerts");
        return Ok(());
    }
    for alert in alerts {
        println!(
            "#{:<4} {:<12} {:<18} value={:.3} threshold={:.3}  {}",
            alert.id,
            alert.archetype.slug(),
            alert.kind.slug(),
            alert.value,
            alert.threshold,
            alert.created_at.format("%Y-%m-%d"),
        );
        if alert.kind == quarry_store::AlertKind::RewriteTriggered {
            if let Some(focus) = alert.details.get("suggested_focus").and_then(|v| v.as_str()) {
                println!("      {focus}");
            }
        }
    }
    Ok(())
}

async fn cmd_reembed(app: &App) -> Result<()> {
    let versions = app.version_store();
    let count = app
        .pipeline
        .reembed(versions.as_ref().map(|v| v as &dyn VersionStore))
        .await?;
    println!("re-embedded {count} listings under model {}", app.store.model_version());
    Ok(())
}

async fn cmd_run(app: App) -> Result<()> {
    let versions = app.version_store();
    let App {
        config, pipeline, ..
    } = app;

    if let Some(versions) = versions {
        match pipeline.refresh_variants(&versions).await {
            Ok(updated) if updated > 0 => info!(updated, "variants refreshed at startup"),
            Ok(_) => {}
            Err(err) => warn!(%err, "variant refresh failed at startup"),
        }
    }

    let shutdown = shutdown_channel();
    spawn_classify_retry(pipeline.clone(), &shutdown);
    spawn_drift_job(pipeline.clone(), &shutdown);
    spawn_backup_job(pipeline.clone(), &shutdown);
    if config.collaborators.inbox_command.is_empty() {
        warn!("no inbox command configured; outcome ingestion is disabled");
    } else {
        spawn_inbox_poll(
            pipeline.clone(),
            Arc::new(CommandInbox::new(&config.collaborators.inbox_command)),
            &shutdown,
        );
    }

    info!("quarry scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    shutdown.send(true).ok();
    info!("shutting down");
    Ok(())
}
