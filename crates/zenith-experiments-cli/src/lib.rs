//! Operator command surface for the experimentation store.
//!
//! Host tooling should embed experiment behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_experiments_with_db`] for direct [`ExperimentsCommand`] execution
//!   against a DB path.
//! - [`run_experiments`] for execution against an existing
//!   [`SqliteExperimentStore`].

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ulid::Ulid;
use zenith_experiments_core::{
    detect_winner, sample_size, AllocationId, ExperimentDefinition, ExperimentId,
    ExperimentStatus, ExperimentType, SignificanceTest, Subject, VariantCounts,
};
use zenith_experiments_store_sqlite::{
    EventWindow, ExperimentFilter, SqliteExperimentStore, TrackEventInput,
};

#[derive(Debug, Parser)]
#[command(name = "zx")]
#[command(about = "Zenith experimentation CLI")]
pub struct Cli {
    #[arg(long, default_value = "./zenith_experiments.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Experiments {
        #[command(subcommand)]
        command: Box<ExperimentsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ExperimentsCommand {
    /// Apply pending schema migrations and report the schema state.
    Migrate,
    Create(CreateArgs),
    List(ListArgs),
    Show(ShowArgs),
    Status(StatusArgs),
    Allocate(AllocateArgs),
    Track(TrackArgs),
    TrackBatch(TrackBatchArgs),
    Stats(StatsArgs),
    Winner(WinnerArgs),
    SampleSize(SampleSizeArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Path to a JSON experiment definition.
    #[arg(long)]
    definition: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long = "type")]
    experiment_type: Option<TypeArg>,
    #[arg(long)]
    page: Option<u64>,
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    experiment: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    status: StatusArg,
}

#[derive(Debug, Args)]
pub struct AllocateArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    force_variant: Option<String>,
}

#[derive(Debug, Args)]
pub struct TrackArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    allocation: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    event_type: String,
    #[arg(long)]
    event_value: Option<f64>,
    #[arg(long, default_value = "{}")]
    event_data_json: String,
}

#[derive(Debug, Args)]
pub struct TrackBatchArgs {
    /// Path to a JSON array of tracking events.
    #[arg(long)]
    events: PathBuf,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    event_type: Option<String>,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Args)]
pub struct WinnerArgs {
    #[arg(long)]
    experiment: String,
}

#[derive(Debug, Args)]
pub struct SampleSizeArgs {
    #[arg(long, default_value_t = 0.1)]
    baseline_rate: f64,
    #[arg(long)]
    mde: f64,
    #[arg(long, default_value_t = 0.95)]
    confidence: f64,
    #[arg(long, default_value_t = 0.8)]
    power: f64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TypeArg {
    AbTest,
    Multivariate,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Experiments { command } => run_experiments_with_db(&cli.db, *command),
    }
}

/// Executes a parsed experiments command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_experiments_with_db(
    db_path: &std::path::Path,
    command: ExperimentsCommand,
) -> Result<()> {
    match command {
        ExperimentsCommand::SampleSize(args) => run_sample_size(&args),
        command => {
            let mut store = SqliteExperimentStore::open(db_path)?;
            store.migrate()?;
            run_experiments(command, &mut store)
        }
    }
}

/// Executes a parsed experiments command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_experiments(
    command: ExperimentsCommand,
    store: &mut SqliteExperimentStore,
) -> Result<()> {
    match command {
        ExperimentsCommand::Migrate => {
            let status = store.schema_status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        ExperimentsCommand::Create(args) => {
            let body = fs::read_to_string(&args.definition).with_context(|| {
                format!("failed to read definition {}", args.definition.display())
            })?;
            let definition: ExperimentDefinition =
                serde_json::from_str(&body).with_context(|| {
                    format!("failed to parse definition {}", args.definition.display())
                })?;

            let created = store.create_experiment(&definition)?;
            println!("{}", serde_json::to_string_pretty(&created)?);
            Ok(())
        }
        ExperimentsCommand::List(args) => {
            let filter = ExperimentFilter {
                status: args.status.map(map_status),
                experiment_type: args.experiment_type.map(map_type),
                page: args.page,
                limit: args.limit,
            };
            let page = store.list_experiments(&args.owner, &filter)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        ExperimentsCommand::Show(args) => {
            let experiment_id = parse_experiment_id(&args.experiment)?;
            let experiment = store.get_experiment(experiment_id)?;
            let variants = store.list_variants(experiment_id)?;
            let payload = serde_json::json!({
                "experiment": experiment,
                "variants": variants,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        ExperimentsCommand::Status(args) => {
            let experiment_id = parse_experiment_id(&args.experiment)?;
            let experiment = store.set_status(experiment_id, map_status(args.status))?;
            println!("{}", serde_json::to_string_pretty(&experiment)?);
            Ok(())
        }
        ExperimentsCommand::Allocate(args) => {
            let experiment_id = parse_experiment_id(&args.experiment)?;
            let subject = Subject {
                user_id: args.user_id,
                session_id: args.session_id,
            };
            let outcome =
                store.allocate(experiment_id, &subject, args.force_variant.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        ExperimentsCommand::Track(args) => {
            let event_data: serde_json::Value = serde_json::from_str(&args.event_data_json)
                .context("event_data_json MUST be valid JSON")?;
            let input = TrackEventInput {
                experiment_id: parse_experiment_id(&args.experiment)?,
                allocation_id: args
                    .allocation
                    .as_deref()
                    .map(parse_allocation_id)
                    .transpose()?,
                subject: Subject {
                    user_id: args.user_id,
                    session_id: args.session_id,
                },
                event_type: args.event_type,
                event_value: args.event_value,
                event_data,
            };

            let event = store.track_event(&input)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        ExperimentsCommand::TrackBatch(args) => {
            let body = fs::read_to_string(&args.events)
                .with_context(|| format!("failed to read events {}", args.events.display()))?;
            let inputs: Vec<TrackEventInput> = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse events {}", args.events.display()))?;

            let report = store.track_batch(&inputs)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        ExperimentsCommand::Stats(args) => {
            let experiment_id = parse_experiment_id(&args.experiment)?;
            let window = EventWindow {
                event_type: args.event_type,
                start: args.start,
                end: args.end,
            };
            let stats = store.event_statistics(experiment_id, &window)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        ExperimentsCommand::Winner(args) => {
            let experiment_id = parse_experiment_id(&args.experiment)?;
            let experiment = store.get_experiment(experiment_id)?;
            let counts: Vec<VariantCounts> = store
                .list_variants(experiment_id)?
                .into_iter()
                .map(|v| VariantCounts {
                    name: v.name,
                    is_control: v.is_control,
                    participants: v.participants,
                    conversions: v.conversions,
                })
                .collect();

            let analysis = detect_winner(
                &counts,
                experiment.confidence_level,
                experiment.minimum_sample_size,
                SignificanceTest::default(),
            )?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(())
        }
        ExperimentsCommand::SampleSize(args) => run_sample_size(&args),
    }
}

fn run_sample_size(args: &SampleSizeArgs) -> Result<()> {
    let analysis = sample_size(
        args.baseline_rate,
        args.mde,
        1.0 - args.confidence,
        args.power,
    )?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn map_status(arg: StatusArg) -> ExperimentStatus {
    match arg {
        StatusArg::Draft => ExperimentStatus::Draft,
        StatusArg::Running => ExperimentStatus::Running,
        StatusArg::Paused => ExperimentStatus::Paused,
        StatusArg::Completed => ExperimentStatus::Completed,
        StatusArg::Archived => ExperimentStatus::Archived,
    }
}

fn map_type(arg: TypeArg) -> ExperimentType {
    match arg {
        TypeArg::AbTest => ExperimentType::AbTest,
        TypeArg::Multivariate => ExperimentType::Multivariate,
    }
}

fn parse_experiment_id(raw: &str) -> Result<ExperimentId> {
    Ulid::from_string(raw)
        .map(ExperimentId)
        .with_context(|| format!("invalid experiment id: {raw}"))
}

fn parse_allocation_id(raw: &str) -> Result<AllocationId> {
    Ulid::from_string(raw)
        .map(AllocationId)
        .with_context(|| format!("invalid allocation id: {raw}"))
}
