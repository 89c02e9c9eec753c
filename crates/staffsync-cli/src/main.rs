use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use staffsync_storage::{BiosLoad, StaffDataStore};
use staffsync_sync::config::DEFAULT_ENV_FILE;
use staffsync_sync::{reconcile_from_disk, EnvSource, SyncConfig, SyncError, SyncPipeline};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "staffsync", version)]
#[command(about = "Sync course staff from Canvas into the site's data files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding canvas-staff.json and instructor-bio.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// KEY=VALUE file read for variables the environment does not set
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Exit non-zero when the fetch or the write-back fails
    #[arg(long, global = true)]
    strict: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the roster from Canvas and add bios for new instructors
    Sync {
        /// Skip per-person email lookups
        #[arg(long)]
        skip_email: bool,
    },
    /// Add bios for instructors in the roster already on disk
    Reconcile,
    /// Print each instructor with the title and bio the site will show
    Show,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = match verbose {
        0 => "warn,staffsync=info",
        1 => "warn,staffsync=debug",
        _ => "staffsync=trace,info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

/// Fetch and persist failures keep the last saved files, so the surrounding
/// site build goes on with them unless `--strict` was given.
fn tolerate(err: SyncError, strict: bool) -> Result<()> {
    if err.is_recoverable() && !strict {
        warn!(error = %err, "staff sync failed; keeping previously saved staff data");
        return Ok(());
    }
    Err(err.into())
}

async fn show(store: &StaffDataStore) -> Result<()> {
    let roster = store.load_roster().await?.with_context(|| {
        format!("no roster at {}", store.roster_path().display())
    })?;
    let bios = store.load_bios().await;
    if let BiosLoad::Unparsable { reason } = &bios {
        warn!(%reason, "bios file unreadable; showing fallback bios");
    }
    let bios = bios.into_record();

    println!("{}", roster.course_name);
    for person in &roster.instructors {
        let profile = bios.profile_for(person);
        let marker = if profile.has_entry { "" } else { " [no bios entry]" };
        match &profile.title {
            Some(title) => println!("\n{} ({title}){marker}", profile.name),
            None => println!("\n{}{marker}", profile.name),
        }
        if !profile.email.is_empty() {
            println!("  {}", profile.email);
        }
        println!("  {}", profile.bio);
    }
    println!(
        "\ninstructors={} tas={} tutors={}",
        roster.instructors.len(),
        roster.tas.len(),
        roster.tutors.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let env = EnvSource::with_env_file(&cli.env_file)?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| env.data_dir());

    match cli.command.unwrap_or(Commands::Sync { skip_email: false }) {
        Commands::Sync { skip_email } => {
            let mut config = SyncConfig::from_source(&env)?;
            config.data_dir = data_dir;
            config.skip_email |= skip_email;

            let result = match SyncPipeline::new(&config) {
                Ok(pipeline) => pipeline.run_once().await,
                Err(err) => Err(err),
            };
            match result {
                Ok(summary) => {
                    println!(
                        "sync complete: run_id={} course={:?} instructors={} tas={} tutors={} new_bios={}",
                        summary.run_id,
                        summary.course_name,
                        summary.instructors,
                        summary.tas,
                        summary.tutors,
                        summary.bios.appended.len()
                    );
                }
                Err(err) => tolerate(err, cli.strict)?,
            }
        }
        Commands::Reconcile => {
            let store = StaffDataStore::new(data_dir);
            match reconcile_from_disk(&store).await {
                Ok(outcome) => {
                    println!(
                        "reconcile complete: new_bios={} written={}",
                        outcome.appended.len(),
                        outcome.written
                    );
                }
                Err(err) => tolerate(err, cli.strict)?,
            }
        }
        Commands::Show => show(&StaffDataStore::new(data_dir)).await?,
    }

    Ok(())
}
