mod extractor;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};
use roll_core::{
    Day, EnrollOutcome, IdentityKey, NoMatchReason, Recognition, RollCall,
};
use roll_store::{DataDir, RollConfig, Store};
use serde::Serialize;

use crate::extractor::CommandExtractor;
use crate::server::{RegisteredView, RollServer};

#[derive(Parser)]
#[command(name = "roll", about = "Face-recognition attendance CLI and MCP server")]
struct Cli {
    /// Data directory (default: $ROLL_DATA_DIR, then ~/.rollcall)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Manage the student directory
    Student {
        #[command(subcommand)]
        action: StudentAction,
    },

    /// Enroll (or replace) a student's face from an image file
    Enroll {
        /// Registration number
        identity: String,
        /// Image containing exactly one face
        image: PathBuf,
    },

    /// Remove a student's enrolled face
    Unenroll {
        /// Registration number
        identity: String,
    },

    /// Remove every enrolled face
    ClearFaces,

    /// List enrolled faces
    Registered {
        /// Include captured images (base64) in JSON output
        #[arg(long)]
        images: bool,
    },

    /// Recognize the face in an image and mark attendance
    Recognize {
        /// Captured image
        image: PathBuf,
        /// Day as YYYY-MM-DD (default: today)
        #[arg(long)]
        day: Option<String>,
    },

    /// Show attendance for a day
    Attendance {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(long)]
        day: Option<String>,
    },

    /// Delete all attendance records of a day
    ResetDay {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(long)]
        day: Option<String>,
    },

    /// List days with attendance records
    Days,
}

#[derive(Subcommand)]
enum StudentAction {
    /// Add a student or rename an existing one
    Add {
        /// Registration number
        identity: String,
        /// Display name
        name: String,
    },
    /// List students
    List,
}

/// Everything a command needs, opened from the data directory.
struct App {
    roll: Arc<RollCall>,
    store: Arc<Store>,
    config: RollConfig,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let base = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var_os("ROLL_DATA_DIR").map(PathBuf::from));
        let dir = DataDir::open(base.as_deref()).context("failed to open data directory")?;
        let config = dir
            .load_config()
            .with_context(|| format!("failed to load {}", dir.config_path().display()))?;
        let store = Arc::new(dir.open_store(&config).context("failed to open store")?);
        let extractor = Arc::new(CommandExtractor::new(
            config.extractor.command.clone(),
            config.extractor_timeout(),
        ));
        let roll = RollCall::new(
            store.clone(),
            store.clone(),
            store.clone(),
            extractor,
            config.matcher_config(),
        );
        Ok(Self {
            roll: Arc::new(roll),
            store,
            config,
        })
    }

    fn day(&self, day: Option<&str>) -> Result<Day> {
        match day {
            Some(raw) => Ok(Day::parse(raw)?),
            None => Ok(Day::today(self.config.utc_offset_secs())),
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let app = App::open(&cli)?;

    match &cli.command {
        Commands::Serve => cmd_serve(app).await,
        Commands::Student { action } => match action {
            StudentAction::Add { identity, name } => cmd_student_add(&cli, &app, identity, name),
            StudentAction::List => cmd_student_list(&cli, &app),
        },
        Commands::Enroll { identity, image } => cmd_enroll(&cli, &app, identity, image),
        Commands::Unenroll { identity } => cmd_unenroll(&cli, &app, identity),
        Commands::ClearFaces => cmd_clear_faces(&cli, &app),
        Commands::Registered { images } => cmd_registered(&cli, &app, *images),
        Commands::Recognize { image, day } => cmd_recognize(&cli, &app, image, day.as_deref()),
        Commands::Attendance { day } => cmd_attendance(&cli, &app, day.as_deref()),
        Commands::ResetDay { day } => cmd_reset_day(&cli, &app, day.as_deref()),
        Commands::Days => cmd_days(&cli, &app),
    }
}

async fn cmd_serve(app: App) -> Result<()> {
    tracing::info!("starting MCP server");
    let server = RollServer::new(app.roll.clone(), app.config.utc_offset_secs());
    let service = server
        .serve(stdio())
        .await
        .context("failed to start MCP server")?;

    tokio::select! {
        res = service.waiting() => {
            res.context("MCP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    if let Err(e) = app.store.checkpoint_truncate() {
        tracing::warn!("WAL checkpoint failed: {e}");
    }
    Ok(())
}

fn cmd_student_add(cli: &Cli, app: &App, identity: &str, name: &str) -> Result<()> {
    let key = IdentityKey::parse(identity)?;
    app.store
        .add_student(&key, name)
        .with_context(|| format!("failed to save student {key}"))?;
    if cli.json {
        return print_json(&serde_json::json!({ "identity": key, "name": name.trim() }));
    }
    println!("saved student {key} ({})", name.trim());
    Ok(())
}

fn cmd_student_list(cli: &Cli, app: &App) -> Result<()> {
    let students = app.roll.students().context("failed to list students")?;
    if cli.json {
        return print_json(&students);
    }
    if students.is_empty() {
        println!("(no students)");
    }
    for s in &students {
        println!("{}\t{}", s.key, s.name);
    }
    Ok(())
}

fn cmd_enroll(cli: &Cli, app: &App, identity: &str, image: &Path) -> Result<()> {
    let key = IdentityKey::parse(identity)?;
    let bytes = read_image(image)?;
    let outcome = app
        .roll
        .enroll(&key, &bytes)
        .with_context(|| format!("failed to enroll {key}"))?;
    if cli.json {
        return print_json(&outcome);
    }
    match outcome {
        EnrollOutcome::Enrolled => println!("enrolled {key}"),
        EnrollOutcome::Rejected(rejection) => println!("rejected: {rejection}"),
    }
    Ok(())
}

fn cmd_unenroll(cli: &Cli, app: &App, identity: &str) -> Result<()> {
    let key = IdentityKey::parse(identity)?;
    let removed = app
        .roll
        .unenroll(&key)
        .with_context(|| format!("failed to unenroll {key}"))?;
    if cli.json {
        return print_json(&serde_json::json!({ "identity": key, "removed": removed }));
    }
    if removed {
        println!("removed face of {key}");
    } else {
        println!("{key} was not enrolled");
    }
    Ok(())
}

fn cmd_clear_faces(cli: &Cli, app: &App) -> Result<()> {
    let removed = app.roll.clear_faces().context("failed to clear faces")?;
    if cli.json {
        return print_json(&serde_json::json!({ "removed": removed }));
    }
    println!("removed {removed} face(s)");
    Ok(())
}

fn cmd_registered(cli: &Cli, app: &App, images: bool) -> Result<()> {
    let faces = app.roll.registered().context("failed to list faces")?;
    if cli.json {
        let views: Vec<RegisteredView> = faces
            .into_iter()
            .map(|f| RegisteredView::new(f, images))
            .collect();
        return print_json(&views);
    }
    if faces.is_empty() {
        println!("(no faces enrolled)");
    }
    for f in &faces {
        println!("{}\t{}\t{}", f.identity, f.name, f.enrolled_at);
    }
    Ok(())
}

fn describe_no_match(reason: &NoMatchReason) -> String {
    match reason {
        NoMatchReason::Empty => "no match: no faces enrolled".to_string(),
        NoMatchReason::AboveThreshold { distance } => {
            format!("no match: nearest face at distance {distance:.4}")
        }
        NoMatchReason::Ambiguous {
            distance,
            runner_up,
        } => format!("no match: ambiguous ({distance:.4} vs {runner_up:.4})"),
    }
}

fn cmd_recognize(cli: &Cli, app: &App, image: &Path, day: Option<&str>) -> Result<()> {
    let day = app.day(day)?;
    let bytes = read_image(image)?;
    let recognition = app
        .roll
        .submit_probe(&bytes, &day)
        .context("recognition failed")?;
    if cli.json {
        return print_json(&recognition);
    }
    match &recognition {
        Recognition::Marked {
            identity,
            name,
            distance,
            ..
        } => println!("marked {identity} ({name}) present on {day}, distance {distance:.4}"),
        Recognition::AlreadyMarked {
            identity,
            name,
            record,
            ..
        } => println!(
            "{identity} ({name}) already marked on {day} at {}",
            record.timestamp
        ),
        Recognition::NoMatch(reason) => println!("{}", describe_no_match(reason)),
        Recognition::Rejected(rejection) => println!("rejected: {rejection}"),
    }
    Ok(())
}

fn cmd_attendance(cli: &Cli, app: &App, day: Option<&str>) -> Result<()> {
    let day = app.day(day)?;
    let records = app
        .roll
        .get_day(&day)
        .with_context(|| format!("failed to load attendance for {day}"))?;
    if cli.json {
        return print_json(&serde_json::json!({ "day": day, "records": records }));
    }
    println!("{day}: {} present", records.len());
    for (key, record) in &records {
        println!(
            "{key}\t{}\t{}\t{}",
            record.name, record.status, record.timestamp
        );
    }
    Ok(())
}

fn cmd_reset_day(cli: &Cli, app: &App, day: Option<&str>) -> Result<()> {
    let day = app.day(day)?;
    let removed = app
        .roll
        .reset_day(&day)
        .with_context(|| format!("failed to reset {day}"))?;
    if cli.json {
        return print_json(&serde_json::json!({ "day": day, "removed": removed }));
    }
    println!("removed {removed} record(s) for {day}");
    Ok(())
}

fn cmd_days(cli: &Cli, app: &App) -> Result<()> {
    let days = app.roll.days().context("failed to list days")?;
    if cli.json {
        return print_json(&days);
    }
    if days.is_empty() {
        println!("(no attendance recorded)");
    }
    for d in &days {
        println!("{d}");
    }
    Ok(())
}
