mod config;

use agentrail_security::{AuditLogger, ValidationConfig, DEFAULT_AGENTS};
use agentrail_session::{latest_session_file, SessionStore, Transition};
use clap::{Parser, Subcommand};
use config::AgentrailConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentrail", about = "agentrail: crash-safe session state for agent pipelines")]
struct Cli {
    /// Path to config file (defaults to ./agentrail.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relaxed validation: any well-formed agent name, temp dir allowed
    #[arg(long)]
    relaxed: bool,

    /// Session file to use instead of the newest one in the session directory
    #[arg(short, long)]
    session: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a fresh session file and print its path
    New,
    /// Mark an agent as running
    Start {
        agent: String,
        #[arg(short, long, default_value = "")]
        message: String,
        /// Comma-separated tool names
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },
    /// Queue an agent without starting it
    Enqueue {
        agent: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Mark an agent's running attempt as completed
    Complete {
        agent: String,
        #[arg(short, long, default_value = "")]
        message: String,
        /// External reference such as an issue number
        #[arg(long)]
        reference: Option<i64>,
    },
    /// Mark an agent's running attempt as failed
    Fail {
        agent: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Show the session status
    Status {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which pipeline agents have completed
    Progress {
        /// Expected agents (defaults to the standard pipeline)
        agents: Vec<String>,
    },
    /// Check whether the given agents ran in parallel
    Overlap {
        #[arg(required = true, num_args = 2..)]
        agents: Vec<String>,
        /// Exit with an error when they did not overlap
        #[arg(long)]
        require: bool,
    },
    /// Delete temporary files left behind by interrupted writes
    Reclaim {
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let (config, base_dir) = AgentrailConfig::load(cli.config.as_deref())?;
    let validation = Arc::new(config.validation_config(&base_dir, cli.relaxed)?);
    let audit = Arc::new(config.audit_logger(&validation)?);
    info!(
        mode = %validation.mode(),
        project_root = %validation.project_root().display(),
        "agentrail starting"
    );

    let result = run(cli.command, cli.session, validation, audit.clone());

    if audit.failed_writes() > 0 {
        warn!(failed = audit.failed_writes(), "Some audit records could not be written");
    }
    result
}

fn run(
    command: Commands,
    session: Option<PathBuf>,
    validation: Arc<ValidationConfig>,
    audit: Arc<AuditLogger>,
) -> anyhow::Result<()> {
    if let Commands::New = command {
        let store = SessionStore::create(validation, audit)?;
        println!("{}", store.path().display());
        return Ok(());
    }

    let mut store = open_store(session, validation, audit)?;

    match command {
        Commands::New => {}
        Commands::Start {
            agent,
            message,
            tools,
        } => {
            let attempt = store.start(&agent, &message, tools)?;
            println!("{agent} started (attempt {attempt})");
        }
        Commands::Enqueue { agent, message } => match store.enqueue(&agent, &message)? {
            Some(attempt) => println!("{agent} queued (attempt {attempt})"),
            None => println!("{agent} is already queued"),
        },
        Commands::Complete {
            agent,
            message,
            reference,
        } => {
            let transition = store.complete(&agent, &message, reference)?;
            print_transition(&agent, "completed", transition);
        }
        Commands::Fail { agent, message } => {
            let transition = store.fail(&agent, &message)?;
            print_transition(&agent, "failed", transition);
        }
        Commands::Status { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&store.summary())?);
            } else {
                print_status(&store);
            }
        }
        Commands::Progress { agents } => {
            let expected: Vec<String> = if agents.is_empty() {
                DEFAULT_AGENTS.iter().map(|a| (*a).to_string()).collect()
            } else {
                agents
            };
            let progress = store.progress(&expected);
            println!("Completed: {}", progress.completed.join(", "));
            println!("Remaining: {}", progress.remaining.join(", "));
        }
        Commands::Overlap { agents, require } => {
            let overlapped = store.verify_overlap(&agents)?;
            println!("{overlapped}");
            if require && !overlapped {
                anyhow::bail!("agents {} did not run in parallel", agents.join(", "));
            }
        }
        Commands::Reclaim { max_age_secs } => {
            let removed = store.reclaim_orphans(Duration::from_secs(max_age_secs))?;
            println!("Removed {removed} orphaned temporary file(s)");
        }
    }

    Ok(())
}

/// Explicit `--session`, else the newest session file, else a new session.
fn open_store(
    session: Option<PathBuf>,
    validation: Arc<ValidationConfig>,
    audit: Arc<AuditLogger>,
) -> anyhow::Result<SessionStore> {
    let store = match session {
        Some(path) => SessionStore::open(validation, audit, path)?,
        None => match latest_session_file(&validation)? {
            Some(path) => SessionStore::open(validation, audit, path)?,
            None => SessionStore::create(validation, audit)?,
        },
    };
    Ok(store)
}

fn print_transition(agent: &str, state: &str, transition: Transition) {
    match transition {
        Transition::Applied { attempt } => println!("{agent} {state} (attempt {attempt})"),
        Transition::AlreadyDone { attempt } => {
            println!("{agent} was already {state} (attempt {attempt})");
        }
    }
}

/// Escapes control characters so stored text cannot drive the terminal.
fn printable(text: &str) -> String {
    text.chars()
        .flat_map(|c| {
            if c.is_control() {
                c.escape_default().collect::<Vec<_>>()
            } else {
                vec![c]
            }
        })
        .collect()
}

fn print_status(store: &SessionStore) {
    let summary = store.summary();
    println!("Session {} ({})", summary.session_id, store.path().display());
    println!("Status: {}", summary.status);
    if summary.agents.is_empty() {
        println!("No agents recorded yet.");
        return;
    }
    for agent in &summary.agents {
        let Some(latest) = store.latest(agent) else {
            continue;
        };
        let duration = latest
            .duration_seconds()
            .map(|s| format!(" {s:.1}s"))
            .unwrap_or_default();
        println!(
            "  {:<18} #{:<3} {:<10}{duration}  {}",
            printable(agent),
            latest.attempt,
            latest.status.to_string(),
            printable(&latest.message)
        );
    }
    println!(
        "\nTotal: {} attempt(s), {} completed, {} failed, {} running, {} pending",
        summary.total_attempts, summary.completed, summary.failed, summary.running, summary.pending
    );
}
