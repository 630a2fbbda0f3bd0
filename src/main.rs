use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use rollcall::api::{self, SecurityConfig};
use rollcall::config::ServiceConfig;
use rollcall::db::Database;
use rollcall::models::*;
use rollcall::service::VerificationService;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Reconcile RFID attendance scans against classroom headcounts")]
struct Cli {
    /// Path to the SQLite database (defaults to the platform data directory)
    #[arg(long, global = true, env = "ROLLCALL_DB")]
    db: Option<PathBuf>,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Tuning {
    /// Width of each verification window, in seconds
    #[arg(long, global = true, env = "ROLLCALL_WINDOW_SECS", default_value = "3600")]
    window_secs: i64,

    /// Distinct RFID scans a window needs before its verdict is trusted
    #[arg(long, global = true, env = "ROLLCALL_MIN_RFID_EVENTS", default_value = "1")]
    min_rfid_events: u32,

    /// Repeat reads of the same tag closer than this collapse into one, in seconds
    #[arg(long, global = true, env = "ROLLCALL_DEDUP_TOLERANCE_SECS", default_value = "5")]
    dedup_tolerance_secs: i64,

    /// How long a computed verdict is served from cache, in seconds
    #[arg(long, global = true, env = "ROLLCALL_CACHE_TTL_SECS", default_value = "5")]
    cache_ttl_secs: u64,
}

impl Tuning {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        Ok(ServiceConfig::default()
            .with_window_size(seconds("window size", self.window_secs)?)
            .with_min_rfid_events(self.min_rfid_events)
            .with_dedup_tolerance(seconds("dedup tolerance", self.dedup_tolerance_secs)?)
            .with_cache_ttl(StdDuration::from_secs(self.cache_ttl_secs)))
    }
}

fn seconds(what: &str, secs: i64) -> anyhow::Result<chrono::Duration> {
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| anyhow::anyhow!("{} of {}s is out of range", what, secs))
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port for HTTP API
        #[arg(short, long, env = "ROLLCALL_PORT", default_value = "3000")]
        port: u16,

        /// Address to bind
        #[arg(long, env = "ROLLCALL_HOST", default_value = "127.0.0.1")]
        host: String,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Add a student to the roster
    Enroll {
        name: String,
        rfid_tag: String,
    },
    /// Open a session for a class
    OpenSession { class_id: String },
    /// Close a session
    CloseSession { session_id: Uuid },
    /// Print the current verdict for a class
    Verify { class_id: String },
}

/// Initialize tracing with output to stderr so CLI output on stdout stays clean
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "rollcall=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(path: Option<PathBuf>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::open(path)?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

async fn serve(service: VerificationService, host: &str, port: u16) -> anyhow::Result<()> {
    let security = SecurityConfig::from_env();
    if !security.auth_enabled() {
        tracing::warn!("ROLLCALL_API_KEYS not set, API authentication is disabled");
    }

    let app = api::create_router_with_config(service, security);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("rollcall server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let db = open_database(cli.db)?;
    let service = VerificationService::new(db, cli.tuning.service_config()?)?;
    let operator = Caller::new("cli");

    match cli.command {
        Some(Commands::Serve { port, host }) => serve(service, &host, port).await?,
        None => serve(service, "127.0.0.1", 3000).await?,
        Some(Commands::Migrate) => {
            println!("Database is up to date");
        }
        Some(Commands::Enroll { name, rfid_tag }) => {
            let student = service
                .db()
                .create_student(CreateStudentInput { name, rfid_tag })?;
            println!("Enrolled {} ({}) as {}", student.name, student.rfid_tag, student.id);
        }
        Some(Commands::OpenSession { class_id }) => {
            let session = service.open_session(&operator, OpenSessionInput::new(class_id))?;
            println!("Opened session {} for class {}", session.id, session.class_id);
        }
        Some(Commands::CloseSession { session_id }) => {
            let session = service.close_session(&operator, session_id)?;
            println!("Closed session {} for class {}", session.id, session.class_id);
        }
        Some(Commands::Verify { class_id }) => {
            let verdict = service.current_verdict(&operator, &class_id)?;
            let response = VerifyResponse::new(class_id, &verdict);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
