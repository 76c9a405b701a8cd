//! Embeddable `hb` command surface.
//!
//! Hosts can drive the buffer through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for one [`Command`] against an existing engine.
//! - [`init_tracing`] to install the same stderr logging the binary uses.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hookbuffer_core::{
    DebounceEngine, ScopedUpdate, ThreadKey, ThreadUpdate, UpdateStatus, WebhookConfig,
};
use hookbuffer_store_sqlite::{SqliteUpdateStore, StoreConfig, UpdateQuery};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hb")]
#[command(about = "Debounced webhook thread buffer")]
pub struct Cli {
    #[arg(long, env = "HOOKBUFFER_DB", default_value = "./hookbuffer.sqlite3")]
    db: PathBuf,

    /// Seconds before a lock left by a crashed consumer can be reclaimed.
    #[arg(
        long,
        env = "HOOKBUFFER_LOCK_TTL_SECONDS",
        default_value_t = 900,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    lock_ttl_seconds: u32,

    #[arg(long, env = "HOOKBUFFER_LOG", default_value = "warn")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Webhook {
        #[command(subcommand)]
        command: WebhookCommand,
    },
    Ingest(IngestArgs),
    /// Claim one thread and deliver its newest pending update.
    Pull(PullArgs),
    Thread {
        #[command(subcommand)]
        command: ThreadCommand,
    },
    Updates {
        #[command(subcommand)]
        command: UpdatesCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum WebhookCommand {
    Register(WebhookRegisterArgs),
    Show(WebhookNameArgs),
    List,
}

#[derive(Debug, Args)]
pub struct WebhookRegisterArgs {
    #[arg(long)]
    name: String,
    /// Dotted path to the thread id, e.g. `data.items.0.id`.
    #[arg(long)]
    thread_id_path: String,
    #[arg(long, default_value = "")]
    revision_path: String,
}

#[derive(Debug, Args)]
pub struct WebhookNameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    webhook: String,
    #[arg(long)]
    payload_json: String,
}

#[derive(Debug, Args)]
pub struct PullArgs {
    /// Only updates that arrived at least this many seconds ago are eligible.
    #[arg(long, default_value_t = 0)]
    buffer_seconds: u32,
    /// Record the pulled update as failed and exit non-zero with this message.
    #[arg(long)]
    fail_with: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ThreadCommand {
    Show(ThreadShowArgs),
}

#[derive(Debug, Args)]
pub struct ThreadShowArgs {
    #[arg(long)]
    webhook: String,
    #[arg(long)]
    thread_id: String,
}

#[derive(Debug, Subcommand)]
pub enum UpdatesCommand {
    List(UpdatesListArgs),
}

#[derive(Debug, Args)]
pub struct UpdatesListArgs {
    #[arg(long)]
    webhook: Option<String>,
    #[arg(long)]
    thread_id: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 50)]
    per_page: u32,
    #[arg(long)]
    oldest_first: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Skipped,
    Success,
    Error,
}

impl From<StatusArg> for UpdateStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::Skipped => Self::Skipped,
            StatusArg::Success => Self::Success,
            StatusArg::Error => Self::Error,
        }
    }
}

#[derive(Debug, Serialize)]
struct PullOutput<'a> {
    update: Option<&'a ThreadUpdate>,
}

impl Cli {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lock_ttl: time::Duration::seconds(i64::from(self.lock_ttl_seconds)),
            ..StoreConfig::default()
        }
    }
}

/// Installs a stderr `tracing` subscriber per `--log-level` / `--log-format`.
///
/// # Errors
/// Returns an error when the filter is invalid or a global subscriber is
/// already installed.
pub fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log filter: {}", cli.log_level))?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match cli.log_format {
        LogFormatArg::Json => builder.json().try_init(),
        LogFormatArg::Text => builder.compact().try_init(),
    }
    .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteUpdateStore::open_with_config(&cli.db, cli.store_config())?;
    store.migrate()?;
    let engine = DebounceEngine::new(store);
    run_command(cli.command, &engine)
}

/// Executes one command against an existing engine and its store.
///
/// # Errors
/// Returns an error when input validation or the store operation fails, and
/// for `pull --fail-with` after the failure was recorded.
pub fn run_command(command: Command, engine: &DebounceEngine<SqliteUpdateStore>) -> Result<()> {
    let store = engine.store();
    match command {
        Command::Webhook { command } => run_webhook(command, store),
        Command::Ingest(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let update = store.ingest(&args.webhook, payload)?;
            println!("{}", serde_json::to_string_pretty(&update)?);
            Ok(())
        }
        Command::Pull(args) => run_pull(&args, engine),
        Command::Thread {
            command: ThreadCommand::Show(args),
        } => {
            let key = ThreadKey::new(args.webhook, args.thread_id);
            let thread = store
                .get_thread(&key)?
                .ok_or_else(|| anyhow!("thread not found: {key}"))?;
            println!("{}", serde_json::to_string_pretty(&thread)?);
            Ok(())
        }
        Command::Updates {
            command: UpdatesCommand::List(args),
        } => {
            let page = store.list_updates(&UpdateQuery {
                webhook_name: args.webhook,
                thread_id: args.thread_id,
                status: args.status.map(UpdateStatus::from),
                page: args.page,
                per_page: args.per_page,
                newest_first: !args.oldest_first,
            })?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
    }
}

fn run_webhook(command: WebhookCommand, store: &SqliteUpdateStore) -> Result<()> {
    match command {
        WebhookCommand::Register(args) => {
            let webhook = WebhookConfig {
                name: args.name,
                thread_id_path: WebhookConfig::parse_path(&args.thread_id_path),
                revision_path: WebhookConfig::parse_path(&args.revision_path),
            };
            store.register_webhook(&webhook)?;
            println!("{}", serde_json::to_string_pretty(&webhook)?);
        }
        WebhookCommand::Show(args) => {
            let webhook = store
                .get_webhook(&args.name)?
                .ok_or_else(|| anyhow!("webhook not found: {}", args.name))?;
            println!("{}", serde_json::to_string_pretty(&webhook)?);
        }
        WebhookCommand::List => {
            let webhooks = store.list_webhooks()?;
            println!("{}", serde_json::to_string_pretty(&webhooks)?);
        }
    }
    Ok(())
}

fn run_pull(args: &PullArgs, engine: &DebounceEngine<SqliteUpdateStore>) -> Result<()> {
    let buffer = time::Duration::seconds(i64::from(args.buffer_seconds));
    let Some(scope) = engine.acquire(buffer)? else {
        println!(
            "{}",
            serde_json::to_string_pretty(&PullOutput { update: None })?
        );
        return Ok(());
    };

    match finalize_pull(scope, args.fail_with.as_deref()) {
        Ok(rendered) => {
            println!("{rendered}");
            Ok(())
        }
        Err(PullFailure::Recorded { rendered, error }) => {
            println!("{rendered}");
            Err(error)
        }
        Err(PullFailure::Finalize(error)) => Err(error),
    }
}

enum PullFailure {
    /// `--fail-with` was committed as `error`; the update is still reported.
    Recorded { rendered: String, error: anyhow::Error },
    /// The outcome never committed, so nothing was delivered.
    Finalize(anyhow::Error),
}

/// Commits the pulled update's outcome and renders it. Nothing is rendered
/// unless the commit succeeded.
fn finalize_pull(
    scope: ScopedUpdate<'_, SqliteUpdateStore>,
    fail_with: Option<&str>,
) -> std::result::Result<String, PullFailure> {
    let rendered = serde_json::to_string_pretty(&PullOutput {
        update: Some(scope.update()),
    })
    .map_err(|err| PullFailure::Finalize(err.into()))?;
    let update_id = scope.update().id;

    match fail_with {
        Some(message) => {
            scope
                .fail()
                .map_err(|err| PullFailure::Finalize(err.into()))?;
            info!(update_id = %update_id, "pulled update recorded as failed");
            Err(PullFailure::Recorded {
                rendered,
                error: anyhow!("update {update_id} failed: {message}"),
            })
        }
        None => {
            scope
                .complete()
                .map_err(|err| PullFailure::Finalize(err.into()))?;
            Ok(rendered)
        }
    }
}

fn parse_payload_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}
