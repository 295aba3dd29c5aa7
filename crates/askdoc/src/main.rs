// askdoc/crates/askdoc/src/main.rs

#[cfg(feature = "cli")]
use askdoc::{
    config::Config,
    documents::{StoredUpload, PDF_MIME_TYPE},
    run_worker_server,
    workers::DOCUMENT_QUEUE_NAME,
    AppState,
};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "askdoc", about = "Document ingestion workers and document chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the document workers until Ctrl-C
    Worker,
    /// Store a PDF and queue it for ingestion
    Upload {
        #[arg(long)]
        user: String,
        file: PathBuf,
        /// Progress event target, such as a client socket id
        #[arg(long)]
        notify: Option<String>,
    },
    /// List a user's documents and sessions
    Status {
        #[arg(long)]
        user: String,
    },
    /// Ask a question in a session
    Chat {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        message: String,
    },
    /// Job counts for the document queue
    QueueStats,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command {
        Command::Worker => return run_worker_server(cfg).await,
        Command::Upload { user, file, notify } => {
            let state = open_state(cfg)?;
            let original_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow::anyhow!("'{}' is not a file path", file.display()))?;
            let is_pdf = file
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("pdf"));
            let (path, size_bytes) = state.documents.store_file(&file, &original_name).await?;
            let receipt = state
                .documents
                .upload(StoredUpload {
                    external_user_id: user,
                    email: None,
                    original_name,
                    path,
                    size_bytes,
                    mime_type: if is_pdf { PDF_MIME_TYPE } else { "application/octet-stream" }.to_string(),
                    notify_target: notify,
                })
                .await?;
            println!(
                "Queued document {} (namespace {}) as job {}",
                receipt.document.id, receipt.document.namespace, receipt.job_id
            );
        }
        Command::Status { user } => {
            let state = open_state(cfg)?;
            let Some(user) = state.records.users.get_user_by_external_id(&user)? else {
                println!("No documents for '{}'", user);
                return Ok(());
            };
            for document in state.documents.list(&user.id)? {
                println!(
                    "{}  {:<10}  {}  {}",
                    document.id,
                    document.status,
                    document.original_name,
                    document.error.as_deref().unwrap_or("")
                );
            }
            for session in state.chat.list_sessions(&user.id)? {
                println!(
                    "session {}  {}  ({} messages, {} tokens)",
                    session.id, session.title, session.message_count, session.metadata.total_tokens
                );
            }
        }
        Command::Chat { user, session, message } => {
            let state = open_state(cfg)?;
            let user = state
                .records
                .users
                .get_user_by_external_id(&user)?
                .ok_or_else(|| anyhow::anyhow!("unknown user '{}'", user))?;
            let reply = state.chat.send_message(&session, &user.id, &message).await?;
            println!("{}", reply.assistant_message.content);
            if let Some(metadata) = &reply.assistant_message.metadata {
                for source in &metadata.sources {
                    match source.page {
                        Some(page) => println!("  [page {}] {}", page, source.content.lines().next().unwrap_or("")),
                        None => println!("  {}", source.content.lines().next().unwrap_or("")),
                    }
                }
            }
        }
        Command::QueueStats => {
            let state = open_state(cfg)?;
            let counts = state.jobs.counts(DOCUMENT_QUEUE_NAME)?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }
    Ok(())
}

/// Commands other than `worker` print their own output, so logging stays quiet.
#[cfg(feature = "cli")]
fn open_state(cfg: Config) -> anyhow::Result<AppState> {
    askdoc::telemetry::init_tracing_with("warn");
    AppState::new(cfg)
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
