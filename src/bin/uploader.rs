use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use drive_uploads::{
    config::UploaderConfig,
    session::{Session, SessionHandle},
    HttpUploadApi, ManagerOptions, SqliteUploadStore, UploadManager, UploadRecord, UploadSummary,
};

const USAGE: &str = "Usage: uploader <command>
  add <path>... [--folder <uuid>]   queue files and upload them
  resume                            resume interrupted uploads
  retry <id>                        retry a paused or failed upload
  list                              show stored uploads
  purge                             delete completed uploads
  remove <id>                       cancel and delete an upload";

enum Command {
    Add {
        paths: Vec<PathBuf>,
        folder: Option<Uuid>,
    },
    Resume,
    Retry(Uuid),
    List,
    Purge,
    Remove(Uuid),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let command = match parse_command(env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err}\n{USAGE}");
            std::process::exit(1);
        }
    };

    let config = UploaderConfig::from_env()?;
    tracing::info!(
        component = "uploader",
        api_base_url = %config.redacted_api_base_url(),
        database_path = %config.database_path,
        pool_size = config.database_max_pool_size,
        concurrency = config.upload_concurrency,
        "loaded uploader configuration"
    );

    let store = Arc::new(SqliteUploadStore::open(
        &config.database_path,
        config.database_max_pool_size,
    )?);
    let session = SessionHandle::new(session_from_config(&config));
    let api = Arc::new(HttpUploadApi::from_config(&config, session.clone())?);
    let manager = UploadManager::new(store, api, session, ManagerOptions::from(&config));

    match command {
        Command::List => {
            manager.refresh().await?;
            print_uploads(&manager.uploads());
            return Ok(());
        }
        Command::Purge => {
            let purged = manager.purge_completed().await?;
            println!("purged {purged} completed uploads");
            return Ok(());
        }
        Command::Remove(id) => {
            manager.remove_upload(id).await?;
            println!("removed {id}");
            return Ok(());
        }
        Command::Add { paths, folder } => {
            manager.start().await?;
            for path in paths {
                let record = manager
                    .add_file(&path, folder)
                    .await
                    .with_context(|| format!("failed to add {}", path.display()))?;
                println!("queued {} as {}", path.display(), record.id);
            }
        }
        Command::Resume => manager.start().await?,
        Command::Retry(id) => {
            manager.start().await?;
            let status = manager.retry_upload(id).await?;
            println!("{id} is {status}");
        }
    }

    tokio::select! {
        result = manager.wait_idle() => result?,
        _ = signal::ctrl_c() => {
            tracing::info!("uploader received shutdown signal");
            manager.shutdown().await?;
        }
    }

    manager.refresh().await?;
    print_uploads(&manager.uploads());
    Ok(())
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = match args.next().as_deref() {
        Some("add") => {
            let mut paths = Vec::new();
            let mut folder = None;
            while let Some(arg) = args.next() {
                if arg == "--folder" {
                    let value = args.next().context("--folder needs a value")?;
                    folder = Some(value.parse::<Uuid>().context("--folder must be a UUID")?);
                } else {
                    paths.push(PathBuf::from(arg));
                }
            }
            if paths.is_empty() {
                bail!("add needs at least one path");
            }
            Command::Add { paths, folder }
        }
        Some("resume") => Command::Resume,
        Some("retry") => Command::Retry(parse_id(args.next())?),
        Some("list") => Command::List,
        Some("purge") => Command::Purge,
        Some("remove") => Command::Remove(parse_id(args.next())?),
        Some(cmd) => bail!("Unknown command: {cmd}"),
        None => bail!("Missing command"),
    };
    Ok(command)
}

fn parse_id(arg: Option<String>) -> Result<Uuid> {
    let arg = arg.context("missing upload id")?;
    arg.parse::<Uuid>()
        .with_context(|| format!("invalid upload id: {arg}"))
}

/// A configured token or user id counts as a signed-in session.
fn session_from_config(config: &UploaderConfig) -> Option<Session> {
    if config.api_token.is_none() && config.user_id.is_none() {
        return None;
    }
    Some(Session {
        user_id: config.user_id.unwrap_or_default(),
        access_token: config.api_token.clone(),
    })
}

fn print_uploads(records: &[UploadRecord]) {
    for record in records {
        let error = record.error.as_deref().unwrap_or("");
        println!(
            "{}  {:<9} {:>3}%  {}  {}",
            record.id,
            record.status.as_str(),
            record.progress,
            record.file_name,
            error
        );
    }
    let summary = UploadSummary::from_records(records);
    println!(
        "{} uploads: {} in progress, {} paused, {} failed, {} done",
        summary.total, summary.in_progress, summary.paused, summary.failed, summary.done
    );
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
