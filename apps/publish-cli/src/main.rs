//! deltapush entry point.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deltapush_protocol::{ComponentKind, DescriptorStatus, RemoteFileRecord, Version};
use deltapush_publish::{PublishConfig, PublishEvent, Publisher, UploadRequest};
use deltapush_remote::{HttpRemoteFiles, RemoteFiles};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

/// Bearer token read from the environment, overriding the config file.
const TOKEN_ENV: &str = "DELTAPUSH_TOKEN";

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish files to a versioned-file service, sending only what changed")]
struct Cli {
    /// Config file (defaults to the per-user config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Service base URL (overrides the config file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file as the next version of a record
    Publish {
        /// File to publish
        path: PathBuf,

        /// Record to publish into; a new record is created when omitted
        #[arg(long)]
        id: Option<String>,

        /// Display name of a new record (defaults to the file name)
        #[arg(long, default_value = "")]
        name: String,

        /// MIME type (inferred from the extension by default)
        #[arg(long)]
        mime: Option<String>,

        /// Always send the full file
        #[arg(long)]
        no_delta: bool,
    },
    /// List the versions of a record
    Show {
        /// Record id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.remote.base_url = base_url;
    }
    if let Some(token) = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()) {
        config.remote.auth_token = Some(token);
    }

    let remote =
        Arc::new(HttpRemoteFiles::new(&config.remote).context("creating service client")?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.remote.base_url,
        "starting deltapush"
    );

    match cli.command {
        Command::Publish {
            path,
            id,
            name,
            mime,
            no_delta,
        } => {
            let mut publish_config = config.publish;
            if no_delta {
                publish_config.delta_enabled = false;
            }
            let mut request = UploadRequest::new(path, name);
            request.existing_id = id;
            request.mime_type = mime;
            publish(remote, publish_config, request).await
        }
        Command::Show { id } => show(remote.as_ref(), &id).await,
    }
}

async fn publish(
    remote: Arc<HttpRemoteFiles>,
    config: PublishConfig,
    request: UploadRequest,
) -> anyhow::Result<()> {
    let mut publisher = Publisher::new(remote.clone(), remote, config);
    let mut events = publisher
        .take_events()
        .context("event receiver already taken")?;

    let cancel = publisher.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling upload");
            cancel.cancel();
        }
    });

    let renderer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = progress_line(&event) {
                eprintln!("{line}");
            }
        }
    });

    let result = publisher.publish(request).await;
    // Closes the event channel so the renderer drains and exits.
    drop(publisher);
    let _ = renderer.await;

    match result {
        Ok(done) => {
            println!("{} v{}: {}", done.record.id, done.outcome.version(), done.message);
            Ok(())
        }
        Err(e) if e.is_cancelled() => anyhow::bail!("upload cancelled"),
        Err(e) => {
            let summary = e.summary();
            Err(anyhow::Error::new(e).context(summary))
        }
    }
}

async fn show(remote: &dyn RemoteFiles, id: &str) -> anyhow::Result<()> {
    let record = remote
        .fetch_record(id)
        .await
        .with_context(|| format!("fetching record {id}"))?;
    for line in describe_record(&record) {
        println!("{line}");
    }
    Ok(())
}

fn progress_line(event: &PublishEvent) -> Option<String> {
    match event {
        PublishEvent::Progress {
            fraction,
            status,
            sub_status,
            ..
        } => {
            let percent = fraction * 100.0;
            if sub_status.is_empty() {
                Some(format!("[{percent:>5.1}%] {status}"))
            } else {
                Some(format!("[{percent:>5.1}%] {status}: {sub_status}"))
            }
        }
        _ => None,
    }
}

fn status_label(status: DescriptorStatus) -> &'static str {
    match status {
        DescriptorStatus::None => "-",
        DescriptorStatus::Waiting => "waiting",
        DescriptorStatus::Complete => "complete",
        DescriptorStatus::Error => "error",
    }
}

fn describe_version(v: &Version) -> String {
    let size = v
        .descriptor(ComponentKind::Primary)
        .map(|d| d.size_in_bytes)
        .unwrap_or(0);
    let delta = match v.descriptor(ComponentKind::Delta) {
        Some(d) => format!("delta {} B", d.size_in_bytes),
        None => "full".to_string(),
    };
    format!(
        "v{:<4} {:<9} {:>12} B  {delta}",
        v.version,
        status_label(v.status),
        size
    )
}

fn describe_record(record: &RemoteFileRecord) -> Vec<String> {
    let mut lines = vec![format!("{} ({}) {}", record.name, record.id, record.mime_type)];
    lines.extend(record.live_versions().map(describe_version));
    lines
}
