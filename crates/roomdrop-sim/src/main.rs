mod report;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use roomdrop_protocol::{
    ClientParts, ConditionSpec, EncryptionSettings, InstallationToken, LocalConditionGateway,
    MemoryStorage, RawFile, RoomdropClient, SendOutcome, SessionConfig, Settings, StaticOracle,
};
use roomdrop_protocol::same_content;
use roomdrop_transport::MemoryNetwork;

use report::{DownloadReport, FileReport, Report};

const BOOTSTRAP: &str = "/dns4/sim-boot/tcp/443/wss";

#[derive(Parser)]
#[command(
    name = "roomdrop-sim",
    about = "Run a sender and N receivers in one in-memory room"
)]
struct Cli {
    /// Room identifier.
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Number of receiving peers.
    #[arg(long, default_value = "2")]
    peers: usize,

    /// Seal files under the access condition before upload.
    #[arg(long)]
    encrypt: bool,

    /// Access condition as "<method> <comparator> <value>".
    #[arg(long, default_value = "balance > 0")]
    condition: String,

    /// Receivers do not satisfy the access condition.
    #[arg(long)]
    deny: bool,

    /// Write downloaded files into this directory (one subdirectory per peer).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Seconds to wait for announcements to reach every receiver.
    #[arg(long, default_value = "5")]
    wait: u64,

    /// Files to share. A generated sample is used when none are given.
    files: Vec<PathBuf>,
}

fn parse_condition(raw: &str) -> anyhow::Result<ConditionSpec> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    let [method, comparator, value] = parts.as_slice() else {
        bail!("condition must look like \"balance > 0\", got {raw:?}");
    };
    Ok(ConditionSpec::new("ethereum", *method, *comparator, *value))
}

fn load_files(paths: &[PathBuf]) -> anyhow::Result<Vec<RawFile>> {
    if paths.is_empty() {
        let data = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        return Ok(vec![RawFile::new(
            "sample.bin",
            "application/octet-stream",
            data,
        )]);
    }
    paths
        .iter()
        .map(|path| {
            RawFile::from_path(path).with_context(|| format!("reading {}", path.display()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let condition = parse_condition(&cli.condition)?;
    let files = load_files(&cli.files)?;

    let network = MemoryNetwork::with_endpoints([BOOTSTRAP]);
    let storage = Arc::new(MemoryStorage::new());
    let secret: [u8; 32] = rand::random();

    let settings = Settings::new(&cli.room);
    settings.validate()?;

    let open = |satisfies: bool| {
        let parts = ClientParts::new(
            Arc::new(network.factory()),
            storage.clone(),
            Arc::new(LocalConditionGateway::new(secret, StaticOracle(satisfies))),
            InstallationToken::generate(),
        )
        .session_config(SessionConfig::new().bootstrap([BOOTSTRAP]));
        RoomdropClient::open(settings.clone(), parts)
    };

    eprintln!("roomdrop-sim v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("room: {}  receivers: {}", cli.room, cli.peers);

    let sender = open(true).await?;
    let mut receivers = Vec::with_capacity(cli.peers);
    for _ in 0..cli.peers {
        receivers.push(open(!cli.deny).await?);
    }

    if cli.encrypt {
        sender.set_encryption(EncryptionSettings::with_condition(condition));
    }

    // ── Send ────────────────────────────────────────────────────────
    let originals: HashMap<String, Vec<u8>> = files
        .iter()
        .map(|f| (f.name.clone(), f.data.clone()))
        .collect();
    let outcomes = sender.coordinator().send_files(files).outcomes().await?;
    let mut file_reports = Vec::new();
    for outcome in &outcomes {
        match outcome {
            SendOutcome::Sent {
                item_id,
                file_id,
                published,
            } => {
                let name = sender
                    .coordinator()
                    .sent_items()
                    .into_iter()
                    .find(|i| &i.id == item_id)
                    .map(|i| i.file_name)
                    .unwrap_or_default();
                eprintln!("sent {name} -> {file_id} (announced: {published})");
                file_reports.push(FileReport::sent(name, file_id.clone(), *published));
            }
            SendOutcome::Failed { item_id, error } => {
                let name = sender
                    .coordinator()
                    .uploading_items()
                    .into_iter()
                    .find(|i| &i.id == item_id)
                    .map(|i| i.file_name)
                    .unwrap_or_else(|| item_id.to_string());
                eprintln!("failed {name}: {}", error.user_message());
                file_reports.push(FileReport::failed(name, error.to_string()));
            }
        }
    }
    let announced = outcomes
        .iter()
        .filter(|o| matches!(o, SendOutcome::Sent { published: true, .. }))
        .count();

    // ── Receive + download ──────────────────────────────────────────
    let mut downloads = Vec::new();
    for (peer, receiver) in receivers.iter().enumerate() {
        let mut rx = receiver.coordinator().watch_received();
        let arrived = tokio::time::timeout(
            Duration::from_secs(cli.wait),
            rx.wait_for(|items| items.len() >= announced),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        if !arrived {
            tracing::warn!(peer, "not every announcement arrived in time");
        }

        for item in receiver.coordinator().received_items() {
            let result = receiver.coordinator().download_file(&item.id).await;
            let entry = match result {
                Ok(file) => {
                    let saved = match &cli.out_dir {
                        Some(dir) => Some(file.save_in(dir.join(format!("peer-{peer}")))?),
                        None => None,
                    };
                    let verified = originals
                        .get(&file.file_name)
                        .is_some_and(|original| same_content(original, &file.data));
                    if !verified {
                        tracing::warn!(peer, file = %file.file_name, "download differs from the sent file");
                    }
                    DownloadReport::ok(peer, &file.file_name, file.data.len(), verified, saved)
                }
                Err(e) => {
                    eprintln!("peer {peer}: {}", e.user_message());
                    DownloadReport::failed(peer, &item.file_name, &e)
                }
            };
            downloads.push(entry);
        }
    }

    let report = Report {
        room: cli.room.clone(),
        encrypted: cli.encrypt,
        files: file_reports,
        downloads,
        sender: sender.metrics(),
        receivers: receivers.iter().map(|r| r.metrics()).collect(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    sender.close().await;
    for receiver in &receivers {
        receiver.close().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_parsing() {
        let spec = parse_condition("balance >= 10").unwrap();
        assert_eq!(spec.description(), "balance >= 10");
        assert!(parse_condition("balance").is_err());
    }

    #[test]
    fn cli_flags() {
        let cli = Cli::parse_from([
            "roomdrop-sim",
            "--room",
            "annex",
            "--peers",
            "3",
            "--encrypt",
            "--deny",
            "a.txt",
        ]);
        assert_eq!(cli.room, "annex");
        assert_eq!(cli.peers, 3);
        assert!(cli.encrypt && cli.deny);
        assert_eq!(cli.files, vec![PathBuf::from("a.txt")]);
    }
}
