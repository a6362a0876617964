//! Ferry - Passphrase-Rendezvous File Transfer

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use libp2p::{identity, PeerId};
use sha2::{Digest, Sha256};
use tracing::info;

use ferry_node::network::discovery::{DhtClient, ZeroconfMdns};
use ferry_node::network::pake::Spake2KeyExchange;
use ferry_node::network::swarm::start_network;
use ferry_node::network::{Host, NetworkConfig, SessionOutcome, SessionSupervisor};
use ferry_node::telemetry::{self, TelemetryConfig};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Peer-to-peer file transfer over a short shared code", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make the given file available to your peer
    Send {
        /// Path to the file to send
        file: PathBuf,
    },
    /// Receive the file offered under the given transfer code
    Receive {
        /// Transfer code shown by the sender, e.g. "421-9f31d2c07a88"
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing(TelemetryConfig::from_env());

    let cli = Cli::parse();
    let config = NetworkConfig::from_env();

    match cli.command {
        Commands::Send { file } => send(file, config).await,
        Commands::Receive { code } => receive(code, config).await,
    }
}

async fn send(file: PathBuf, config: NetworkConfig) -> Result<()> {
    validate_file(&file)?;

    let keypair = identity::Keypair::generate_ed25519();
    let (channel, password) = derive_code(&keypair.public().to_peer_id());
    println!("Code is:  {channel}-{password}");
    println!("On the other machine run:");
    println!("\tferry receive {channel}-{password}");

    let (host, auth_rx) = start_network(&config, keypair, channel, &password)?;
    let host_dyn: Arc<dyn Host> = host.clone();
    let dht_dyn: Arc<dyn DhtClient> = host.clone();
    let mdns = Arc::new(ZeroconfMdns::new(host_dyn.clone())?);

    let supervisor =
        SessionSupervisor::sender(channel, config, host_dyn, dht_dyn, mdns, auth_rx)
            .map_err(|e| anyhow!(e))?;
    let outcome = run_session(supervisor).await;
    finish(outcome, &file)
}

async fn receive(code: String, config: NetworkConfig) -> Result<()> {
    let (channel, password) = parse_code(&code)?;

    let keypair = identity::Keypair::generate_ed25519();
    let (host, _auth_rx) = start_network(&config, keypair, channel, &password)?;
    let host_dyn: Arc<dyn Host> = host.clone();
    let dht_dyn: Arc<dyn DhtClient> = host.clone();
    let mdns = Arc::new(ZeroconfMdns::new(host_dyn.clone())?);
    let key_exchange = Arc::new(Spake2KeyExchange::new(host.clone(), channel, &password));

    let supervisor = SessionSupervisor::receiver(
        channel,
        config,
        host_dyn,
        dht_dyn,
        mdns,
        key_exchange,
    )
    .map_err(|e| anyhow!(e))?;
    let outcome = run_session(supervisor).await;
    finish(outcome, Path::new("-"))
}

/// Runs the session with an interrupt handler wired to session shutdown.
async fn run_session(supervisor: SessionSupervisor) -> SessionOutcome {
    let cancel = supervisor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            cancel.cancel();
        }
    });
    supervisor.run().await
}

fn finish(outcome: SessionOutcome, file: &Path) -> Result<()> {
    println!("{}", outcome.describe());
    match outcome {
        SessionOutcome::Ready { peer_id, .. } => {
            info!(
                peer_id = %peer_id,
                file = %file.display(),
                "Peer authenticated over a direct connection, transfer stream takes over"
            );
            Ok(())
        }
        SessionOutcome::Cancelled | SessionOutcome::Stopped => Ok(()),
        SessionOutcome::Failed(e) => Err(anyhow!(e)),
    }
}

/// Checks early that we may actually read the file.
fn validate_file(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("please specify the file you want to transfer");
    }
    let metadata = File::open(path)
        .and_then(|f| f.metadata())
        .with_context(|| format!("opening {}", path.display()))?;
    if metadata.is_dir() {
        bail!("directories are not supported yet");
    }
    Ok(())
}

/// Derives the transfer code from a fresh peer identity: a numeric channel
/// and the password proven by the key exchange. The word-list rendering of
/// codes lives outside this binary.
fn derive_code(peer_id: &PeerId) -> (u32, String) {
    let digest = Sha256::digest(peer_id.to_bytes());
    let channel = (u32::from(digest[0]) << 8 | u32::from(digest[1])) % 1000;
    let password = digest[2..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    (channel, password)
}

/// Splits "channel-password" back apart.
fn parse_code(code: &str) -> Result<(u32, String)> {
    let mut parts = code.splitn(2, '-');
    let channel = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| anyhow!("invalid code: expected \"<channel>-<password>\""))?;
    let password = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("invalid code: missing password part"))?;
    Ok((channel, password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        let peer_id = PeerId::random();
        let (channel, password) = derive_code(&peer_id);
        assert!(channel < 1000);
        assert_eq!(password.len(), 12);

        let code = format!("{channel}-{password}");
        let (parsed_channel, parsed_password) = parse_code(&code).unwrap();
        assert_eq!(parsed_channel, channel);
        assert_eq!(parsed_password, password);
    }

    #[test]
    fn malformed_codes_are_rejected() {
        assert!(parse_code("no-channel-here").is_err());
        assert!(parse_code("abc").is_err());
        assert!(parse_code("42").is_err());
        assert!(parse_code("42-").is_err());
    }
}
