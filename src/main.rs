// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peerpad::config::{SessionConfig, SyncthingSettings, DEFAULT_PORT};
use peerpad::connection::ConnectionState;
use peerpad::session::{Event, Session};
use peerpad::{logging, protocol::SyncStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// API key of the local Syncthing daemon, for folder sync.
    #[arg(long, global = true, env = "SYNCTHING_API_KEY")]
    syncthing_api_key: Option<String>,
    /// Run the pad without Syncthing folder sync.
    #[arg(long, global = true, action)]
    no_folder_sync: bool,
    /// Enable verbose debug output.
    #[arg(short, long, global = true, action)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the other peer to connect to this machine.
    Host {
        /// Port to listen on.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Connect to a hosting peer.
    Connect {
        /// Address of the host, optionally with a port ("192.168.1.5:9876").
        address: String,
        /// Port of the host, unless given as part of the address.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

fn split_address(address: &str, default_port: u16) -> Result<(String, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in address {address}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((address.to_string(), default_port)),
    }
}

fn session_config(cli: &Cli) -> SessionConfig {
    if cli.no_folder_sync {
        return SessionConfig::default();
    }
    let Some(api_key) = cli.syncthing_api_key.clone() else {
        info!("No Syncthing API key given, running without folder sync");
        return SessionConfig::default();
    };
    SessionConfig {
        syncthing: Some(SyncthingSettings::new(api_key)),
    }
}

fn print_events(mut events: broadcast::Receiver<Event>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Connection(state)) => match state {
                    ConnectionState::Connected { peer } => {
                        println!("* connected to {peer}");
                    }
                    state => println!("* {state}"),
                },
                Ok(Event::Remote(content)) => {
                    println!("--- peer pad ---");
                    print!("{content}");
                    println!("----------------");
                }
                Ok(Event::Sync(status)) => {
                    if status == SyncStatus::SameMachine {
                        println!("* folder sync: {status} (both peers are on this machine)");
                    } else {
                        println!("* folder sync: {status}");
                    }
                }
                Ok(Event::TransportError(error)) => {
                    println!("* connection error: {error}");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event printer lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Reads the local pad from stdin, one line at a time. "/clear" wipes both
/// pads; every other line is appended to the local pad and pushed whole.
async fn run_pad(session: &Session) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pad = String::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim() == "/clear" {
                    pad.clear();
                    if let Err(err) = session.send_clear().await {
                        println!("* not delivered: {err}");
                    }
                } else {
                    pad.push_str(&line);
                    pad.push('\n');
                    if let Err(err) = session.send_local_edit(pad.clone()).await {
                        println!("* not delivered: {err}");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                break;
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();

    logging::initialize(cli.debug)?;

    let session = Session::new(session_config(&cli));
    print_events(session.subscribe());

    match &cli.command {
        Commands::Host { port } => {
            let bound = session.host(*port).await?;
            println!("* waiting for a peer on port {bound}");
        }
        Commands::Connect { address, port } => {
            let (host, port) = split_address(address, *port)?;
            if host.is_empty() {
                bail!("Empty host in address {address}");
            }
            session.connect(&host, port).await?;
        }
    }

    run_pad(&session).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn address_with_port_overrides_the_default() {
        let (host, port) = split_address("192.168.1.5:4000", DEFAULT_PORT).unwrap();
        assert_eq!(host, "192.168.1.5");
        assert_eq!(port, 4000);
    }

    #[test]
    fn bare_address_uses_the_default_port() {
        let (host, port) = split_address("192.168.1.5", DEFAULT_PORT).unwrap();
        assert_eq!(host, "192.168.1.5");
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn garbage_port_is_an_error() {
        assert!(split_address("host:notaport", DEFAULT_PORT).is_err());
    }
}
