use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use peerward::config;
use peerward::daemon::CurrentDaemon;
use peerward::firewall::ConfiguredFirewall;
use peerward::ops::{Dispatcher, Mode, Operation, Outcome};
use peerward::reconcile::ReconcileReport;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    #[cfg(not(distribute))]
    {
        fmt()
            .pretty()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Manage the peers of a WireGuard server")]
struct Args {
    /// Path to the settings file
    #[arg(
        short,
        long,
        global = true,
        env = "PEERWARD_CONFIG",
        default_value = "/etc/peerward/peerward.toml"
    )]
    config: PathBuf,

    /// Print what would change without touching anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the server config with a fresh keypair
    Init,
    /// Add a peer, allocating the next free address unless one is given
    Add { name: String, address: Option<Ipv4Addr> },
    /// Remove a peer and archive its client profile
    Remove { name: String },
    /// List peers in config order
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print a peer's client profile
    Show {
        name: String,
        /// Also print the profile as a QR code
        #[arg(long)]
        qr: bool,
    },
    /// Push the on-disk config into the running interface
    Reconcile,
    /// Change the server's listen port
    SetPort { port: u16 },
}

impl Command {
    fn operation(&self) -> Operation {
        match self {
            Self::Init => Operation::Init,
            Self::Add { name, address } => Operation::AddPeer {
                name: name.clone(),
                address: *address,
            },
            Self::Remove { name } => Operation::RemovePeer { name: name.clone() },
            Self::List { .. } => Operation::ListPeers,
            Self::Show { name, qr } => Operation::ShowPeer {
                name: name.clone(),
                qr: *qr,
            },
            Self::Reconcile => Operation::Reconcile,
            Self::SetPort { port } => Operation::SetListenPort { port: *port },
        }
    }
}

#[cfg(target_os = "linux")]
fn current_daemon(interface: &str) -> CurrentDaemon {
    CurrentDaemon::new(interface)
}

#[cfg(not(target_os = "linux"))]
fn current_daemon(_interface: &str) -> CurrentDaemon {
    peerward::daemon::StubDaemon
}

fn describe(report: &ReconcileReport) -> String {
    format!("daemon: {} ({} peers)", report.outcome(), report.peer_count)
}

fn print(outcome: Outcome, json: bool) -> Result<(), serde_json::Error> {
    match outcome {
        Outcome::Planned(steps) => {
            println!("dry run, would:");
            for step in steps {
                println!("  - {step}");
            }
        }
        Outcome::Initialized { path, public_key } => {
            println!("wrote {}", path.display());
            println!("server public key: {public_key}");
        }
        Outcome::Added {
            record,
            profile_path,
            report,
        } => {
            println!("added {} at {}", record.name, record.allowed_ip());
            println!("profile: {}", profile_path.display());
            println!("{}", describe(&report));
        }
        Outcome::Removed { record, report } => {
            println!("removed {} ({})", record.name, record.allowed_ip());
            println!("{}", describe(&report));
        }
        Outcome::Peers(peers) if json => {
            println!("{}", serde_json::to_string_pretty(&peers)?);
        }
        Outcome::Peers(peers) => {
            for peer in peers {
                println!("{}\t{}\t{}", peer.name, peer.allowed_ip(), peer.public_key);
            }
        }
        Outcome::Shown { exported, qr } => {
            print!("{}", exported.text);
            if let Some(qr) = qr {
                println!();
                println!("{qr}");
            }
        }
        Outcome::Reconciled(report) => println!("{}", describe(&report)),
        Outcome::PortChanged {
            previous,
            port,
            report,
        } => {
            match previous {
                Some(old) if old == port => println!("already listening on {port}"),
                Some(old) => println!("listen port {old} -> {port}"),
                None => println!("listen port set to {port}"),
            }
            if let Some(report) = report {
                println!("{}", describe(&report));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let settings = match config::load(&args.config).await {
        Ok(settings) => settings,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "failed to load settings");
            eprintln!("error: {e}");
            return ExitCode::from(peerward::Error::from(e).exit_code());
        }
    };

    let mode = if args.dry_run {
        Mode::Simulate
    } else {
        Mode::Apply
    };
    let json = matches!(args.command, Command::List { json: true });
    let op = args.command.operation();
    info!(command = op.name(), ?mode, interface = %settings.interface, "starting peerward");

    let daemon = current_daemon(&settings.interface);
    let firewall = ConfiguredFirewall::from(settings.firewall);
    let dispatcher = Dispatcher::new(settings, daemon, firewall);

    match dispatcher.run(op, mode).await {
        Ok(outcome) => match print(outcome, json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "operation failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&["peerward", "--config", "f.toml", "add", "laptop"]; "before subcommand")]
    #[test_case(&["peerward", "add", "laptop", "--config", "f.toml"]; "after subcommand")]
    #[test_case(&["peerward", "list", "-c", "f.toml", "--dry-run"]; "short form")]
    fn config_flag_is_accepted_anywhere(argv: &[&str]) {
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.config, PathBuf::from("f.toml"));
    }
}
