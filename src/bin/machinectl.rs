//! `machinectl` — operator CLI for `machine-runtimed` (spec §10.6).
//!
//! Dials the daemon's UNIX-socket gRPC surface directly; there is no local
//! state, every subcommand is a single round trip.

use clap::{Parser, Subcommand, ValueEnum};
use nexa_machine_runtime::pb;
use pb::machine_runtime_client::MachineRuntimeClient;
use std::path::PathBuf;
use std::process::ExitCode;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Request;
use tower::service_fn;

#[derive(Debug, Parser)]
#[command(name = "machinectl", version, about = "Control machine-runtimed over its UNIX socket")]
struct Cli {
    /// Path to the daemon's gRPC socket.
    #[arg(long, env = "RUNTIME_LISTEN", default_value = "/run/nexa/machine-runtime.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the daemon's name and version.
    Version,
    /// Print per-class fit counts.
    Status,
    /// Create a machine of the named class.
    Create {
        class: String,
        #[arg(long, value_enum, default_value = "off")]
        power: PowerArg,
        /// Repeatable `key=value` label.
        #[arg(long = "label", value_parser = parse_key_val)]
        labels: Vec<(String, String)>,
    },
    /// List machines, or show one by id.
    List {
        id: Option<String>,
    },
    /// Delete a machine by id.
    Delete {
        id: String,
    },
    /// Power a machine on or off.
    Power {
        id: String,
        #[arg(value_enum)]
        state: PowerArg,
    },
    /// Mint an exec session and print its streaming URL.
    Exec {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PowerArg {
    On,
    Off,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("machinectl: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn connect(socket: PathBuf) -> anyhow::Result<MachineRuntimeClient<Channel>> {
    // The URI is never dialed as network address; the connector below always
    // routes through the UNIX socket at `socket` regardless of what's here.
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { tokio::net::UnixStream::connect(socket).await }
        }))
        .await?;
    Ok(MachineRuntimeClient::new(channel))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut client = connect(cli.socket).await?;

    match cli.command {
        Command::Version => {
            let resp = client.version(Request::new(pb::VersionRequest {})).await?.into_inner();
            println!("{} {}", resp.runtime_name, resp.semver);
        }
        Command::Status => {
            let resp = client.status(Request::new(pb::StatusRequest {})).await?.into_inner();
            for class in resp.classes {
                println!("{:<20} {}", class.class, class.fit_count);
            }
        }
        Command::Create { class, power, labels } => {
            let resp = client
                .create_machine(Request::new(pb::CreateMachineRequest {
                    id: String::new(),
                    spec: Some(pb::MachineSpec { class, power: power_to_i32(power), ..Default::default() }),
                    labels: labels.into_iter().collect(),
                    annotations: Default::default(),
                    finalizers: vec![],
                }))
                .await?
                .into_inner();
            println!("created {}", resp.metadata.unwrap_or_default().id);
        }
        Command::List { id } => {
            let resp = client
                .list_machines(Request::new(pb::ListMachinesRequest { id, label_selector: Default::default() }))
                .await?
                .into_inner();
            for m in resp.machines {
                let meta = m.metadata.unwrap_or_default();
                let spec = m.spec.unwrap_or_default();
                let power = pb::Power::try_from(spec.power).unwrap_or(pb::Power::Unspecified);
                println!("{:<36} {:<16} power={:?}", meta.id, spec.class, power);
            }
        }
        Command::Delete { id } => {
            client.delete_machine(Request::new(pb::DeleteMachineRequest { id: id.clone() })).await?;
            println!("deleted {id}");
        }
        Command::Power { id, state } => {
            client
                .update_machine_power(Request::new(pb::UpdateMachinePowerRequest { id: id.clone(), power: power_to_i32(state) }))
                .await?;
            println!("{id} power set to {state:?}");
        }
        Command::Exec { id } => {
            let resp = client.exec(Request::new(pb::ExecRequest { id })).await?.into_inner();
            println!("{}", resp.streaming_url);
        }
    }
    Ok(())
}

fn power_to_i32(p: PowerArg) -> i32 {
    match p {
        PowerArg::On => pb::Power::On as i32,
        PowerArg::Off => pb::Power::Off as i32,
    }
}
