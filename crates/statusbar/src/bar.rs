//! Running the registries and connecting them to stdin and stdout.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use itertools::Itertools;
use peer_registry::{
    dbus::{BusTarget, ZbusConnection},
    discovery::run_discovery,
    players::PLAYERS,
    sinks::SINKS,
    tray::TRAY,
    BusConnection, PeerDescriptor, PeerId, Record, RegistryConfig, RegistryHandle,
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{self, UnboundedReceiver},
};
use tokio_util::sync::CancellationToken;

use crate::{auto_select::AutoSelect, command::Command, opts::RunOpts};

/// One line of output: a record, tagged with the kind of registry it came from.
#[derive(Serialize)]
struct OutputLine<'a> {
    kind: &'a str,
    #[serde(flatten)]
    record: &'a Record,
}

fn output_line(kind: &str, record: &Record) -> Result<String> {
    serde_json::to_string(&OutputLine { kind, record }).context("Failed to serialize record")
}

#[derive(Default)]
struct Registries {
    all: Vec<RegistryHandle>,
    players: Option<RegistryHandle>,
}

impl Registries {
    fn players(&self) -> Result<&RegistryHandle> {
        self.players.as_ref().ok_or_else(|| anyhow!("Players are not being mirrored"))
    }
}

pub async fn run(opts: RunOpts, config: RegistryConfig) -> Result<()> {
    let kinds = opts.kinds();
    let shutdown = crate::application_lifecycle::exit_token();
    let session: Arc<dyn BusConnection> =
        Arc::new(ZbusConnection::session().await.context("Failed to connect to the session bus")?);

    let mut registries = Registries::default();
    if kinds.tray {
        let (handle, records) = start(&TRAY, session.clone(), config, &shutdown);
        tokio::spawn(print_records(handle.kind(), records));
        registries.all.push(handle);
    }
    if kinds.sinks {
        // connected by the discovery driver, which keeps retrying while PulseAudio is away
        let pulse: Arc<dyn BusConnection> = Arc::new(ZbusConnection::lazy(BusTarget::PulseAudio));
        let (handle, records) = start(&SINKS, pulse, config, &shutdown);
        tokio::spawn(print_records(handle.kind(), records));
        registries.all.push(handle);
    }
    if kinds.players {
        let (handle, records) = start(&PLAYERS, session.clone(), config, &shutdown);
        tokio::spawn(follow_players(handle.clone(), records, AutoSelect::new(opts.prefer_player)));
        registries.players = Some(handle.clone());
        registries.all.push(handle);
    }
    log::info!("Mirroring {}", registries.all.iter().map(RegistryHandle::kind).join(", "));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    crate::loop_select_exiting! { shutdown;
        line = stdin.next_line(), if stdin_open => match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                crate::print_result_err!("handling command", handle_command(&registries, &line).await);
            }
            Ok(None) => {
                log::debug!("stdin closed, no more commands");
                stdin_open = false;
            }
            Err(err) => {
                log::error!("Failed to read from stdin: {}", err);
                stdin_open = false;
            }
        },
    }

    log::info!("Shutting down");
    shutdown.cancel();
    Ok(())
}

/// Spawn the registry for `descriptor` along with its discovery driver.
fn start(
    descriptor: &'static PeerDescriptor,
    bus: Arc<dyn BusConnection>,
    config: RegistryConfig,
    shutdown: &CancellationToken,
) -> (RegistryHandle, UnboundedReceiver<Record>) {
    let (handle, records) = peer_registry::spawn(descriptor, bus.clone(), config, shutdown.child_token());
    tokio::spawn(run_discovery(descriptor, bus, handle.clone(), config, shutdown.child_token()));
    (handle, records)
}

async fn print_records(kind: &'static str, mut records: UnboundedReceiver<Record>) {
    while let Some(record) = records.recv().await {
        print_record(kind, &record);
    }
}

fn print_record(kind: &str, record: &Record) {
    match output_line(kind, record) {
        Ok(line) => println!("{}", line),
        Err(err) => log::error!("{:?}", err),
    }
}

/// Print player records, binding players as they come and go. Returns once the registry is gone.
async fn follow_players(handle: RegistryHandle, mut records: UnboundedReceiver<Record>, mut auto: AutoSelect) -> AutoSelect {
    let (failed_send, mut failed_recv) = mpsc::unbounded_channel::<PeerId>();
    loop {
        tokio::select! {
            Some(id) = failed_recv.recv() => auto.select_failed(&id),
            record = records.recv() => {
                let Some(record) = record else { break };
                print_record(handle.kind(), &record);
                if let Some(id) = auto.observe(&record) {
                    tokio::spawn(select_player(handle.clone(), id, failed_send.clone()));
                }
            }
        }
    }
    auto
}

async fn select_player(handle: RegistryHandle, id: PeerId, failed: mpsc::UnboundedSender<PeerId>) {
    log::debug!("Selecting player {}", id);
    let result = handle.select(Some(id.clone())).await;
    crate::print_result_err!(format!("selecting {}", id), &result);
    if result.is_err() {
        let _ = failed.send(id);
    }
}

async fn handle_command(registries: &Registries, line: &str) -> Result<()> {
    match line.parse::<Command>()? {
        Command::Select(id) => registries.players()?.select(Some(id)).await?,
        Command::Deselect => registries.players()?.select(None).await?,
        Command::Player(method) => {
            registries.players()?.control(method).await?;
        }
        Command::State => {
            for snapshot in join_all(registries.all.iter().map(RegistryHandle::snapshot)).await {
                println!("{}", serde_json::to_string(&snapshot?)?);
            }
        }
    }
    Ok(())
}
