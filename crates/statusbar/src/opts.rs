use std::time::Duration;

use clap::{Parser, Subcommand};
use peer_registry::RegistryConfig;

/// Struct that gets generated from `RawOpt`.
#[derive(Debug, PartialEq)]
pub struct Opt {
    pub log_debug: bool,
    pub config: RegistryConfig,
    pub action: Action,
}

#[derive(Parser, Debug, PartialEq)]
#[command(version, about)]
pub(super) struct RawOpt {
    /// Write out debug logs.
    #[arg(long = "debug", global = true)]
    log_debug: bool,

    /// How long to wait for any single bus call, in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    call_timeout_ms: Option<u64>,

    /// How long a peer that could not be introspected is kept before it is dropped, in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    grace_ms: Option<u64>,

    /// Delay between losing a bus connection and reconnecting, in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    reconnect_ms: Option<u64>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Action {
    /// Generate a shell completion script
    #[command(name = "completions")]
    ShellCompletions {
        #[arg(short, long)]
        shell: clap_complete::shells::Shell,
    },

    /// Mirror the peers on the bus, printing every change as a JSON line.
    ///
    /// Without any of the kind flags, all kinds are mirrored.
    /// While running, commands are read from stdin: `select <id>`, `deselect`, `play-pause`,
    /// `play`, `pause`, `next`, `previous`, `stop` and `state`.
    #[command(name = "run", alias = "r")]
    Run(RunOpts),
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOpts {
    /// Mirror tray items.
    #[arg(long)]
    pub tray: bool,

    /// Mirror the sinks of the PulseAudio server.
    #[arg(long)]
    pub sinks: bool,

    /// Mirror media players.
    #[arg(long)]
    pub players: bool,

    /// Bind to a player whose bus name starts with this prefix whenever one shows up,
    /// e.g. `org.mpris.MediaPlayer2.spotify`.
    #[arg(long, value_name = "PREFIX")]
    pub prefer_player: Option<String>,
}

impl RunOpts {
    /// The peer kinds to mirror, in the order they are started.
    pub fn kinds(&self) -> Kinds {
        let all = !self.tray && !self.sinks && !self.players;
        Kinds { tray: all || self.tray, sinks: all || self.sinks, players: all || self.players }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kinds {
    pub tray: bool,
    pub sinks: bool,
    pub players: bool,
}

impl Opt {
    pub fn from_env() -> Self {
        let raw: RawOpt = RawOpt::parse();
        raw.into()
    }
}

impl From<RawOpt> for Opt {
    fn from(other: RawOpt) -> Self {
        let RawOpt { log_debug, call_timeout_ms, grace_ms, reconnect_ms, action } = other;
        let defaults = RegistryConfig::default();
        let config = RegistryConfig {
            call_timeout: call_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.call_timeout),
            failed_grace: grace_ms.map(Duration::from_millis).unwrap_or(defaults.failed_grace),
            reconnect_delay: reconnect_ms.map(Duration::from_millis).unwrap_or(defaults.reconnect_delay),
        };
        Opt { log_debug, config, action }
    }
}
