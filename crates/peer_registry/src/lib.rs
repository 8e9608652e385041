//! Live mirror of the peers a status bar shows: tray items, audio sinks and media players.
//!
//! Each kind of peer is described by a static [`PeerDescriptor`] ([`tray::TRAY`],
//! [`sinks::SINKS`], [`players::PLAYERS`]). A [`Registry`] keeps the table of peers of one kind
//! and turns bus events into a stream of [`Record`]s, while a discovery driver
//! ([`discovery::run_discovery`]) feeds it from a [`BusConnection`].

pub mod dbus;
pub mod descriptor;
pub mod discovery;
pub mod players;
pub mod registry;
pub mod sinks;
pub mod tray;

mod bus;
pub use bus::*;

mod config;
pub use config::RegistryConfig;

mod error;
pub use error::*;

mod peer;
pub use peer::*;

mod value;
pub use value::{properties_from_bus, Properties, Value};

pub use descriptor::{
    Change, ControlChannel, Discovery, Lifecycle, PeerDescriptor, PrepareFn, PropertyMap, SelectionMode, SnapshotSource,
    PROPERTIES_INTERFACE,
};
pub use registry::{spawn, ConnectionStatus, Record, Registry, RegistryHandle, RegistrySnapshot};

#[cfg(test)]
mod testing;
