//! Static description of a kind of peer.
//!
//! A registry never branches on what kind of peer it manages. Everything that differs between
//! tray items, audio sinks and media players lives in a [`PeerDescriptor`], a table of constants
//! and plain functions supplied once when the registry is created.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{BusConnection, BusResult, PeerAddress, PeerId, Properties, SignalEvent, SignalSpec, Value};

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Every active peer is mirrored, none is special.
    Multi,
    /// On top of the mirror, at most one peer is bound as the control target.
    Single,
}

/// What a discovery signal means for the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Appeared(String),
    Vanished(String),
}

/// How a property-change signal should be turned into a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The signal carries the changed (raw) properties.
    Delta(Properties),
    /// The signal only says that these properties changed; they have to be fetched.
    Refetch(&'static [&'static str]),
}

/// Where the full list of currently live peers comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Bus names starting with the given prefix.
    NamesWithPrefix(&'static str),
    /// A list-valued property of some well-known object.
    Property { service: &'static str, path: &'static str, interface: &'static str, name: &'static str },
}

/// Setup that has to happen on a (re)connected bus before discovery starts.
pub type PrepareFn = fn(Arc<dyn BusConnection>) -> BoxFuture<'static, BusResult<()>>;

pub struct Discovery {
    pub snapshot: SnapshotSource,
    /// Signals announcing and withdrawing peers. Keep related signals in one spec, since order is
    /// only preserved within a single subscription.
    pub signals: fn() -> Vec<SignalSpec>,
    pub classify: fn(&SignalEvent) -> Option<Lifecycle>,
    pub prepare: Option<PrepareFn>,
}

/// Which bus properties are mirrored, and under what names.
pub struct PropertyMap {
    /// Raw property names that are fetched and mirrored.
    pub names: &'static [&'static str],
    /// Writes the mirrored field(s) for one raw property into the output.
    pub map: fn(&str, &Value, &mut Properties),
}

impl PropertyMap {
    /// Mirror a raw property set, dropping everything that isn't declared.
    pub fn mirror(&self, raw: &Properties) -> Properties {
        let mut out = Properties::new();
        for (name, value) in raw.iter().filter(|(name, _)| self.names.contains(&name.as_str())) {
            (self.map)(name, value, &mut out);
        }
        out
    }
}

/// The dedicated channel of a single-select registry's bound peer.
pub struct ControlChannel {
    pub interface: &'static str,
    pub properties: PropertyMap,
    /// Signal carrying changes of the transport state.
    pub signal: fn(&PeerAddress) -> SignalSpec,
    /// Extract the raw changed properties from a signal of [`ControlChannel::signal`].
    pub interpret: fn(&SignalEvent) -> Option<Properties>,
    /// Method names that may be called on the bound peer.
    pub commands: &'static [&'static str],
}

pub struct PeerDescriptor {
    /// Short name used in logs and output.
    pub kind: &'static str,
    pub mode: SelectionMode,
    /// Interface a peer has to implement, and whose properties are mirrored.
    pub interface: &'static str,
    pub properties: PropertyMap,
    pub discovery: Discovery,
    /// Derive the peer id from a raw identifier found in a discovery event.
    pub peer_id: fn(&str) -> Option<PeerId>,
    pub address: fn(&str) -> PeerAddress,
    pub change_signal: fn(&PeerAddress) -> SignalSpec,
    pub interpret_change: fn(&SignalEvent) -> Option<Change>,
    pub control: Option<ControlChannel>,
}

impl PeerDescriptor {
    pub fn mirror(&self, raw: &Properties) -> Properties {
        self.properties.mirror(raw)
    }
}

impl std::fmt::Debug for PeerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDescriptor").field("kind", &self.kind).field("mode", &self.mode).finish_non_exhaustive()
    }
}

/// `org.freedesktop.DBus.Properties.PropertiesChanged` signals for `interface` on `address`.
pub fn properties_changed_signal(address: &PeerAddress, interface: &str) -> SignalSpec {
    let spec = SignalSpec::new(PROPERTIES_INTERFACE).member("PropertiesChanged").path(address.path.clone()).arg0(interface);
    if address.service.is_empty() {
        spec
    } else {
        spec.sender(address.service.clone())
    }
}

/// Decode the changed properties of a `PropertiesChanged` signal for `interface`.
pub fn properties_changed(event: &SignalEvent, interface: &str) -> Option<Properties> {
    if event.interface != PROPERTIES_INTERFACE || event.member != "PropertiesChanged" || event.arg_str(0) != Some(interface) {
        return None;
    }
    let changed = event.args.get(1)?.as_map()?;
    Some(changed.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Map function that stores a raw property under a fixed, renamed key.
pub fn rename(renames: &[(&str, &str)], name: &str, value: &Value, out: &mut Properties) {
    if let Some((_, to)) = renames.iter().find(|(from, _)| *from == name) {
        out.insert(to.to_string(), value.clone());
    }
}
