//! Tray items, as published through the [StatusNotifierItem] protocol.
//!
//! Items are discovered through the `org.kde.StatusNotifierWatcher`. Before the watcher talks to
//! us, we have to register ourselves as a StatusNotifierHost, which is done in the descriptor's
//! prepare step so it is repeated after every reconnect.
//!
//! [StatusNotifierItem]: https://freedesktop.org/wiki/Specifications/StatusNotifierItem/

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    descriptor::rename, BusConnection, BusError, BusResult, Change, Discovery, Lifecycle,
    PeerAddress, PeerDescriptor, PeerId, Properties, PropertyMap, SelectionMode, SignalEvent, SignalSpec,
    SnapshotSource, Value,
};

pub const WATCHER_NAME: &str = "org.kde.StatusNotifierWatcher";
pub const WATCHER_PATH: &str = "/StatusNotifierWatcher";
pub const ITEM_INTERFACE: &str = "org.kde.StatusNotifierItem";
/// Object path of items that register with their bus name only.
pub const DEFAULT_ITEM_PATH: &str = "/StatusNotifierItem";

const HOST_NAME_ATTEMPTS: usize = 32;

const RENAMES: &[(&str, &str)] = &[
    ("Id", "id"),
    ("Title", "title"),
    ("Status", "status"),
    ("IconName", "icon_name"),
    ("IconThemePath", "icon_theme_path"),
    ("Menu", "menu"),
    ("Category", "category"),
];

pub static TRAY: PeerDescriptor = PeerDescriptor {
    kind: "tray",
    mode: SelectionMode::Multi,
    interface: ITEM_INTERFACE,
    properties: PropertyMap {
        names: &["Id", "Title", "Status", "IconName", "IconThemePath", "Menu", "Category"],
        map: map_property,
    },
    discovery: Discovery {
        snapshot: SnapshotSource::Property {
            service: WATCHER_NAME,
            path: WATCHER_PATH,
            interface: WATCHER_NAME,
            name: "RegisteredStatusNotifierItems",
        },
        signals: discovery_signals,
        classify,
        prepare: Some(register_host),
    },
    peer_id,
    address,
    change_signal,
    interpret_change,
    control: None,
};

fn map_property(name: &str, value: &Value, out: &mut Properties) {
    rename(RENAMES, name, value, out)
}

/// Normalize the `{bus}{object_path}` format the watcher uses into `bus/path`.
///
/// Items that registered with a bare bus name live at [`DEFAULT_ITEM_PATH`].
fn peer_id(raw: &str) -> Option<PeerId> {
    match raw.split_once('/') {
        Some(("", _)) => None,
        Some((service, path)) => Some(format!("{}/{}", service, path.trim_end_matches('/'))),
        None if !raw.is_empty() => Some(format!("{}{}", raw, DEFAULT_ITEM_PATH)),
        None => None,
    }
}

fn address(id: &str) -> PeerAddress {
    match id.split_once('/') {
        Some((service, path)) => PeerAddress::new(service, format!("/{}", path)),
        None => PeerAddress::new(id, DEFAULT_ITEM_PATH),
    }
}

fn discovery_signals() -> Vec<SignalSpec> {
    // registration and unregistration share one subscription to keep their relative order
    vec![SignalSpec::new(WATCHER_NAME).sender(WATCHER_NAME).path(WATCHER_PATH)]
}

fn classify(event: &SignalEvent) -> Option<Lifecycle> {
    let service = event.arg_str(0)?.to_string();
    match event.member.as_str() {
        "StatusNotifierItemRegistered" => Some(Lifecycle::Appeared(service)),
        "StatusNotifierItemUnregistered" => Some(Lifecycle::Vanished(service)),
        _ => None,
    }
}

fn change_signal(address: &PeerAddress) -> SignalSpec {
    SignalSpec::new(ITEM_INTERFACE).from_peer(address)
}

/// Items announce most changes without the new value, so those have to be fetched.
fn interpret_change(event: &SignalEvent) -> Option<Change> {
    let refetch: &'static [&'static str] = match event.member.as_str() {
        "NewTitle" => &["Title"],
        "NewIcon" => &["IconName"],
        "NewMenu" => &["Menu"],
        "NewStatus" | "NewIconThemePath" => {
            let name = event.member.trim_start_matches("New");
            let value = event.args.first()?.clone();
            return Some(Change::Delta(Properties::from([(name.to_string(), value)])));
        }
        _ => return None,
    };
    Some(Change::Refetch(refetch))
}

/// Register this connection as a StatusNotifierHost.
///
/// The well-known name has the form `org.kde.StatusNotifierHost-{pid}-{n}`, with the first `n`
/// that isn't taken yet.
fn register_host(bus: Arc<dyn BusConnection>) -> BoxFuture<'static, BusResult<()>> {
    Box::pin(async move {
        let pid = std::process::id();
        let mut host_name = None;
        for i in 0..HOST_NAME_ATTEMPTS {
            let name = format!("org.kde.StatusNotifierHost-{}-{}", pid, i);
            if bus.request_name(&name).await? {
                host_name = Some(name);
                break;
            }
        }
        let host_name = host_name.ok_or_else(|| BusError::Unreachable("no free StatusNotifierHost name".to_string()))?;

        let watcher = PeerAddress::new(WATCHER_NAME, WATCHER_PATH);
        bus.call(&watcher, WATCHER_NAME, "RegisterStatusNotifierHost", vec![Value::from(host_name.as_str())]).await?;
        log::info!("registered as {}", host_name);
        Ok(())
    })
}
