//! Discovery drivers keep a registry's peer table in line with the bus.
//!
//! A driver subscribes to the descriptor's appear/vanish signals, then fetches the complete list
//! of live peers and hands it to the registry as a reconciliation. Subscribing first means no
//! peer can slip through between the snapshot and the first signal. When any of the signal
//! streams ends, the connection is considered lost: the registry is told, and the driver
//! reconnects and starts over.

use std::{sync::Arc, time::Duration};

use futures::{future::try_join_all, stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::with_timeout, BusConnection, BusResult, Lifecycle, PeerAddress, PeerDescriptor, RegistryConfig,
    RegistryHandle, SnapshotSource,
};

/// Drive discovery for the registry behind `handle` until `shutdown` is cancelled.
pub async fn run_discovery(
    descriptor: &'static PeerDescriptor,
    bus: Arc<dyn BusConnection>,
    handle: RegistryHandle,
    config: RegistryConfig,
    shutdown: CancellationToken,
) {
    loop {
        let epoch = bus.epoch();
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = discover(descriptor, &bus, &handle, config.call_timeout) => result,
        };
        match result {
            Ok(()) => log::warn!("[{}] discovery signals stopped arriving", descriptor.kind),
            Err(e) => log::warn!("[{}] discovery failed: {}", descriptor.kind, e),
        }
        handle.disconnected();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(config.reconnect_delay) => {}
            }
            match with_timeout(config.call_timeout, bus.reconnect(epoch)).await {
                Ok(()) => break,
                Err(e) => log::warn!("[{}] could not reconnect: {}", descriptor.kind, e),
            }
        }
    }
}

/// One pass of discovery on a live connection. Returns once a signal stream ends.
async fn discover(
    descriptor: &'static PeerDescriptor,
    bus: &Arc<dyn BusConnection>,
    handle: &RegistryHandle,
    timeout: Duration,
) -> BusResult<()> {
    let discovery = &descriptor.discovery;
    if let Some(prepare) = discovery.prepare {
        with_timeout(timeout, prepare(bus.clone())).await?;
    }

    let subscriptions = (discovery.signals)().into_iter().map(|spec| with_timeout(timeout, bus.subscribe(spec)));
    let streams = try_join_all(subscriptions).await?;
    let snapshot = with_timeout(timeout, fetch_snapshot(&**bus, discovery.snapshot)).await?;
    log::debug!("[{}] {} peers on the bus", descriptor.kind, snapshot.len());
    handle.connected();
    handle.reconcile(snapshot);

    // every stream yields None once when it ends
    let mut events = stream::select_all(streams.into_iter().map(|s| s.map(Some).chain(stream::once(async { None })).boxed()));
    while let Some(Some(event)) = events.next().await {
        match (discovery.classify)(&event) {
            Some(Lifecycle::Appeared(raw_id)) => handle.discovered(raw_id),
            Some(Lifecycle::Vanished(raw_id)) => handle.vanished(raw_id),
            None => log::trace!("[{}] ignoring {}.{}", descriptor.kind, event.interface, event.member),
        }
    }
    Ok(())
}

/// The raw ids of all peers currently on the bus.
pub async fn fetch_snapshot(bus: &dyn BusConnection, source: SnapshotSource) -> BusResult<Vec<String>> {
    match source {
        SnapshotSource::NamesWithPrefix(prefix) => {
            let mut names: Vec<String> = bus.list_names().await?.into_iter().filter(|n| n.starts_with(prefix)).collect();
            names.sort();
            Ok(names)
        }
        SnapshotSource::Property { service, path, interface, name } => {
            Ok(bus.get_property(&PeerAddress::new(service, path), interface, name).await?.string_list())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{registry, testing::*, ConnectionStatus, Record};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config() -> RegistryConfig {
        RegistryConfig {
            call_timeout: Duration::from_millis(500),
            failed_grace: Duration::from_millis(10),
            reconnect_delay: Duration::from_millis(20),
        }
    }

    async fn next(records: &mut UnboundedReceiver<Record>) -> Record {
        tokio::time::timeout(Duration::from_secs(2), records.recv()).await.unwrap().unwrap()
    }

    fn short(record: &Record) -> (String, Option<u64>) {
        match record {
            Record::Added { id, generation, .. } => (format!("added {}", id), Some(*generation)),
            Record::Updated { id, generation, .. } => (format!("updated {}", id), Some(*generation)),
            Record::Removed { id, generation } => (format!("removed {}", id), Some(*generation)),
            Record::Selection { id, .. } => (format!("selection {:?}", id), None),
            Record::Status { status } => (format!("status {:?}", status), None),
        }
    }

    #[tokio::test]
    async fn test_snapshot_sources() {
        let bus = MockBus::new();
        bus.set_names(&["org.example.Peer.b", "org.example.Peer.a", "org.example.Other"]);
        let names = fetch_snapshot(&*bus, SnapshotSource::NamesWithPrefix(TEST_PREFIX)).await.unwrap();
        assert_eq!(names, vec!["org.example.Peer.a".to_string(), "org.example.Peer.b".to_string()]);

        let watcher = PeerAddress::new("org.example.Watcher", "/Watcher");
        bus.set_properties(&watcher, "org.example.Watcher", maplit::btreemap! {
            "Items".to_string() => crate::Value::from(vec![":1.4/item", ":1.5/item"]),
        });
        let source = SnapshotSource::Property {
            service: "org.example.Watcher",
            path: "/Watcher",
            interface: "org.example.Watcher",
            name: "Items",
        };
        assert_eq!(fetch_snapshot(&*bus, source).await.unwrap(), vec![":1.4/item".to_string(), ":1.5/item".to_string()]);
    }

    #[tokio::test]
    async fn test_discovery_follows_the_bus() {
        let bus = MockBus::new();
        bus.set_names(&["org.example.Peer.x", ":1.1"]);
        for id in ["x", "y"] {
            bus.add_object(&address_of(id), TEST_INTERFACE, Default::default());
        }
        let shutdown = CancellationToken::new();
        let (handle, mut records) = registry::spawn(&MULTI, bus.clone(), config(), shutdown.clone());
        tokio::spawn(run_discovery(&MULTI, bus.clone(), handle.clone(), config(), shutdown.clone()));

        assert_eq!(short(&next(&mut records).await), ("added x".to_string(), Some(1)));

        bus.emit(name_owner_changed("org.example.Peer.y", "", ":1.7"));
        assert_eq!(short(&next(&mut records).await), ("added y".to_string(), Some(2)));
        bus.emit(name_owner_changed("org.example.Peer.x", ":1.6", ""));
        assert_eq!(short(&next(&mut records).await), ("removed x".to_string(), Some(1)));
        bus.emit(name_owner_changed("org.example.Unrelated", "", ":1.8"));

        // losing the discovery subscription means losing the bus
        bus.set_names(&["org.example.Peer.y"]);
        bus.drop_subscriptions(|spec| spec.interface == "org.freedesktop.DBus");
        assert_eq!(short(&next(&mut records).await), ("removed y".to_string(), Some(2)));
        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Disconnected });
        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Connected });
        assert_eq!(short(&next(&mut records).await), ("added y".to_string(), Some(3)));
        assert_eq!(bus.reconnects(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_discovery_retries() {
        let bus = MockBus::new();
        bus.refuse_subscriptions(1);
        bus.set_names(&["org.example.Peer.x"]);
        bus.add_object(&address_of("x"), TEST_INTERFACE, Default::default());
        let shutdown = CancellationToken::new();
        let (handle, mut records) = registry::spawn(&MULTI, bus.clone(), config(), shutdown.clone());
        tokio::spawn(run_discovery(&MULTI, bus.clone(), handle, config(), shutdown.clone()));

        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Disconnected });
        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Connected });
        assert_eq!(short(&next(&mut records).await), ("added x".to_string(), Some(1)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_discovery_waits_for_an_unreachable_bus() {
        let bus = MockBus::new();
        bus.go_offline(2);
        bus.set_names(&["org.example.Peer.x"]);
        bus.add_object(&address_of("x"), TEST_INTERFACE, Default::default());
        let shutdown = CancellationToken::new();
        let (handle, mut records) = registry::spawn(&MULTI, bus.clone(), config(), shutdown.clone());
        tokio::spawn(run_discovery(&MULTI, bus.clone(), handle, config(), shutdown.clone()));

        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Disconnected });
        assert_eq!(next(&mut records).await, Record::Status { status: ConnectionStatus::Connected });
        assert_eq!(short(&next(&mut records).await), ("added x".to_string(), Some(1)));
        assert_eq!(bus.reconnects(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shared_bus_reconnects_once() {
        let bus = MockBus::new();
        bus.set_names(&["org.example.Peer.x"]);
        bus.add_object(&address_of("x"), TEST_INTERFACE, Default::default());
        let shutdown = CancellationToken::new();
        let mut all_records = Vec::new();
        for descriptor in [&MULTI, &SINGLE] {
            let (handle, records) = registry::spawn(descriptor, bus.clone(), config(), shutdown.clone());
            tokio::spawn(run_discovery(descriptor, bus.clone(), handle, config(), shutdown.clone()));
            all_records.push(records);
        }
        for records in &mut all_records {
            assert_eq!(short(&next(records).await), ("added x".to_string(), Some(1)));
        }

        // both drivers lose the same connection
        bus.drop_subscriptions(|spec| spec.interface == "org.freedesktop.DBus");
        for records in &mut all_records {
            assert_eq!(short(&next(records).await), ("removed x".to_string(), Some(1)));
            assert_eq!(next(records).await, Record::Status { status: ConnectionStatus::Disconnected });
            assert_eq!(next(records).await, Record::Status { status: ConnectionStatus::Connected });
            assert_eq!(short(&next(records).await), ("added x".to_string(), Some(2)));
        }
        assert_eq!(bus.reconnects(), 1);
        shutdown.cancel();
    }
}
