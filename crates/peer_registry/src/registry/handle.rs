use std::sync::Arc;

use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tokio_util::sync::CancellationToken;

use super::{Event, Record, Registry, RegistrySnapshot};
use crate::{BusConnection, PeerDescriptor, PeerId, Properties, RegistryConfig, RegistryError, Value};

/// Start the loop of a registry for `descriptor`.
///
/// Returns a handle for feeding it events and the receiving end of its records. The loop runs
/// until `shutdown` is cancelled or every clone of the handle is dropped.
pub fn spawn(
    descriptor: &'static PeerDescriptor,
    bus: Arc<dyn BusConnection>,
    config: RegistryConfig,
    shutdown: CancellationToken,
) -> (RegistryHandle, UnboundedReceiver<Record>) {
    let (registry, sender, events, records) = Registry::new(descriptor, bus, config);
    let handle = RegistryHandle { kind: descriptor.kind, events: sender };
    tokio::spawn(registry.run(events, shutdown));
    (handle, records)
}

/// Cheap, cloneable entry point into a running registry.
///
/// The notification methods never block; they only queue an event for the registry loop.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    kind: &'static str,
    events: UnboundedSender<Event>,
}

impl RegistryHandle {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn discovered(&self, raw_id: impl Into<String>) {
        self.send(Event::Discovered(raw_id.into()));
    }

    pub fn vanished(&self, raw_id: impl Into<String>) {
        self.send(Event::Vanished(raw_id.into()));
    }

    pub fn property_changed(&self, raw_id: impl Into<String>, delta: Properties) {
        self.send(Event::PropertyChanged { raw_id: raw_id.into(), delta });
    }

    /// Replace the registry's view of which peers exist with `snapshot`.
    pub fn reconcile(&self, snapshot: Vec<String>) {
        self.send(Event::Reconcile(snapshot));
    }

    pub fn disconnected(&self) {
        self.send(Event::Disconnected);
    }

    pub fn connected(&self) {
        self.send(Event::Connected);
    }

    /// Select a peer as the control target, or clear the selection with `None`.
    pub async fn select(&self, id: Option<PeerId>) -> crate::Result<()> {
        let (reply, response) = oneshot::channel();
        self.events.send(Event::Select { target: id, reply }).map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)?
    }

    /// Call a transport command on the selected peer.
    pub async fn control(&self, command: impl Into<String>) -> crate::Result<Vec<Value>> {
        let (reply, response) = oneshot::channel();
        self.events.send(Event::Control { command: command.into(), reply }).map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)?
    }

    pub async fn snapshot(&self) -> crate::Result<RegistrySnapshot> {
        let (reply, response) = oneshot::channel();
        self.events.send(Event::Snapshot(reply)).map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            log::warn!("[{}] registry loop has stopped, dropping event", self.kind);
        }
    }
}
