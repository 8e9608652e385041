use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio_util::sync::CancellationToken;

use super::Event;
use crate::{
    config::with_timeout, BusConnection, BusError, BusResult, Change, ControlChannel, PeerAddress, PeerDescriptor,
    PeerId, Properties, SignalEvent, SignalStream,
};

/// Outcome of a successful introspection: the initial properties and the stream of change
/// signals, which was opened before the properties were fetched.
pub(crate) struct Introspection {
    pub(crate) properties: Properties,
    pub(crate) stream: SignalStream,
}

pub(super) async fn introspect(
    bus: &dyn BusConnection,
    descriptor: &'static PeerDescriptor,
    address: &PeerAddress,
    timeout: Duration,
) -> BusResult<Introspection> {
    let capabilities = with_timeout(timeout, bus.introspect(address)).await?;
    if !capabilities.implements(descriptor.interface) {
        return Err(BusError::Malformed(format!("{} does not implement {}", address, descriptor.interface)));
    }
    resubscribe(bus, descriptor, address, timeout).await
}

/// Open the change subscription and fetch the full property set.
pub(super) async fn resubscribe(
    bus: &dyn BusConnection,
    descriptor: &'static PeerDescriptor,
    address: &PeerAddress,
    timeout: Duration,
) -> BusResult<Introspection> {
    let stream = with_timeout(timeout, bus.subscribe((descriptor.change_signal)(address))).await?;
    let properties = with_timeout(timeout, bus.get_properties(address, descriptor.interface)).await?;
    Ok(Introspection { properties, stream })
}

pub(super) async fn bind_control(
    bus: &dyn BusConnection,
    control: &ControlChannel,
    address: &PeerAddress,
    timeout: Duration,
) -> BusResult<(SignalStream, Properties)> {
    let stream = with_timeout(timeout, bus.subscribe((control.signal)(address))).await?;
    let state = with_timeout(timeout, bus.get_properties(address, control.interface)).await?;
    Ok((stream, state))
}

/// Queue `event` for the registry loop. Returns false once every handle of the registry is gone.
///
/// Background tasks only hold weak senders, so they never keep a registry alive on their own.
pub(super) fn report(events: &WeakUnboundedSender<Event>, event: Event) -> bool {
    events.upgrade().map_or(false, |events| events.send(event).is_ok())
}

/// Turns the change signals of one peer generation into [`Event::PeerChanged`].
pub(super) struct PeerWatcher {
    pub(super) bus: Arc<dyn BusConnection>,
    pub(super) descriptor: &'static PeerDescriptor,
    pub(super) timeout: Duration,
    pub(super) events: WeakUnboundedSender<Event>,
    pub(super) id: PeerId,
    pub(super) generation: u64,
    pub(super) address: PeerAddress,
}

impl PeerWatcher {
    pub(super) async fn run(self, mut stream: SignalStream, token: CancellationToken) {
        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => return,
                signal = stream.next() => signal,
            };
            let Some(signal) = signal else {
                log::debug!("[{}] change stream of {} ended", self.descriptor.kind, self.id);
                report(&self.events, Event::SubscriptionLost { id: self.id, generation: self.generation });
                return;
            };
            let Some(raw) = self.interpret(&signal).await else { continue };
            let event = Event::PeerChanged { id: self.id.clone(), generation: self.generation, raw };
            if !report(&self.events, event) {
                return;
            }
        }
    }

    async fn interpret(&self, signal: &SignalEvent) -> Option<Properties> {
        match (self.descriptor.interpret_change)(signal)? {
            Change::Delta(raw) => Some(raw),
            Change::Refetch(names) => {
                let fetched = with_timeout(self.timeout, self.bus.get_properties(&self.address, self.descriptor.interface)).await;
                match fetched {
                    Ok(all) => Some(all.into_iter().filter(|(name, _)| names.contains(&name.as_str())).collect()),
                    Err(e) => {
                        log::debug!("[{}] dropping change of {}: {}", self.descriptor.kind, self.id, e);
                        None
                    }
                }
            }
        }
    }
}

/// Forwards transport-state signals of the selected peer as [`Event::TransportChanged`].
pub(super) struct TransportWatcher {
    pub(super) kind: &'static str,
    pub(super) events: WeakUnboundedSender<Event>,
    pub(super) id: PeerId,
    pub(super) binding: u64,
    pub(super) interpret: fn(&SignalEvent) -> Option<Properties>,
}

impl TransportWatcher {
    pub(super) async fn run(self, mut stream: SignalStream, token: CancellationToken) {
        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => return,
                signal = stream.next() => signal,
            };
            let Some(signal) = signal else {
                log::debug!("[{}] transport channel of {} closed", self.kind, self.id);
                return;
            };
            let Some(raw) = (self.interpret)(&signal) else { continue };
            let event = Event::TransportChanged { id: self.id.clone(), binding: self.binding, raw };
            if !report(&self.events, event) {
                return;
            }
        }
    }
}
