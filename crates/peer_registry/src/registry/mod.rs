//! The reconciliation engine.
//!
//! A [`Registry`] owns the peer table of one peer kind. All of its state is mutated by exactly one
//! loop (see [`spawn`]), which handles one [`Event`] at a time. Anything asynchronous (introspection,
//! watching a peer's signals, fetching properties) runs in separate tasks that report back to the
//! loop by sending events, tagged with the generation of the peer they were started for. Results
//! for a generation that is no longer current are dropped when they arrive.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
    oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::with_timeout, BusConnection, BusResult, Notice, Peer, PeerDescriptor, PeerId, PeerSnapshot, PeerState,
    Properties, RegistryConfig, RegistryError, SelectionMode, SignalStream, Value,
};

mod handle;
pub use handle::*;

mod watch;
use watch::*;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// What a registry reports to its consumer.
///
/// For any one id and generation, the records form a prefix of `Added, Updated*, Removed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Added { id: PeerId, generation: u64, properties: Properties },
    Updated { id: PeerId, generation: u64, delta: Properties },
    Removed { id: PeerId, generation: u64 },
    /// The bound peer of a single-select registry changed, or its transport state did.
    Selection { id: Option<PeerId>, transport: Properties },
    Status { status: ConnectionStatus },
}

impl Record {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Record::Added { id, .. } | Record::Updated { id, .. } | Record::Removed { id, .. } => Some(id),
            Record::Selection { .. } | Record::Status { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub kind: &'static str,
    pub status: ConnectionStatus,
    pub peers: Vec<PeerSnapshot>,
    pub selected: Option<PeerId>,
    pub transport: Properties,
}

/// Everything that can happen to a registry. Only the registry loop consumes these.
pub(crate) enum Event {
    Discovered(String),
    Vanished(String),
    /// Externally reported change, keyed by raw id.
    PropertyChanged { raw_id: String, delta: Properties },
    /// Change observed by the watcher of one peer generation.
    PeerChanged { id: PeerId, generation: u64, raw: Properties },
    Reconcile(Vec<String>),
    Introspected { id: PeerId, generation: u64, result: BusResult<Introspection> },
    SubscriptionLost { id: PeerId, generation: u64 },
    Resubscribed { id: PeerId, generation: u64, result: BusResult<Introspection> },
    EvictFailed { id: PeerId, generation: u64 },
    TransportChanged { id: PeerId, binding: u64, raw: Properties },
    Select { target: Option<PeerId>, reply: oneshot::Sender<crate::Result<()>> },
    Control { command: String, reply: oneshot::Sender<crate::Result<Vec<Value>>> },
    Disconnected,
    Connected,
    Snapshot(oneshot::Sender<RegistrySnapshot>),
}

/// The peer that a single-select registry is currently bound to.
struct Selection {
    id: PeerId,
    /// Distinguishes successive bindings, so transport updates of a released binding are dropped.
    binding: u64,
    transport: Properties,
    watcher: CancellationToken,
}

pub struct Registry {
    descriptor: &'static PeerDescriptor,
    bus: Arc<dyn BusConnection>,
    config: RegistryConfig,
    peers: HashMap<PeerId, Peer>,
    selection: Option<Selection>,
    last_generation: u64,
    last_binding: u64,
    status: ConnectionStatus,
    events: WeakUnboundedSender<Event>,
    records: UnboundedSender<Record>,
}

impl Registry {
    pub(crate) fn new(
        descriptor: &'static PeerDescriptor,
        bus: Arc<dyn BusConnection>,
        config: RegistryConfig,
    ) -> (Self, UnboundedSender<Event>, UnboundedReceiver<Event>, UnboundedReceiver<Record>) {
        let (events, events_recv) = mpsc::unbounded_channel();
        let (records, records_recv) = mpsc::unbounded_channel();
        let registry = Registry {
            descriptor,
            bus,
            config,
            peers: HashMap::new(),
            selection: None,
            last_generation: 0,
            last_binding: 0,
            status: ConnectionStatus::Connected,
            events: events.downgrade(),
            records,
        };
        (registry, events, events_recv, records_recv)
    }

    pub fn descriptor(&self) -> &'static PeerDescriptor {
        self.descriptor
    }

    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selection.as_ref().map(|s| s.id.as_str())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut peers: Vec<PeerSnapshot> = self.peers.values().map(Peer::snapshot).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        RegistrySnapshot {
            kind: self.descriptor.kind,
            status: self.status,
            peers,
            selected: self.selection.as_ref().map(|s| s.id.clone()),
            transport: self.selection.as_ref().map(|s| s.transport.clone()).unwrap_or_default(),
        }
    }

    async fn run(mut self, mut events: UnboundedReceiver<Event>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            // every handle is gone
            let Some(event) = event else { break };
            self.handle(event).await;
        }
        log::debug!("[{}] registry loop stopped", self.descriptor.kind);
    }

    /// Handle one event to completion.
    pub(crate) async fn handle(&mut self, event: Event) -> Option<Notice> {
        let notice = match event {
            Event::Discovered(raw_id) => self.handle_discovered(&raw_id),
            Event::Vanished(raw_id) => self.handle_vanished(&raw_id),
            Event::PropertyChanged { raw_id, delta } => self.handle_property_changed(&raw_id, delta),
            Event::PeerChanged { id, generation, raw } => self.apply_change(&id, Some(generation), raw),
            Event::Reconcile(snapshot) => {
                self.handle_reconcile(snapshot);
                None
            }
            Event::Introspected { id, generation, result } => self.handle_introspected(id, generation, result),
            Event::SubscriptionLost { id, generation } => {
                self.handle_subscription_lost(&id, generation);
                None
            }
            Event::Resubscribed { id, generation, result } => {
                self.handle_resubscribed(&id, generation, result);
                None
            }
            Event::EvictFailed { id, generation } => {
                self.handle_evict_failed(&id, generation);
                None
            }
            Event::TransportChanged { id, binding, raw } => {
                self.handle_transport_changed(&id, binding, raw);
                None
            }
            Event::Select { target, reply } => {
                let result = self.select(target).await;
                let _ = reply.send(result);
                None
            }
            Event::Control { command, reply } => {
                self.control(command, reply);
                None
            }
            Event::Disconnected => {
                self.handle_disconnected();
                None
            }
            Event::Connected => {
                self.handle_connected();
                None
            }
            Event::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                None
            }
        };
        if let Some(notice) = &notice {
            log::debug!("[{}] {}", self.descriptor.kind, notice);
        }
        notice
    }

    /// A peer was announced. Unknown ids get a fresh generation and start introspection.
    pub fn handle_discovered(&mut self, raw_id: &str) -> Option<Notice> {
        let Some(id) = (self.descriptor.peer_id)(raw_id) else {
            log::warn!("[{}] could not make sense of discovered peer {:?}", self.descriptor.kind, raw_id);
            return Some(Notice::UnrecognizedId(raw_id.to_string()));
        };
        match self.peers.get(&id).map(Peer::state) {
            Some(state) if state.is_live() => return Some(Notice::DuplicateDiscovery(id)),
            Some(state) => {
                log::debug!("[{}] {} re-announced itself while {}", self.descriptor.kind, id, state);
                self.peers.remove(&id);
            }
            None => {}
        }

        self.last_generation += 1;
        let mut peer = Peer::new(id.clone(), (self.descriptor.address)(&id), self.last_generation);
        log::debug!("[{}] discovered {} (generation {})", self.descriptor.kind, id, peer.generation);
        self.start_introspection(&peer);
        peer.advance(PeerState::Introspecting);
        self.peers.insert(id, peer);
        None
    }

    /// A peer went away. Works in any state; only announced peers produce a Removed record.
    pub fn handle_vanished(&mut self, raw_id: &str) -> Option<Notice> {
        let Some(id) = (self.descriptor.peer_id)(raw_id) else {
            return Some(Notice::UnrecognizedId(raw_id.to_string()));
        };
        if self.remove_peer(&id) {
            None
        } else {
            Some(Notice::UnknownPeer(id))
        }
    }

    pub fn handle_property_changed(&mut self, raw_id: &str, delta: Properties) -> Option<Notice> {
        let Some(id) = (self.descriptor.peer_id)(raw_id) else {
            return Some(Notice::UnrecognizedId(raw_id.to_string()));
        };
        self.apply_change(&id, None, delta)
    }

    /// Bring the table in line with a complete list of live peers.
    ///
    /// Since this runs as a single loop step, reconciliations can never overlap; a second one
    /// simply waits in the queue.
    pub fn handle_reconcile(&mut self, snapshot: Vec<String>) {
        let descriptor = self.descriptor;
        let wanted: BTreeMap<PeerId, String> =
            snapshot.into_iter().filter_map(|raw| (descriptor.peer_id)(&raw).map(|id| (id, raw))).collect();
        let mut gone: Vec<PeerId> = self.peers.keys().filter(|id| !wanted.contains_key(*id)).cloned().collect();
        gone.sort();

        log::debug!("[{}] reconciling against {} live peers, {} gone", descriptor.kind, wanted.len(), gone.len());
        for id in gone {
            self.remove_peer(&id);
        }
        for (id, raw_id) in wanted {
            if !self.peers.contains_key(&id) {
                self.handle_discovered(&raw_id);
            }
        }
    }

    /// The bus is gone. Every live peer is removed as if it had vanished.
    pub fn handle_disconnected(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        log::warn!("[{}] lost the bus, dropping all peers", self.descriptor.kind);
        self.status = ConnectionStatus::Disconnected;

        let mut live: Vec<PeerId> = self.peers.values().filter(|p| p.state().is_live()).map(|p| p.id.clone()).collect();
        live.sort();
        for id in live {
            self.remove_peer(&id);
        }
        self.clear_selection();
        self.emit(Record::Status { status: ConnectionStatus::Disconnected });
    }

    pub fn handle_connected(&mut self) {
        if self.status == ConnectionStatus::Connected {
            return;
        }
        log::info!("[{}] bus is back", self.descriptor.kind);
        self.status = ConnectionStatus::Connected;
        self.emit(Record::Status { status: ConnectionStatus::Connected });
    }

    /// Bind the control channel of `target`, or release the binding when `target` is `None`.
    pub async fn select(&mut self, target: Option<PeerId>) -> crate::Result<()> {
        let descriptor = self.descriptor;
        let (SelectionMode::Single, Some(control)) = (descriptor.mode, &descriptor.control) else {
            return Err(RegistryError::NotSingleSelect(descriptor.kind));
        };
        let Some(id) = target else {
            self.clear_selection();
            return Ok(());
        };
        let address = match self.peers.get(&id) {
            Some(peer) if peer.state() == PeerState::Active => peer.address.clone(),
            _ => return Err(RegistryError::SelectionInvalid(id)),
        };
        if self.selected() == Some(id.as_str()) {
            return Ok(());
        }

        // the loop waits for this, so nothing can change the table while we bind
        let (stream, raw) = bind_control(&*self.bus, control, &address, self.config.call_timeout).await?;

        if let Some(previous) = self.selection.take() {
            previous.watcher.cancel();
        }
        self.last_binding += 1;
        let watcher = CancellationToken::new();
        let transport_watcher = TransportWatcher {
            kind: descriptor.kind,
            events: self.events.clone(),
            id: id.clone(),
            binding: self.last_binding,
            interpret: control.interpret,
        };
        tokio::spawn(transport_watcher.run(stream, watcher.clone()));

        let transport = control.properties.mirror(&raw);
        log::info!("[{}] selected {}", descriptor.kind, id);
        self.selection =
            Some(Selection { id: id.clone(), binding: self.last_binding, transport: transport.clone(), watcher });
        self.emit(Record::Selection { id: Some(id), transport });
        Ok(())
    }

    fn clear_selection(&mut self) {
        if let Some(selection) = self.selection.take() {
            selection.watcher.cancel();
            log::info!("[{}] deselected {}", self.descriptor.kind, selection.id);
            self.emit(Record::Selection { id: None, transport: Properties::new() });
        }
    }

    fn handle_transport_changed(&mut self, id: &str, binding: u64, raw: Properties) {
        let descriptor = self.descriptor;
        let Some(control) = &descriptor.control else { return };
        let Some(selection) = self.selection.as_mut().filter(|s| s.id == id && s.binding == binding) else {
            return;
        };
        let mut changed = false;
        for (name, value) in control.properties.mirror(&raw) {
            if selection.transport.get(&name) != Some(&value) {
                selection.transport.insert(name, value);
                changed = true;
            }
        }
        if changed {
            let record = Record::Selection { id: Some(selection.id.clone()), transport: selection.transport.clone() };
            self.emit(record);
        }
    }

    /// Forward a transport command to the bound peer. The call runs outside of the loop.
    fn control(&self, command: String, reply: oneshot::Sender<crate::Result<Vec<Value>>>) {
        let (address, interface) = match self.control_target(&command) {
            Ok(target) => target,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        log::debug!("[{}] calling {} on {}", self.descriptor.kind, command, address);
        let bus = self.bus.clone();
        let timeout = self.config.call_timeout;
        tokio::spawn(async move {
            let result = with_timeout(timeout, bus.call(&address, interface, &command, Vec::new())).await;
            let _ = reply.send(result.map_err(RegistryError::from));
        });
    }

    fn control_target(&self, command: &str) -> crate::Result<(crate::PeerAddress, &'static str)> {
        let descriptor = self.descriptor;
        let control = descriptor
            .control
            .as_ref()
            .filter(|_| descriptor.mode == SelectionMode::Single)
            .ok_or(RegistryError::NotSingleSelect(descriptor.kind))?;
        if !control.commands.contains(&command) {
            return Err(RegistryError::UnknownCommand(command.to_string()));
        }
        let selection = self.selection.as_ref().ok_or(RegistryError::NoSelection)?;
        let peer = self.peers.get(&selection.id).ok_or(RegistryError::NoSelection)?;
        Ok((peer.address.clone(), control.interface))
    }

    fn apply_change(&mut self, id: &str, generation: Option<u64>, raw: Properties) -> Option<Notice> {
        let descriptor = self.descriptor;
        let peer = match self.peers.get_mut(id) {
            Some(peer) if peer.state() == PeerState::Active && generation.map_or(true, |g| g == peer.generation) => peer,
            _ => return Some(Notice::StalePropertyUpdate(id.to_string())),
        };
        let delta = peer.merge(descriptor.mirror(&raw));
        let generation = peer.generation;
        if !delta.is_empty() {
            self.emit(Record::Updated { id: id.to_string(), generation, delta });
        }
        None
    }

    /// Evict a peer, returning whether it was known.
    fn remove_peer(&mut self, id: &str) -> bool {
        let Some(mut peer) = self.peers.remove(id) else {
            return false;
        };
        let previous = peer.state();
        peer.advance(PeerState::Removed);
        log::debug!("[{}] removed {} (generation {}, was {})", self.descriptor.kind, id, peer.generation, previous);
        if peer.announced() {
            log::info!("[{}] {} is gone", self.descriptor.kind, id);
            self.emit(Record::Removed { id: peer.id, generation: peer.generation });
        }
        if self.selected() == Some(id) {
            self.clear_selection();
        }
        true
    }

    fn start_introspection(&self, peer: &Peer) {
        let bus = self.bus.clone();
        let descriptor = self.descriptor;
        let timeout = self.config.call_timeout;
        let events = self.events.clone();
        let (id, generation, address) = (peer.id.clone(), peer.generation, peer.address.clone());
        tokio::spawn(async move {
            let result = introspect(&*bus, descriptor, &address, timeout).await;
            report(&events, Event::Introspected { id, generation, result });
        });
    }

    fn handle_introspected(&mut self, id: PeerId, generation: u64, result: BusResult<Introspection>) -> Option<Notice> {
        let descriptor = self.descriptor;
        let Some(peer) = self.peers.get_mut(&id).filter(|p| p.generation == generation && p.state() == PeerState::Introspecting)
        else {
            return Some(Notice::PeerVanishedDuringIntrospection(id));
        };

        match result {
            Ok(Introspection { properties, stream }) => {
                peer.properties = descriptor.mirror(&properties);
                peer.advance(PeerState::Active);
                let token = CancellationToken::new();
                peer.watcher = Some(token.clone());
                let properties = peer.properties.clone();
                let address = peer.address.clone();

                self.spawn_watcher(id.clone(), generation, address, stream, token);
                log::info!("[{}] {} is active", descriptor.kind, id);
                self.emit(Record::Added { id, generation, properties });
            }
            Err(e) => {
                log::warn!("[{}] introspection of {} failed: {}", descriptor.kind, id, e);
                peer.advance(PeerState::Failed);
                self.schedule_eviction(id, generation);
            }
        }
        None
    }

    fn spawn_watcher(
        &self,
        id: PeerId,
        generation: u64,
        address: crate::PeerAddress,
        stream: SignalStream,
        token: CancellationToken,
    ) {
        let watcher = PeerWatcher {
            bus: self.bus.clone(),
            descriptor: self.descriptor,
            timeout: self.config.call_timeout,
            events: self.events.clone(),
            id,
            generation,
            address,
        };
        tokio::spawn(watcher.run(stream, token));
    }

    fn handle_subscription_lost(&mut self, id: &str, generation: u64) {
        let descriptor = self.descriptor;
        let Some(peer) = self.peers.get_mut(id).filter(|p| p.generation == generation && p.state() == PeerState::Active) else {
            return;
        };
        if peer.resubscribed {
            log::warn!("[{}] lost the subscription of {} again, treating it as vanished", descriptor.kind, id);
            self.remove_peer(id);
            return;
        }

        log::warn!("[{}] lost the subscription of {}, resubscribing", descriptor.kind, id);
        peer.resubscribed = true;
        if let Some(token) = peer.watcher.take() {
            token.cancel();
        }
        let address = peer.address.clone();
        let bus = self.bus.clone();
        let timeout = self.config.call_timeout;
        let events = self.events.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let result = resubscribe(&*bus, descriptor, &address, timeout).await;
            report(&events, Event::Resubscribed { id, generation, result });
        });
    }

    fn handle_resubscribed(&mut self, id: &str, generation: u64, result: BusResult<Introspection>) {
        let Some(peer) = self.peers.get_mut(id).filter(|p| p.generation == generation && p.state() == PeerState::Active) else {
            return;
        };
        match result {
            Ok(Introspection { properties, stream }) => {
                let token = CancellationToken::new();
                peer.watcher = Some(token.clone());
                let address = peer.address.clone();
                self.spawn_watcher(id.to_string(), generation, address, stream, token);
                // catch up on whatever changed while we weren't listening
                self.apply_change(id, Some(generation), properties);
            }
            Err(e) => {
                log::warn!("[{}] resubscribing to {} failed ({}), treating it as vanished", self.descriptor.kind, id, e);
                self.remove_peer(id);
            }
        }
    }

    fn schedule_eviction(&self, id: PeerId, generation: u64) {
        let events = self.events.clone();
        let grace = self.config.failed_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            report(&events, Event::EvictFailed { id, generation });
        });
    }

    fn handle_evict_failed(&mut self, id: &str, generation: u64) {
        if self.peers.get(id).is_some_and(|p| p.generation == generation && p.state() == PeerState::Failed) {
            log::debug!("[{}] evicting failed peer {}", self.descriptor.kind, id);
            self.peers.remove(id);
        }
    }

    fn emit(&self, record: Record) {
        if self.records.send(record).is_err() {
            log::debug!("[{}] nobody is listening for records anymore", self.descriptor.kind);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for peer in self.peers.values_mut() {
            if let Some(token) = peer.watcher.take() {
                token.cancel();
            }
        }
        if let Some(selection) = self.selection.take() {
            selection.watcher.cancel();
        }
    }
}
