//! In-memory [`BusConnection`] and descriptors used by the tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, StreamExt};
use tokio::sync::{mpsc, Notify};

use crate::{
    descriptor::{properties_changed, properties_changed_signal},
    BusConnection, BusError, BusResult, Capabilities, Change, ControlChannel, Discovery, Lifecycle, PeerAddress,
    PeerDescriptor, PeerId, Properties, PropertyMap, SelectionMode, SignalEvent, SignalSpec, SignalStream,
    SnapshotSource, Value,
};

pub const TEST_INTERFACE: &str = "org.example.Peer";
pub const TEST_CONTROL_INTERFACE: &str = "org.example.Peer.Control";
pub const TEST_PREFIX: &str = "org.example.Peer.";

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub address: PeerAddress,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    /// Interfaces implemented by each object.
    objects: HashMap<PeerAddress, Vec<String>>,
    properties: HashMap<(PeerAddress, String), Properties>,
    gates: HashMap<PeerAddress, Arc<Notify>>,
    subscribers: Vec<(SignalSpec, mpsc::UnboundedSender<SignalEvent>)>,
    refused_subscriptions: usize,
    calls: Vec<Call>,
    names: HashSet<String>,
    reconnects: usize,
    epoch: u64,
    offline: bool,
    refused_reconnects: usize,
}

/// A scriptable bus. Cloning it yields another handle onto the same state.
#[derive(Default, Clone)]
pub struct MockBus {
    // unwrap: a poisoned mutex only happens after a test already panicked
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put an object implementing `interface` on the bus.
    pub fn add_object(&self, address: &PeerAddress, interface: &str, properties: Properties) {
        let mut state = self.state.lock().unwrap();
        state.objects.entry(address.clone()).or_default().push(interface.to_string());
        state.properties.insert((address.clone(), interface.to_string()), properties);
    }

    /// Make properties of `interface` available without declaring the interface in introspection.
    pub fn set_properties(&self, address: &PeerAddress, interface: &str, properties: Properties) {
        self.state.lock().unwrap().properties.insert((address.clone(), interface.to_string()), properties);
    }

    /// Hold introspection of `address` until the returned gate is notified.
    pub fn hold(&self, address: &PeerAddress) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gates.insert(address.clone(), gate.clone());
        gate
    }

    /// Deliver a signal to every matching subscription.
    pub fn emit(&self, event: SignalEvent) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (spec, tx) in &state.subscribers {
            if spec.matches(&event) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// End every subscription whose spec satisfies `pred`.
    pub fn drop_subscriptions(&self, pred: impl Fn(&SignalSpec) -> bool) {
        self.state.lock().unwrap().subscribers.retain(|(spec, _)| !pred(spec));
    }

    pub fn subscriptions(&self) -> Vec<SignalSpec> {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.iter().map(|(spec, _)| spec.clone()).collect()
    }

    /// Fail the next `n` subscription attempts.
    pub fn refuse_subscriptions(&self, n: usize) {
        self.state.lock().unwrap().refused_subscriptions = n;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn set_names(&self, names: &[&str]) {
        self.state.lock().unwrap().names = names.iter().map(|n| n.to_string()).collect();
    }

    /// Connections made by [`BusConnection::reconnect`].
    pub fn reconnects(&self) -> usize {
        self.state.lock().unwrap().reconnects
    }

    /// Fail every call with [`BusError::Disconnected`] until a reconnect succeeds, refusing the
    /// first `refused_reconnects` attempts.
    pub fn go_offline(&self, refused_reconnects: usize) {
        let mut state = self.state.lock().unwrap();
        state.offline = true;
        state.refused_reconnects = refused_reconnects;
    }

    fn offline(&self) -> bool {
        self.state.lock().unwrap().offline
    }
}

fn disconnected<T: Send + 'static>() -> BoxFuture<'static, BusResult<T>> {
    Box::pin(async { Err(BusError::Disconnected) })
}

impl BusConnection for MockBus {
    fn introspect(&self, address: &PeerAddress) -> BoxFuture<'static, BusResult<Capabilities>> {
        if self.offline() {
            return disconnected();
        }
        let state = self.state.clone();
        let address = address.clone();
        Box::pin(async move {
            let gate = state.lock().unwrap().gates.get(&address).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let state = state.lock().unwrap();
            match state.objects.get(&address) {
                Some(interfaces) => Ok(Capabilities { interfaces: interfaces.clone(), children: Vec::new() }),
                None => Err(BusError::Unreachable(format!("no object at {}", address))),
            }
        })
    }

    fn get_properties(&self, address: &PeerAddress, interface: &str) -> BoxFuture<'static, BusResult<Properties>> {
        if self.offline() {
            return disconnected();
        }
        let result = match self.state.lock().unwrap().properties.get(&(address.clone(), interface.to_string())) {
            Some(properties) => Ok(properties.clone()),
            None => Err(BusError::Unreachable(format!("no {} at {}", interface, address))),
        };
        Box::pin(async move { result })
    }

    fn get_property(&self, address: &PeerAddress, interface: &str, name: &str) -> BoxFuture<'static, BusResult<Value>> {
        if self.offline() {
            return disconnected();
        }
        let result = self
            .state
            .lock()
            .unwrap()
            .properties
            .get(&(address.clone(), interface.to_string()))
            .and_then(|properties| properties.get(name).cloned())
            .ok_or_else(|| BusError::Remote {
                name: "org.freedesktop.DBus.Error.UnknownProperty".to_string(),
                message: name.to_string(),
            });
        Box::pin(async move { result })
    }

    fn call(
        &self,
        address: &PeerAddress,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, BusResult<Vec<Value>>> {
        if self.offline() {
            return disconnected();
        }
        let call = Call { address: address.clone(), interface: interface.to_string(), method: method.to_string(), args };
        self.state.lock().unwrap().calls.push(call);
        Box::pin(async { Ok(Vec::new()) })
    }

    fn subscribe(&self, spec: SignalSpec) -> BoxFuture<'static, BusResult<SignalStream>> {
        if self.offline() {
            return disconnected();
        }
        let mut state = self.state.lock().unwrap();
        if state.refused_subscriptions > 0 {
            state.refused_subscriptions -= 1;
            return Box::pin(async { Err(BusError::Unreachable("subscription refused".to_string())) });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((spec, tx));
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) });
        Box::pin(async move { Ok(stream.boxed()) })
    }

    fn request_name(&self, name: &str) -> BoxFuture<'static, BusResult<bool>> {
        if self.offline() {
            return disconnected();
        }
        let fresh = self.state.lock().unwrap().names.insert(name.to_string());
        Box::pin(async move { Ok(fresh) })
    }

    fn list_names(&self) -> BoxFuture<'static, BusResult<HashSet<String>>> {
        if self.offline() {
            return disconnected();
        }
        let names = self.state.lock().unwrap().names.clone();
        Box::pin(async move { Ok(names) })
    }

    fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    fn reconnect(&self, lost: u64) -> BoxFuture<'static, BusResult<()>> {
        let mut state = self.state.lock().unwrap();
        if state.epoch != lost {
            return Box::pin(async { Ok(()) });
        }
        if state.refused_reconnects > 0 {
            state.refused_reconnects -= 1;
            return Box::pin(async { Err(BusError::Unreachable("connection refused".to_string())) });
        }
        state.offline = false;
        state.epoch += 1;
        state.reconnects += 1;
        Box::pin(async { Ok(()) })
    }
}

pub fn address_of(id: &str) -> PeerAddress {
    PeerAddress::new(id, "/peer")
}

/// A `PropertiesChanged` signal for `interface`, as emitted by the object at `address`.
pub fn properties_changed_event(address: &PeerAddress, interface: &str, changed: Properties) -> SignalEvent {
    SignalEvent {
        sender: address.service.clone(),
        path: address.path.clone(),
        interface: crate::PROPERTIES_INTERFACE.to_string(),
        member: "PropertiesChanged".to_string(),
        args: vec![interface.into(), Value::Map(changed), Value::List(Vec::new())],
    }
}

pub fn name_owner_changed(name: &str, old: &str, new: &str) -> SignalEvent {
    SignalEvent {
        sender: "org.freedesktop.DBus".to_string(),
        path: "/org/freedesktop/DBus".to_string(),
        interface: "org.freedesktop.DBus".to_string(),
        member: "NameOwnerChanged".to_string(),
        args: vec![name.into(), old.into(), new.into()],
    }
}

fn mirror_lowercase(name: &str, value: &Value, out: &mut Properties) {
    out.insert(name.to_lowercase(), value.clone());
}

fn peer_id(raw: &str) -> Option<PeerId> {
    let id = raw.strip_prefix(TEST_PREFIX).unwrap_or(raw);
    (!id.is_empty() && !id.contains(' ')).then(|| id.to_string())
}

fn address(id: &str) -> PeerAddress {
    address_of(id)
}

fn change_signal(address: &PeerAddress) -> SignalSpec {
    properties_changed_signal(address, TEST_INTERFACE)
}

/// Changed properties are applied as sent; an update that only invalidates refetches `Title`.
fn interpret_change(event: &SignalEvent) -> Option<Change> {
    let changed = properties_changed(event, TEST_INTERFACE)?;
    if changed.is_empty() && event.args.get(2).map_or(false, |invalidated| !invalidated.string_list().is_empty()) {
        return Some(Change::Refetch(&["Title"]));
    }
    Some(Change::Delta(changed))
}

/// A `PropertiesChanged` signal that only invalidates `names`.
pub fn invalidated_event(address: &PeerAddress, interface: &str, names: &[&str]) -> SignalEvent {
    let mut event = properties_changed_event(address, interface, Properties::new());
    event.args[2] = Value::List(names.iter().map(|n| Value::from(*n)).collect());
    event
}

fn discovery_signals() -> Vec<SignalSpec> {
    vec![SignalSpec::new("org.freedesktop.DBus").member("NameOwnerChanged")]
}

fn classify(event: &SignalEvent) -> Option<Lifecycle> {
    let name = event.arg_str(0)?.strip_prefix(TEST_PREFIX)?;
    match event.arg_str(2)? {
        "" => Some(Lifecycle::Vanished(name.to_string())),
        _ => Some(Lifecycle::Appeared(name.to_string())),
    }
}

fn control_signal(address: &PeerAddress) -> SignalSpec {
    properties_changed_signal(address, TEST_CONTROL_INTERFACE)
}

fn interpret_control(event: &SignalEvent) -> Option<Properties> {
    properties_changed(event, TEST_CONTROL_INTERFACE)
}

const TEST_PROPERTIES: PropertyMap = PropertyMap { names: &["Status", "Title"], map: mirror_lowercase };

const TEST_DISCOVERY: Discovery = Discovery {
    snapshot: SnapshotSource::NamesWithPrefix(TEST_PREFIX),
    signals: discovery_signals,
    classify,
    prepare: None,
};

/// Multi-select peers at `<id>/peer` implementing [`TEST_INTERFACE`].
pub static MULTI: PeerDescriptor = PeerDescriptor {
    kind: "test",
    mode: SelectionMode::Multi,
    interface: TEST_INTERFACE,
    properties: TEST_PROPERTIES,
    discovery: TEST_DISCOVERY,
    peer_id,
    address,
    change_signal,
    interpret_change,
    control: None,
};

/// Like [`MULTI`], but with a control channel on [`TEST_CONTROL_INTERFACE`].
pub static SINGLE: PeerDescriptor = PeerDescriptor {
    kind: "test-single",
    mode: SelectionMode::Single,
    interface: TEST_INTERFACE,
    properties: TEST_PROPERTIES,
    discovery: TEST_DISCOVERY,
    peer_id,
    address,
    change_signal,
    interpret_change,
    control: Some(ControlChannel {
        interface: TEST_CONTROL_INTERFACE,
        properties: PropertyMap { names: &["State"], map: mirror_lowercase },
        signal: control_signal,
        interpret: interpret_control,
        commands: &["Toggle", "Stop"],
    }),
};
