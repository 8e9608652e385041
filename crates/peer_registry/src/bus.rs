//! The message-bus contract the registries are written against.
//!
//! Everything a registry needs from the bus goes through [`BusConnection`], which is passed to
//! each registry explicitly. [`crate::dbus::ZbusConnection`] implements it on top of zbus; the
//! tests use an in-memory implementation.

use std::collections::HashSet;

use futures::{future::BoxFuture, stream::BoxStream};
use serde::Deserialize;

use crate::{BusError, Properties, Value};

/// Identifier of a peer, unique within one registry.
pub type PeerId = String;

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Stream of signals matching one [`SignalSpec`]. Dropping it cancels the subscription.
pub type SignalStream = BoxStream<'static, SignalEvent>;

/// Where a remote object lives: the bus name of its owner and its object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub service: String,
    pub path: String,
}

impl PeerAddress {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self { service: service.into(), path: path.into() }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.service, self.path)
    }
}

/// What introspecting an object told us about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Interfaces implemented by the object itself.
    pub interfaces: Vec<String>,
    /// Names of child nodes.
    pub children: Vec<String>,
}

#[derive(Deserialize)]
struct DBusNode {
    #[serde(default)]
    interface: Vec<DBusInterface>,

    #[serde(default)]
    node: Vec<DBusChildNode>,
}

#[derive(Deserialize)]
struct DBusInterface {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Deserialize)]
struct DBusChildNode {
    #[serde(rename = "@name")]
    name: Option<String>,
}

impl Capabilities {
    /// Parse the XML returned by `org.freedesktop.DBus.Introspectable.Introspect`.
    pub fn from_xml(xml: &str) -> BusResult<Self> {
        let node = quick_xml::de::from_str::<DBusNode>(xml).map_err(|e| BusError::Malformed(e.to_string()))?;
        Ok(Self {
            interfaces: node.interface.into_iter().map(|i| i.name).collect(),
            children: node.node.into_iter().filter_map(|n| n.name).collect(),
        })
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }
}

/// Describes a set of signals to subscribe to. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: String,
    pub member: Option<String>,
    /// Required value of the first (string) argument.
    pub arg0: Option<String>,
}

impl SignalSpec {
    pub fn new(interface: impl Into<String>) -> Self {
        Self { sender: None, path: None, interface: interface.into(), member: None, arg0: None }
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Restrict this spec to signals emitted by the object at `address`.
    pub fn from_peer(self, address: &PeerAddress) -> Self {
        self.sender(address.service.clone()).path(address.path.clone())
    }

    pub fn matches(&self, event: &SignalEvent) -> bool {
        fn field_matches(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().map_or(true, |e| e == actual)
        }
        self.interface == event.interface
            && field_matches(&self.sender, &event.sender)
            && field_matches(&self.path, &event.path)
            && field_matches(&self.member, &event.member)
            && self.arg0.as_deref().map_or(true, |a| event.args.first().and_then(Value::as_str) == Some(a))
    }
}

/// A signal as delivered to subscribers, with its body decoded into [`Value`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

impl SignalEvent {
    pub fn arg_str(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).and_then(Value::as_str)
    }
}

/// Asynchronous access to the message bus.
///
/// Every returned future is `'static`, so callers can move it into a spawned task. None of the
/// operations block other tasks.
pub trait BusConnection: Send + Sync + 'static {
    /// Introspect the object at `address`.
    fn introspect(&self, address: &PeerAddress) -> BoxFuture<'static, BusResult<Capabilities>>;

    /// Fetch all properties of `interface` on the object at `address`.
    fn get_properties(&self, address: &PeerAddress, interface: &str) -> BoxFuture<'static, BusResult<Properties>>;

    /// Fetch a single property.
    fn get_property(&self, address: &PeerAddress, interface: &str, name: &str) -> BoxFuture<'static, BusResult<Value>>;

    /// Call `method` on the object at `address`, returning the decoded reply body.
    fn call(
        &self,
        address: &PeerAddress,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, BusResult<Vec<Value>>>;

    /// Subscribe to the signals described by `spec`.
    fn subscribe(&self, spec: SignalSpec) -> BoxFuture<'static, BusResult<SignalStream>>;

    /// Request a well-known name. Resolves to `true` if we became its primary owner.
    fn request_name(&self, name: &str) -> BoxFuture<'static, BusResult<bool>>;

    /// Names currently owned on the bus.
    fn list_names(&self) -> BoxFuture<'static, BusResult<HashSet<String>>>;

    /// Identifies the current underlying connection. It changes every time [`Self::reconnect`]
    /// replaces it.
    fn epoch(&self) -> u64 {
        0
    }

    /// Re-establish the connection identified by `lost`. Resolves without doing anything if that
    /// connection was replaced already, so several users of one connection can all report its loss.
    fn reconnect(&self, _lost: u64) -> BoxFuture<'static, BusResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
