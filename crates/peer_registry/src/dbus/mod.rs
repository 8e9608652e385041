//! # zbus transport
//!
//! [`ZbusConnection`] implements [`BusConnection`] either on the session bus or on a
//! peer-to-peer connection (PulseAudio runs its own D-Bus server). A connection may start out
//! unconnected and gets established by the discovery driver's reconnect loop. Signal bodies and method
//! replies are decoded dynamically, since the registries only ever look at them as [`Value`]s.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use futures::{future::BoxFuture, StreamExt};
use zbus::{
    fdo::{DBusProxy, RequestNameFlags, RequestNameReply},
    names::BusName,
    zvariant::{OwnedValue, Structure, StructureBuilder},
    ConnectionBuilder, MatchRule, MessageStream, MessageType,
};

use crate::{
    value::{properties_from_bus, to_bus_arg},
    BusConnection, BusError, BusResult, Capabilities, PeerAddress, Properties, SignalEvent, SignalSpec, SignalStream,
    Value, PROPERTIES_INTERFACE,
};

const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const DBUS_NAME: &str = "org.freedesktop.DBus";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTarget {
    Session,
    /// A D-Bus server address, connected to peer-to-peer.
    Address(String),
    /// PulseAudio's own D-Bus server. Its address is looked up on the session bus every time
    /// the connection is (re)established.
    PulseAudio,
}

#[derive(Debug, Default)]
struct Slot {
    con: Option<zbus::Connection>,
    /// Bumped every time `con` is replaced.
    epoch: u64,
}

#[derive(Debug, Clone)]
pub struct ZbusConnection {
    target: BusTarget,
    slot: Arc<RwLock<Slot>>,
    /// Held while a replacement connection is being established.
    reconnecting: Arc<tokio::sync::Mutex<()>>,
}

impl ZbusConnection {
    pub async fn session() -> BusResult<Self> {
        Self::open(BusTarget::Session).await
    }

    pub async fn open(target: BusTarget) -> BusResult<Self> {
        let con = connect(&target).await?;
        Ok(Self::with_connection(target, Some(con)))
    }

    /// A connection to `target` that is not established yet. Every call fails with
    /// [`BusError::Disconnected`] until the first [`BusConnection::reconnect`] succeeds.
    pub fn lazy(target: BusTarget) -> Self {
        Self::with_connection(target, None)
    }

    fn with_connection(target: BusTarget, con: Option<zbus::Connection>) -> Self {
        Self { target, slot: Arc::new(RwLock::new(Slot { con, epoch: 0 })), reconnecting: Default::default() }
    }

    pub fn target(&self) -> &BusTarget {
        &self.target
    }

    /// The current underlying connection. It is replaced by [`BusConnection::reconnect`].
    pub fn connection(&self) -> BusResult<zbus::Connection> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).con.clone().ok_or(BusError::Disconnected)
    }
}

async fn connect(target: &BusTarget) -> BusResult<zbus::Connection> {
    let con = match target {
        BusTarget::Session => zbus::Connection::session().await?,
        BusTarget::Address(address) => ConnectionBuilder::address(address.as_str())?.p2p().build().await?,
        BusTarget::PulseAudio => {
            let session = ZbusConnection::with_connection(BusTarget::Session, Some(zbus::Connection::session().await?));
            let address = crate::sinks::server_address(&session).await?;
            log::debug!("PulseAudio listens on {}", address);
            ConnectionBuilder::address(address.as_str())?.p2p().build().await?
        }
    };
    Ok(con)
}

/// Peers on a peer-to-peer connection have no bus name.
fn destination(address: &PeerAddress) -> Option<&str> {
    (!address.service.is_empty()).then_some(address.service.as_str())
}

/// Decode a message body into its arguments.
fn decode_body(msg: &zbus::Message) -> BusResult<Vec<Value>> {
    match msg.body_signature() {
        Ok(signature) if !signature.as_str().is_empty() => {}
        _ => return Ok(Vec::new()),
    }
    let body: Structure<'_> = msg.body()?;
    Ok(body.fields().iter().map(Value::from).collect())
}

fn signal_event(msg: &zbus::Message) -> Option<SignalEvent> {
    let sender = msg.header().ok()?.sender().ok().flatten().map(|s| s.to_string()).unwrap_or_default();
    let args = match decode_body(msg) {
        Ok(args) => args,
        Err(e) => {
            log::debug!("could not decode signal body: {}", e);
            return None;
        }
    };
    Some(SignalEvent {
        sender,
        path: msg.path()?.to_string(),
        interface: msg.interface()?.to_string(),
        member: msg.member()?.to_string(),
        args,
    })
}

/// Resolve a well-known name to its unique owner.
///
/// Signal headers only carry unique names, and zbus can't tell on its own whether a signal from
/// a unique name belongs to a well-known one, so rules have to use the unique name.
async fn resolve_owner(con: &zbus::Connection, name: &str) -> BusResult<String> {
    let dbus = DBusProxy::new(con).await?;
    let name = BusName::try_from(name).map_err(zbus::Error::from)?;
    Ok(dbus.get_name_owner(name).await?.to_string())
}

impl BusConnection for ZbusConnection {
    fn introspect(&self, address: &PeerAddress) -> BoxFuture<'static, BusResult<Capabilities>> {
        let con = self.connection();
        let address = address.clone();
        Box::pin(async move {
            let con = con?;
            let reply = con
                .call_method(destination(&address), address.path.as_str(), Some(INTROSPECTABLE_INTERFACE), "Introspect", &())
                .await?;
            let xml: String = reply.body()?;
            Capabilities::from_xml(&xml)
        })
    }

    fn get_properties(&self, address: &PeerAddress, interface: &str) -> BoxFuture<'static, BusResult<Properties>> {
        let con = self.connection();
        let address = address.clone();
        let interface = interface.to_string();
        Box::pin(async move {
            let con = con?;
            let reply = con
                .call_method(destination(&address), address.path.as_str(), Some(PROPERTIES_INTERFACE), "GetAll", &interface)
                .await?;
            let properties: HashMap<String, OwnedValue> = reply.body()?;
            Ok(properties_from_bus(&properties))
        })
    }

    fn get_property(&self, address: &PeerAddress, interface: &str, name: &str) -> BoxFuture<'static, BusResult<Value>> {
        let con = self.connection();
        let address = address.clone();
        let body = (interface.to_string(), name.to_string());
        Box::pin(async move {
            let con = con?;
            let reply =
                con.call_method(destination(&address), address.path.as_str(), Some(PROPERTIES_INTERFACE), "Get", &body).await?;
            let value: OwnedValue = reply.body()?;
            Ok(Value::from(&*value))
        })
    }

    fn call(
        &self,
        address: &PeerAddress,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, BusResult<Vec<Value>>> {
        let con = self.connection();
        let address = address.clone();
        let interface = interface.to_string();
        let method = method.to_string();
        Box::pin(async move {
            let con = con?;
            let dest = destination(&address);
            let path = address.path.as_str();
            let reply = if args.is_empty() {
                con.call_method(dest, path, Some(interface.as_str()), method.as_str(), &()).await?
            } else {
                // a structure body is sent as its fields, one argument each
                let mut body = StructureBuilder::new();
                for arg in &args {
                    body = body.append_field(to_bus_arg(arg)?);
                }
                con.call_method(dest, path, Some(interface.as_str()), method.as_str(), &body.build()).await?
            };
            decode_body(&reply)
        })
    }

    fn subscribe(&self, spec: SignalSpec) -> BoxFuture<'static, BusResult<SignalStream>> {
        let con = self.connection();
        let on_bus = self.target == BusTarget::Session;
        Box::pin(async move {
            let con = con?;
            let sender = match spec.sender.clone() {
                Some(name) if on_bus && !name.starts_with(':') && name != DBUS_NAME => Some(resolve_owner(&con, &name).await?),
                sender => sender,
            };

            let mut rule = MatchRule::builder().msg_type(MessageType::Signal).interface(spec.interface.as_str())?;
            if let Some(sender) = &sender {
                rule = rule.sender(sender.as_str())?;
            }
            if let Some(path) = &spec.path {
                rule = rule.path(path.as_str())?;
            }
            if let Some(member) = &spec.member {
                rule = rule.member(member.as_str())?;
            }
            if let Some(arg0) = &spec.arg0 {
                rule = rule.arg(0, arg0.as_str())?;
            }
            log::debug!("subscribing to {:?}", spec);

            let stream = MessageStream::for_match_rule(rule.build(), &con, None).await?;
            let events = stream.filter_map(|msg| futures::future::ready(msg.ok().and_then(|msg| signal_event(&msg))));
            Ok(events.boxed())
        })
    }

    fn request_name(&self, name: &str) -> BoxFuture<'static, BusResult<bool>> {
        let con = self.connection();
        let name = name.to_string();
        Box::pin(async move {
            let con = con?;
            let flags = [RequestNameFlags::DoNotQueue];
            let reply = con.request_name_with_flags(name.as_str(), flags.into_iter().collect()).await?;
            Ok(matches!(reply, RequestNameReply::PrimaryOwner))
        })
    }

    fn list_names(&self) -> BoxFuture<'static, BusResult<HashSet<String>>> {
        let con = self.connection();
        Box::pin(async move {
            let con = con?;
            let dbus = DBusProxy::new(&con).await?;
            let names = dbus.list_names().await?;
            Ok(names.into_iter().map(|name| name.to_string()).collect())
        })
    }

    fn epoch(&self) -> u64 {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).epoch
    }

    fn reconnect(&self, lost: u64) -> BoxFuture<'static, BusResult<()>> {
        let target = self.target.clone();
        let slot = self.slot.clone();
        let reconnecting = self.reconnecting.clone();
        Box::pin(async move {
            // registries sharing this connection all notice its loss, but only one replaces it
            let _guard = reconnecting.lock().await;
            let current = slot.read().unwrap_or_else(PoisonError::into_inner).epoch;
            if current != lost {
                log::debug!("connection to {:?} was replaced already", target);
                return Ok(());
            }
            let con = connect(&target).await?;
            let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.con = Some(con);
            slot.epoch += 1;
            log::info!("connected to {:?}", target);
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_lazy_connection_is_disconnected() {
        let pulse = ZbusConnection::lazy(BusTarget::PulseAudio);
        assert_eq!(pulse.target(), &BusTarget::PulseAudio);
        assert_eq!(pulse.epoch(), 0);
        assert!(matches!(pulse.connection(), Err(BusError::Disconnected)));
        assert!(matches!(pulse.list_names().await, Err(BusError::Disconnected)));
        // a connection that was replaced already is left alone
        assert!(pulse.reconnect(1).await.is_ok());
        assert_eq!(pulse.epoch(), 0);
    }
}
