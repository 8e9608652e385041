//! Audio sinks of a PulseAudio (or pipewire-pulse) server, via its D-Bus protocol module.
//!
//! PulseAudio doesn't put its objects on the session bus. The session bus only tells us where
//! its own D-Bus server listens, and everything else happens on a peer-to-peer connection to that
//! server, where objects have no bus name. Signals are only delivered after asking the core for
//! them with `ListenForSignal`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    BusConnection, BusError, BusResult, Change, Discovery, Lifecycle, PeerAddress, PeerDescriptor, PeerId, Properties,
    PropertyMap, SelectionMode, SignalEvent, SignalSpec, SnapshotSource, Value,
};

pub const CORE_PATH: &str = "/org/pulseaudio/core1";
pub const CORE_INTERFACE: &str = "org.PulseAudio.Core1";
pub const DEVICE_INTERFACE: &str = "org.PulseAudio.Core1.Device";

const LOOKUP_NAME: &str = "org.PulseAudio1";
const LOOKUP_PATH: &str = "/org/pulseaudio/server_lookup1";
const LOOKUP_INTERFACE: &str = "org.PulseAudio.ServerLookup1";
/// Overrides the server address found on the session bus.
const SERVER_ENV: &str = "PULSE_DBUS_SERVER";

/// `PA_VOLUME_NORM`, the volume that counts as 100%.
const VOLUME_NORM: f64 = 65536.0;

/// Signals the core has to forward to us.
const SIGNALS: &[&str] = &[
    "org.PulseAudio.Core1.NewSink",
    "org.PulseAudio.Core1.SinkRemoved",
    "org.PulseAudio.Core1.Device.VolumeUpdated",
    "org.PulseAudio.Core1.Device.MuteUpdated",
];

pub static SINKS: PeerDescriptor = PeerDescriptor {
    kind: "sinks",
    mode: SelectionMode::Multi,
    interface: DEVICE_INTERFACE,
    properties: PropertyMap { names: &["Name", "Description", "Volume", "Mute"], map: map_property },
    discovery: Discovery {
        snapshot: SnapshotSource::Property { service: "", path: CORE_PATH, interface: CORE_INTERFACE, name: "Sinks" },
        signals: discovery_signals,
        classify,
        prepare: Some(listen_for_signals),
    },
    peer_id,
    address,
    change_signal,
    interpret_change,
    control: None,
};

/// Look up the address of PulseAudio's D-Bus server on the session bus.
pub async fn server_address(session: &dyn BusConnection) -> BusResult<String> {
    if let Ok(address) = std::env::var(SERVER_ENV) {
        return Ok(address);
    }
    let lookup = PeerAddress::new(LOOKUP_NAME, LOOKUP_PATH);
    let address = session.get_property(&lookup, LOOKUP_INTERFACE, "Address").await?;
    match address.as_str() {
        Some(address) if !address.is_empty() => Ok(address.to_string()),
        _ => Err(BusError::Malformed(format!("unexpected server address {:?}", address))),
    }
}

/// Average over all channels, relative to [`VOLUME_NORM`].
fn volume_fraction(channels: &Value) -> Option<f64> {
    let channels = channels.as_list()?.iter().map(Value::as_f64).collect::<Option<Vec<_>>>()?;
    if channels.is_empty() {
        return None;
    }
    Some(channels.iter().sum::<f64>() / channels.len() as f64 / VOLUME_NORM)
}

fn map_property(name: &str, value: &Value, out: &mut Properties) {
    match name {
        "Name" => {
            out.insert("name".to_string(), value.clone());
        }
        "Description" => {
            out.insert("description".to_string(), value.clone());
        }
        "Volume" => {
            if let Some(volume) = volume_fraction(value) {
                out.insert("volume".to_string(), Value::Double(volume));
            }
        }
        "Mute" => {
            out.insert("muted".to_string(), value.clone());
        }
        _ => {}
    }
}

fn peer_id(raw: &str) -> Option<PeerId> {
    let sink = raw.strip_prefix(CORE_PATH)?.strip_prefix("/sink")?;
    (!sink.is_empty()).then(|| raw.to_string())
}

fn address(id: &str) -> PeerAddress {
    PeerAddress::new("", id)
}

fn discovery_signals() -> Vec<SignalSpec> {
    vec![SignalSpec::new(CORE_INTERFACE).path(CORE_PATH)]
}

fn classify(event: &SignalEvent) -> Option<Lifecycle> {
    let path = event.arg_str(0)?.to_string();
    match event.member.as_str() {
        "NewSink" => Some(Lifecycle::Appeared(path)),
        "SinkRemoved" => Some(Lifecycle::Vanished(path)),
        _ => None,
    }
}

fn change_signal(address: &PeerAddress) -> SignalSpec {
    SignalSpec::new(DEVICE_INTERFACE).path(address.path.clone())
}

fn interpret_change(event: &SignalEvent) -> Option<Change> {
    let name = match event.member.as_str() {
        "VolumeUpdated" => "Volume",
        "MuteUpdated" => "Mute",
        _ => return None,
    };
    let value = event.args.first()?.clone();
    Some(Change::Delta(Properties::from([(name.to_string(), value)])))
}

/// Ask the core to forward the signals we subscribe to, from all objects.
fn listen_for_signals(bus: Arc<dyn BusConnection>) -> BoxFuture<'static, BusResult<()>> {
    Box::pin(async move {
        let core = PeerAddress::new("", CORE_PATH);
        for signal in SIGNALS {
            // an empty object list means every object
            bus.call(&core, CORE_INTERFACE, "ListenForSignal", vec![Value::from(*signal), Value::List(Vec::new())]).await?;
        }
        Ok(())
    })
}
