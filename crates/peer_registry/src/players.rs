//! Media players implementing [MPRIS](https://specifications.freedesktop.org/mpris-spec/latest/).
//!
//! Players are found by their well-known bus names. Only one player is bound at a time; its
//! `org.mpris.MediaPlayer2.Player` interface is the transport channel that playback state is
//! mirrored from and commands are sent to.

use crate::{
    descriptor::{properties_changed, properties_changed_signal, rename},
    Change, ControlChannel, Discovery, Lifecycle, PeerAddress, PeerDescriptor, PeerId, Properties, PropertyMap,
    SelectionMode, SignalEvent, SignalSpec, SnapshotSource, Value,
};

pub const NAME_PREFIX: &str = "org.mpris.MediaPlayer2.";
pub const PLAYER_PATH: &str = "/org/mpris/MediaPlayer2";
pub const ROOT_INTERFACE: &str = "org.mpris.MediaPlayer2";
pub const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";

const ROOT_RENAMES: &[(&str, &str)] = &[("Identity", "identity"), ("DesktopEntry", "desktop_entry")];

const PLAYER_RENAMES: &[(&str, &str)] = &[
    ("PlaybackStatus", "status"),
    ("CanGoNext", "can_go_next"),
    ("CanGoPrevious", "can_go_previous"),
    ("CanPlay", "can_play"),
    ("CanPause", "can_pause"),
];

pub static PLAYERS: PeerDescriptor = PeerDescriptor {
    kind: "players",
    mode: SelectionMode::Single,
    interface: ROOT_INTERFACE,
    properties: PropertyMap { names: &["Identity", "DesktopEntry"], map: map_root_property },
    discovery: Discovery {
        snapshot: SnapshotSource::NamesWithPrefix(NAME_PREFIX),
        signals: discovery_signals,
        classify,
        prepare: None,
    },
    peer_id,
    address,
    change_signal,
    interpret_change,
    control: Some(ControlChannel {
        interface: PLAYER_INTERFACE,
        properties: PropertyMap {
            names: &["PlaybackStatus", "Metadata", "CanGoNext", "CanGoPrevious", "CanPlay", "CanPause"],
            map: map_player_property,
        },
        signal: player_signal,
        interpret: interpret_player_change,
        commands: &["PlayPause", "Play", "Pause", "Next", "Previous", "Stop"],
    }),
};

fn map_root_property(name: &str, value: &Value, out: &mut Properties) {
    rename(ROOT_RENAMES, name, value, out)
}

fn map_player_property(name: &str, value: &Value, out: &mut Properties) {
    if name != "Metadata" {
        return rename(PLAYER_RENAMES, name, value, out);
    }
    let metadata = value.as_map();
    let title = metadata.and_then(|m| m.get("xesam:title")).and_then(Value::as_str).unwrap_or_default();
    let artist = metadata.and_then(|m| m.get("xesam:artist")).map(Value::string_list).unwrap_or_default().join(", ");
    out.insert("title".to_string(), Value::from(title));
    out.insert("artist".to_string(), Value::from(artist));
}

/// Players are identified by their full bus name, e.g. `org.mpris.MediaPlayer2.firefox.instance_1_42`.
fn peer_id(raw: &str) -> Option<PeerId> {
    let player = raw.strip_prefix(NAME_PREFIX)?;
    (!player.is_empty()).then(|| raw.to_string())
}

fn address(id: &str) -> PeerAddress {
    PeerAddress::new(id, PLAYER_PATH)
}

fn discovery_signals() -> Vec<SignalSpec> {
    vec![SignalSpec::new("org.freedesktop.DBus")
        .member("NameOwnerChanged")
        .sender("org.freedesktop.DBus")
        .path("/org/freedesktop/DBus")]
}

/// `NameOwnerChanged(name, old_owner, new_owner)`: an empty new owner means the name is gone.
fn classify(event: &SignalEvent) -> Option<Lifecycle> {
    let name = event.arg_str(0)?;
    if !name.starts_with(NAME_PREFIX) {
        return None;
    }
    match event.arg_str(2)? {
        "" => Some(Lifecycle::Vanished(name.to_string())),
        _ => Some(Lifecycle::Appeared(name.to_string())),
    }
}

fn change_signal(address: &PeerAddress) -> SignalSpec {
    properties_changed_signal(address, ROOT_INTERFACE)
}

fn interpret_change(event: &SignalEvent) -> Option<Change> {
    properties_changed(event, ROOT_INTERFACE).map(Change::Delta)
}

fn player_signal(address: &PeerAddress) -> SignalSpec {
    properties_changed_signal(address, PLAYER_INTERFACE)
}

fn interpret_player_change(event: &SignalEvent) -> Option<Properties> {
    properties_changed(event, PLAYER_INTERFACE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{name_owner_changed, properties_changed_event};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ids() {
        assert_eq!(peer_id("org.mpris.MediaPlayer2.spotify"), Some("org.mpris.MediaPlayer2.spotify".to_string()));
        assert_eq!(peer_id("org.mpris.MediaPlayer2."), None);
        assert_eq!(peer_id("org.freedesktop.Notifications"), None);
        assert_eq!(address("org.mpris.MediaPlayer2.mpv"), PeerAddress::new("org.mpris.MediaPlayer2.mpv", PLAYER_PATH));
    }

    #[test]
    fn test_classify() {
        let appeared = name_owner_changed("org.mpris.MediaPlayer2.mpv", "", ":1.80");
        assert!(discovery_signals()[0].matches(&appeared));
        assert_eq!(classify(&appeared), Some(Lifecycle::Appeared("org.mpris.MediaPlayer2.mpv".to_string())));
        let vanished = name_owner_changed("org.mpris.MediaPlayer2.mpv", ":1.80", "");
        assert_eq!(classify(&vanished), Some(Lifecycle::Vanished("org.mpris.MediaPlayer2.mpv".to_string())));
        assert_eq!(classify(&name_owner_changed(":1.80", "", ":1.80")), None);
    }

    #[test]
    fn test_metadata() {
        let raw = btreemap! {
            "PlaybackStatus".to_string() => Value::from("Playing"),
            "Metadata".to_string() => Value::Map(btreemap! {
                "xesam:title".to_string() => Value::from("Everything In Its Right Place"),
                "xesam:artist".to_string() => Value::from(vec!["Radiohead"]),
                "mpris:length".to_string() => Value::Int(250_000_000),
            }),
            "CanGoNext".to_string() => Value::Bool(true),
            "Volume".to_string() => Value::Double(1.0),
        };
        let Some(control) = &PLAYERS.control else { panic!("players have a control channel") };
        assert_eq!(
            control.properties.mirror(&raw),
            btreemap! {
                "status".to_string() => Value::from("Playing"),
                "title".to_string() => Value::from("Everything In Its Right Place"),
                "artist".to_string() => Value::from("Radiohead"),
                "can_go_next".to_string() => Value::Bool(true),
            }
        );
    }

    #[test]
    fn test_missing_metadata_clears_the_track() {
        let Some(control) = &PLAYERS.control else { panic!("players have a control channel") };
        let raw = btreemap! {
            "Metadata".to_string() => Value::Map(btreemap! {
                "xesam:artist".to_string() => Value::from(vec!["Boards of Canada", "Hell Interface"]),
            }),
        };
        assert_eq!(
            control.properties.mirror(&raw),
            btreemap! {
                "title".to_string() => Value::from(""),
                "artist".to_string() => Value::from("Boards of Canada, Hell Interface"),
            }
        );
    }

    #[test]
    fn test_player_changes_only_come_from_the_player_interface() {
        let Some(control) = &PLAYERS.control else { panic!("players have a control channel") };
        let player = address("org.mpris.MediaPlayer2.mpv");
        let paused = properties_changed_event(&player, PLAYER_INTERFACE, btreemap! {
            "PlaybackStatus".to_string() => Value::from("Paused"),
        });
        assert!((control.signal)(&player).matches(&paused));
        assert!(!change_signal(&player).matches(&paused));
        assert_eq!((control.interpret)(&paused), Some(btreemap! { "PlaybackStatus".to_string() => Value::from("Paused") }));
        assert_eq!(interpret_change(&paused), None);

        let renamed = properties_changed_event(&player, ROOT_INTERFACE, btreemap! {
            "Identity".to_string() => Value::from("mpv Media Player"),
        });
        assert!(change_signal(&player).matches(&renamed));
        let Some(Change::Delta(delta)) = interpret_change(&renamed) else { panic!("expected a delta") };
        assert_eq!(PLAYERS.mirror(&delta), btreemap! { "identity".to_string() => Value::from("mpv Media Player") });
    }
}
