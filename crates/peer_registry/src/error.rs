use thiserror::Error;
use zbus::DBusError as _;

use crate::PeerId;

/// Failures reported by a [`BusConnection`][crate::BusConnection].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },
    #[error("bus connection lost")]
    Disconnected,
    #[error("malformed data: {0}")]
    Malformed(String),
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, message, _) => {
                BusError::Remote { name: name.to_string(), message: message.unwrap_or_default() }
            }
            zbus::Error::FDO(e) => BusError::from(*e),
            zbus::Error::InputOutput(e) => BusError::Unreachable(e.to_string()),
            zbus::Error::Variant(e) => BusError::Malformed(e.to_string()),
            e => BusError::Unreachable(e.to_string()),
        }
    }
}

impl From<zbus::fdo::Error> for BusError {
    fn from(e: zbus::fdo::Error) -> Self {
        match e {
            zbus::fdo::Error::ZBus(e) => BusError::from(e),
            zbus::fdo::Error::ServiceUnknown(msg)
            | zbus::fdo::Error::NameHasNoOwner(msg)
            | zbus::fdo::Error::NoReply(msg)
            | zbus::fdo::Error::Timeout(msg)
            | zbus::fdo::Error::Disconnected(msg) => BusError::Unreachable(msg),
            e => {
                let message = e.to_string();
                BusError::Remote { name: e.name().to_string(), message }
            }
        }
    }
}

/// Errors returned to callers of a [`RegistryHandle`][crate::RegistryHandle].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("cannot select {0:?}: no such active peer")]
    SelectionInvalid(PeerId),
    #[error("registry {0} does not support selection")]
    NotSingleSelect(&'static str),
    #[error("no peer is selected")]
    NoSelection,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("registry loop has stopped")]
    Closed,
}

/// Events that are deliberately not acted upon. These are never errors for the consumer, but
/// handlers report them so they can be logged in one place (and checked in tests).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    #[error("discovery of {0} ignored, peer is already known")]
    DuplicateDiscovery(PeerId),
    #[error("property update for {0} dropped, peer is not active")]
    StalePropertyUpdate(PeerId),
    #[error("introspection result for {0} discarded, peer vanished in the meantime")]
    PeerVanishedDuringIntrospection(PeerId),
    #[error("vanish of unknown peer {0} ignored")]
    UnknownPeer(PeerId),
    #[error("could not derive a peer id from {0:?}")]
    UnrecognizedId(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
