//! Messages used by the framework itself.
//!
//! The handshake coordinator exchanges [`Ping`], [`NewConnectionRequest`] and [`NewConnectionInitializer`].
//! [`CacheRegistration`] and [`CacheUnRegistration`] are control messages for a cache or broadcast layer built on top
//! of the dispatch registry; the core only routes them to whatever pipeline is registered for them.

use serde::{Deserialize, Serialize};

use crate::{
    id::{ClientId, ConnectionKey},
    message::Message,
};

/// Carries the id assigned by the server, in both directions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// The assigned id.
    pub client_id: ClientId,
}

impl Message for Ping {
    const TAG: &'static str = "Ping";
}

/// Asks the remote side to accept a new connection under `key`. Echoed back as the acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnectionRequest {
    /// Key of the connection about to be opened.
    pub key: ConnectionKey,
}

impl Message for NewConnectionRequest {
    const TAG: &'static str = "NewConnectionRequest";
}

/// Merges a freshly handshaken socket into the canonical peer. Echoed back as the acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnectionInitializer {
    /// Key the new connection is stored under.
    pub key: ConnectionKey,
    /// Id of the peer the connection belongs to.
    pub canonical_id: ClientId,
    /// Id the new socket was assigned by its own Ping handshake.
    pub temporary_id: ClientId,
}

impl Message for NewConnectionInitializer {
    const TAG: &'static str = "NewConnectionInitializer";
}

/// Subscribes the sending peer to updates of a message type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRegistration {
    /// Tag of the observed message type.
    pub type_tag: String,
}

impl CacheRegistration {
    /// Creates a registration for `M`.
    pub fn of<M: Message>() -> Self {
        CacheRegistration {
            type_tag: M::TAG.to_string(),
        }
    }
}

impl Message for CacheRegistration {
    const TAG: &'static str = "CacheRegistration";
}

/// Cancels a [`CacheRegistration`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUnRegistration {
    /// Tag of the observed message type.
    pub type_tag: String,
}

impl CacheUnRegistration {
    /// Creates an unregistration for `M`.
    pub fn of<M: Message>() -> Self {
        CacheUnRegistration {
            type_tag: M::TAG.to_string(),
        }
    }
}

impl Message for CacheUnRegistration {
    const TAG: &'static str = "CacheUnRegistration";
}
