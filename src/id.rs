//! Identifiers for peers and connections.

use std::{
    borrow::Cow,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a logical peer, assigned by the server during the Ping handshake.
///
/// [`ClientId::EMPTY`] is the sentinel for "not yet assigned".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// The unassigned id.
    pub const EMPTY: ClientId = ClientId(Uuid::nil());

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        ClientId(Uuid::new_v4())
    }

    /// Returns `true` if this is the unassigned sentinel.
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        ClientId(uuid)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            fmt::Display::fmt(&self.0, f)
        }
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

/// Logical name of one of a peer's connections.
///
/// Keys are usually derived from a message type with [`ConnectionKey::of`], so a connection can be
/// dedicated to one kind of traffic. [`ConnectionKey::DEFAULT`] names the connection the handshake runs on.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(Cow<'static, str>);

impl ConnectionKey {
    /// The key of the primary connection.
    pub const DEFAULT: ConnectionKey = ConnectionKey(Cow::Borrowed("default"));

    /// Creates a key from an arbitrary name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        ConnectionKey(name.into())
    }

    /// Creates a key named after a message type.
    pub fn of<M: Message>() -> Self {
        ConnectionKey(Cow::Borrowed(M::TAG))
    }

    /// Returns the key's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for [`ConnectionKey::DEFAULT`].
    pub fn is_default(&self) -> bool {
        *self == ConnectionKey::DEFAULT
    }
}

impl Default for ConnectionKey {
    fn default() -> Self {
        ConnectionKey::DEFAULT
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionKey({:?})", self.0)
    }
}

/// Process-local identifier of a physical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new `ConnectionId` with an automatically incremented value.
    pub fn generate() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_is_the_default() {
        assert!(ClientId::default().is_empty());
        assert!(ClientId::EMPTY.is_empty());
        assert!(!ClientId::generate().is_empty());
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn client_id_round_trips_as_a_plain_string() {
        let id = ClientId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        assert_eq!(serde_json::from_str::<ClientId>(&json).unwrap(), id);
    }

    #[test]
    fn connection_keys_compare_by_name() {
        assert_eq!(ConnectionKey::new("default"), ConnectionKey::DEFAULT);
        assert!(ConnectionKey::default().is_default());
        assert_eq!(
            ConnectionKey::of::<crate::protocol::Ping>().as_str(),
            "Ping"
        );
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert!(b > a);
    }
}
