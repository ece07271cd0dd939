//! Per-peer session state.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use crate::rendezvous::Rendezvous;

/// Per-peer state shared by every connection of the peer.
///
/// The session is primed once the Ping handshake on the default connection completes; [`Peer::send`] waits on that
/// gate before writing anything.
///
/// [`Peer::send`]: crate::peer::Peer::send
#[derive(Clone, Debug, Default)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug, Default)]
struct SessionInner {
    identified: AtomicBool,
    identifier: RwLock<String>,
    properties: RwLock<HashMap<String, String>>,
    primed: Rendezvous,
}

impl Session {
    /// Creates an unidentified, unprimed session.
    pub fn new() -> Self {
        Session::default()
    }

    /// Returns `true` once the peer completed its handshake.
    pub fn is_identified(&self) -> bool {
        self.inner.identified.load(Ordering::Acquire)
    }

    /// Marks the session as identified or not.
    pub fn set_identified(&self, identified: bool) {
        self.inner.identified.store(identified, Ordering::Release);
    }

    /// Returns the application-defined identifier.
    pub fn identifier(&self) -> String {
        self.inner
            .identifier
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the application-defined identifier.
    pub fn set_identifier(&self, identifier: impl Into<String>) {
        *self
            .inner
            .identifier
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identifier.into();
    }

    /// Returns a property value.
    pub fn property(&self, key: &str) -> Option<String> {
        self.inner
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Sets a property, returning the previous value.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into())
    }

    /// Removes a property, returning its value.
    pub fn remove_property(&self, key: &str) -> Option<String> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// The gate released when the handshake completes.
    pub fn primed(&self) -> &Rendezvous {
        &self.inner.primed
    }

    /// Returns `true` if both handles point to the same session.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_shared_between_clones() {
        let session = Session::new();
        let clone = session.clone();
        assert_eq!(session.set_property("room", "lobby"), None);
        assert_eq!(clone.property("room").as_deref(), Some("lobby"));
        assert_eq!(clone.remove_property("room").as_deref(), Some("lobby"));
        assert!(session.property("room").is_none());
        assert!(session.ptr_eq(&clone));
        assert!(!session.ptr_eq(&Session::new()));
    }

    #[test]
    fn new_sessions_are_unprimed() {
        let session = Session::new();
        assert!(!session.is_identified());
        assert!(!session.primed().is_released());
        session.set_identifier("alice");
        assert_eq!(session.identifier(), "alice");
    }
}
