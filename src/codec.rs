//! Converts envelopes to and from wire strings.
//!
//! A [`Codec`] holds one primary serialization adapter, one primary deserialization adapter, an ordered list of
//! fallbacks for each, and one encryption and one decryption adapter. Every peer owns its own codec, so adapters can
//! be swapped per peer at runtime.
//!
//! Encoding runs the primary adapter, then each fallback in registration order, until one succeeds. The result is
//! terminated with [`BOUNDARY_MARKER`] and handed to the encryption adapter. Decoding mirrors these steps.
//! Adapters must not produce the boundary marker or a line terminator themselves.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::trace;

use crate::{
    error::{BoxError, CodecError},
    message::Envelope,
};

/// Token appended after every serialized object.
///
/// It is built from ASCII record separators, which JSON always escapes inside strings, so it cannot occur within a
/// JSON-encoded object.
pub const BOUNDARY_MARKER: &str = "\u{1e}EOO\u{1e}";

/// Turns an envelope into text.
pub trait SerializationAdapter: Send + Sync + 'static {
    /// Serializes the envelope.
    fn serialize(&self, envelope: &Envelope) -> Result<String, BoxError>;
}

/// Turns text back into an envelope.
pub trait DeserializationAdapter: Send + Sync + 'static {
    /// Deserializes a wire unit.
    fn deserialize(&self, wire: &str) -> Result<Envelope, BoxError>;
}

/// Transforms serialized text before it is written.
pub trait EncryptionAdapter: Send + Sync + 'static {
    /// Encrypts a serialized, marker-terminated object.
    fn encrypt(&self, wire: String) -> String;
}

/// Reverses an [`EncryptionAdapter`] on received units.
pub trait DecryptionAdapter: Send + Sync + 'static {
    /// Decrypts a received unit.
    fn decrypt(&self, wire: String) -> String;
}

/// The default serialization and deserialization adapter, encoding envelopes as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonAdapter;

impl SerializationAdapter for JsonAdapter {
    fn serialize(&self, envelope: &Envelope) -> Result<String, BoxError> {
        Ok(serde_json::to_string(envelope)?)
    }
}

impl DeserializationAdapter for JsonAdapter {
    fn deserialize(&self, wire: &str) -> Result<Envelope, BoxError> {
        Ok(serde_json::from_str(wire)?)
    }
}

/// The default encryption and decryption adapter, leaving text untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCipher;

impl EncryptionAdapter for IdentityCipher {
    fn encrypt(&self, wire: String) -> String {
        wire
    }
}

impl DecryptionAdapter for IdentityCipher {
    fn decrypt(&self, wire: String) -> String {
        wire
    }
}

/// A peer's adapter configuration.
pub struct Codec {
    adapters: RwLock<Adapters>,
}

struct Adapters {
    serializer: Arc<dyn SerializationAdapter>,
    fallback_serializers: Vec<Arc<dyn SerializationAdapter>>,
    deserializer: Arc<dyn DeserializationAdapter>,
    fallback_deserializers: Vec<Arc<dyn DeserializationAdapter>>,
    encryption: Arc<dyn EncryptionAdapter>,
    decryption: Arc<dyn DecryptionAdapter>,
}

impl Codec {
    /// Creates a codec using [`JsonAdapter`] and [`IdentityCipher`] with no fallbacks.
    pub fn new() -> Self {
        Codec {
            adapters: RwLock::new(Adapters {
                serializer: Arc::new(JsonAdapter),
                fallback_serializers: Vec::new(),
                deserializer: Arc::new(JsonAdapter),
                fallback_deserializers: Vec::new(),
                encryption: Arc::new(IdentityCipher),
                decryption: Arc::new(IdentityCipher),
            }),
        }
    }

    /// Replaces the primary serialization adapter.
    pub fn set_main_serialization_adapter(&self, adapter: impl SerializationAdapter) {
        self.write().serializer = Arc::new(adapter);
    }

    /// Appends a fallback serialization adapter.
    pub fn add_fallback_serialization_adapter(&self, adapter: impl SerializationAdapter) {
        self.write().fallback_serializers.push(Arc::new(adapter));
    }

    /// Replaces the primary deserialization adapter.
    pub fn set_main_deserialization_adapter(&self, adapter: impl DeserializationAdapter) {
        self.write().deserializer = Arc::new(adapter);
    }

    /// Appends a fallback deserialization adapter.
    pub fn add_fallback_deserialization_adapter(&self, adapter: impl DeserializationAdapter) {
        self.write().fallback_deserializers.push(Arc::new(adapter));
    }

    /// Replaces the encryption adapter.
    pub fn set_encryption_adapter(&self, adapter: impl EncryptionAdapter) {
        self.write().encryption = Arc::new(adapter);
    }

    /// Replaces the decryption adapter.
    pub fn set_decryption_adapter(&self, adapter: impl DecryptionAdapter) {
        self.write().decryption = Arc::new(adapter);
    }

    /// Encodes an envelope into a marker-terminated, encrypted wire string.
    pub fn serialize(&self, envelope: &Envelope) -> Result<String, CodecError> {
        let adapters = self.read();
        let mut causes = Vec::new();

        let chain = std::iter::once(&adapters.serializer).chain(&adapters.fallback_serializers);
        for (attempt, adapter) in chain.enumerate() {
            match adapter.serialize(envelope) {
                Ok(mut wire) => {
                    if attempt > 0 {
                        trace!(tag = %envelope.tag, attempt, "serialized with fallback adapter");
                    }
                    wire.push_str(BOUNDARY_MARKER);
                    return Ok(adapters.encryption.encrypt(wire));
                }
                Err(err) => causes.push(err),
            }
        }

        Err(CodecError::Serialize {
            tag: envelope.tag.clone(),
            causes,
        })
    }

    /// Decodes a received wire unit.
    ///
    /// A trailing [`BOUNDARY_MARKER`] left by line framing is stripped before deserializing.
    pub fn deserialize(&self, wire: &str) -> Result<Envelope, CodecError> {
        let adapters = self.read();
        let decrypted = adapters.decryption.decrypt(wire.to_string());
        let unit = decrypted
            .strip_suffix(BOUNDARY_MARKER)
            .unwrap_or(&decrypted);
        let mut causes = Vec::new();

        let chain = std::iter::once(&adapters.deserializer).chain(&adapters.fallback_deserializers);
        for adapter in chain {
            match adapter.deserialize(unit) {
                Ok(envelope) => return Ok(envelope),
                Err(err) => causes.push(err),
            }
        }

        Err(CodecError::Deserialize { causes })
    }

    fn read(&self) -> RwLockReadGuard<'_, Adapters> {
        self.adapters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Adapters> {
        self.adapters.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new()
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adapters = self.read();
        f.debug_struct("Codec")
            .field("fallback_serializers", &adapters.fallback_serializers.len())
            .field("fallback_deserializers", &adapters.fallback_deserializers.len())
            .finish_non_exhaustive()
    }
}
