//! Typed messages and the envelope they travel in.
//!
//! Every object exchanged between peers implements [`Message`], which gives it a stable type tag. On the wire the
//! object is carried inside an [`Envelope`] holding the tag next to the serialized payload, so the receiving side
//! can pick the right receive pipeline without any runtime type introspection.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An object that can be sent to and received from a peer.
///
/// The [`TAG`](Message::TAG) identifies the type on the wire and must be unique among the message types a process
/// registers. Routing matches tags exactly, so related types never receive each other's objects.
///
/// With the `macros` feature enabled, this trait can be implemented with `#[derive(Message)]`.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The wire identifier of this type.
    const TAG: &'static str;
}

/// A tagged, type-erased message as seen by the codec and the dispatch registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The [`Message::TAG`] of the payload.
    #[serde(rename = "type")]
    pub tag: String,
    /// The serialized message.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wraps a message into an envelope.
    pub fn wrap<M: Message>(message: &M) -> Result<Self, serde_json::Error> {
        Ok(Envelope {
            tag: M::TAG.to_string(),
            payload: serde_json::to_value(message)?,
        })
    }

    /// Decodes the payload as `M`, regardless of the tag.
    pub fn open<M: Message>(&self) -> Result<M, serde_json::Error> {
        M::deserialize(&self.payload)
    }

    /// Returns the type tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` if the envelope carries an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.tag == M::TAG
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl Message for Greeting {
        const TAG: &'static str = "Greeting";
    }

    #[test]
    fn envelope_carries_the_tag_and_payload() {
        let envelope = Envelope::wrap(&Greeting {
            text: "hi".to_string(),
        })
        .unwrap();
        assert!(envelope.is::<Greeting>());
        assert_eq!(envelope.tag(), "Greeting");
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"type":"Greeting","payload":{"text":"hi"}}"#
        );
        assert_eq!(
            envelope.open::<Greeting>().unwrap(),
            Greeting {
                text: "hi".to_string()
            }
        );
    }
}
