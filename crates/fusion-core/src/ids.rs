//! Branded ID newtypes for type safety.
//!
//! Publisher and publication identifiers are opaque strings handed out by
//! the server in the bootstrap response. They are wrapped in distinct
//! newtypes so a publication ID can never be routed as a publisher ID.
//!
//! [`ClientId`] is the only ID minted locally: one per runtime context,
//! sent on every connection handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the underlying string is empty.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Process-lifetime identifier of this client, sent as `clientId` on
    /// every connection so the server can correlate reconnects.
    ClientId
}

branded_id! {
    /// Identifier of the server endpoint multiplexing many publications.
    /// Selects which connection carries the updates.
    PublisherId
}

branded_id! {
    /// Identifier of one logical server-side value within a publisher.
    PublicationId
}

impl ClientId {
    /// Generate a fresh random client ID (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::generate()
    }
}

/// The `(PublisherId, PublicationId)` pair: what a subscription is about.
///
/// Serialized with the server's PascalCase field names, which is also the
/// shape of the `PublicationRef` object in the bootstrap header.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublicationRef {
    /// Connection selector.
    pub publisher_id: PublisherId,
    /// Value selector within the connection.
    pub publication_id: PublicationId,
}

impl PublicationRef {
    /// Build a reference from anything string-like.
    pub fn new(publisher_id: impl Into<PublisherId>, publication_id: impl Into<PublicationId>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            publication_id: publication_id.into(),
        }
    }

    /// Both halves are present and non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.publisher_id.is_empty() && !self.publication_id.is_empty()
    }
}

impl fmt::Display for PublicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publisher_id, self.publication_id)
    }
}
