//! Identity types for Accord
//!
//! All identifiers are opaque strings minted by their origin server.
//! Equality is byte-wise; no normalization is performed here.

use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(String);

        impl $name {
            #[inline]
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[inline]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                $name(id)
            }
        }
    };
}

string_id!(
    /// Room identity - the federated namespace a PDU and state slot belong to
    RoomId,
    "Room"
);

string_id!(
    /// Server identity - the origin authority for PDUs it mints
    ServerId,
    "Server"
);

string_id!(
    /// User identity - the author of an event
    UserId,
    "User"
);

string_id!(
    /// PDU identity - unique within its origin server
    PduId,
    "Pdu"
);

/// Globally unique reference to a PDU: identity plus minting origin.
///
/// The canonical text form is `<pdu_id>@<origin>`, which is how references
/// travel inside `prev_events` lists.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventRef {
    pub pdu_id: PduId,
    pub origin: ServerId,
}

impl EventRef {
    #[inline]
    pub fn new(pdu_id: PduId, origin: ServerId) -> Self {
        EventRef { pdu_id, origin }
    }

    /// Parse the canonical `<pdu_id>@<origin>` form.
    ///
    /// The first `@` splits the two halves; PDU identifiers never contain
    /// one.
    pub fn parse(s: &str) -> Option<Self> {
        let (pdu_id, origin) = s.split_once('@')?;
        if pdu_id.is_empty() || origin.is_empty() {
            return None;
        }
        Some(EventRef::new(PduId::from(pdu_id), ServerId::from(origin)))
    }
}

impl fmt::Debug for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}@{})", self.pdu_id, self.origin)
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pdu_id, self.origin)
    }
}
