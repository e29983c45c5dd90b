//! Type-safe identifier wrappers for the telemetry source namespace.
//!
//! The source tags every fetch with a request id and decodes it through a
//! definition id. Both are plain `u32` on the wire; wrapping them keeps a
//! request id from being passed where a definition id is expected.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around `u32` with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Return the inner `u32` value.
            pub const fn into_inner(self) -> u32 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Tag attached to a one-shot fetch; the source echoes it on the response.
    RequestId
}

define_id! {
    /// Identifier of a decode layout registered with the source.
    DefinitionId
}

define_id! {
    /// Identifier of the simulated object a fetch reads from.
    ObjectId
}

impl ObjectId {
    /// The user's own aircraft, the default subject of every fetch.
    pub const USER: Self = Self(0);
}
