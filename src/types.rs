//! Newtypes for runtime identifiers to avoid stringly-typed code.

use std::fmt;
use std::ops::Deref;

use uuid::Uuid;

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrows the identifier.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

newtype!(
    /// Opaque runtime-assigned container identifier. Empty means "never
    /// created".
    ContainerId
);
newtype!(
    /// Locally tagged image name generated for one node launch.
    ImageName
);

impl ImageName {
    /// Generates `<prefix>-<node>-<random hex>`, lowercasing the node name as
    /// image references must be lowercase.
    #[must_use]
    pub fn unique(prefix: &str, node: &str) -> Self {
        Self(format!(
            "{prefix}-{}-{}",
            node.to_ascii_lowercase(),
            Uuid::new_v4().simple()
        ))
    }
}
