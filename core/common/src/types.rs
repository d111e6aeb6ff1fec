//! Common types used throughout SoundVault.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            ///
            /// # Errors
            /// - Returns error if id is empty
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(crate::Error::InvalidInput(concat!(
                        stringify!($name),
                        " cannot be empty"
                    )
                    .to_string()));
                }
                Ok(Self(id))
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of an authenticated user.
    UserId
);

string_id!(
    /// Identifier of a track row in the metadata store.
    TrackId
);

/// An absolute path in the remote blob store, e.g. `/3f2a...-song.mp3`.
///
/// Remote paths are opaque to the crypto layer; they only need to be
/// absolute and free of empty components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath {
    components: Vec<String>,
}

impl RemotePath {
    /// The store root.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse a path string. Uses '/' as separator; a leading '/' is implied.
    ///
    /// # Errors
    /// - Returns error if a component is empty (e.g. `/a//b`)
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut components = Vec::new();
        for comp in trimmed.split('/') {
            if comp.is_empty() {
                return Err(crate::Error::InvalidInput(format!(
                    "Path '{}' contains an empty component",
                    path
                )));
            }
            components.push(comp.to_string());
        }
        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the last component.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a single child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        if child.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Child component cannot be empty".to_string(),
            ));
        }
        if child.contains('/') || child.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Child component cannot contain separators".to_string(),
            ));
        }
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to the string form used on the wire.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.to_string_path()
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}
