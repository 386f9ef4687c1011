// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! 128-bit identifiers
//!
//! Assets and payload types are identified by 16-byte UUIDs. Random (v4) ids
//! are used for one-off assets; deterministic (v5) ids derive from an asset's
//! logical name and variant key so that repeated builds of the same source
//! tree produce the same ids.

use std::fmt;

/// Namespace under which deterministic asset ids are derived.
pub const ASSET_NAMESPACE: Uuid = Uuid([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// A 16-byte universally unique identifier.
///
/// Stored and compared as raw bytes so the on-disk layout stays byte-exact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid(pub [u8; 16]);

/// Identifies a payload or asset-kind type.
pub type TypeId = Uuid;

/// Identifies an asset.
pub type AssetId = Uuid;

impl Uuid {
    /// The all-zero UUID.
    pub const NIL: Uuid = Uuid([0; 16]);

    /// Generate a random (version 4) UUID.
    pub fn new_v4() -> Self {
        Uuid(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Generate a deterministic (version 5) UUID from a namespace and name.
    pub fn new_v5(namespace: &Uuid, name: &str) -> Self {
        let ns = uuid::Uuid::from_bytes(namespace.0);
        Uuid(*uuid::Uuid::new_v5(&ns, name.as_bytes()).as_bytes())
    }

    /// Parse from the hyphenated string form. Returns `None` on malformed
    /// input.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| Uuid(*u.as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

/// Deterministic asset id for a logical name and variant key.
///
/// The combined key is `"{name}|{variant}"`, hashed as a v5 UUID under
/// [`ASSET_NAMESPACE`]. An empty variant key still contributes the separator
/// so `("a|b", "")` and `("a", "b")` never collide.
pub fn deterministic_asset_id(logical_name: &str, variant_key: &str) -> AssetId {
    let mut combined = String::with_capacity(logical_name.len() + 1 + variant_key.len());
    combined.push_str(logical_name);
    combined.push('|');
    combined.push_str(variant_key);
    Uuid::new_v5(&ASSET_NAMESPACE, &combined)
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}
