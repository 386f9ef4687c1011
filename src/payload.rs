//! Typed payloads and the serializer registry
//!
//! A [`TypedPayload`] is the unit of data the pipeline moves around: opaque
//! bytes tagged with the payload type that produced them and that type's
//! schema version. Serializers for payload types live in a
//! [`PayloadRegistry`] with a two-phase lifecycle: registration happens
//! behind a write lock at startup, then the registry is frozen and every
//! later lookup reads the published map without taking any lock.

use std::any::Any;
use std::sync::OnceLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::id::TypeId;

/// Opaque bytes tagged with their payload type and schema version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypedPayload {
    pub payload_type: TypeId,
    pub schema_version: u32,
    pub bytes: Vec<u8>,
}

impl TypedPayload {
    pub fn new(payload_type: TypeId, schema_version: u32, bytes: Vec<u8>) -> Self {
        TypedPayload {
            payload_type,
            schema_version,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.payload_type = TypeId::NIL;
        self.schema_version = 0;
        self.bytes.clear();
    }
}

/// Serializes one payload type to and from bytes.
///
/// Implementations are opaque to the engine; the only contract is that
/// `deserialize(serialize(x))` reconstructs a value equal to `x` under the
/// serializer's own notion of equality.
pub trait PayloadSerializer: Send + Sync {
    /// The payload type this serializer handles.
    fn type_id(&self) -> TypeId;

    /// Human-readable name of the type, unique within a registry.
    fn type_name(&self) -> &str;

    /// Current schema version written by `serialize`.
    fn schema_version(&self) -> u32;

    fn serialize(&self, value: &dyn Any, out: &mut Vec<u8>) -> Result<()>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>>;

    /// Migrate serialized bytes between schema versions. The default
    /// declines; serializers that support migration override this.
    fn migrate(&self, _from_version: u32, _to_version: u32, _bytes: &mut Vec<u8>) -> bool {
        false
    }
}

#[derive(Default)]
struct RegistryMap {
    by_type: FxHashMap<TypeId, Box<dyn PayloadSerializer>>,
    by_name: FxHashMap<String, TypeId>,
    order: Vec<TypeId>,
}

/// TypeId to serializer map with a register/freeze lifecycle.
///
/// Duplicate registration and registration after freeze are programmer
/// errors and panic. [`PayloadRegistry::freeze`] moves the map into a
/// `OnceLock`, which both publishes it to other threads and makes every
/// subsequent `find` lock-free.
pub struct PayloadRegistry {
    building: RwLock<Option<RegistryMap>>,
    frozen: OnceLock<RegistryMap>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        PayloadRegistry {
            building: RwLock::new(Some(RegistryMap::default())),
            frozen: OnceLock::new(),
        }
    }

    /// Register a serializer. Panics if the registry is frozen or if the
    /// serializer's type id or type name is already registered; both
    /// indicate a bug in collaborator setup, not a recoverable condition.
    pub fn register(&self, serializer: Box<dyn PayloadSerializer>) {
        let mut guard = self.building.write();
        let map = guard
            .as_mut()
            .unwrap_or_else(|| panic!("payload registry is frozen, cannot register"));

        let type_id = PayloadSerializer::type_id(serializer.as_ref());
        let type_name = serializer.type_name().to_string();

        if map.by_type.contains_key(&type_id) {
            panic!("payload type already registered: {type_id}");
        }
        if map.by_name.contains_key(&type_name) {
            panic!("payload type name already registered: {type_name}");
        }

        map.by_name.insert(type_name, type_id);
        map.order.push(type_id);
        map.by_type.insert(type_id, serializer);
    }

    /// Freeze the registry. Idempotent; after the first call lookups no
    /// longer take a lock.
    pub fn freeze(&self) {
        let mut guard = self.building.write();
        if let Some(map) = guard.take() {
            let _ = self.frozen.set(map);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Find a serializer by payload type id.
    pub fn find(&self, type_id: TypeId) -> Option<&dyn PayloadSerializer> {
        if let Some(map) = self.frozen.get() {
            return map.by_type.get(&type_id).map(|s| s.as_ref());
        }
        // Pre-freeze reads still need the lock, and cannot hand out a
        // borrow that outlives it. Registration-phase callers go through
        // `with_serializer` instead.
        None
    }

    /// Find a serializer by its registered type name.
    pub fn find_by_name(&self, name: &str) -> Option<&dyn PayloadSerializer> {
        let map = self.frozen.get()?;
        let type_id = map.by_name.get(name)?;
        map.by_type.get(type_id).map(|s| s.as_ref())
    }

    /// Run `f` against a serializer regardless of freeze state. Works
    /// before freeze at the cost of holding the read lock for the call.
    pub fn with_serializer<R>(
        &self,
        type_id: TypeId,
        f: impl FnOnce(&dyn PayloadSerializer) -> R,
    ) -> Option<R> {
        if let Some(map) = self.frozen.get() {
            return map.by_type.get(&type_id).map(|s| f(s.as_ref()));
        }
        let guard = self.building.read();
        guard
            .as_ref()
            .and_then(|map| map.by_type.get(&type_id))
            .map(|s| f(s.as_ref()))
    }

    /// Type ids in registration order. Empty before freeze.
    pub fn registered_types(&self) -> &[TypeId] {
        self.frozen.get().map(|m| m.order.as_slice()).unwrap_or(&[])
    }

    /// Deserialize a payload through its registered serializer.
    pub fn deserialize_payload(&self, payload: &TypedPayload) -> Result<Box<dyn Any + Send + Sync>> {
        let serializer = self.find(payload.payload_type).ok_or_else(|| {
            Error::Runtime(format!(
                "no serializer registered for payload type {}",
                payload.payload_type
            ))
        })?;
        serializer.deserialize(&payload.bytes)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Uuid;

    struct U32Serializer {
        type_id: TypeId,
    }

    impl PayloadSerializer for U32Serializer {
        fn type_id(&self) -> TypeId {
            self.type_id
        }

        fn type_name(&self) -> &str {
            "test.u32"
        }

        fn schema_version(&self) -> u32 {
            1
        }

        fn serialize(&self, value: &dyn Any, out: &mut Vec<u8>) -> Result<()> {
            let v = value
                .downcast_ref::<u32>()
                .ok_or_else(|| Error::Runtime("expected u32".into()))?;
            out.extend_from_slice(&v.to_le_bytes());
            Ok(())
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
            let arr: [u8; 4] = bytes
                .try_into()
                .map_err(|_| Error::Runtime("expected 4 bytes".into()))?;
            Ok(Box::new(u32::from_le_bytes(arr)))
        }
    }

    fn make_registry() -> (PayloadRegistry, TypeId) {
        let registry = PayloadRegistry::new();
        let type_id = Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "test.u32");
        registry.register(Box::new(U32Serializer { type_id }));
        (registry, type_id)
    }

    #[test]
    fn find_after_freeze() {
        let (registry, type_id) = make_registry();
        assert!(!registry.is_frozen());
        registry.freeze();
        assert!(registry.is_frozen());

        let serializer = registry.find(type_id).unwrap();
        assert_eq!(serializer.type_name(), "test.u32");
        assert!(registry.find_by_name("test.u32").is_some());
        assert!(registry.find_by_name("test.other").is_none());
        assert_eq!(registry.registered_types(), &[type_id]);
    }

    #[test]
    fn freeze_is_idempotent() {
        let (registry, type_id) = make_registry();
        registry.freeze();
        registry.freeze();
        assert!(registry.find(type_id).is_some());
    }

    #[test]
    fn with_serializer_works_before_freeze() {
        let (registry, type_id) = make_registry();
        let name = registry
            .with_serializer(type_id, |s| s.type_name().to_string())
            .unwrap();
        assert_eq!(name, "test.u32");
    }

    #[test]
    fn serialize_roundtrip() {
        let (registry, type_id) = make_registry();
        registry.freeze();

        let serializer = registry.find(type_id).unwrap();
        let mut bytes = Vec::new();
        serializer.serialize(&42u32, &mut bytes).unwrap();
        let value = serializer.deserialize(&bytes).unwrap();
        assert_eq!(*value.downcast_ref::<u32>().unwrap(), 42);
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn register_after_freeze_panics() {
        let (registry, _) = make_registry();
        registry.freeze();
        let type_id = Uuid::new_v4();
        registry.register(Box::new(U32Serializer { type_id }));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_type_id_panics() {
        let (registry, type_id) = make_registry();
        registry.register(Box::new(U32Serializer { type_id }));
    }

    #[test]
    fn typed_payload_clear() {
        let mut payload = TypedPayload::new(Uuid::new_v4(), 3, vec![1, 2]);
        assert!(!payload.is_empty());
        payload.clear();
        assert!(payload.is_empty());
        assert!(payload.payload_type.is_nil());
        assert_eq!(payload.schema_version, 0);
    }
}
