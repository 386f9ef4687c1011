//! Build pipeline
//!
//! Sources move through a two-stage transform: an [`Importer`] turns a
//! source file into one or more intermediate typed payloads, then a
//! [`Cooker`] turns each intermediate into a cooked payload plus bulk
//! chunks ready for packing. Importers, cookers and payload serializers
//! are external collaborators; they reach the engine either through direct
//! registration or through a [`CollaboratorProvider`].

pub mod engine;
pub mod incremental;
pub mod runtime;

pub use engine::{BuildConfig, PipelineEngine};
pub use incremental::IncrementalCache;
pub use runtime::{RuntimePipeline, RuntimePipelineConfig};

use std::path::Path;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::hashing::Hash128;
use crate::id::{AssetId, TypeId};
use crate::pack::BulkChunk;
use crate::payload::{PayloadRegistry, PayloadSerializer, TypedPayload};

/// A source file (or custom-scheme resource) feeding the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRef {
    pub uri: String,
    /// Computed by the engine; importers may override for synthetic
    /// sources.
    pub content_hash: u64,
}

impl SourceRef {
    pub fn new(uri: impl Into<String>) -> Self {
        SourceRef {
            uri: uri.into(),
            content_hash: 0,
        }
    }
}

/// One intermediate asset produced by an importer. Multi-asset sources
/// (atlases, scene files) yield several.
#[derive(Debug, Clone, Default)]
pub struct ImportedItem {
    pub id: AssetId,
    pub logical_name: String,
    pub asset_kind: TypeId,
    pub variant_key: String,
    pub intermediate: TypedPayload,
    pub dependencies: Vec<SourceRef>,
}

/// Input to a cooker.
#[derive(Debug, Clone, Default)]
pub struct CookRequest {
    pub id: AssetId,
    pub logical_name: String,
    pub asset_kind: TypeId,
    pub variant_key: String,
    pub intermediate: TypedPayload,
    pub dependencies: Vec<SourceRef>,
    pub build_options: FxHashMap<String, String>,
}

/// Output of a cooker.
#[derive(Debug, Clone, Default)]
pub struct CookResult {
    pub cooked: TypedPayload,
    pub bulk: Vec<BulkChunk>,
    pub dependencies: Vec<SourceRef>,
    pub tags: FxHashMap<String, String>,
}

/// A fully cooked asset held in memory by the runtime pipeline.
#[derive(Debug, Clone, Default)]
pub struct CookedAsset {
    pub id: AssetId,
    pub logical_name: String,
    pub asset_kind: TypeId,
    pub cooked: TypedPayload,
    pub bulk: Vec<BulkChunk>,
    pub dirty: bool,
}

/// Aggregate outcome of a batch build. Per-asset failures accumulate here
/// instead of aborting the build; a partial pack is still written.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub success: bool,
    pub assets_built: u32,
    pub assets_skipped: u32,
    pub assets_failed: u32,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Name and version of a registered collaborator. Both participate in
/// rebuild decisions so a collaborator update forces a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorInfo {
    pub name: String,
    pub version: String,
}

/// Services available to importers and cookers while they run.
pub trait PipelineContext: Send + Sync {
    fn read_all_bytes(&self, uri: &str) -> Result<Vec<u8>>;

    fn hash64(&self, data: &[u8]) -> u64;

    fn hash128(&self, data: &[u8]) -> Hash128;

    fn deterministic_asset_id(&self, logical_name: &str, variant_key: &str) -> AssetId;

    /// The payload registry, for serializing intermediates and cooked
    /// payloads.
    fn registry(&self) -> &PayloadRegistry;

    /// A build option by key, if present.
    fn option(&self, key: &str) -> Option<&str>;

    fn option_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.option(key).unwrap_or(default)
    }
}

/// Turns a source file into intermediate typed payloads.
pub trait Importer: Send + Sync {
    /// Unique importer name.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn can_import(&self, source: &SourceRef) -> bool;

    /// Import the source. An empty result is treated as a failure by the
    /// engine.
    fn import(&self, source: &SourceRef, ctx: &dyn PipelineContext) -> Result<Vec<ImportedItem>>;
}

/// Turns an intermediate payload into a cooked payload plus bulk chunks.
pub trait Cooker: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn can_cook(&self, asset_kind: TypeId, intermediate_type: TypeId) -> bool;

    fn cook(&self, request: &CookRequest, ctx: &dyn PipelineContext) -> Result<CookResult>;
}

/// Registration surface handed to a [`CollaboratorProvider`].
#[derive(Default)]
pub struct CollaboratorSet {
    importers: Vec<Box<dyn Importer>>,
    cookers: Vec<Box<dyn Cooker>>,
    serializers: Vec<Box<dyn PayloadSerializer>>,
}

impl CollaboratorSet {
    pub fn new() -> Self {
        CollaboratorSet::default()
    }

    pub fn register_importer(&mut self, importer: Box<dyn Importer>) {
        self.importers.push(importer);
    }

    pub fn register_cooker(&mut self, cooker: Box<dyn Cooker>) {
        self.cookers.push(cooker);
    }

    pub fn register_serializer(&mut self, serializer: Box<dyn PayloadSerializer>) {
        self.serializers.push(serializer);
    }

    /// First importer accepting the source, in registration order.
    pub fn find_importer(&self, source: &SourceRef) -> Option<&dyn Importer> {
        self.importers
            .iter()
            .find(|i| i.can_import(source))
            .map(|i| i.as_ref())
    }

    /// First cooker accepting the pair, in registration order.
    pub fn find_cooker(&self, asset_kind: TypeId, intermediate_type: TypeId) -> Option<&dyn Cooker> {
        self.cookers
            .iter()
            .find(|c| c.can_cook(asset_kind, intermediate_type))
            .map(|c| c.as_ref())
    }

    pub fn importer_version(&self, name: &str) -> Option<&str> {
        self.importers
            .iter()
            .find(|i| i.name() == name)
            .map(|i| i.version())
    }

    pub fn cooker_version(&self, name: &str) -> Option<&str> {
        self.cookers
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.version())
    }

    pub fn importer_infos(&self) -> Vec<CollaboratorInfo> {
        self.importers
            .iter()
            .map(|i| CollaboratorInfo {
                name: i.name().to_string(),
                version: i.version().to_string(),
            })
            .collect()
    }

    pub fn cooker_infos(&self) -> Vec<CollaboratorInfo> {
        self.cookers
            .iter()
            .map(|c| CollaboratorInfo {
                name: c.name().to_string(),
                version: c.version().to_string(),
            })
            .collect()
    }

    /// Move queued serializers into a registry.
    pub fn transfer_serializers(&mut self, registry: &PayloadRegistry) {
        for serializer in self.serializers.drain(..) {
            registry.register(serializer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty() && self.cookers.is_empty() && self.serializers.is_empty()
    }
}

/// Abstract supplier of importers, cookers and serializers. In-process
/// registration is the primary mechanism; anything capable of filling a
/// [`CollaboratorSet`] can act as a provider.
pub trait CollaboratorProvider {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn register(&self, set: &mut CollaboratorSet);
}

/// Default context implementation used by both pipeline flavors.
pub(crate) struct StdPipelineContext<'a> {
    registry: &'a PayloadRegistry,
    options: &'a FxHashMap<String, String>,
}

impl<'a> StdPipelineContext<'a> {
    pub(crate) fn new(
        registry: &'a PayloadRegistry,
        options: &'a FxHashMap<String, String>,
    ) -> Self {
        StdPipelineContext { registry, options }
    }
}

impl PipelineContext for StdPipelineContext<'_> {
    fn read_all_bytes(&self, uri: &str) -> Result<Vec<u8>> {
        std::fs::read(Path::new(uri))
            .map_err(|e| Error::Io(format!("failed to read {uri}: {e}")))
    }

    fn hash64(&self, data: &[u8]) -> u64 {
        crate::hashing::hash64(data)
    }

    fn hash128(&self, data: &[u8]) -> Hash128 {
        crate::hashing::hash128(data)
    }

    fn deterministic_asset_id(&self, logical_name: &str, variant_key: &str) -> AssetId {
        crate::id::deterministic_asset_id(logical_name, variant_key)
    }

    fn registry(&self) -> &PayloadRegistry {
        self.registry
    }

    fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal importer/cooker pair used across pipeline tests. Sources
    //! with a `.txt` extension import into a single item whose cooked
    //! payload is the file contents, with one bulk chunk holding the
    //! reversed bytes.

    use super::*;
    use crate::id::Uuid;
    use crate::pack::BulkSemantic;

    pub fn text_kind() -> TypeId {
        Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "test.kind.text")
    }

    pub fn text_intermediate_type() -> TypeId {
        Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "test.payload.text-raw")
    }

    pub fn text_cooked_type() -> TypeId {
        Uuid::new_v5(&crate::id::ASSET_NAMESPACE, "test.payload.text-cooked")
    }

    pub struct TextImporter;

    impl Importer for TextImporter {
        fn name(&self) -> &str {
            "text-importer"
        }

        fn version(&self) -> &str {
            "1.0"
        }

        fn can_import(&self, source: &SourceRef) -> bool {
            source.uri.ends_with(".txt")
        }

        fn import(
            &self,
            source: &SourceRef,
            ctx: &dyn PipelineContext,
        ) -> Result<Vec<ImportedItem>> {
            let bytes = ctx.read_all_bytes(&source.uri)?;
            Ok(vec![ImportedItem {
                id: Uuid::new_v4(),
                logical_name: source.uri.clone(),
                asset_kind: text_kind(),
                variant_key: String::new(),
                intermediate: TypedPayload::new(text_intermediate_type(), 1, bytes),
                dependencies: Vec::new(),
            }])
        }
    }

    pub struct TextCooker {
        pub version: &'static str,
    }

    impl Default for TextCooker {
        fn default() -> Self {
            TextCooker { version: "1.0" }
        }
    }

    impl Cooker for TextCooker {
        fn name(&self) -> &str {
            "text-cooker"
        }

        fn version(&self) -> &str {
            self.version
        }

        fn can_cook(&self, asset_kind: TypeId, intermediate_type: TypeId) -> bool {
            asset_kind == text_kind() && intermediate_type == text_intermediate_type()
        }

        fn cook(&self, request: &CookRequest, _ctx: &dyn PipelineContext) -> Result<CookResult> {
            let mut reversed = request.intermediate.bytes.clone();
            reversed.reverse();
            Ok(CookResult {
                cooked: TypedPayload::new(
                    text_cooked_type(),
                    1,
                    request.intermediate.bytes.clone(),
                ),
                bulk: vec![BulkChunk::new(BulkSemantic::Aux, 0, reversed)],
                dependencies: request.dependencies.clone(),
                tags: FxHashMap::default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn collaborator_set_matches_first() {
        let mut set = CollaboratorSet::new();
        set.register_importer(Box::new(TextImporter));
        set.register_cooker(Box::new(TextCooker::default()));

        let txt = SourceRef::new("assets/readme.txt");
        let png = SourceRef::new("assets/icon.png");
        assert!(set.find_importer(&txt).is_some());
        assert!(set.find_importer(&png).is_none());

        assert!(set.find_cooker(text_kind(), text_intermediate_type()).is_some());
        assert!(set.find_cooker(text_kind(), text_cooked_type()).is_none());
    }

    #[test]
    fn collaborator_infos_carry_versions() {
        let mut set = CollaboratorSet::new();
        set.register_importer(Box::new(TextImporter));
        let infos = set.importer_infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "text-importer");
        assert_eq!(infos[0].version, "1.0");
        assert_eq!(set.importer_version("text-importer"), Some("1.0"));
        assert_eq!(set.importer_version("other"), None);
    }

    #[test]
    fn provider_registers_into_set() {
        struct TestProvider;

        impl CollaboratorProvider for TestProvider {
            fn name(&self) -> &str {
                "test-provider"
            }

            fn version(&self) -> &str {
                "0.1"
            }

            fn register(&self, set: &mut CollaboratorSet) {
                set.register_importer(Box::new(TextImporter));
                set.register_cooker(Box::new(TextCooker::default()));
            }
        }

        let mut set = CollaboratorSet::new();
        TestProvider.register(&mut set);
        assert!(!set.is_empty());
        assert_eq!(set.cooker_infos().len(), 1);
    }

    #[test]
    fn std_context_options() {
        let registry = PayloadRegistry::new();
        let mut options = FxHashMap::default();
        options.insert("quality".to_string(), "high".to_string());
        let ctx = StdPipelineContext::new(&registry, &options);

        assert_eq!(ctx.option("quality"), Some("high"));
        assert_eq!(ctx.option("absent"), None);
        assert_eq!(ctx.option_or("absent", "fallback"), "fallback");

        let a = ctx.deterministic_asset_id("n", "v");
        let b = ctx.deterministic_asset_id("n", "v");
        assert_eq!(a, b);
    }
}
