//! Runtime pipeline
//!
//! Cooks source files on demand and keeps the results in memory so the
//! asset manager can serve assets that never went through a batch build.
//! Concurrent requests for the same logical name are deduplicated: the
//! first requester cooks, everyone else waits for that result. Dirty
//! assets can be persisted to a runtime pack at any point.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::compression::{Compression, CompressionLevel};
use crate::error::{Error, Result};
use crate::hashing::hash64;
use crate::pack::{AssetPackEntry, PackWriter};
use crate::payload::PayloadRegistry;
use crate::pipeline::{
    CollaboratorSet, CookRequest, CookedAsset, Cooker, Importer, PipelineContext, SourceRef,
    StdPipelineContext,
};
use crate::id::AssetId;

/// Configuration for on-the-fly cooking.
#[derive(Debug, Clone)]
pub struct RuntimePipelineConfig {
    /// Where the runtime pack is stored. Empty means the working
    /// directory.
    pub output_directory: PathBuf,
    pub pack_name: String,
    pub compression: Compression,
    pub compression_level: CompressionLevel,
    pub build_options: FxHashMap<String, String>,
    /// Persist dirty assets when the owning manager shuts down.
    pub auto_save: bool,
    pub deterministic_asset_ids: bool,
}

impl Default for RuntimePipelineConfig {
    fn default() -> Self {
        RuntimePipelineConfig {
            output_directory: PathBuf::new(),
            pack_name: "runtime_assets.snpak".to_string(),
            compression: Compression::Lz4,
            compression_level: CompressionLevel::Default,
            build_options: FxHashMap::default(),
            auto_save: false,
            deterministic_asset_ids: true,
        }
    }
}

impl RuntimePipelineConfig {
    /// Full path of the runtime pack.
    pub fn pack_path(&self) -> PathBuf {
        if self.output_directory.as_os_str().is_empty() {
            PathBuf::from(&self.pack_name)
        } else {
            self.output_directory.join(&self.pack_name)
        }
    }
}

/// Outcome of pipelining one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub id: AssetId,
    pub logical_name: String,
}

struct InflightSlot {
    result: Mutex<Option<Result<PipelineOutcome>>>,
    cv: Condvar,
}

/// On-demand cooking into in-memory storage.
pub struct RuntimePipeline {
    config: RuntimePipelineConfig,
    registry: Arc<PayloadRegistry>,
    collaborators: RwLock<CollaboratorSet>,
    cooked: Mutex<FxHashMap<String, Arc<CookedAsset>>>,
    inflight: Mutex<FxHashMap<String, Arc<InflightSlot>>>,
}

impl RuntimePipeline {
    pub fn new(config: RuntimePipelineConfig, registry: Arc<PayloadRegistry>) -> Self {
        RuntimePipeline {
            config,
            registry,
            collaborators: RwLock::new(CollaboratorSet::new()),
            cooked: Mutex::new(FxHashMap::default()),
            inflight: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &RuntimePipelineConfig {
        &self.config
    }

    /// Direct registration, no provider involved.
    pub fn register_importer(&self, importer: Box<dyn Importer>) {
        self.collaborators.write().register_importer(importer);
    }

    pub fn register_cooker(&self, cooker: Box<dyn Cooker>) {
        self.collaborators.write().register_cooker(cooker);
    }

    /// Cook a source file, storing the result in memory. Repeated and
    /// concurrent calls for one logical name cook at most once.
    pub fn process_source(&self, absolute_path: &str, logical_name: &str) -> Result<PipelineOutcome> {
        if let Some(asset) = self.cooked.lock().get(logical_name) {
            return Ok(PipelineOutcome {
                id: asset.id,
                logical_name: asset.logical_name.clone(),
            });
        }

        // In-flight dedup: whoever installs the slot does the work, later
        // arrivals wait on it.
        let (slot, is_first) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(logical_name) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(InflightSlot {
                        result: Mutex::new(None),
                        cv: Condvar::new(),
                    });
                    inflight.insert(logical_name.to_string(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !is_first {
            let mut result = slot.result.lock();
            while result.is_none() {
                slot.cv.wait(&mut result);
            }
            return result.as_ref().unwrap().clone();
        }

        let outcome = self.cook_source(absolute_path, logical_name);

        {
            let mut result = slot.result.lock();
            *result = Some(outcome.clone());
            slot.cv.notify_all();
        }
        self.inflight.lock().remove(logical_name);

        outcome
    }

    fn cook_source(&self, absolute_path: &str, logical_name: &str) -> Result<PipelineOutcome> {
        let bytes = std::fs::read(absolute_path)
            .map_err(|e| Error::Io(format!("cannot open source file {absolute_path}: {e}")))?;
        if bytes.is_empty() {
            return Err(Error::Pipeline(format!("source file is empty: {absolute_path}")));
        }

        let source = SourceRef {
            uri: absolute_path.to_string(),
            content_hash: hash64(&bytes),
        };

        let ctx = StdPipelineContext::new(&self.registry, &self.config.build_options);
        let collaborators = self.collaborators.read();

        let importer = collaborators
            .find_importer(&source)
            .ok_or_else(|| Error::Pipeline(format!("no importer found for: {absolute_path}")))?;

        let items = importer
            .import(&source, &ctx)
            .map_err(|e| Error::Pipeline(format!("import failed for {absolute_path}: {e}")))?;
        if items.is_empty() {
            return Err(Error::Pipeline(format!(
                "import produced no items for: {absolute_path}"
            )));
        }

        let mut outcome = None;
        for mut item in items {
            // The caller's query name wins over whatever the importer
            // chose.
            item.logical_name = logical_name.to_string();
            if self.config.deterministic_asset_ids {
                item.id = ctx.deterministic_asset_id(&item.logical_name, &item.variant_key);
            }

            let cooker = collaborators
                .find_cooker(item.asset_kind, item.intermediate.payload_type)
                .ok_or_else(|| {
                    Error::Pipeline(format!(
                        "no cooker found for asset {} (kind {})",
                        item.logical_name, item.asset_kind
                    ))
                })?;

            let request = CookRequest {
                id: item.id,
                logical_name: item.logical_name.clone(),
                asset_kind: item.asset_kind,
                variant_key: item.variant_key.clone(),
                intermediate: item.intermediate,
                dependencies: item.dependencies,
                build_options: self.config.build_options.clone(),
            };

            let result = cooker
                .cook(&request, &ctx)
                .map_err(|e| Error::Pipeline(format!("cook failed for {}: {e}", request.logical_name)))?;

            let asset = CookedAsset {
                id: request.id,
                logical_name: request.logical_name.clone(),
                asset_kind: request.asset_kind,
                cooked: result.cooked,
                bulk: result.bulk,
                dirty: true,
            };

            outcome = Some(PipelineOutcome {
                id: asset.id,
                logical_name: asset.logical_name.clone(),
            });

            debug!(name = %asset.logical_name, id = %asset.id, "runtime pipeline cooked");
            self.cooked
                .lock()
                .insert(request.logical_name, Arc::new(asset));
        }

        // Non-empty items guarantees at least one iteration.
        Ok(outcome.unwrap())
    }

    pub fn has_asset(&self, logical_name: &str) -> bool {
        self.cooked.lock().contains_key(logical_name)
    }

    pub fn asset_id(&self, logical_name: &str) -> Result<AssetId> {
        self.cooked
            .lock()
            .get(logical_name)
            .map(|a| a.id)
            .ok_or_else(|| Error::NotFound(format!("asset not in runtime pipeline: {logical_name}")))
    }

    /// The in-memory cooked asset for a logical name.
    pub fn cooked_asset(&self, logical_name: &str) -> Option<Arc<CookedAsset>> {
        self.cooked.lock().get(logical_name).cloned()
    }

    pub fn dirty_count(&self) -> u32 {
        self.cooked.lock().values().filter(|a| a.dirty).count() as u32
    }

    /// Write all dirty assets to the runtime pack, creating it or
    /// appending to it, then mark them clean.
    pub fn save_all(&self) -> Result<()> {
        let mut cooked = self.cooked.lock();

        let dirty: Vec<Arc<CookedAsset>> = cooked.values().filter(|a| a.dirty).cloned().collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let output_path = self.config.pack_path();
        if !self.config.output_directory.as_os_str().is_empty() {
            std::fs::create_dir_all(&self.config.output_directory)
                .map_err(|e| Error::Io(format!("failed to create output directory: {e}")))?;
        }

        let mut writer = PackWriter::new();
        writer.set_compression(self.config.compression);
        writer.set_compression_level(self.config.compression_level);

        for asset in &dirty {
            writer.add_asset(AssetPackEntry {
                id: asset.id,
                asset_kind: asset.asset_kind,
                name: asset.logical_name.clone(),
                variant_key: String::new(),
                cooked: asset.cooked.clone(),
                bulk: asset.bulk.clone(),
            });
        }

        if output_path.exists() {
            writer.append_update(&output_path)?;
        } else {
            writer.write(&output_path)?;
        }

        for asset in cooked.values_mut() {
            if asset.dirty {
                Arc::make_mut(asset).dirty = false;
            }
        }

        debug!(path = %output_path.display(), saved = dirty.len(), "saved runtime assets");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackReader;
    use crate::pipeline::test_support::{TextCooker, TextImporter};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pipeline_with(dir: &std::path::Path) -> RuntimePipeline {
        let registry = Arc::new(PayloadRegistry::new());
        registry.freeze();
        let pipeline = RuntimePipeline::new(
            RuntimePipelineConfig {
                output_directory: dir.to_path_buf(),
                ..RuntimePipelineConfig::default()
            },
            registry,
        );
        pipeline.register_importer(Box::new(TextImporter));
        pipeline.register_cooker(Box::new(TextCooker::default()));
        pipeline
    }

    fn write_source(dir: &std::path::Path, name: &str, contents: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn cooks_and_stores_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path());
        let src = write_source(dir.path(), "note.txt", b"hello");

        let outcome = pipeline.process_source(&src, "notes/hello").unwrap();
        assert_eq!(outcome.logical_name, "notes/hello");
        assert!(pipeline.has_asset("notes/hello"));
        assert_eq!(pipeline.asset_id("notes/hello").unwrap(), outcome.id);
        assert_eq!(pipeline.dirty_count(), 1);

        let asset = pipeline.cooked_asset("notes/hello").unwrap();
        assert_eq!(asset.cooked.bytes, b"hello");
        assert_eq!(asset.bulk[0].bytes, b"olleh");
    }

    #[test]
    fn deterministic_ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path());
        let src = write_source(dir.path(), "note.txt", b"hello");

        let outcome = pipeline.process_source(&src, "notes/hello").unwrap();
        assert_eq!(
            outcome.id,
            crate::id::deterministic_asset_id("notes/hello", "")
        );
    }

    #[test]
    fn repeated_requests_cook_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PayloadRegistry::new());
        registry.freeze();
        let pipeline = RuntimePipeline::new(
            RuntimePipelineConfig {
                output_directory: dir.path().to_path_buf(),
                ..RuntimePipelineConfig::default()
            },
            registry,
        );

        static COOKS: AtomicU32 = AtomicU32::new(0);

        struct CountingCooker;
        impl Cooker for CountingCooker {
            fn name(&self) -> &str {
                "counting-cooker"
            }
            fn version(&self) -> &str {
                "1.0"
            }
            fn can_cook(&self, kind: crate::id::TypeId, it: crate::id::TypeId) -> bool {
                TextCooker::default().can_cook(kind, it)
            }
            fn cook(
                &self,
                request: &CookRequest,
                ctx: &dyn PipelineContext,
            ) -> Result<crate::pipeline::CookResult> {
                COOKS.fetch_add(1, Ordering::SeqCst);
                TextCooker::default().cook(request, ctx)
            }
        }

        pipeline.register_importer(Box::new(TextImporter));
        pipeline.register_cooker(Box::new(CountingCooker));

        let src = write_source(dir.path(), "note.txt", b"content");
        let a = pipeline.process_source(&src, "n").unwrap();
        let b = pipeline.process_source(&src, "n").unwrap();
        assert_eq!(a, b);
        assert_eq!(COOKS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_importer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PayloadRegistry::new());
        registry.freeze();
        let pipeline = RuntimePipeline::new(RuntimePipelineConfig::default(), registry);

        let src = write_source(dir.path(), "thing.bin", b"raw");
        let err = pipeline.process_source(&src, "thing").unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
    }

    #[test]
    fn save_all_writes_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path());

        let src_a = write_source(dir.path(), "a.txt", b"first");
        pipeline.process_source(&src_a, "a").unwrap();
        pipeline.save_all().unwrap();
        assert_eq!(pipeline.dirty_count(), 0);

        let pack_path = pipeline.config().pack_path();
        let reader = PackReader::open(&pack_path).unwrap();
        assert_eq!(reader.asset_count(), 1);
        drop(reader);

        let src_b = write_source(dir.path(), "b.txt", b"second");
        pipeline.process_source(&src_b, "b").unwrap();
        pipeline.save_all().unwrap();

        let reader = PackReader::open(&pack_path).unwrap();
        assert_eq!(reader.asset_count(), 2);
        let info = reader.find_asset_by_name("b").unwrap();
        assert_eq!(reader.load_cooked_payload(info.id).unwrap().bytes, b"second");
    }

    #[test]
    fn save_with_nothing_dirty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path());
        pipeline.save_all().unwrap();
        assert!(!pipeline.config().pack_path().exists());
    }
}
