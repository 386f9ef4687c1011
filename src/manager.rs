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

//! Asset manager
//!
//! Front door of the runtime: mounts packs into a priority-ordered
//! overlay, registers per-type factories, and serves synchronous, cached
//! and asynchronous loads. Higher-priority packs shadow lower ones, which
//! is how patches override base content. With source assets enabled, a
//! name that no pack knows falls back to cooking the source file through
//! the runtime pipeline.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::{AssetCache, AssetHandle, CacheConfig};
use crate::error::{Error, Result};
use crate::id::{AssetId, TypeId};
use crate::loader::{
    AsyncLoadHandle, AsyncLoader, CancellationToken, ErasedAsset, LoadDelegate, LoadPriority,
    LoadRequestSpec, LoadTarget,
};
use crate::mmap::{MapAccess, MappedFile};
use crate::pack::{AssetInfo, BulkChunkInfo, BulkSemantic, PackReader};
use crate::payload::{PayloadRegistry, TypedPayload};
use crate::pipeline::{Cooker, Importer, RuntimePipeline, RuntimePipelineConfig};
use crate::source::{SourceAssetResolver, SourceMountConfig};

/// Options for one mounted pack.
#[derive(Debug, Clone, Default)]
pub struct PackMountOptions {
    /// Higher priority packs shadow lower ones on name lookups.
    pub priority: i32,
    /// Keep the whole pack resident via a prefetched mapping.
    pub load_to_memory: bool,
    /// Virtual prefix; lookups must start with it and it is stripped
    /// before consulting the pack's index.
    pub mount_point: String,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub cache: CacheConfig,
    /// Zero picks one fewer than the available parallelism.
    pub loader_threads: usize,
    pub hot_reload: bool,
    pub hot_reload_poll: Duration,
    /// Source roots installed when source assets are enabled.
    pub source_roots: Vec<SourceMountConfig>,
    /// Directories scanned for `.snpak` files to mount at startup.
    pub pack_search_paths: Vec<PathBuf>,
    pub runtime_pipeline: RuntimePipelineConfig,
    /// Enable the source-asset fallback path.
    pub source_assets: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            cache: CacheConfig::default(),
            loader_threads: 0,
            hot_reload: false,
            hot_reload_poll: Duration::from_millis(500),
            source_roots: Vec::new(),
            pack_search_paths: Vec::new(),
            runtime_pipeline: RuntimePipelineConfig::default(),
            source_assets: false,
        }
    }
}

/// Everything a factory sees while constructing a runtime object.
pub struct AssetLoadContext<'a> {
    pub cooked: &'a TypedPayload,
    pub info: &'a AssetInfo,
    pub registry: &'a PayloadRegistry,
    /// Caller-supplied opaque parameters. Factories downcast; absent or
    /// mistyped params mean "use defaults".
    pub params: Option<&'a (dyn Any + Send + Sync)>,
    load_bulk: &'a (dyn Fn(u32) -> Result<Vec<u8>> + 'a),
    bulk_info: &'a (dyn Fn(u32) -> Result<BulkChunkInfo> + 'a),
}

impl AssetLoadContext<'_> {
    /// Load one of the asset's bulk chunks.
    pub fn load_bulk(&self, index: u32) -> Result<Vec<u8>> {
        (self.load_bulk)(index)
    }

    pub fn bulk_info(&self, index: u32) -> Result<BulkChunkInfo> {
        (self.bulk_info)(index)
    }

    /// Deserialize the cooked payload through the registry.
    pub fn deserialize_cooked(&self) -> Result<Box<dyn Any + Send + Sync>> {
        self.registry.deserialize_payload(self.cooked)
    }
}

/// Builds runtime objects from cooked payloads. One factory per runtime
/// type; its declared cooked payload type is checked against each asset
/// before it runs.
pub trait AssetFactory: Send + Sync {
    fn cooked_payload_type(&self) -> TypeId;

    /// Size estimate for cache accounting. Zero defers to the manager's
    /// bulk-size heuristic.
    fn estimate_size(&self, _ctx: &AssetLoadContext) -> usize {
        0
    }

    fn load(&self, ctx: &AssetLoadContext) -> Result<Box<dyn Any + Send + Sync>>;
}

/// Result delivered to typed async callbacks.
pub struct AsyncLoadResult<T> {
    pub asset: Option<Box<T>>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl<T> AsyncLoadResult<T> {
    pub fn is_success(&self) -> bool {
        self.asset.is_some() && self.error.is_none() && !self.cancelled
    }
}

struct MountedPack {
    path: PathBuf,
    options: PackMountOptions,
    reader: Arc<PackReader>,
    last_modified: Option<SystemTime>,
    /// Held only to keep the pack's pages resident.
    _resident: Option<MappedFile>,
}

type HotReloadCallback = Box<dyn Fn(&[AssetId]) + Send + Sync>;

struct SourceState {
    resolver: RwLock<SourceAssetResolver>,
    pipeline: RuntimePipeline,
}

struct ManagerCore {
    registry: Arc<PayloadRegistry>,
    cache: AssetCache,
    packs: RwLock<Vec<MountedPack>>,
    factories: RwLock<FxHashMap<std::any::TypeId, Arc<dyn AssetFactory>>>,
    hot_reload_enabled: AtomicBool,
    hot_reload_callback: Mutex<Option<HotReloadCallback>>,
    source: Option<SourceState>,
    auto_save: bool,
}

impl ManagerCore {
    fn resolve_by_name(&self, name: &str) -> Option<(Arc<PackReader>, AssetInfo)> {
        let packs = self.packs.read();
        for pack in packs.iter() {
            let lookup = if pack.options.mount_point.is_empty() {
                name
            } else if let Some(stripped) = name.strip_prefix(&pack.options.mount_point) {
                stripped
            } else {
                continue;
            };
            if let Ok(info) = pack.reader.find_asset_by_name(lookup) {
                return Some((Arc::clone(&pack.reader), info));
            }
        }
        None
    }

    fn resolve_by_id(&self, id: AssetId) -> Option<(Arc<PackReader>, AssetInfo)> {
        let packs = self.packs.read();
        for pack in packs.iter() {
            if let Ok(info) = pack.reader.find_asset(id) {
                return Some((Arc::clone(&pack.reader), info));
            }
        }
        None
    }

    fn factory_for(&self, runtime_type: std::any::TypeId) -> Result<Arc<dyn AssetFactory>> {
        self.factories
            .read()
            .get(&runtime_type)
            .cloned()
            .ok_or_else(|| Error::Runtime("no factory registered for requested runtime type".into()))
    }

    fn check_factory(&self, factory: &dyn AssetFactory, cooked_type: TypeId) -> Result<()> {
        let declared = factory.cooked_payload_type();
        if declared != cooked_type {
            return Err(Error::Runtime(format!(
                "factory cooked type mismatch: asset has {cooked_type}, factory expects {declared}"
            )));
        }
        Ok(())
    }

    fn load_from_pack(
        &self,
        reader: &Arc<PackReader>,
        info: &AssetInfo,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset> {
        let factory = self.factory_for(runtime_type)?;
        self.check_factory(factory.as_ref(), info.cooked_payload_type)?;

        let cooked = reader.load_cooked_payload(info.id)?;

        let id = info.id;
        let load_bulk = |index: u32| reader.load_bulk_chunk(id, index);
        let bulk_info = |index: u32| reader.bulk_chunk_info(id, index);

        let ctx = AssetLoadContext {
            cooked: &cooked,
            info,
            registry: &self.registry,
            params,
            load_bulk: &load_bulk,
            bulk_info: &bulk_info,
        };
        factory.load(&ctx)
    }

    fn load_any_by_name(
        &self,
        name: &str,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset> {
        self.registry.freeze();

        if let Some((reader, info)) = self.resolve_by_name(name) {
            return self.load_from_pack(&reader, &info, runtime_type, params);
        }

        if self.source.is_some() {
            self.try_pipeline_source(name)?;
            return self.load_from_runtime_pipeline(name, runtime_type, params);
        }

        Err(Error::NotFound(format!("asset {name:?}")))
    }

    fn load_any_by_id(
        &self,
        id: AssetId,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset> {
        self.registry.freeze();

        let (reader, info) = self
            .resolve_by_id(id)
            .ok_or_else(|| Error::NotFound(format!("asset {id}")))?;
        self.load_from_pack(&reader, &info, runtime_type, params)
    }

    /// Make sure a source-backed asset is cooked and resident in the
    /// runtime pipeline.
    fn try_pipeline_source(&self, name: &str) -> Result<AssetId> {
        let state = self
            .source
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("asset {name:?}")))?;

        if state.pipeline.has_asset(name) {
            return state.pipeline.asset_id(name);
        }

        let resolved = state
            .resolver
            .read()
            .resolve(name)
            .ok_or_else(|| Error::NotFound(format!("asset {name:?} (no pack entry, no source)")))?;

        let outcome = state.pipeline.process_source(
            &resolved.absolute_path.to_string_lossy(),
            &resolved.logical_name,
        )?;
        Ok(outcome.id)
    }

    fn load_from_runtime_pipeline(
        &self,
        name: &str,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset> {
        let state = self
            .source
            .as_ref()
            .ok_or_else(|| Error::Runtime("source assets are not enabled".into()))?;
        let asset = state
            .pipeline
            .cooked_asset(name)
            .ok_or_else(|| Error::Runtime(format!("asset not in runtime pipeline: {name}")))?;

        let factory = self.factory_for(runtime_type)?;
        self.check_factory(factory.as_ref(), asset.cooked.payload_type)?;

        let info = AssetInfo {
            id: asset.id,
            asset_kind: asset.asset_kind,
            cooked_payload_type: asset.cooked.payload_type,
            schema_version: asset.cooked.schema_version,
            name: asset.logical_name.clone(),
            variant_key: String::new(),
            bulk_chunk_count: asset.bulk.len() as u32,
        };

        let bulk = &asset.bulk;
        let load_bulk = |index: u32| {
            bulk.get(index as usize)
                .map(|b| b.bytes.clone())
                .ok_or_else(|| Error::Bounds(format!("bulk index {index} out of range")))
        };
        let bulk_info = |index: u32| {
            bulk.get(index as usize)
                .map(|b| BulkChunkInfo {
                    semantic: BulkSemantic::from_u32(b.semantic),
                    sub_index: b.sub_index,
                    uncompressed_size: b.bytes.len() as u64,
                })
                .ok_or_else(|| Error::Bounds(format!("bulk index {index} out of range")))
        };

        let ctx = AssetLoadContext {
            cooked: &asset.cooked,
            info: &info,
            registry: &self.registry,
            params,
            load_bulk: &load_bulk,
            bulk_info: &bulk_info,
        };
        factory.load(&ctx)
    }

    /// Cache size estimate for an asset: the factory's own estimate when
    /// it gives one, else the sum of uncompressed bulk sizes, else 1 KiB.
    fn estimate_asset_size(&self, id: AssetId, runtime_type: std::any::TypeId) -> usize {
        let Some((reader, info)) = self.resolve_by_id(id) else {
            return 1024;
        };

        if let Ok(factory) = self.factory_for(runtime_type) {
            if let Ok(cooked) = reader.load_cooked_payload(id) {
                let load_bulk = |index: u32| reader.load_bulk_chunk(id, index);
                let bulk_info = |index: u32| reader.bulk_chunk_info(id, index);
                let ctx = AssetLoadContext {
                    cooked: &cooked,
                    info: &info,
                    registry: &self.registry,
                    params: None,
                    load_bulk: &load_bulk,
                    bulk_info: &bulk_info,
                };
                let estimate = factory.estimate_size(&ctx);
                if estimate > 0 {
                    return estimate;
                }
            }
        }

        let total: u64 = (0..info.bulk_chunk_count)
            .filter_map(|i| reader.bulk_chunk_info(id, i).ok())
            .map(|b| b.uncompressed_size)
            .sum();
        if total > 0 {
            total as usize
        } else {
            1024
        }
    }

    fn check_for_changes(&self) -> Vec<PathBuf> {
        if !self.hot_reload_enabled.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut reloaded_packs = Vec::new();
        let mut reloaded_assets = Vec::new();

        {
            let mut packs = self.packs.write();
            for pack in packs.iter_mut() {
                let Ok(modified) = std::fs::metadata(&pack.path).and_then(|m| m.modified()) else {
                    continue;
                };
                if Some(modified) == pack.last_modified {
                    continue;
                }

                match PackReader::open(&pack.path) {
                    Ok(new_reader) => {
                        // Report what the stale reader served so clients
                        // can drop handles and re-request.
                        for i in 0..pack.reader.asset_count() {
                            if let Ok(info) = pack.reader.asset_info(i) {
                                reloaded_assets.push(info.id);
                            }
                        }
                        pack.reader = Arc::new(new_reader);
                        pack.last_modified = Some(modified);
                        reloaded_packs.push(pack.path.clone());
                        debug!(path = %pack.path.display(), "hot-reloaded pack");
                    }
                    Err(e) => {
                        warn!(path = %pack.path.display(), error = %e, "hot reload reopen failed");
                    }
                }
            }
        }

        if !reloaded_assets.is_empty() {
            if let Some(callback) = self.hot_reload_callback.lock().as_ref() {
                callback(&reloaded_assets);
            }
        }

        reloaded_packs
    }
}

impl LoadDelegate for ManagerCore {
    fn load_erased(
        &self,
        target: &LoadTarget,
        runtime_type: std::any::TypeId,
        params: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<ErasedAsset> {
        match target {
            LoadTarget::Name(name) => self.load_any_by_name(name, runtime_type, params),
            LoadTarget::Id(id) => self.load_any_by_id(*id, runtime_type, params),
        }
    }
}

fn scan_for_packs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                walk(&path, out);
            } else if path.extension().is_some_and(|ext| ext == "snpak") {
                out.push(path);
            }
        }
    }

    let mut out = Vec::new();
    for dir in dirs {
        if dir.is_dir() {
            walk(dir, &mut out);
        }
    }
    out
}

/// Runtime asset manager.
pub struct AssetManager {
    core: Arc<ManagerCore>,
    loader_threads: usize,
    loader: OnceLock<AsyncLoader>,
    poll_stop: Arc<AtomicBool>,
    poll_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AssetManager {
    pub fn new(config: ManagerConfig) -> Self {
        let registry = Arc::new(PayloadRegistry::new());

        let source = config.source_assets.then(|| {
            let mut resolver = SourceAssetResolver::new();
            for root in &config.source_roots {
                resolver.add_root(root.clone());
            }
            SourceState {
                resolver: RwLock::new(resolver),
                pipeline: RuntimePipeline::new(
                    config.runtime_pipeline.clone(),
                    Arc::clone(&registry),
                ),
            }
        });

        let core = Arc::new(ManagerCore {
            registry,
            cache: AssetCache::new(config.cache.clone()),
            packs: RwLock::new(Vec::new()),
            factories: RwLock::new(FxHashMap::default()),
            hot_reload_enabled: AtomicBool::new(config.hot_reload),
            hot_reload_callback: Mutex::new(None),
            source,
            auto_save: config.runtime_pipeline.auto_save,
        });

        let manager = AssetManager {
            core,
            loader_threads: config.loader_threads,
            loader: OnceLock::new(),
            poll_stop: Arc::new(AtomicBool::new(false)),
            poll_thread: Mutex::new(None),
        };

        for pack_path in scan_for_packs(&config.pack_search_paths) {
            if let Err(e) = manager.mount_pack(&pack_path, PackMountOptions::default()) {
                warn!(path = %pack_path.display(), error = %e, "auto-mount failed");
            }
        }

        // A runtime pack from a previous session sits underneath
        // everything else.
        if manager.core.source.is_some() {
            let runtime_pack = config.runtime_pipeline.pack_path();
            if runtime_pack.exists() {
                let options = PackMountOptions {
                    priority: -50,
                    ..PackMountOptions::default()
                };
                if let Err(e) = manager.mount_pack(&runtime_pack, options) {
                    warn!(error = %e, "failed to mount runtime pack");
                }
            }
        }

        if config.hot_reload && !config.hot_reload_poll.is_zero() {
            manager.start_hot_reload_polling(config.hot_reload_poll);
        }

        manager
    }

    // ---- pack management ----

    /// Mount a pack. Fails if the path is already mounted or the pack
    /// does not validate.
    pub fn mount_pack(&self, path: impl AsRef<Path>, options: PackMountOptions) -> Result<()> {
        let path = path.as_ref().to_path_buf();

        {
            let packs = self.core.packs.read();
            if packs.iter().any(|p| p.path == path) {
                return Err(Error::Runtime(format!(
                    "pack already mounted: {}",
                    path.display()
                )));
            }
        }

        let reader = Arc::new(PackReader::open(&path)?);
        let last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        let resident = if options.load_to_memory {
            match MappedFile::open(&path, MapAccess::ReadOnly) {
                Ok(map) => {
                    map.prefetch(0, map.len());
                    Some(map)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "load_to_memory mapping failed");
                    None
                }
            }
        } else {
            None
        };

        debug!(path = %path.display(), priority = options.priority, "mounted pack");

        let mut packs = self.core.packs.write();
        packs.push(MountedPack {
            path,
            options,
            reader,
            last_modified,
            _resident: resident,
        });
        // Stable: equal priorities keep mount order.
        packs.sort_by_key(|p| std::cmp::Reverse(p.options.priority));
        Ok(())
    }

    pub fn unmount_pack(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.core.packs.write().retain(|p| p.path != path);
    }

    pub fn unmount_all(&self) {
        self.core.packs.write().clear();
    }

    /// Mounted pack paths, highest priority first.
    pub fn mounted_packs(&self) -> Vec<PathBuf> {
        self.core.packs.read().iter().map(|p| p.path.clone()).collect()
    }

    // ---- registry and factories ----

    /// The payload registry. Register serializers before the first load;
    /// the registry freezes when loading starts.
    pub fn registry(&self) -> &PayloadRegistry {
        &self.core.registry
    }

    /// Register the factory that builds `T` from cooked payloads.
    pub fn register_factory<T: Any + Send + Sync>(&self, factory: impl AssetFactory + 'static) {
        self.core
            .factories
            .write()
            .insert(std::any::TypeId::of::<T>(), Arc::new(factory));
    }

    // ---- discovery ----

    /// Find an asset by name across mounted packs, honoring priority and
    /// mount points.
    pub fn find_asset(&self, name: &str) -> Result<AssetInfo> {
        self.core
            .resolve_by_name(name)
            .map(|(_, info)| info)
            .ok_or_else(|| Error::NotFound(format!("asset {name:?}")))
    }

    pub fn find_asset_by_id(&self, id: AssetId) -> Result<AssetInfo> {
        self.core
            .resolve_by_id(id)
            .map(|(_, info)| info)
            .ok_or_else(|| Error::NotFound(format!("asset {id}")))
    }

    /// Every variant of a logical name across all mounted packs.
    pub fn find_asset_variants(&self, name: &str) -> Vec<AssetInfo> {
        let packs = self.core.packs.read();
        let mut all = Vec::new();
        for pack in packs.iter() {
            let lookup = if pack.options.mount_point.is_empty() {
                name
            } else if let Some(stripped) = name.strip_prefix(&pack.options.mount_point) {
                stripped
            } else {
                continue;
            };
            all.extend(pack.reader.find_assets_by_name(lookup));
        }
        all
    }

    pub fn list_assets(&self) -> Vec<AssetInfo> {
        let packs = self.core.packs.read();
        let mut all = Vec::new();
        for pack in packs.iter() {
            for i in 0..pack.reader.asset_count() {
                if let Ok(info) = pack.reader.asset_info(i) {
                    all.push(info);
                }
            }
        }
        all
    }

    // ---- synchronous loading ----

    /// Load fresh, bypassing the cache. Returns unique ownership.
    pub fn load<T: Any + Send + Sync>(&self, name: &str) -> Result<Box<T>> {
        let erased = self
            .core
            .load_any_by_name(name, std::any::TypeId::of::<T>(), None)?;
        downcast_loaded(erased)
    }

    pub fn load_by_id<T: Any + Send + Sync>(&self, id: AssetId) -> Result<Box<T>> {
        let erased = self
            .core
            .load_any_by_id(id, std::any::TypeId::of::<T>(), None)?;
        downcast_loaded(erased)
    }

    /// Load with caller params forwarded to the factory.
    pub fn load_with_params<T: Any + Send + Sync>(
        &self,
        name: &str,
        params: &(dyn Any + Send + Sync),
    ) -> Result<Box<T>> {
        let erased =
            self.core
                .load_any_by_name(name, std::any::TypeId::of::<T>(), Some(params))?;
        downcast_loaded(erased)
    }

    // ---- cached loading ----

    /// Cache-first load returning a reference-counted handle.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<AssetHandle<T>> {
        let info = self.find_asset(name)?;
        self.get_by_id(info.id)
    }

    pub fn get_by_id<T: Any + Send + Sync>(&self, id: AssetId) -> Result<AssetHandle<T>> {
        let cached = self.core.cache.get::<T>(id);
        if cached.is_valid() {
            return Ok(cached);
        }

        let loaded = self.load_by_id::<T>(id)?;
        let estimate = self
            .core
            .estimate_asset_size(id, std::any::TypeId::of::<T>());
        Ok(self.core.cache.insert(id, *loaded, estimate))
    }

    pub fn is_cached<T: Any + Send + Sync>(&self, id: AssetId) -> bool {
        self.core.cache.contains::<T>(id)
    }

    // ---- async loading ----

    fn loader(&self) -> &AsyncLoader {
        self.loader.get_or_init(|| {
            let delegate: Arc<dyn LoadDelegate> = Arc::clone(&self.core) as _;
            AsyncLoader::new(delegate, self.loader_threads)
        })
    }

    /// Queue an async load by name. The typed callback runs on a worker
    /// thread when the load settles.
    pub fn load_async<T: Any + Send + Sync>(
        &self,
        name: &str,
        priority: LoadPriority,
        params: Option<Box<dyn Any + Send + Sync>>,
        callback: impl FnOnce(AsyncLoadResult<T>) + Send + 'static,
        token: CancellationToken,
    ) -> AsyncLoadHandle {
        self.enqueue_async(LoadTarget::Name(name.to_string()), priority, params, callback, token)
    }

    pub fn load_async_by_id<T: Any + Send + Sync>(
        &self,
        id: AssetId,
        priority: LoadPriority,
        params: Option<Box<dyn Any + Send + Sync>>,
        callback: impl FnOnce(AsyncLoadResult<T>) + Send + 'static,
        token: CancellationToken,
    ) -> AsyncLoadHandle {
        self.enqueue_async(LoadTarget::Id(id), priority, params, callback, token)
    }

    fn enqueue_async<T: Any + Send + Sync>(
        &self,
        target: LoadTarget,
        priority: LoadPriority,
        params: Option<Box<dyn Any + Send + Sync>>,
        callback: impl FnOnce(AsyncLoadResult<T>) + Send + 'static,
        token: CancellationToken,
    ) -> AsyncLoadHandle {
        self.loader().enqueue(LoadRequestSpec {
            target,
            runtime_type: std::any::TypeId::of::<T>(),
            priority,
            params,
            token,
            callback: Some(Box::new(move |outcome| {
                let asset = outcome.asset.and_then(|a| a.downcast::<T>().ok());
                callback(AsyncLoadResult {
                    asset,
                    error: outcome.error,
                    cancelled: outcome.cancelled,
                });
            })),
            deferred: false,
        })
    }

    /// The underlying loader, for wait/cancel/pump operations.
    pub fn async_loader(&self) -> &AsyncLoader {
        self.loader()
    }

    // ---- cache management ----

    pub fn cache(&self) -> &AssetCache {
        &self.core.cache
    }

    pub fn clear_unreferenced_cache(&self) -> usize {
        self.core.cache.clear_unreferenced()
    }

    pub fn clear_cache(&self) {
        self.core.cache.clear_all();
    }

    // ---- hot reload ----

    pub fn set_hot_reload_enabled(&self, enabled: bool) {
        self.core.hot_reload_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_hot_reload_enabled(&self) -> bool {
        self.core.hot_reload_enabled.load(Ordering::Acquire)
    }

    /// Compare mounted packs against their files and swap readers for any
    /// that changed. Returns the paths that were reloaded; the registered
    /// callback receives the asset ids the stale readers were serving.
    pub fn check_for_changes(&self) -> Vec<PathBuf> {
        self.core.check_for_changes()
    }

    pub fn set_hot_reload_callback(&self, callback: impl Fn(&[AssetId]) + Send + Sync + 'static) {
        *self.core.hot_reload_callback.lock() = Some(Box::new(callback));
    }

    /// Start a background thread polling for pack changes.
    pub fn start_hot_reload_polling(&self, interval: Duration) {
        let mut slot = self.poll_thread.lock();
        if slot.is_some() {
            return;
        }
        self.poll_stop.store(false, Ordering::Release);

        let core = Arc::clone(&self.core);
        let stop = Arc::clone(&self.poll_stop);
        let handle = thread::Builder::new()
            .name("snpak-hot-reload".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    core.check_for_changes();
                }
            })
            .expect("failed to spawn hot reload poller");
        *slot = Some(handle);
    }

    pub fn stop_hot_reload_polling(&self) {
        self.poll_stop.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }
    }

    // ---- source assets ----

    pub fn add_source_root(&self, config: SourceMountConfig) {
        if let Some(state) = &self.core.source {
            state.resolver.write().add_root(config);
        }
    }

    pub fn remove_source_root(&self, root_path: impl AsRef<Path>) {
        if let Some(state) = &self.core.source {
            state.resolver.write().remove_root(root_path);
        }
    }

    /// Register an importer with the runtime pipeline. No-op unless
    /// source assets are enabled.
    pub fn register_importer(&self, importer: Box<dyn Importer>) {
        match &self.core.source {
            Some(state) => state.pipeline.register_importer(importer),
            None => warn!("register_importer ignored: source assets are disabled"),
        }
    }

    pub fn register_cooker(&self, cooker: Box<dyn Cooker>) {
        match &self.core.source {
            Some(state) => state.pipeline.register_cooker(cooker),
            None => warn!("register_cooker ignored: source assets are disabled"),
        }
    }

    /// Persist dirty runtime-pipelined assets to the runtime pack.
    pub fn save_runtime_assets(&self) -> Result<()> {
        let state = self
            .core
            .source
            .as_ref()
            .ok_or_else(|| Error::Runtime("runtime pipeline not initialized".into()))?;
        state.pipeline.save_all()
    }

    pub fn dirty_asset_count(&self) -> u32 {
        self.core
            .source
            .as_ref()
            .map(|s| s.pipeline.dirty_count())
            .unwrap_or(0)
    }
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        self.stop_hot_reload_polling();
        if let Some(loader) = self.loader.get() {
            loader.shutdown();
        }
        if self.core.auto_save {
            if let Some(state) = &self.core.source {
                if state.pipeline.dirty_count() > 0 {
                    if let Err(e) = state.pipeline.save_all() {
                        warn!(error = %e, "auto-save of runtime assets failed");
                    }
                }
            }
        }
    }
}

fn downcast_loaded<T: Any + Send + Sync>(erased: ErasedAsset) -> Result<Box<T>> {
    erased
        .downcast::<T>()
        .map_err(|_| Error::Runtime("factory produced an unexpected runtime type".into()))
}
