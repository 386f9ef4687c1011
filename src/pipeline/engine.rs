//! Batch build engine
//!
//! Walks source roots, pushes every source through the importer/cooker
//! pair, and writes the results into one pack. Three build modes: full
//! rebuild, changed-only incremental (appending to the existing pack), and
//! explicit path lists. Per-source failures are accumulated, never fatal;
//! a partial pack is still written.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::compression::{Compression, CompressionLevel};
use crate::error::{Error, Result};
use crate::hashing::hash64;
use crate::id::AssetId;
use crate::pack::{AssetPackEntry, PackWriter};
use crate::payload::{PayloadRegistry, PayloadSerializer};
use crate::pipeline::incremental::{CacheEntryRecord, IncrementalCache};
use crate::pipeline::{
    BuildResult, CollaboratorInfo, CollaboratorProvider, CollaboratorSet, CookRequest, Cooker,
    Importer, PipelineContext, SourceRef, StdPipelineContext,
};
use std::sync::Arc;

/// Batch build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directories scanned recursively for sources.
    pub source_roots: Vec<PathBuf>,
    /// Output `.snpak` path.
    pub output_pack: PathBuf,
    /// Options forwarded to importers and cookers; participate in rebuild
    /// decisions.
    pub build_options: FxHashMap<String, String>,
    /// Derive asset ids from logical name and variant key instead of
    /// rolling random ones.
    pub deterministic_asset_ids: bool,
    /// Incremental cache database. Defaults to the output path with a
    /// `.cache` suffix.
    pub cache_db_path: Option<PathBuf>,
    pub compression: Compression,
    pub compression_level: CompressionLevel,
    /// Cook parallelism; zero picks a sensible default, one forces
    /// sequential cooking.
    pub parallel_jobs: usize,
    pub verbose: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            source_roots: Vec::new(),
            output_pack: PathBuf::new(),
            build_options: FxHashMap::default(),
            deterministic_asset_ids: true,
            cache_db_path: None,
            compression: Compression::Zstd,
            compression_level: CompressionLevel::Default,
            parallel_jobs: 0,
            verbose: false,
        }
    }
}

impl BuildConfig {
    fn cache_path(&self) -> PathBuf {
        self.cache_db_path.clone().unwrap_or_else(|| {
            let mut path = self.output_pack.as_os_str().to_os_string();
            path.push(".cache");
            PathBuf::from(path)
        })
    }
}

/// Everything one source produced, staged for the sequential write and
/// cache-update phase.
struct SourceOutcome {
    uri: String,
    entries: Vec<AssetPackEntry>,
    records: Vec<PendingRecord>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

struct PendingRecord {
    record: CacheEntryRecord,
    dependency_paths: Vec<String>,
}

/// Source to pack build engine.
pub struct PipelineEngine {
    config: BuildConfig,
    registry: Arc<PayloadRegistry>,
    collaborators: CollaboratorSet,
    providers: Vec<CollaboratorInfo>,
    cache: Mutex<IncrementalCache>,
}

impl PipelineEngine {
    /// Validate the configuration and open the incremental cache.
    pub fn new(config: BuildConfig) -> Result<Self> {
        if config.output_pack.as_os_str().is_empty() {
            return Err(Error::Pipeline("output pack path is required".into()));
        }
        if config.source_roots.is_empty() {
            return Err(Error::Pipeline("at least one source root is required".into()));
        }
        for root in &config.source_roots {
            if !root.is_dir() {
                return Err(Error::Pipeline(format!(
                    "source root does not exist: {}",
                    root.display()
                )));
            }
        }

        let cache = IncrementalCache::open(config.cache_path())?;

        Ok(PipelineEngine {
            config,
            registry: Arc::new(PayloadRegistry::new()),
            collaborators: CollaboratorSet::new(),
            providers: Vec::new(),
            cache: Mutex::new(cache),
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PayloadRegistry> {
        &self.registry
    }

    // Registration happens before the first build; the registry freezes
    // when a build starts.

    pub fn register_importer(&mut self, importer: Box<dyn Importer>) {
        self.collaborators.register_importer(importer);
    }

    pub fn register_cooker(&mut self, cooker: Box<dyn Cooker>) {
        self.collaborators.register_cooker(cooker);
    }

    pub fn register_serializer(&mut self, serializer: Box<dyn PayloadSerializer>) {
        self.registry.register(serializer);
    }

    /// Let a provider contribute its importers, cookers and serializers.
    pub fn install_provider(&mut self, provider: &dyn CollaboratorProvider) {
        debug!(name = provider.name(), version = provider.version(), "installing provider");
        provider.register(&mut self.collaborators);
        self.collaborators.transfer_serializers(&self.registry);
        self.providers.push(CollaboratorInfo {
            name: provider.name().to_string(),
            version: provider.version().to_string(),
        });
    }

    /// Providers installed so far, in installation order.
    pub fn providers(&self) -> &[CollaboratorInfo] {
        &self.providers
    }

    pub fn importers(&self) -> Vec<CollaboratorInfo> {
        self.collaborators.importer_infos()
    }

    pub fn cookers(&self) -> Vec<CollaboratorInfo> {
        self.collaborators.cooker_infos()
    }

    /// Build every source from scratch and write a fresh pack.
    pub fn build_all(&self) -> BuildResult {
        self.registry.freeze();
        let mut result = BuildResult {
            success: true,
            ..BuildResult::default()
        };

        let sources = self.scan_sources(&mut result);
        if sources.is_empty() {
            result.warnings.push("no source files found".to_string());
            return result;
        }

        let outcomes = self.process_sources(&sources);

        let mut writer = self.make_writer();
        self.commit_outcomes(outcomes, &mut writer, &mut result);

        if let Err(e) = writer.write(&self.config.output_pack) {
            result.errors.push(format!("failed to write pack: {e}"));
        }

        result.success = result.errors.is_empty();
        result
    }

    /// Rebuild only sources whose fingerprint changed and append them to
    /// the existing pack. Assets of unchanged sources are not re-cooked;
    /// the append carries them into the new index untouched.
    pub fn build_changed(&self) -> BuildResult {
        self.registry.freeze();
        let mut result = BuildResult {
            success: true,
            ..BuildResult::default()
        };

        let sources = self.scan_sources(&mut result);
        if sources.is_empty() {
            result.warnings.push("no source files found".to_string());
            return result;
        }

        let changed: Vec<SourceRef> = {
            let cache = self.cache.lock();
            sources
                .into_iter()
                .filter(|source| {
                    let rebuild = self.source_needs_rebuild(&cache, source);
                    if !rebuild {
                        result.assets_skipped += 1;
                    }
                    rebuild
                })
                .collect()
        };

        if changed.is_empty() {
            debug!("incremental build: nothing changed");
            return result;
        }

        let outcomes = self.process_sources(&changed);

        let mut writer = self.make_writer();
        self.commit_outcomes(outcomes, &mut writer, &mut result);

        let write_result = if self.config.output_pack.exists() {
            writer.append_update(&self.config.output_pack)
        } else {
            writer.write(&self.config.output_pack)
        };
        if let Err(e) = write_result {
            result.errors.push(format!("failed to write pack: {e}"));
        }

        result.success = result.errors.is_empty();
        result
    }

    /// Build an explicit list of sources, writing or appending to
    /// `output_pack` (empty means the configured output).
    pub fn build_assets(
        &self,
        source_paths: &[PathBuf],
        output_pack: Option<&Path>,
        append: bool,
    ) -> BuildResult {
        self.registry.freeze();
        let mut result = BuildResult {
            success: true,
            ..BuildResult::default()
        };

        if source_paths.is_empty() {
            result.warnings.push("no source paths provided".to_string());
            return result;
        }

        let pack_path = output_pack.unwrap_or(&self.config.output_pack);
        if pack_path.as_os_str().is_empty() {
            result.errors.push("no output pack path specified".to_string());
            result.success = false;
            return result;
        }

        let mut sources = Vec::new();
        {
            let cache = self.cache.lock();
            for path in source_paths {
                if !path.is_file() {
                    result.errors.push(format!("source file not found: {}", path.display()));
                    result.assets_failed += 1;
                    continue;
                }
                let uri = path.to_string_lossy().to_string();
                let content_hash = cache.cached_file_hash(&uri).unwrap_or(0);
                sources.push(SourceRef { uri, content_hash });
            }
        }

        if sources.is_empty() {
            result.success = false;
            return result;
        }

        let outcomes = self.process_sources(&sources);

        let mut writer = self.make_writer();
        self.commit_outcomes(outcomes, &mut writer, &mut result);

        let write_result = if append && pack_path.exists() {
            writer.append_update(pack_path)
        } else {
            writer.write(pack_path)
        };
        if let Err(e) = write_result {
            result.errors.push(format!("failed to write pack: {e}"));
        }

        result.success = result.errors.is_empty();
        result
    }

    pub fn build_asset(
        &self,
        source_path: &Path,
        output_pack: Option<&Path>,
        append: bool,
    ) -> BuildResult {
        self.build_assets(&[source_path.to_path_buf()], output_pack, append)
    }

    /// Drop incremental cache entries for assets not in `valid_ids`.
    pub fn prune_cache(&self, valid_ids: &[AssetId]) -> Result<usize> {
        self.cache.lock().prune_stale(valid_ids)
    }

    // ---- internals ----

    fn make_writer(&self) -> PackWriter {
        let mut writer = PackWriter::new();
        writer.set_compression(self.config.compression);
        writer.set_compression_level(self.config.compression_level);
        writer
    }

    /// Recursively walk the source roots. Entries are sorted so repeated
    /// builds see sources in the same order.
    fn scan_sources(&self, result: &mut BuildResult) -> Vec<SourceRef> {
        fn walk(dir: &Path, files: &mut Vec<PathBuf>, warnings: &mut Vec<String>) {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warnings.push(format!("failed to scan {}: {e}", dir.display()));
                    return;
                }
            };
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            paths.sort();
            for path in paths {
                if path.is_dir() {
                    walk(&path, files, warnings);
                } else if path.is_file() {
                    files.push(path);
                }
            }
        }

        let mut files = Vec::new();
        for root in &self.config.source_roots {
            walk(root, &mut files, &mut result.warnings);
        }

        let cache = self.cache.lock();
        files
            .into_iter()
            .map(|path| {
                let uri = path.to_string_lossy().to_string();
                let content_hash = cache.cached_file_hash(&uri).unwrap_or(0);
                SourceRef { uri, content_hash }
            })
            .collect()
    }

    /// True when any asset previously built from this source is out of
    /// date, or the source has never been built.
    fn source_needs_rebuild(&self, cache: &IncrementalCache, source: &SourceRef) -> bool {
        let ids = match cache.assets_for_source(&source.uri) {
            Ok(ids) if !ids.is_empty() => ids,
            _ => return true,
        };

        let options_hash = options_hash(&self.config.build_options);

        for id in ids {
            let Ok(Some(recorded)) = cache.get(id) else {
                return true;
            };
            if recorded.source_hash != source.content_hash {
                return true;
            }
            if recorded.options_hash != options_hash {
                return true;
            }
            // A renamed or re-versioned collaborator invalidates its
            // output.
            if self.collaborators.importer_version(&recorded.importer_name)
                != Some(recorded.importer_version.as_str())
            {
                return true;
            }
            if self.collaborators.cooker_version(&recorded.cooker_name)
                != Some(recorded.cooker_version.as_str())
            {
                return true;
            }
            if cache.has_dependency_changed(id).unwrap_or(true) {
                return true;
            }
        }
        false
    }

    fn process_sources(&self, sources: &[SourceRef]) -> Vec<SourceOutcome> {
        if self.config.parallel_jobs == 1 {
            return sources.iter().map(|s| self.process_source(s)).collect();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_jobs)
            .thread_name(|i| format!("snpak-build-{i}"))
            .build();

        match pool {
            Ok(pool) => pool.install(|| {
                sources.par_iter().map(|s| self.process_source(s)).collect()
            }),
            Err(_) => sources.iter().map(|s| self.process_source(s)).collect(),
        }
    }

    /// Import and cook one source. Failures land in the outcome's error
    /// and warning lists; the build carries on.
    fn process_source(&self, source: &SourceRef) -> SourceOutcome {
        let mut outcome = SourceOutcome {
            uri: source.uri.clone(),
            entries: Vec::new(),
            records: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        };

        let ctx = StdPipelineContext::new(&self.registry, &self.config.build_options);

        let Some(importer) = self.collaborators.find_importer(source) else {
            outcome.warnings.push(format!("no importer found for: {}", source.uri));
            return outcome;
        };

        let items = match importer.import(source, &ctx) {
            Ok(items) => items,
            Err(e) => {
                outcome.errors.push(format!("import failed for {}: {e}", source.uri));
                return outcome;
            }
        };
        if items.is_empty() {
            outcome.warnings.push(format!("import produced no items for: {}", source.uri));
            return outcome;
        }

        let opts_hash = options_hash(&self.config.build_options);

        for mut item in items {
            if self.config.deterministic_asset_ids {
                item.id = ctx.deterministic_asset_id(&item.logical_name, &item.variant_key);
            }

            let Some(cooker) = self
                .collaborators
                .find_cooker(item.asset_kind, item.intermediate.payload_type)
            else {
                outcome.warnings.push(format!(
                    "no cooker found for asset {} (kind {}, type {})",
                    item.logical_name, item.asset_kind, item.intermediate.payload_type
                ));
                continue;
            };

            let intermediate_hash = hash64(&item.intermediate.bytes);

            let request = CookRequest {
                id: item.id,
                logical_name: item.logical_name,
                asset_kind: item.asset_kind,
                variant_key: item.variant_key,
                intermediate: item.intermediate,
                dependencies: item.dependencies,
                build_options: self.config.build_options.clone(),
            };

            let cook_result = match cooker.cook(&request, &ctx) {
                Ok(r) => r,
                Err(e) => {
                    outcome
                        .errors
                        .push(format!("cook failed for asset {}: {e}", request.logical_name));
                    continue;
                }
            };

            // Cook-reported dependencies supersede import-time ones.
            let dependency_paths: Vec<String> = if cook_result.dependencies.is_empty() {
                request.dependencies.iter().map(|d| d.uri.clone()).collect()
            } else {
                cook_result.dependencies.iter().map(|d| d.uri.clone()).collect()
            };

            outcome.records.push(PendingRecord {
                record: CacheEntryRecord {
                    asset_id: request.id,
                    logical_name: request.logical_name.clone(),
                    variant_key: request.variant_key.clone(),
                    source_hash: source.content_hash,
                    deps_hash: 0,
                    intermediate_hash,
                    cooked_hash: hash64(&cook_result.cooked.bytes),
                    options_hash: opts_hash,
                    importer_name: importer.name().to_string(),
                    importer_version: importer.version().to_string(),
                    cooker_name: cooker.name().to_string(),
                    cooker_version: cooker.version().to_string(),
                },
                dependency_paths,
            });

            outcome.entries.push(AssetPackEntry {
                id: request.id,
                asset_kind: request.asset_kind,
                name: request.logical_name,
                variant_key: request.variant_key,
                cooked: cook_result.cooked,
                bulk: cook_result.bulk,
            });
        }

        outcome
    }

    /// Queue the produced entries on the writer, update the incremental
    /// cache, and fold counts and logs into the build result.
    fn commit_outcomes(
        &self,
        outcomes: Vec<SourceOutcome>,
        writer: &mut PackWriter,
        result: &mut BuildResult,
    ) {
        let cache = self.cache.lock();
        let _ = cache.begin_transaction();

        for outcome in outcomes {
            for warning in &outcome.warnings {
                warn!("{warning}");
            }
            result.warnings.extend(outcome.warnings);
            result.errors.extend(outcome.errors);

            if outcome.entries.is_empty() {
                result.assets_failed += 1;
                continue;
            }
            result.assets_built += outcome.entries.len() as u32;

            let ids: Vec<AssetId> = outcome.entries.iter().map(|e| e.id).collect();
            for pending in outcome.records {
                let mut record = pending.record;
                if let Err(e) =
                    cache.set_dependencies(record.asset_id, &pending.dependency_paths, "file")
                {
                    result.warnings.push(format!("failed to record dependencies: {e}"));
                }
                record.deps_hash = cache.dependencies_hash(record.asset_id).unwrap_or(0);
                if let Err(e) = cache.put(&record) {
                    result.warnings.push(format!("failed to update build cache: {e}"));
                }
            }
            if let Err(e) = cache.record_source_assets(&outcome.uri, &ids) {
                result.warnings.push(format!("failed to record source assets: {e}"));
            }

            for entry in outcome.entries {
                writer.add_asset(entry);
            }
        }

        let _ = cache.commit_transaction();
    }
}

fn options_hash(options: &FxHashMap<String, String>) -> u64 {
    let mut pairs: Vec<(&str, &str)> = options
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort();

    let mut buf = Vec::new();
    for (k, v) in pairs {
        buf.extend_from_slice(k.as_bytes());
        buf.push(b'=');
        buf.extend_from_slice(v.as_bytes());
        buf.push(b'\n');
    }
    hash64(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackReader;
    use crate::pipeline::test_support::{TextCooker, TextImporter};

    fn engine_for(sources: &Path, output_dir: &Path) -> PipelineEngine {
        let mut engine = PipelineEngine::new(BuildConfig {
            source_roots: vec![sources.to_path_buf()],
            output_pack: output_dir.join("assets.snpak"),
            ..BuildConfig::default()
        })
        .unwrap();
        engine.register_importer(Box::new(TextImporter));
        engine.register_cooker(Box::new(TextCooker::default()));
        engine
    }

    fn write_sources(dir: &Path, files: &[(&str, &[u8])]) {
        for (name, contents) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
    }

    #[test]
    fn config_validation() {
        assert!(PipelineEngine::new(BuildConfig::default()).is_err());

        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineEngine::new(BuildConfig {
            source_roots: vec![dir.path().join("missing")],
            output_pack: dir.path().join("out.snpak"),
            ..BuildConfig::default()
        })
        .is_err());
    }

    #[test]
    fn build_all_produces_a_pack() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);

        let engine = engine_for(src.path(), out.path());
        let result = engine.build_all();

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.assets_built, 2);
        assert_eq!(result.assets_failed, 0);

        let reader = PackReader::open(out.path().join("assets.snpak")).unwrap();
        assert_eq!(reader.asset_count(), 2);
    }

    #[test]
    fn unknown_sources_warn_and_count_failed() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha"), ("weird.bin", b"???")]);

        let engine = engine_for(src.path(), out.path());
        let result = engine.build_all();

        // The unknown source warns and counts failed, but the pack is
        // still written with the good asset.
        assert!(result.success);
        assert_eq!(result.assets_built, 1);
        assert_eq!(result.assets_failed, 1);
        assert!(!result.warnings.is_empty());
        assert!(out.path().join("assets.snpak").exists());
    }

    #[test]
    fn build_all_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha"), ("b.txt", b"beta")]);

        let out1 = tempfile::tempdir().unwrap();
        let out2 = tempfile::tempdir().unwrap();
        let engine1 = engine_for(src.path(), out1.path());
        let engine2 = engine_for(src.path(), out2.path());

        assert!(engine1.build_all().success);
        assert!(engine2.build_all().success);

        let r1 = PackReader::open(out1.path().join("assets.snpak")).unwrap();
        let r2 = PackReader::open(out2.path().join("assets.snpak")).unwrap();
        assert_eq!(r1.asset_count(), r2.asset_count());

        for i in 0..r1.asset_count() {
            let a = r1.asset_info(i).unwrap();
            let b = r2.asset_info(i).unwrap();
            assert_eq!(a.id, b.id);
            assert_eq!(
                r1.load_cooked_payload(a.id).unwrap().bytes,
                r2.load_cooked_payload(b.id).unwrap().bytes
            );
        }
    }

    #[test]
    fn build_changed_skips_unchanged() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(
            src.path(),
            &[("a.txt", b"alpha"), ("b.txt", b"beta"), ("c.txt", b"gamma")],
        );

        let engine = engine_for(src.path(), out.path());
        assert!(engine.build_all().success);

        // Touch exactly one source.
        write_sources(src.path(), &[("b.txt", b"beta v2")]);

        let result = engine.build_changed();
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.assets_built, 1);
        assert_eq!(result.assets_skipped, 2);

        // The appended pack still serves all three, with b updated.
        let reader = PackReader::open(out.path().join("assets.snpak")).unwrap();
        assert_eq!(reader.asset_count(), 3);
        let b = reader
            .find_asset_by_name(&src.path().join("b.txt").to_string_lossy())
            .unwrap();
        assert_eq!(reader.load_cooked_payload(b.id).unwrap().bytes, b"beta v2");
    }

    #[test]
    fn build_changed_with_no_changes_is_all_skips() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha")]);

        let engine = engine_for(src.path(), out.path());
        assert!(engine.build_all().success);

        let result = engine.build_changed();
        assert!(result.success);
        assert_eq!(result.assets_built, 0);
        assert_eq!(result.assets_skipped, 1);
    }

    #[test]
    fn cooker_version_change_forces_rebuild() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha")]);

        let engine = engine_for(src.path(), out.path());
        assert!(engine.build_all().success);

        // Same sources, updated cooker.
        let mut engine = PipelineEngine::new(BuildConfig {
            source_roots: vec![src.path().to_path_buf()],
            output_pack: out.path().join("assets.snpak"),
            ..BuildConfig::default()
        })
        .unwrap();
        engine.register_importer(Box::new(TextImporter));
        engine.register_cooker(Box::new(TextCooker { version: "2.0" }));

        let result = engine.build_changed();
        assert_eq!(result.assets_built, 1);
        assert_eq!(result.assets_skipped, 0);
    }

    #[test]
    fn build_options_change_forces_rebuild() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha")]);

        let engine = engine_for(src.path(), out.path());
        assert!(engine.build_all().success);

        let mut options = FxHashMap::default();
        options.insert("quality".to_string(), "max".to_string());
        let mut engine = PipelineEngine::new(BuildConfig {
            source_roots: vec![src.path().to_path_buf()],
            output_pack: out.path().join("assets.snpak"),
            build_options: options,
            ..BuildConfig::default()
        })
        .unwrap();
        engine.register_importer(Box::new(TextImporter));
        engine.register_cooker(Box::new(TextCooker::default()));

        let result = engine.build_changed();
        assert_eq!(result.assets_built, 1);
    }

    #[test]
    fn build_assets_with_explicit_paths() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha"), ("b.txt", b"beta")]);

        let engine = engine_for(src.path(), out.path());
        let result = engine.build_asset(&src.path().join("a.txt"), None, false);
        assert!(result.success);
        assert_eq!(result.assets_built, 1);

        let result = engine.build_asset(&src.path().join("b.txt"), None, true);
        assert!(result.success);

        let reader = PackReader::open(out.path().join("assets.snpak")).unwrap();
        assert_eq!(reader.asset_count(), 2);
    }

    #[test]
    fn missing_explicit_path_fails() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha")]);

        let engine = engine_for(src.path(), out.path());
        let result = engine.build_asset(&src.path().join("nope.txt"), None, false);
        assert!(!result.success);
        assert_eq!(result.assets_failed, 1);
    }

    #[test]
    fn provider_backed_build() {
        struct TextProvider;

        impl crate::pipeline::CollaboratorProvider for TextProvider {
            fn name(&self) -> &str {
                "text-provider"
            }

            fn version(&self) -> &str {
                "1.0"
            }

            fn register(&self, set: &mut crate::pipeline::CollaboratorSet) {
                set.register_importer(Box::new(TextImporter));
                set.register_cooker(Box::new(TextCooker::default()));
            }
        }

        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_sources(src.path(), &[("a.txt", b"alpha")]);

        let mut engine = PipelineEngine::new(BuildConfig {
            source_roots: vec![src.path().to_path_buf()],
            output_pack: out.path().join("assets.snpak"),
            ..BuildConfig::default()
        })
        .unwrap();
        engine.install_provider(&TextProvider);

        assert_eq!(engine.providers().len(), 1);
        assert_eq!(engine.importers().len(), 1);
        assert_eq!(engine.cookers().len(), 1);

        let result = engine.build_all();
        assert!(result.success);
        assert_eq!(result.assets_built, 1);
    }

    #[test]
    fn options_hash_is_order_independent() {
        let mut a = FxHashMap::default();
        a.insert("x".to_string(), "1".to_string());
        a.insert("y".to_string(), "2".to_string());

        let mut b = FxHashMap::default();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());

        assert_eq!(options_hash(&a), options_hash(&b));
        b.insert("z".to_string(), "3".to_string());
        assert_ne!(options_hash(&a), options_hash(&b));
    }
}
