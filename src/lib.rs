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

//! SNPAK - content-addressed asset packaging
//!
//! Build-time pipeline that cooks source files into a compact binary
//! container, and a runtime that mounts those packs and serves typed,
//! reference-counted asset handles.

pub mod cache;
pub mod compression;
pub mod error;
pub mod hashing;
pub mod id;
pub mod loader;
pub mod manager;
pub mod mmap;
pub mod pack;
pub mod payload;
pub mod pipeline;
pub mod source;

// Re-exports for convenience
pub use cache::{AssetCache, AssetHandle, CacheConfig, EvictionPolicy};
pub use compression::{Compression, CompressionLevel};
pub use error::{Error, Result};
pub use id::{deterministic_asset_id, AssetId, TypeId, Uuid};
pub use loader::{AsyncLoadHandle, AsyncLoader, CancellationToken, LoadPriority};
pub use manager::{
    AssetFactory, AssetLoadContext, AssetManager, AsyncLoadResult, ManagerConfig, PackMountOptions,
};
pub use mmap::{MapAccess, MappedFile, MappedRegion, StreamingBulkReader};
pub use pack::{
    AssetInfo, AssetPackEntry, BulkChunk, BulkChunkInfo, BulkSemantic, PackReader, PackWriter,
};
pub use payload::{PayloadRegistry, PayloadSerializer, TypedPayload};
pub use pipeline::{
    BuildConfig, BuildResult, CollaboratorProvider, CollaboratorSet, CookRequest, CookResult,
    CookedAsset, Cooker, ImportedItem, Importer, IncrementalCache, PipelineContext, PipelineEngine,
    RuntimePipeline, RuntimePipelineConfig, SourceRef,
};
pub use source::{SourceAssetResolver, SourceMountConfig};

#[cfg(test)]
mod tests;
