//! Asset inventory and patch store interfaces

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::RemediationError;
use crate::models::asset::Asset;
use crate::models::patch::Patch;

/// Read-only host inventory owned elsewhere
#[async_trait]
pub trait AssetInventory: Send + Sync {
    async fn get_asset(&self, id: &str) -> Result<Asset, RemediationError>;
}

/// Read-only patch store owned elsewhere
#[async_trait]
pub trait PatchStore: Send + Sync {
    async fn get_patch(&self, id: &str) -> Result<Patch, RemediationError>;
}

/// In-memory inventory
#[derive(Default)]
pub struct InMemoryInventory {
    assets: RwLock<HashMap<String, Asset>>,
}

impl InMemoryInventory {
    pub fn new(assets: impl IntoIterator<Item = Asset>) -> Self {
        Self {
            assets: RwLock::new(assets.into_iter().map(|a| (a.id.clone(), a)).collect()),
        }
    }

    pub fn insert(&self, asset: Asset) {
        let mut assets = self.assets.write().unwrap_or_else(|e| e.into_inner());
        assets.insert(asset.id.clone(), asset);
    }
}

#[async_trait]
impl AssetInventory for InMemoryInventory {
    async fn get_asset(&self, id: &str) -> Result<Asset, RemediationError> {
        let assets = self.assets.read().unwrap_or_else(|e| e.into_inner());
        assets
            .get(id)
            .cloned()
            .ok_or_else(|| RemediationError::NotFound(format!("asset {}", id)))
    }
}

/// In-memory patch store
#[derive(Default)]
pub struct InMemoryPatchStore {
    patches: RwLock<HashMap<String, Patch>>,
}

impl InMemoryPatchStore {
    pub fn new(patches: impl IntoIterator<Item = Patch>) -> Self {
        Self {
            patches: RwLock::new(patches.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }

    pub fn insert(&self, patch: Patch) {
        let mut patches = self.patches.write().unwrap_or_else(|e| e.into_inner());
        patches.insert(patch.id.clone(), patch);
    }
}

#[async_trait]
impl PatchStore for InMemoryPatchStore {
    async fn get_patch(&self, id: &str) -> Result<Patch, RemediationError> {
        let patches = self.patches.read().unwrap_or_else(|e| e.into_inner());
        patches
            .get(id)
            .cloned()
            .ok_or_else(|| RemediationError::NotFound(format!("patch {}", id)))
    }
}
