//! Id allocation per id space.

mod file;
mod generator;

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::metrics::{default_metrics, CacheMetrics};
use crate::types::{CacheError, IdSpace, Result};

pub use file::FileIdGeneratorFactory;
pub use generator::{IdGenerator, IdGeneratorState};

/// Vends one [`IdGenerator`] per id space and owns their persistence.
pub trait IdGeneratorFactory: Send + Sync {
    /// Creates a fresh generator for `space`, replacing any previous one.
    fn create(&self, space: IdSpace, high_id: u64) -> Result<Arc<IdGenerator>>;

    /// Opens the generator of `space` from its persisted state.
    fn open(&self, space: IdSpace) -> Result<Arc<IdGenerator>>;

    /// Generator previously created or opened.
    fn get(&self, space: IdSpace) -> Result<Arc<IdGenerator>>;
}

/// Keeps generators in memory only; `open` on an unknown space starts at id 0.
pub struct MemoryIdGeneratorFactory {
    generators: RwLock<FxHashMap<IdSpace, Arc<IdGenerator>>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl Default for MemoryIdGeneratorFactory {
    fn default() -> Self {
        Self::with_metrics(default_metrics())
    }
}

impl MemoryIdGeneratorFactory {
    /// Factory reporting to `metrics`.
    pub fn with_metrics(metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            generators: RwLock::new(FxHashMap::default()),
            metrics,
        }
    }
}

impl IdGeneratorFactory for MemoryIdGeneratorFactory {
    fn create(&self, space: IdSpace, high_id: u64) -> Result<Arc<IdGenerator>> {
        let generator = Arc::new(IdGenerator::with_metrics(
            space,
            high_id,
            Arc::clone(&self.metrics),
        ));
        self.generators.write().insert(space, Arc::clone(&generator));
        Ok(generator)
    }

    fn open(&self, space: IdSpace) -> Result<Arc<IdGenerator>> {
        if let Some(existing) = self.generators.read().get(&space) {
            return Ok(Arc::clone(existing));
        }
        let mut generators = self.generators.write();
        let generator = generators.entry(space).or_insert_with(|| {
            Arc::new(IdGenerator::with_metrics(
                space,
                0,
                Arc::clone(&self.metrics),
            ))
        });
        Ok(Arc::clone(generator))
    }

    fn get(&self, space: IdSpace) -> Result<Arc<IdGenerator>> {
        self.generators
            .read()
            .get(&space)
            .cloned()
            .ok_or(CacheError::Invalid("id generator not opened"))
    }
}
