//! Tunables for the engine and the sync coordinator.

/// Engine knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on the ancestor walk during the redo cycle check.
    /// Chains deeper than this are treated as cycles, which keeps the
    /// decision deterministic even for pathological inputs.
    pub max_ancestor_walk_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_ancestor_walk_depth: 100,
        }
    }
}

/// Coordinator knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many pulled operations are fed into the engine per batch.
    pub pull_chunk_size: usize,
    /// How many snapshot rows are written to the local store per
    /// transaction during hydration.
    pub hydration_row_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_chunk_size: 1_000,
            hydration_row_batch: 5_000,
        }
    }
}
