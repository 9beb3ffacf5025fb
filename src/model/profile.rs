//! Query-signature profiles (§4.4): pre-aggregated "ghost" spaces that let
//! `dice` skip scanning the full fact table for coarse, frequently-repeated
//! queries.
//!
//! A profile is keyed by a *signature* — `dim_name -> effective_depth` — and
//! materializes a rollup of the owning space's fact table at that
//! granularity. A profile "covers" a query when its depth is at least as
//! deep, on every dimension, as the query asks for; the smallest covering
//! profile is used.

use std::collections::HashMap;

use crate::backend::{Backend, DiceLevel, DicePlan, ProfileRow};
use crate::error::Result;
use crate::model::space::Space;

/// Hits an unregistered signature needs before a profile is materialized for
/// it (§4.4). Chosen so a one-off query never triggers a rebuild.
const REGISTER_THRESHOLD: i64 = 8;

/// Fraction of a space's row count available to its hot set of materialized
/// profiles (§4.4 `register`'s default `cache_ratio`).
pub const DEFAULT_CACHE_RATIO: f64 = 0.10;

/// Per-space profile bookkeeping: the registered profiles (lazily loaded
/// from the backend) and hit counters toward registering new ones.
#[derive(Debug, Default)]
pub struct ProfileTable {
    rows: Vec<ProfileRow>,
    pending_hits: HashMap<Vec<(String, u32)>, i64>,
    loaded: bool,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_loaded(&mut self, backend: &mut dyn Backend, space: &Space) -> Result<()> {
        if !self.loaded {
            self.rows = backend.get_profiles(space)?;
            self.loaded = true;
        }
        Ok(())
    }

    fn best(&self, signature: &[(String, u32)]) -> Option<&ProfileRow> {
        self.rows
            .iter()
            .filter(|p| p.size.is_some())
            .filter(|p| covers(&p.signature, signature))
            .min_by_key(|p| p.size.unwrap())
    }

    /// Record a hit for `signature`, persisting the counter and registering
    /// a new profile once it has been asked for often enough (§4.4).
    pub fn record_hit(&mut self, backend: &mut dyn Backend, space: &Space, signature: &[(String, u32)]) -> Result<()> {
        self.ensure_loaded(backend, space)?;
        backend.inc_profile(space, signature, 1)?;

        if self.rows.iter().any(|p| p.signature == signature) {
            return Ok(());
        }
        let hits = self.pending_hits.entry(signature.to_vec()).or_insert(0);
        *hits += 1;
        if *hits >= REGISTER_THRESHOLD {
            self.pending_hits.remove(signature);
            self.register(backend, space, signature)?;
        }
        Ok(())
    }

    /// Flush buffered hit counters to the backend (§4.4 `sync`). This
    /// implementation writes each hit through `inc_profile` as it happens
    /// rather than batching on a timer — there is no background thread in a
    /// single-session, synchronous store to drive a periodic flush — so
    /// `sync` is a no-op kept for parity with the spec's named operation and
    /// as a hook a future buffered implementation could fill in.
    pub fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Resolve `signature` to the ghost [`Space`] that should serve it, or a
    /// clone of `space` itself if no profile covers it.
    pub fn route(&mut self, backend: &mut dyn Backend, space: &Space, signature: &[(String, u32)]) -> Result<Space> {
        self.ensure_loaded(backend, space)?;
        match self.best(signature) {
            Some(row) => Ok(ghost_space(space, &row.signature, row.id)),
            None => Ok(space.clone()),
        }
    }

    /// Mark every materialized profile as unsafe to route to, without
    /// forgetting it was ever registered: a structural dimension change or a
    /// fact load can silently invalidate a profile's rollup (§4.4), but the
    /// profile isn't incrementally maintained, so the conservative response
    /// is to wipe the ghost table and stop routing to it until it earns
    /// re-registration.
    pub fn invalidate(&mut self, backend: &mut dyn Backend, space: &Space) -> Result<()> {
        self.ensure_loaded(backend, space)?;
        for row in &mut self.rows {
            if row.size.is_some() {
                let ghost = ghost_space(space, &row.signature, row.id);
                backend.reset_profile(space, &ghost, row.id)?;
                row.size = None;
            }
        }
        self.pending_hits.clear();
        Ok(())
    }

    fn register(&mut self, backend: &mut dyn Backend, space: &Space, signature: &[(String, u32)]) -> Result<()> {
        let id = self.rows.len() as i64 + 1;
        let ghost = ghost_space(space, signature, id);
        backend.register_space(&ghost)?;

        let size = snapshot_ghost(backend, space, &ghost, signature)?;
        backend.set_profile(space, id, size)?;
        self.rows.push(ProfileRow { id, signature: signature.to_vec(), size: Some(size), hits: 1 });
        Ok(())
    }

    /// The size-budgeted cache refresh (§4.4 `register(space, snapshot)`):
    /// reload every profile's hit count from the backend, then walk them hits
    /// descending, keeping the hottest ones materialized within
    /// `backend.size(space) * cache_ratio` and resetting whichever ones don't
    /// fit so they stop being routed to. Only profiles a prior threshold
    /// crossing already materialized (non-null size) are eligible here —
    /// this pass manages the hot set's membership, it doesn't mint new
    /// profiles; `record_hit` still does that.
    pub fn refresh_cache(&mut self, backend: &mut dyn Backend, space: &Space, cache_ratio: f64, snapshot: bool) -> Result<()> {
        self.loaded = false;
        self.ensure_loaded(backend, space)?;

        let total_size = backend.size(space)? as f64;
        let mut budget = (total_size * cache_ratio) as i64;

        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by(|&a, &b| self.rows[b].hits.cmp(&self.rows[a].hits));

        for idx in order {
            if self.rows[idx].size.is_none() {
                continue;
            }
            if budget > 0 {
                if snapshot {
                    let id = self.rows[idx].id;
                    let signature = self.rows[idx].signature.clone();
                    let ghost = ghost_space(space, &signature, id);
                    let size = snapshot_ghost(backend, space, &ghost, &signature)?;
                    backend.set_profile(space, id, size)?;
                    self.rows[idx].size = Some(size);
                }
                budget -= self.rows[idx].size.unwrap() as i64;
            } else {
                let id = self.rows[idx].id;
                let signature = self.rows[idx].signature.clone();
                let ghost = ghost_space(space, &signature, id);
                backend.reset_profile(space, &ghost, id)?;
                self.rows[idx].size = None;
            }
        }
        Ok(())
    }
}

/// Rebuild `ghost`'s materialized rollup for `signature` and return its row
/// count, shared by both brand-new registration and a cache refresh pass.
fn snapshot_ghost(backend: &mut dyn Backend, space: &Space, ghost: &Space, signature: &[(String, u32)]) -> Result<u64> {
    let levels = signature
        .iter()
        .filter(|(_, depth)| *depth > 0)
        .map(|(name, depth)| -> Result<DiceLevel> {
            Ok(DiceLevel { dim: space.dimension(name)?.clone(), depth: *depth as usize })
        })
        .collect::<Result<Vec<_>>>()?;
    let measures = space.measures.iter().filter(|m| m.is_stored()).map(|m| m.name.clone()).collect();
    let plan = DicePlan { levels, measures, filters: Vec::new() };
    backend.snapshot(space, ghost, &plan, &Vec::new())
}

/// A profile covers a query iff, for every dimension, its materialized depth
/// is at least as deep as the query's.
fn covers(profile: &[(String, u32)], query: &[(String, u32)]) -> bool {
    query.iter().all(|(name, depth)| {
        profile.iter().find(|(n, _)| n == name).map(|(_, pd)| pd >= depth).unwrap_or(false)
    })
}

/// The reduced-schema space a profile materializes into: only the
/// dimensions the signature actually projects (depth > 0) survive as
/// columns — a fully collapsed dimension carries no information the ghost
/// fact table needs to store.
fn ghost_space(space: &Space, signature: &[(String, u32)], id: i64) -> Space {
    let dimensions = space
        .dimensions
        .iter()
        .filter(|d| signature.iter().find(|(n, _)| *n == d.name).map(|(_, depth)| *depth > 0).unwrap_or(false))
        .cloned()
        .collect();
    Space { name: format!("{}__p{id}", space.name), dimensions, measures: space.measures.clone() }
}
