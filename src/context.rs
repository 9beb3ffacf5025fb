//! Per-session state (§4.6, §5): the backend connection, dimension caches,
//! the space registry, and profile tables. In place of the thread-local a
//! single-process deployment might reach for, a [`Context`] is passed
//! explicitly through every operation that touches the store (SPEC_FULL.md
//! §D, "Context propagation").

use std::collections::HashMap;

use crate::backend::sqlite::SqliteBackend;
use crate::backend::Backend;
use crate::config::{Scheme, Uri};
use crate::error::{Error, Result, UserError};
use crate::event::{Bus, Event};
use crate::model::dimension::{Atom, Coord, DimensionDef, DimensionHandle};
use crate::model::profile::ProfileTable;
use crate::model::space::Space;

/// A session bound to one backend connection. Mutating operations commit
/// immediately against the underlying connection; [`Context::commit`] and
/// [`Context::rollback`] finalize the connection itself. Dropping an open
/// context without calling either rolls back, the safer default for a
/// session that exits mid-error.
pub struct Context {
    backend: Box<dyn Backend>,
    dims: HashMap<String, DimensionHandle>,
    spaces: HashMap<String, Space>,
    profiles: HashMap<String, ProfileTable>,
    bus: Bus,
    readonly: bool,
    closed: bool,
}

impl Context {
    /// Open a session against `uri` (see [`crate::config::Uri`] for the
    /// supported forms).
    pub fn connect(uri: &str) -> Result<Self> {
        let parsed = Uri::parse(uri)?;
        let readonly = parsed.readonly;
        let backend: Box<dyn Backend> = match parsed.scheme {
            Scheme::Sqlite => Box::new(SqliteBackend::open(&parsed)?),
            Scheme::Postgresql => {
                return Err(Error::InvalidUri("postgresql backend is not implemented".into()));
            }
        };
        Ok(Context {
            backend,
            dims: HashMap::new(),
            spaces: HashMap::new(),
            profiles: HashMap::new(),
            bus: Bus::new(),
            readonly,
            closed: false,
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub(crate) fn dim_and_backend(&mut self, name: &str) -> Result<(&mut DimensionHandle, &mut dyn Backend)> {
        let handle = self
            .dims
            .get_mut(name)
            .ok_or_else(|| UserError::UnknownDimension(name.to_string(), String::new()))?;
        Ok((handle, self.backend.as_mut()))
    }

    /// Fire the cache-clear event and conservatively invalidate every
    /// registered profile: a structural dimension change or a fact load can
    /// silently stale a materialized rollup that isn't incrementally
    /// maintained (§4.4), so every profile across every space is dropped
    /// back to "unregistered" rather than risk serving a wrong aggregate.
    pub fn trigger_clear_cache(&mut self) -> Result<()> {
        self.bus.trigger(Event::ClearCache);
        for (name, space) in self.spaces.clone() {
            let table = self.profiles.entry(name).or_insert_with(ProfileTable::new);
            table.invalidate(self.backend.as_mut(), &space)?;
        }
        Ok(())
    }

    /// Register a dimension's tables and its in-session cache handle; a
    /// no-op if already registered (§4.1).
    pub fn register_dimension(&mut self, dim: DimensionDef) -> Result<()> {
        if self.dims.contains_key(&dim.name) {
            return Ok(());
        }
        if !self.readonly {
            self.backend.register_dimension(&dim)?;
        }
        self.dims.insert(dim.name.clone(), DimensionHandle::new(dim));
        Ok(())
    }

    /// Register a space's dimensions and fact/profile tables (§4.1).
    pub fn register_space(&mut self, space: Space) -> Result<()> {
        for dim in space.dimensions.clone() {
            self.register_dimension(dim)?;
        }
        if !self.readonly {
            self.backend.register_space(&space)?;
        }
        self.profiles.entry(space.name.clone()).or_insert_with(ProfileTable::new);
        self.spaces.insert(space.name.clone(), space);
        Ok(())
    }

    pub fn space(&self, name: &str) -> Result<&Space> {
        self.spaces.get(name).ok_or_else(|| UserError::UnknownSpace(name.to_string()).into())
    }

    pub fn record_hit(&mut self, space_name: &str, signature: &[(String, u32)]) -> Result<()> {
        let space = self.spaces.get(space_name).cloned().ok_or_else(|| UserError::UnknownSpace(space_name.to_string()))?;
        let table = self.profiles.entry(space_name.to_string()).or_insert_with(ProfileTable::new);
        table.record_hit(self.backend.as_mut(), &space, signature)
    }

    pub fn route_to_profile(&mut self, space: &Space, signature: &[(String, u32)]) -> Result<Space> {
        let table = self.profiles.entry(space.name.clone()).or_insert_with(ProfileTable::new);
        table.route(self.backend.as_mut(), space, signature)
    }

    /// Rebuild `space`'s hot set of materialized profiles under a size
    /// budget (§4.4 `register(space, snapshot)`): reload hit counts from the
    /// backend, keep the hottest already-materialized profiles within
    /// `backend.size(space) * cache_ratio`, and reset the rest. `cache_ratio`
    /// defaults to [`crate::model::profile::DEFAULT_CACHE_RATIO`] when not
    /// given explicitly.
    pub fn refresh_cache(&mut self, space_name: &str, cache_ratio: Option<f64>, snapshot: bool) -> Result<()> {
        let space = self.spaces.get(space_name).cloned().ok_or_else(|| UserError::UnknownSpace(space_name.to_string()))?;
        let ratio = cache_ratio.unwrap_or(crate::model::profile::DEFAULT_CACHE_RATIO);
        let table = self.profiles.entry(space_name.to_string()).or_insert_with(ProfileTable::new);
        table.refresh_cache(self.backend.as_mut(), &space, ratio, snapshot)
    }

    /// Flush every space's buffered profile hit counters (§4.4 `sync`;
    /// §5 "flushed at most every second or at session end"). A caller
    /// driving periodic maintenance (or a clean session exit) should call
    /// this before `commit`.
    pub fn sync_profiles(&mut self) -> Result<()> {
        for table in self.profiles.values_mut() {
            table.sync()?;
        }
        Ok(())
    }

    fn spaces_using(&self, dim_name: &str) -> Vec<Space> {
        self.spaces.values().filter(|s| s.dim_index(dim_name).is_some()).cloned().collect()
    }

    /// Move the subtree at `coord` under `new_parent`, merging with any
    /// resulting duplicate sibling across every space that uses the
    /// dimension (§4.2).
    pub fn reparent(&mut self, dim_name: &str, coord: &Coord, new_parent: &Coord) -> Result<()> {
        let spaces = self.spaces_using(dim_name);
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.reparent(backend, &spaces, coord, new_parent)?;
        self.trigger_clear_cache()
    }

    /// Rename `coord`, merging with any resulting duplicate sibling across
    /// every space that uses the dimension (§4.2).
    pub fn rename(&mut self, dim_name: &str, coord: &Coord, new_name: Atom) -> Result<()> {
        let spaces = self.spaces_using(dim_name);
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.rename(backend, &spaces, coord, new_name)?;
        self.trigger_clear_cache()
    }

    pub fn delete_coordinate(&mut self, dim_name: &str, coord: &Coord) -> Result<()> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.delete(backend, coord)?;
        self.trigger_clear_cache()
    }

    pub fn drill(&mut self, dim_name: &str, coord: &Coord) -> Result<Vec<Atom>> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.drill(backend, coord)
    }

    pub fn contains(&mut self, dim_name: &str, coord: &Coord) -> Result<bool> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.contains(backend, coord)
    }

    pub fn glob(&mut self, dim_name: &str, pattern: &[Option<Atom>], filters: &[Vec<Coord>]) -> Result<Vec<Coord>> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.glob(backend, pattern, filters)
    }

    /// The longest non-`None` prefix's key plus the distance to the target
    /// depth, for "group at this level under this branch" queries (§4.2).
    pub fn explode(&mut self, dim_name: &str, coord: &[Option<Atom>]) -> Result<(i64, usize)> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.explode(backend, coord)
    }

    pub fn search(&mut self, dim_name: &str, substring: &str, max_depth: usize) -> Result<Vec<(Atom, usize)>> {
        let (handle, backend) = self.dim_and_backend(dim_name)?;
        handle.search(backend, substring, max_depth)
    }

    /// Commit the underlying connection and finalize the session.
    pub fn commit(mut self) -> Result<()> {
        self.backend.close(false)?;
        self.closed = true;
        Ok(())
    }

    /// Roll back the underlying connection and finalize the session.
    pub fn rollback(mut self) -> Result<()> {
        self.backend.close(true)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.backend.close(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::ScalarType;

    #[test]
    fn connect_rejects_postgresql() {
        let err = Context::connect("postgresql://localhost/db").unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn register_dimension_and_space_roundtrip() {
        let mut ctx = Context::connect("sqlite://:memory:").unwrap();
        let dim = DimensionDef::tree("place", vec!["Region", "Country"], ScalarType::String).unwrap();
        let space = Space::new("Cube", vec![dim], vec![]).unwrap();
        ctx.register_space(space).unwrap();
        assert!(ctx.space("Cube").is_ok());
        assert!(ctx.space("Missing").is_err());
    }
}
