//! Hierarchical dimensions: coordinates, closure-backed node resolution,
//! drilling, globbing, and structural maintenance (§4.2).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Result, SchemaError, UserError};
use crate::model::space::Space;
use crate::model::types::ScalarType;

/// A single atom of a coordinate: the name type fixed per dimension (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Atom {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Atom {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Atom::Str(_) => ScalarType::String,
            Atom::Int(_) => ScalarType::Int,
            Atom::Float(_) => ScalarType::Float,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Atom::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Atom::Str(_) => 0,
            Atom::Int(_) => 1,
            Atom::Float(_) => 2,
        }
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Atom::Str(s) => write!(f, "{s}"),
            Atom::Int(i) => write!(f, "{i}"),
            Atom::Float(v) => write!(f, "{v}"),
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Atom::Str(a), Atom::Str(b)) => a == b,
            (Atom::Int(a), Atom::Int(b)) => a == b,
            (Atom::Float(a), Atom::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}
impl Eq for Atom {}

/// Native ordering, not `Display` string comparison: a two-digit `Int` atom
/// (e.g. a day-of-month "10") must sort after single-digit "9", which
/// lexicographic string comparison gets wrong (§4.2 `drill`'s "ordered
/// ascending").
impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Atom::Str(a), Atom::Str(b)) => a.cmp(b),
            (Atom::Int(a), Atom::Int(b)) => a.cmp(b),
            (Atom::Float(a), Atom::Float(b)) => a.total_cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Atom::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Atom::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Atom::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
        }
    }
}

impl From<&str> for Atom {
    fn from(v: &str) -> Self {
        Atom::Str(v.to_string())
    }
}
impl From<String> for Atom {
    fn from(v: String) -> Self {
        Atom::Str(v)
    }
}
impl From<i64> for Atom {
    fn from(v: i64) -> Self {
        Atom::Int(v)
    }
}
impl From<i32> for Atom {
    fn from(v: i32) -> Self {
        Atom::Int(v as i64)
    }
}
impl From<f64> for Atom {
    fn from(v: f64) -> Self {
        Atom::Float(v)
    }
}

/// A coordinate: an ordered sequence of atoms, the empty sequence being the
/// dimension's root (§3).
pub type Coord = Vec<Atom>;

/// Build a [`Coord`] from anything convertible to [`Atom`].
pub fn coord<T: Into<Atom>>(items: impl IntoIterator<Item = T>) -> Coord {
    items.into_iter().map(Into::into).collect()
}

/// The hierarchy shape of a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    /// General hierarchical attribute.
    Tree,
    /// Fixed depth-3 Year/Month/Day hierarchy, integer atoms.
    Date,
    /// Fixed depth-1 hierarchy with an implicit "latest coordinate" filter
    /// at query time (§3, §4.2).
    Version,
}

/// A dimension's schema: name, levels, scalar type, and kind (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionDef {
    pub name: String,
    pub levels: Vec<String>,
    pub scalar_type: ScalarType,
    pub kind: DimensionKind,
}

impl DimensionDef {
    /// A general hierarchical dimension.
    pub fn tree(
        name: impl Into<String>,
        levels: Vec<impl Into<String>>,
        scalar_type: ScalarType,
    ) -> std::result::Result<Self, SchemaError> {
        let name = name.into();
        if levels.is_empty() {
            return Err(SchemaError::UnsupportedScalarType(name));
        }
        Ok(DimensionDef {
            name,
            levels: levels.into_iter().map(Into::into).collect(),
            scalar_type,
            kind: DimensionKind::Tree,
        })
    }

    /// The Year/Month/Day calendar dimension (§3).
    pub fn date(name: impl Into<String>) -> Self {
        DimensionDef {
            name: name.into(),
            levels: vec!["Year".into(), "Month".into(), "Day".into()],
            scalar_type: ScalarType::Int,
            kind: DimensionKind::Date,
        }
    }

    /// A depth-1 dimension that defaults to "latest" at query time (§3, §4.2).
    pub fn version(
        name: impl Into<String>,
        scalar_type: ScalarType,
    ) -> std::result::Result<Self, SchemaError> {
        let name = name.into();
        Ok(DimensionDef {
            levels: vec![name.clone()],
            name,
            scalar_type,
            kind: DimensionKind::Version,
        })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn dim_table(&self) -> String {
        format!("{}_dim", self.name.to_lowercase())
    }

    pub fn closure_table(&self) -> String {
        format!("{}_cls", self.name.to_lowercase())
    }

    /// Resolve a level by name or by position (negative indexes from the
    /// tail, per §4.1).
    pub fn level_index(&self, level: LevelRef<'_>) -> Option<usize> {
        match level {
            LevelRef::Name(n) => self.levels.iter().position(|l| l == n),
            LevelRef::Position(p) => {
                if p >= 0 {
                    let p = p as usize;
                    (p < self.depth()).then_some(p)
                } else {
                    let from_tail = (-p) as usize;
                    (from_tail <= self.depth()).then(|| self.depth() - from_tail)
                }
            }
        }
    }

    /// The convention for a bare `Dimension` in a select list: its deepest
    /// existing level (Open Question (a) in SPEC_FULL.md).
    pub fn deepest_level(&self) -> usize {
        self.depth() - 1
    }

    /// Type-check and length-check a coordinate (the `coord()` operation of
    /// §4.2, specialized since Rust values already arrive typed).
    pub fn validate_coord(&self, value: &Coord) -> std::result::Result<(), UserError> {
        if value.len() > self.depth() {
            return Err(UserError::DepthExceeded(value.len(), self.name.clone(), self.depth()));
        }
        for atom in value {
            if atom.scalar_type() != self.scalar_type {
                return Err(UserError::TypeMismatch(atom.to_string(), self.name.clone()));
            }
        }
        Ok(())
    }
}

/// One clause of a filter: `coordinate in listed branches at an optional
/// depth` (§3). Multiple listed coordinates are OR'd; clauses in a [`Filter`]
/// are AND'd.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub dimension: String,
    pub coords: Vec<Coord>,
    pub depth: Option<usize>,
}

/// A conjunction of [`Clause`]s.
pub type Filter = Vec<Clause>;

/// Either a level name or an integer position (negative indexes from the
/// tail).
#[derive(Debug, Clone, Copy)]
pub enum LevelRef<'a> {
    Name(&'a str),
    Position(i64),
}

/// Runtime wrapper around a [`DimensionDef`]: resolves coordinates to IDs
/// through three session-local caches (key/name/full-name-tuple), all
/// invalidated together on any structural mutation (§3, §4.2).
pub struct DimensionHandle {
    pub def: DimensionDef,
    key_cache: HashMap<Coord, i64>,
    name_cache: HashMap<i64, (Option<Atom>, Option<i64>)>,
    tuple_cache: HashMap<i64, Coord>,
}

impl DimensionHandle {
    pub fn new(def: DimensionDef) -> Self {
        DimensionHandle {
            def,
            key_cache: HashMap::new(),
            name_cache: HashMap::new(),
            tuple_cache: HashMap::new(),
        }
    }

    pub fn clear_cache(&mut self) {
        self.key_cache.clear();
        self.name_cache.clear();
        self.tuple_cache.clear();
    }

    /// Resolve a coordinate to a node ID, optionally materializing missing
    /// ancestors.
    pub fn key(
        &mut self,
        backend: &mut dyn Backend,
        coord: &Coord,
        create: bool,
    ) -> Result<Option<i64>> {
        if coord.is_empty() {
            return Ok(Some(backend.root_id()));
        }
        if let Some(id) = self.key_cache.get(coord) {
            return Ok(Some(*id));
        }

        let parent: Coord = coord[..coord.len() - 1].to_vec();
        let Some(parent_id) = self.key_box(backend, &parent, create)? else {
            return Ok(None);
        };

        // Batch the parent's children into the cache (one backend round trip
        // resolves every sibling of the coordinate we were asked for).
        for (name, id) in backend.get_children(&self.def, Some(parent_id), 1)? {
            let mut child_coord = parent.clone();
            child_coord.push(name.clone());
            self.key_cache.insert(child_coord.clone(), id);
            self.name_cache.insert(id, (Some(name), Some(parent_id)));
        }

        if let Some(id) = self.key_cache.get(coord) {
            return Ok(Some(*id));
        }
        if !create {
            return Ok(None);
        }

        let name = coord.last().unwrap().clone();
        let new_id = backend.create_coordinate(&self.def, Some(&name), Some(parent_id))?;
        self.key_cache.insert(coord.clone(), new_id);
        self.name_cache.insert(new_id, (Some(name), Some(parent_id)));
        Ok(Some(new_id))
    }

    // `key` recurses through ancestors; boxed to allow recursion through a
    // `&mut dyn Backend` without infinite monomorphization.
    fn key_box(
        &mut self,
        backend: &mut dyn Backend,
        coord: &Coord,
        create: bool,
    ) -> Result<Option<i64>> {
        self.key(backend, coord, create)
    }

    pub fn contains(&mut self, backend: &mut dyn Backend, coord: &Coord) -> Result<bool> {
        Ok(self.key(backend, coord, false)?.is_some())
    }

    /// Immediate children of `coord`, ordered ascending. Empty if `coord` is
    /// unknown.
    pub fn drill(&mut self, backend: &mut dyn Backend, coord: &Coord) -> Result<Vec<Atom>> {
        let Some(key) = self.key(backend, coord, false)? else {
            return Ok(Vec::new());
        };
        let mut children: Vec<Atom> = backend
            .get_children(&self.def, Some(key), 1)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        children.sort();
        Ok(children)
    }

    /// Resolve a pattern with trailing `None` wildcards into the concrete
    /// matching full-name tuples (§4.2).
    pub fn glob(
        &mut self,
        backend: &mut dyn Backend,
        pattern: &[Option<Atom>],
        filters: &[Vec<Coord>],
    ) -> Result<Vec<Coord>> {
        let head_len = pattern.iter().take_while(|v| v.is_some()).count();
        let head: Coord = pattern[..head_len]
            .iter()
            .map(|v| v.clone().unwrap())
            .collect();
        let head_key = self.key(backend, &head, false)?;
        let Some(head_key) = head_key else {
            return Ok(Vec::new());
        };
        let target_depth = pattern.len() - head_len;

        // Per-offset name constraints beyond the head.
        let mut constraints = Vec::new();
        for (i, val) in pattern.iter().enumerate().skip(head_len) {
            if let Some(name) = val {
                constraints.push((pattern.len() - i - 1, name.clone()));
            }
        }

        // Resolve each filter clause's listed branches to (key, depth).
        let mut filter_key_depths = Vec::new();
        for clause in filters {
            let mut kd = Vec::new();
            for branch in clause {
                if let Some(k) = self.key(backend, branch, false)? {
                    kd.push((Some(k), branch.len()));
                }
            }
            filter_key_depths.push(kd);
        }

        let ids = backend.glob(
            &self.def,
            Some(head_key),
            head_len,
            target_depth,
            &constraints,
            &filter_key_depths,
        )?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.name_tuple(backend, id)?);
        }
        Ok(out)
    }

    /// The longest non-`None` prefix's key, plus the distance from that
    /// prefix to the target depth (§4.2).
    pub fn explode(
        &mut self,
        backend: &mut dyn Backend,
        coord: &[Option<Atom>],
    ) -> Result<(i64, usize)> {
        if let Some(pos) = coord.iter().position(|v| v.is_none()) {
            let prefix: Coord = coord[..pos].iter().map(|v| v.clone().unwrap()).collect();
            let key = self
                .key(backend, &prefix, false)?
                .ok_or_else(|| self.unknown_coord(&prefix))?;
            Ok((key, coord.len() - pos))
        } else {
            let full: Coord = coord.iter().map(|v| v.clone().unwrap()).collect();
            let key = self
                .key(backend, &full, false)?
                .ok_or_else(|| self.unknown_coord(&full))?;
            Ok((key, 0))
        }
    }

    fn unknown_coord(&self, coord: &Coord) -> crate::error::Error {
        UserError::UnknownCoordinate(coord.iter().map(|a| a.to_string()).collect(), self.def.name.clone())
            .into()
    }

    /// Reparent `coord` under `new_parent_coord`, merging any resulting
    /// duplicate and pruning the vacated parent (§4.2).
    pub fn reparent(
        &mut self,
        backend: &mut dyn Backend,
        spaces: &[Space],
        coord: &Coord,
        new_parent_coord: &Coord,
    ) -> Result<()> {
        let curr_parent = &coord[..coord.len() - 1];
        if curr_parent == new_parent_coord.as_slice() {
            return Ok(());
        }

        let record_id = self
            .key(backend, coord, false)?
            .ok_or_else(|| self.unknown_coord(coord))?;
        let new_parent_id = self.key(backend, new_parent_coord, true)?.unwrap();

        backend.reparent(&self.def, record_id, new_parent_id)?;
        backend.merge(&self.def, new_parent_id, spaces)?;
        if let Some(old_parent_id) = self.key(backend, &curr_parent.to_vec(), false)? {
            backend.prune(&self.def, old_parent_id)?;
        }

        self.clear_cache();
        Ok(())
    }

    /// Rename `coord`, merging any resulting duplicate under the same parent
    /// (§4.2).
    pub fn rename(
        &mut self,
        backend: &mut dyn Backend,
        spaces: &[Space],
        coord: &Coord,
        new_name: Atom,
    ) -> Result<()> {
        let record_id = self
            .key(backend, coord, false)?
            .ok_or_else(|| self.unknown_coord(coord))?;
        backend.rename(&self.def, record_id, &new_name)?;

        let parent: Coord = coord[..coord.len() - 1].to_vec();
        let parent_id = self.key(backend, &parent, false)?.unwrap();
        backend.merge(&self.def, parent_id, spaces)?;

        self.clear_cache();
        Ok(())
    }

    pub fn delete(&mut self, backend: &mut dyn Backend, coord: &Coord) -> Result<()> {
        let Some(id) = self.key(backend, coord, false)? else {
            return Ok(());
        };
        backend.delete_coordinate(&self.def, id)?;
        self.clear_cache();
        Ok(())
    }

    pub fn search(
        &mut self,
        backend: &mut dyn Backend,
        substring: &str,
        max_depth: usize,
    ) -> Result<Vec<(Atom, usize)>> {
        backend.search(&self.def, substring, max_depth)
    }

    /// Build a filter clause matching any of `coords` at an optional depth
    /// (§4.2).
    pub fn match_clause(&self, coords: Vec<Coord>, depth: Option<usize>) -> Clause {
        Clause {
            dimension: self.def.name.clone(),
            coords,
            depth,
        }
    }

    /// Full-name tuple from root for a node ID.
    pub fn name_tuple(&mut self, backend: &mut dyn Backend, id: i64) -> Result<Coord> {
        if let Some(tuple) = self.tuple_cache.get(&id) {
            return Ok(tuple.clone());
        }
        if !self.name_cache.contains_key(&id) {
            for (nid, name, parent) in backend.get_parents(&self.def)? {
                self.name_cache.insert(nid, (Some(name), parent));
            }
        }
        let Some((name, parent)) = self.name_cache.get(&id).cloned() else {
            return Ok(Vec::new());
        };
        let Some(name) = name else {
            return Ok(Vec::new());
        };
        let parent_name = match parent {
            Some(p) => self.name_tuple(backend, p)?,
            None => Vec::new(),
        };
        let mut full = parent_name;
        full.push(name);
        self.tuple_cache.insert(id, full.clone());
        Ok(full)
    }

    /// Version dimensions only: the max-named immediate child of the root.
    pub fn last_coord(&mut self, backend: &mut dyn Backend) -> Result<Coord> {
        debug_assert_eq!(self.def.kind, DimensionKind::Version);
        let mut children = self.drill(backend, &Vec::new())?;
        children.sort();
        match children.pop() {
            Some(atom) => Ok(vec![atom]),
            None => Ok(Vec::new()),
        }
    }
}
