//! The backend contract (§4.1, §6): a transactional store exposing
//! primitives for dimension/closure/fact tables, coordinate operations, fact
//! load/dice/delete, and profile tables.
//!
//! A single connection is used per session. [`sqlite`] is the only shipped
//! implementation; the trait is written so a `postgresql` backend could be
//! added without touching [`crate::context::Context`] or [`crate::model`]
//! callers (see DESIGN.md).

pub mod sqlite;

use crate::error::Result;
use crate::model::dimension::{Atom, DimensionDef, Filter};
use crate::model::space::Space;
pub use crate::model::types::LoadType;

/// A recorded query signature plus its row count and hit counter (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub id: i64,
    /// `dim_name -> effective_depth`, serialized as sorted `(name, depth)`
    /// pairs so the contract stays backend-agnostic.
    pub signature: Vec<(String, u32)>,
    pub size: Option<u64>,
    pub hits: i64,
}

/// One output row of a `dice` execution: grouped ancestor IDs per selected
/// level (in select order) and summed measure values (in select order,
/// including extras appended for computed-measure dependencies).
#[derive(Debug, Clone, PartialEq)]
pub struct DiceRow {
    pub group_ids: Vec<i64>,
    pub measures: Vec<f64>,
}

/// One level/filter projection the planner asks the backend to join and
/// group by (§4.3 step 5): "IDs that are `depth` levels below `parent_id`
/// within dimension `dim`".
#[derive(Debug, Clone)]
pub struct DiceLevel {
    pub dim: DimensionDef,
    pub depth: usize,
}

/// The fully planned shape of a `dice` call, produced by
/// [`crate::model::space::Space::plan`] and executed by the backend.
#[derive(Debug, Clone)]
pub struct DicePlan {
    pub levels: Vec<DiceLevel>,
    pub measures: Vec<String>,
    pub filters: Filter,
}

/// The node ID Menger reserves for "ancestor of everything" (§4.3): every
/// dimension's closure table has a self-row `(ROOT_ID, ROOT_ID, 0)` and every
/// top-level coordinate is `(ROOT_ID, id, 1)`.
pub const ROOT_ID: i64 = 1;

/// The backend contract. All mutating operations are transactional; reads
/// observe uncommitted writes of the same session (§4.1, §5).
pub trait Backend {
    /// The reserved "ancestor of everything" node ID (§4.3). Constant across
    /// all backends.
    fn root_id(&self) -> i64 {
        ROOT_ID
    }

    /// Idempotently create the dimension/closure tables for `dim`.
    fn register_dimension(&mut self, dim: &DimensionDef) -> Result<()>;

    /// Idempotently create the fact/profile tables for `space`.
    fn register_space(&mut self, space: &Space) -> Result<()>;

    /// Commit (or roll back) and close the underlying connection.
    fn close(&mut self, rollback: bool) -> Result<()>;

    /// Row count of a space's fact table.
    fn size(&mut self, space: &Space) -> Result<u64>;

    /// Upsert fact rows. `rows` are `(dimension-ID tuple, measure values)`;
    /// returns the number of rows affected.
    fn load(
        &mut self,
        space: &Space,
        rows: &[(Vec<i64>, Vec<f64>)],
        load_type: LoadType,
    ) -> Result<u64>;

    /// Look up a single fact row by its dimension-ID tuple.
    fn get(&mut self, space: &Space, key: &[i64]) -> Result<Option<Vec<f64>>>;

    /// Delete fact rows matching `filters`. Returns the number of rows
    /// removed.
    fn delete(&mut self, space: &Space, filters: &Filter) -> Result<u64>;

    /// Execute a planned dice query.
    fn dice(&mut self, space: &Space, plan: &DicePlan) -> Result<Vec<DiceRow>>;

    /// Atomically delete rows from `other` matching `to_delete`, then insert
    /// the rows produced by `plan` run against `self` (i.e. `space`).
    fn snapshot(
        &mut self,
        space: &Space,
        other: &Space,
        plan: &DicePlan,
        to_delete: &Filter,
    ) -> Result<u64>;

    /// Insert a new dimension node and extend the closure table (§4.1).
    fn create_coordinate(
        &mut self,
        dim: &DimensionDef,
        name: Option<&Atom>,
        parent_id: Option<i64>,
    ) -> Result<i64>;

    /// Delete `coord_id` and every descendant (cascading through the
    /// closure).
    fn delete_coordinate(&mut self, dim: &DimensionDef, coord_id: i64) -> Result<()>;

    /// Move the subtree rooted at `child_id` under `new_parent_id` (§4.1).
    fn reparent(&mut self, dim: &DimensionDef, child_id: i64, new_parent_id: i64) -> Result<()>;

    /// Collapse same-named siblings of `parent_id`, re-importing fact rows
    /// of the larger ID into the smaller one across every listed space
    /// (§4.1).
    fn merge(&mut self, dim: &DimensionDef, parent_id: i64, spaces: &[Space]) -> Result<()>;

    /// Delete `node_id` if it has no children.
    fn prune(&mut self, dim: &DimensionDef, node_id: i64) -> Result<()>;

    fn rename(&mut self, dim: &DimensionDef, node_id: i64, new_name: &Atom) -> Result<()>;

    /// Children of `parent_id` at `depth` levels below it (or the top-level
    /// nodes when `parent_id` is `None`).
    fn get_children(
        &mut self,
        dim: &DimensionDef,
        parent_id: Option<i64>,
        depth: usize,
    ) -> Result<Vec<(Atom, i64)>>;

    /// Every `(id, name, parent_id)` triple at depth 1 in the closure (i.e.
    /// every node paired with its immediate parent).
    fn get_parents(&mut self, dim: &DimensionDef) -> Result<Vec<(i64, Atom, Option<i64>)>>;

    /// Resolve a coordinate pattern: descendants of `parent_id` at
    /// `parent_depth + target_depth`, narrowed by `constraints`
    /// (`(offset_from_tail, name)` pairs an ancestor at that depth must
    /// match) and by `filters` (each inner vec is OR'd branch
    /// `(key, depth)` constraints; outer vec entries AND).
    #[allow(clippy::too_many_arguments)]
    fn glob(
        &mut self,
        dim: &DimensionDef,
        parent_id: Option<i64>,
        parent_depth: usize,
        target_depth: usize,
        constraints: &[(usize, Atom)],
        filters: &[Vec<(Option<i64>, usize)>],
    ) -> Result<Vec<i64>>;

    /// Substring search over node names, returning `(name, depth)` ordered
    /// by depth then name.
    fn search(&mut self, dim: &DimensionDef, substring: &str, max_depth: usize) -> Result<Vec<(Atom, usize)>>;

    fn get_profiles(&mut self, space: &Space) -> Result<Vec<ProfileRow>>;
    fn inc_profile(&mut self, space: &Space, signature: &[(String, u32)], n: i64) -> Result<()>;
    fn set_profile(&mut self, space: &Space, id: i64, size: u64) -> Result<()>;
    fn reset_profile(&mut self, space: &Space, ghost_space: &Space, id: i64) -> Result<()>;
}
