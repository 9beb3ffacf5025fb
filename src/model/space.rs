//! A space: a named schema binding dimensions and measures, and the `dice`
//! query planner/executor (§4.3).

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::backend::{DiceLevel, DicePlan};
use crate::context::Context;
use crate::error::{Result, SchemaError, UserError};
use crate::model::dimension::{Clause, Coord, DimensionDef, DimensionKind, Filter, LevelRef};
use crate::model::measure::{Computed, Measure, MeasureKind};

/// A single item of a `select` list (§4.3). A bare [`SelectItem::Dimension`]
/// resolves to its deepest existing level (Open Question (a), SPEC_FULL.md §D).
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Dimension(String),
    Level(String, LevelSpec),
    /// A constant coordinate: emitted as a literal column and used as an
    /// implicit filter.
    Coordinate(String, Coord),
    Measure(String),
    Computed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LevelSpec {
    Name(String),
    Position(i64),
}

impl LevelSpec {
    fn as_ref(&self) -> LevelRef<'_> {
        match self {
            LevelSpec::Name(n) => LevelRef::Name(n),
            LevelSpec::Position(p) => LevelRef::Position(*p),
        }
    }
}

/// Dimension output formatting for `dice` (§4.3 step 7). `None` yields the
/// full-name tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimFmt {
    Full,
    Leaf,
}

/// Measure output formatting for `dice`. `Some` yields `Measure::format`;
/// `None` yields the raw number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrFmt;

/// One output cell of a diced row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Coord(Coord),
    Text(String),
    Number(f64),
}

/// One input row to [`Space::load`]: one coordinate per dimension (in space
/// order) and one value per stored measure (in space order).
#[derive(Debug, Clone)]
pub struct LoadPoint {
    pub coords: Vec<Coord>,
    pub values: Vec<f64>,
}

/// One field of a sample record passed to [`Space::build_space`]: a
/// coordinate (becomes a tree dimension) or a numeric scalar type (becomes a
/// stored Sum measure).
#[derive(Debug, Clone, PartialEq)]
pub enum SampleField {
    Coordinate(Coord),
    Number(crate::model::types::ScalarType),
}

/// A named schema binding an ordered list of dimensions and an ordered list
/// of measures (§3). Owns a fact table keyed by the tuple of dimension IDs.
#[derive(Debug, Clone)]
pub struct Space {
    pub name: String,
    pub dimensions: Vec<DimensionDef>,
    pub measures: Vec<Measure>,
}

impl Space {
    /// Construct and validate a space's schema (§7 SchemaError cases).
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<DimensionDef>,
        measures: Vec<Measure>,
    ) -> std::result::Result<Self, SchemaError> {
        let name = name.into();

        let mut seen_dims = HashSet::new();
        for d in &dimensions {
            if !seen_dims.insert(d.name.clone()) {
                return Err(SchemaError::DuplicateDimension(d.name.clone(), name));
            }
        }
        if dimensions.iter().filter(|d| d.kind == DimensionKind::Version).count() > 1 {
            return Err(SchemaError::MultipleVersionDimensions(name));
        }

        let mut seen_msrs = HashSet::new();
        for m in &measures {
            if !seen_msrs.insert(m.name.clone()) {
                return Err(SchemaError::DuplicateMeasure(m.name.clone(), name));
            }
        }
        for m in &measures {
            if let MeasureKind::Computed(c) = &m.kind {
                for arg in c.args() {
                    if !measures.iter().any(|o| o.name == arg) {
                        return Err(SchemaError::UnknownComputedArgument(m.name.clone(), arg.to_string()));
                    }
                }
            }
        }
        computed_topo_order(&measures)?;

        Ok(Space { name, dimensions, measures })
    }

    /// Synthesize a schema from a sample record: a list-valued field becomes
    /// a [`DimensionKind::Tree`] whose depth is the list's length (levels
    /// named positionally, `Level-0`, `Level-1`, ...); a numeric field
    /// becomes a stored [`Measure::sum`] (§4.3's retained `build_space`
    /// factory, generalized from the original's column-introspecting
    /// variant to work off an in-memory sample rather than a live table).
    pub fn build_space(name: impl Into<String>, point: &[(String, SampleField)]) -> std::result::Result<Space, SchemaError> {
        let mut dimensions = Vec::new();
        let mut measures = Vec::new();
        for (field_name, value) in point {
            match value {
                SampleField::Coordinate(coord) => {
                    let scalar_type = coord
                        .first()
                        .map(|a| a.scalar_type())
                        .ok_or_else(|| SchemaError::UnsupportedScalarType(field_name.clone()))?;
                    let levels: Vec<String> = (0..coord.len()).map(|i| format!("Level-{i}")).collect();
                    dimensions.push(DimensionDef::tree(field_name.clone(), levels, scalar_type)?);
                }
                SampleField::Number(scalar_type) => {
                    measures.push(Measure::sum(field_name.clone(), *scalar_type));
                }
            }
        }
        Space::new(name, dimensions, measures)
    }

    pub fn fact_table(&self) -> String {
        format!("{}_spc", self.name.to_lowercase())
    }

    pub fn profile_table(&self) -> String {
        format!("{}_pfl", self.name.to_lowercase())
    }

    /// A clone bound to a different physical table name, used for profile
    /// ghost spaces (§4.4): same dimensions/measures, distinct fact table.
    pub fn renamed(&self, name: impl Into<String>) -> Space {
        Space {
            name: name.into(),
            dimensions: self.dimensions.clone(),
            measures: self.measures.clone(),
        }
    }

    pub fn dimension(&self, name: &str) -> Result<&DimensionDef> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| UserError::UnknownDimension(name.to_string(), self.name.clone()).into())
    }

    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }

    pub fn measure(&self, name: &str) -> Result<&Measure> {
        self.measures
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| UserError::UnknownMeasure(name.to_string(), self.name.clone()).into())
    }

    pub fn version_dimension(&self) -> Option<&DimensionDef> {
        self.dimensions.iter().find(|d| d.kind == DimensionKind::Version)
    }

    /// A point matches a filter iff, for every clause, at least one listed
    /// coordinate is a *prefix* of the point's coordinate on that dimension —
    /// a point deeper than the filter still matches (Open Question (b)).
    pub fn matches_point(&self, point: &[Coord], filters: &Filter) -> Result<bool> {
        for clause in filters {
            let idx = self
                .dim_index(&clause.dimension)
                .ok_or_else(|| UserError::UnknownDimension(clause.dimension.clone(), self.name.clone()))?;
            let value = &point[idx];
            let ok = clause.coords.iter().any(|c| is_prefix(c, value));
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Resolve each dimension of `point` to an ID, in space order, creating
    /// missing nodes when `create` is set.
    pub fn key(&self, ctx: &mut Context, point: &[Coord], create: bool) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(self.dimensions.len());
        for (dim, coord) in self.dimensions.iter().zip(point) {
            dim.validate_coord(coord)?;
            let (handle, backend) = ctx.dim_and_backend(&dim.name)?;
            let id = handle.key(backend, coord, create)?;
            let id = id.ok_or_else(|| {
                UserError::UnknownCoordinate(coord.iter().map(|a| a.to_string()).collect(), dim.name.clone())
            })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Upsert `points`, optionally pre-filtering against `filters` with the
    /// load-time prefix match (§4.3).
    pub fn load(
        &self,
        ctx: &mut Context,
        points: &[LoadPoint],
        filters: Option<&Filter>,
        load_type: crate::backend::LoadType,
    ) -> Result<u64> {
        let mut rows = Vec::with_capacity(points.len());
        for p in points {
            if let Some(f) = filters {
                if !self.matches_point(&p.coords, f)? {
                    continue;
                }
            }
            let ids = self.key(ctx, &p.coords, true)?;
            rows.push((ids, p.values.clone()));
        }
        let n = ctx.backend_mut().load(self, &rows, load_type)?;
        ctx.trigger_clear_cache()?;
        Ok(n)
    }

    pub fn delete(&self, ctx: &mut Context, filters: &Filter) -> Result<u64> {
        ctx.backend_mut().delete(self, filters)
    }

    /// Copy an aggregated projection of `self` into `other`'s fact table
    /// (§4.3). Coordinate constants in `select` become delete-filters on
    /// `other`; other select kinds impose no restriction on the delete
    /// (equivalent to "translate dimensions to level-0", i.e. no
    /// restriction).
    pub fn snapshot(
        &self,
        ctx: &mut Context,
        other: &Space,
        select: &[SelectItem],
        filters: &Filter,
    ) -> Result<u64> {
        let plan = self.build_plan(ctx, select, filters)?;

        let mut to_delete = Filter::new();
        for item in select {
            if let SelectItem::Coordinate(name, coord) = item {
                to_delete.push(Clause {
                    dimension: name.clone(),
                    coords: vec![coord.clone()],
                    depth: Some(coord.len()),
                });
            }
        }
        ctx.backend_mut().snapshot(self, other, &plan.resolved, &to_delete)
    }

    /// The central query routine (§4.3).
    pub fn dice(
        &self,
        ctx: &mut Context,
        select: &[SelectItem],
        filters: &Filter,
        dim_fmt: Option<DimFmt>,
        msr_fmt: Option<MsrFmt>,
    ) -> Result<Vec<Vec<Cell>>> {
        let plan = self.build_plan(ctx, select, filters)?;

        let signature = self.signature(select, &plan.resolved.filters);
        ctx.record_hit(&self.name, &signature)?;
        let target = ctx.route_to_profile(self, &signature)?;

        let rows = ctx.backend_mut().dice(&target, &plan.resolved)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells: Vec<Option<Cell>> = vec![None; select.len()];
            let mut values: HashMap<String, f64> = HashMap::new();

            for (slot_idx, (pos, name, _depth)) in plan.level_slots.iter().enumerate() {
                let id = row.group_ids[slot_idx];
                let (handle, backend) = ctx.dim_and_backend(name)?;
                let tuple = handle.name_tuple(backend, id)?;
                cells[*pos] = Some(match dim_fmt {
                    None => Cell::Coord(tuple),
                    Some(DimFmt::Full) => Cell::Text(format_path(&tuple)),
                    Some(DimFmt::Leaf) => Cell::Text(tuple.last().map(|a| a.to_string()).unwrap_or_default()),
                });
            }
            for (pos, _name, coord) in &plan.coord_slots {
                cells[*pos] = Some(Cell::Coord(coord.clone()));
            }
            for (i, name) in plan.measure_order.iter().enumerate() {
                values.insert(name.clone(), row.measures[i]);
            }
            for measure in &plan.eval_order {
                let MeasureKind::Computed(c) = &measure.kind else { unreachable!() };
                let args: Vec<f64> = c
                    .args()
                    .iter()
                    .map(|a| *values.get(*a).expect("computed arg resolved during planning"))
                    .collect();
                values.insert(measure.name.clone(), c.evaluate(&args));
            }
            for (pos, name) in &plan.stored_slots {
                let v = values[name];
                cells[*pos] = Some(format_measure(self.measure(name)?, v, msr_fmt));
            }
            for (pos, name) in &plan.computed_slots {
                let v = values[name];
                cells[*pos] = Some(format_measure(self.measure(name)?, v, msr_fmt));
            }

            out.push(cells.into_iter().map(|c| c.expect("every select position filled")).collect());
        }
        Ok(out)
    }

    /// `dim_name -> effective_depth` used as the profile-cache key (§4.4). A
    /// dimension named in a filter clause is pinned to its full depth: a
    /// materialized profile must carry that dimension's exact node IDs, not
    /// a coarser ancestor, or the filter couldn't be re-applied against it.
    ///
    /// A bare `Dimension` item records the same depth `build_plan` resolves
    /// it to execution-wise (its deepest level, Open Question (a)) rather
    /// than the literal depth-1 the spec text describes: recording anything
    /// shallower than the depth the query actually executes at would let a
    /// coarser profile's ghost rollup satisfy `covers()` and then get asked
    /// for ancestor IDs deeper than it stored, corrupting the result.
    fn signature(&self, select: &[SelectItem], filters: &Filter) -> Vec<(String, u32)> {
        let mut sig: HashMap<String, u32> = self.dimensions.iter().map(|d| (d.name.clone(), 0)).collect();
        for item in select {
            match item {
                SelectItem::Dimension(name) => {
                    if let Ok(dim) = self.dimension(name) {
                        sig.insert(name.clone(), (dim.deepest_level() + 1) as u32);
                    }
                }
                SelectItem::Level(name, level) => {
                    if let Ok(dim) = self.dimension(name) {
                        if let Some(idx) = dim.level_index(level.as_ref()) {
                            sig.insert(name.clone(), (idx + 1) as u32);
                        }
                    }
                }
                _ => {}
            }
        }
        for clause in filters {
            if let Ok(dim) = self.dimension(&clause.dimension) {
                sig.insert(clause.dimension.clone(), dim.depth() as u32);
            }
        }
        let mut out: Vec<(String, u32)> = sig.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Shared planning logic for `dice` and `snapshot`: classify select
    /// items, resolve computed-measure dependencies, and apply the
    /// versioned-dimension default filter.
    fn build_plan(&self, ctx: &mut Context, select: &[SelectItem], filters: &Filter) -> Result<Plan> {
        let mut level_slots: Vec<(usize, String, usize)> = Vec::new();
        let mut coord_slots: Vec<(usize, String, Coord)> = Vec::new();
        let mut stored_slots: Vec<(usize, String)> = Vec::new();
        let mut computed_slots: Vec<(usize, String)> = Vec::new();

        for (pos, item) in select.iter().enumerate() {
            match item {
                SelectItem::Dimension(name) => {
                    let dim = self.dimension(name)?;
                    level_slots.push((pos, name.clone(), dim.deepest_level()));
                }
                SelectItem::Level(name, level) => {
                    let dim = self.dimension(name)?;
                    let idx = dim
                        .level_index(level.as_ref())
                        .ok_or_else(|| UserError::UnknownLevel(format!("{level:?}"), name.clone()))?;
                    level_slots.push((pos, name.clone(), idx));
                }
                SelectItem::Coordinate(name, coord) => {
                    self.dimension(name)?;
                    coord_slots.push((pos, name.clone(), coord.clone()));
                }
                SelectItem::Measure(name) => {
                    let m = self.measure(name)?;
                    if !m.is_stored() {
                        return Err(SchemaError::UnknownSelectItemKind(format!(
                            "'{name}' is a computed measure, use SelectItem::Computed"
                        ))
                        .into());
                    }
                    stored_slots.push((pos, name.clone()));
                }
                SelectItem::Computed(name) => {
                    let m = self.measure(name)?;
                    if m.is_stored() {
                        return Err(SchemaError::UnknownSelectItemKind(format!(
                            "'{name}' is a stored measure, use SelectItem::Measure"
                        ))
                        .into());
                    }
                    computed_slots.push((pos, name.clone()));
                }
            }
        }

        // Resolve computed-measure dependencies to a fixed point.
        let mut needed_computed: HashSet<String> = computed_slots.iter().map(|(_, n)| n.clone()).collect();
        let mut needed_stored: HashSet<String> = stored_slots.iter().map(|(_, n)| n.clone()).collect();
        loop {
            let mut grew = false;
            for name in needed_computed.clone() {
                let m = self.measure(&name)?;
                let MeasureKind::Computed(c) = &m.kind else { continue };
                for arg in c.args() {
                    let arg_m = self.measure(arg)?;
                    if arg_m.is_stored() {
                        grew |= needed_stored.insert(arg.to_string());
                    } else {
                        grew |= needed_computed.insert(arg.to_string());
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let topo = computed_topo_order(&self.measures)?;
        let eval_order: Vec<Measure> = topo
            .iter()
            .map(|&i| self.measures[i].clone())
            .filter(|m| !m.is_stored() && needed_computed.contains(&m.name))
            .collect();

        let mut measure_order: Vec<String> = stored_slots.iter().map(|(_, n)| n.clone()).collect();
        for name in &needed_stored {
            if !measure_order.contains(name) {
                measure_order.push(name.clone());
            }
        }

        // Versioned-dimension default filter (§4.3 step 3).
        let mut filters = filters.clone();
        if let Some(vdim) = self.version_dimension() {
            let projected = level_slots.iter().any(|(_, n, _)| n == &vdim.name)
                || coord_slots.iter().any(|(_, n, _)| n == &vdim.name);
            let has_filter = filters.iter().any(|c| c.dimension == vdim.name);
            if !projected && !has_filter {
                let (handle, backend) = ctx.dim_and_backend(&vdim.name)?;
                let last = handle.last_coord(backend)?;
                filters.push(Clause { dimension: vdim.name.clone(), coords: vec![last], depth: None });
            }
        }

        let levels = level_slots
            .iter()
            .map(|(_, name, depth)| -> Result<DiceLevel> {
                Ok(DiceLevel { dim: self.dimension(name)?.clone(), depth: depth + 1 })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Plan {
            resolved: DicePlan { levels, measures: measure_order.clone(), filters },
            level_slots,
            coord_slots,
            stored_slots,
            computed_slots,
            eval_order,
            measure_order,
        })
    }
}

struct Plan {
    resolved: DicePlan,
    level_slots: Vec<(usize, String, usize)>,
    coord_slots: Vec<(usize, String, Coord)>,
    stored_slots: Vec<(usize, String)>,
    computed_slots: Vec<(usize, String)>,
    eval_order: Vec<Measure>,
    measure_order: Vec<String>,
}

fn is_prefix(prefix: &Coord, value: &Coord) -> bool {
    prefix.len() <= value.len() && prefix.iter().zip(value).all(|(a, b)| a == b)
}

fn format_path(tuple: &Coord) -> String {
    tuple.iter().map(|a| a.to_string()).collect::<Vec<_>>().join("/")
}

fn format_measure(measure: &Measure, value: f64, msr_fmt: Option<MsrFmt>) -> Cell {
    match msr_fmt {
        None => Cell::Number(value),
        Some(MsrFmt) => Cell::Text(measure.format(value)),
    }
}

/// Topologically order measures by computed-measure dependency, returning
/// indices into `measures`. A cycle is a [`SchemaError`].
fn computed_topo_order(measures: &[Measure]) -> std::result::Result<Vec<usize>, SchemaError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..measures.len()).map(|i| graph.add_node(i)).collect();
    let index_of: HashMap<&str, usize> =
        measures.iter().enumerate().map(|(i, m)| (m.name.as_str(), i)).collect();

    for (i, m) in measures.iter().enumerate() {
        if let MeasureKind::Computed(Computed::Average { total, count }) = &m.kind {
            for arg in [total, count] {
                if let Some(&j) = index_of.get(arg.as_str()) {
                    graph.add_edge(nodes[j], nodes[i], ());
                }
            }
        }
        if let MeasureKind::Computed(Computed::Difference { a, b }) = &m.kind {
            for arg in [a, b] {
                if let Some(&j) = index_of.get(arg.as_str()) {
                    graph.add_edge(nodes[j], nodes[i], ());
                }
            }
        }
    }

    toposort(&graph, None).map(|order| order.into_iter().map(|n| graph[n]).collect()).map_err(|_| {
        SchemaError::CyclicComputedMeasures(measures.iter().map(|m| m.name.clone()).collect::<Vec<_>>().join(", "))
    })
}
