//! The SQLite [`Backend`] implementation (§4.1, §6), closure-table based:
//! every dimension gets a `{name}_dim` node table and a `{name}_cls`
//! `(parent_id, child_id, depth)` closure table; every space gets a
//! `{name}_spc` fact table keyed by the tuple of dimension IDs and a
//! `{name}_pfl` profile table. Grounded on the teacher's
//! `cache::MetadataCache` (rusqlite idiom: `params!`, `query_row` +
//! `OptionalExtension`, explicit transactions for multi-statement writes)
//! and on the closure-join SQL in `original_source/menger/backend/sqlite.py`.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::backend::{Backend, DicePlan, DiceRow, LoadType, ProfileRow, ROOT_ID};
use crate::config::Uri;
use crate::error::{Error, Result};
use crate::model::dimension::{Atom, Coord, DimensionDef, Filter};
use crate::model::measure::Measure;
use crate::model::space::Space;
use crate::model::types::ScalarType;

/// A SQLite-backed session connection.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(uri: &Uri) -> Result<Self> {
        let conn = if uri.is_in_memory() {
            Connection::open_in_memory()?
        } else if uri.readonly {
            Connection::open_with_flags(&uri.path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            Connection::open(&uri.path)?
        };
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;").ok();
        Ok(SqliteBackend { conn })
    }

    fn merge_fact_rows(&mut self, space: &Space, dim: &DimensionDef, dup: i64, survivor: i64) -> Result<()> {
        let col = dim_column(dim);
        let dim_cols: Vec<String> = space.dimensions.iter().map(dim_column).collect();
        let measure_cols: Vec<String> = space.measures.iter().filter(|m| m.is_stored()).map(measure_column).collect();
        let n_dims = dim_cols.len();

        let select_sql = format!(
            "SELECT {} FROM {} WHERE {col} = ?",
            dim_cols.iter().chain(measure_cols.iter()).cloned().collect::<Vec<_>>().join(", "),
            space.fact_table(),
        );
        let rows: Vec<(Vec<i64>, Vec<f64>)> = {
            let mut stmt = self.conn.prepare(&select_sql)?;
            stmt.query_map(params![dup], |row| {
                let ids = (0..n_dims).map(|i| row.get::<_, i64>(i)).collect::<rusqlite::Result<Vec<i64>>>()?;
                let vals = (0..measure_cols.len())
                    .map(|i| row.get::<_, f64>(n_dims + i))
                    .collect::<rusqlite::Result<Vec<f64>>>()?;
                Ok((ids, vals))
            })?
            .collect::<rusqlite::Result<_>>()?
        };
        if rows.is_empty() {
            return Ok(());
        }

        self.conn.execute(&format!("DELETE FROM {} WHERE {col} = ?", space.fact_table()), params![dup])?;

        let remapped: Vec<(Vec<i64>, Vec<f64>)> = rows
            .into_iter()
            .map(|(ids, vals)| {
                let new_ids =
                    space.dimensions.iter().zip(ids).map(|(d, id)| if d.name == dim.name { survivor } else { id }).collect();
                (new_ids, vals)
            })
            .collect();
        self.load(space, &remapped, LoadType::Increment)?;
        Ok(())
    }
}

fn dim_column(dim: &DimensionDef) -> String {
    format!("{}_id", dim.name.to_lowercase())
}

fn measure_column(measure: &Measure) -> String {
    format!("m_{}", measure.name.to_lowercase())
}

fn atom_to_sql(atom: &Atom) -> Value {
    match atom {
        Atom::Str(s) => Value::Text(s.clone()),
        Atom::Int(i) => Value::Integer(*i),
        Atom::Float(f) => Value::Real(*f),
    }
}

fn value_to_atom(scalar_type: ScalarType, row: &Row, idx: usize) -> rusqlite::Result<Atom> {
    Ok(match scalar_type {
        ScalarType::String => Atom::Str(row.get(idx)?),
        ScalarType::Int => Atom::Int(row.get(idx)?),
        ScalarType::Float => Atom::Float(row.get(idx)?),
    })
}

/// Resolve a coordinate to a node ID by walking the dimension table one
/// level at a time, `None` on the first unmatched segment.
fn resolve_coord(conn: &Connection, dim: &DimensionDef, coord: &Coord) -> Result<Option<i64>> {
    let mut parent = ROOT_ID;
    for atom in coord {
        let sql = format!(
            "SELECT d.id FROM {dimt} d JOIN {cls} c ON c.child_id = d.id WHERE c.parent_id = ? AND c.depth = 1 AND d.name = ?",
            dimt = dim.dim_table(),
            cls = dim.closure_table(),
        );
        let id: Option<i64> = conn.query_row(&sql, params![parent, atom_to_sql(atom)], |r| r.get(0)).optional()?;
        match id {
            Some(i) => parent = i,
            None => return Ok(None),
        }
    }
    Ok(Some(parent))
}

fn resolve_ids(conn: &Connection, dim: &DimensionDef, coords: &[Coord]) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(coords.len());
    for c in coords {
        if let Some(id) = resolve_coord(conn, dim, c)? {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Build a `WHERE`-clause fragment for `filters`: each clause becomes
/// `[alias.]dim_col IN (SELECT child_id FROM closure WHERE parent_id IN
/// (ids) [AND depth = ?])`, AND'd together. A clause whose listed
/// coordinates don't resolve to any existing node can never match.
fn filter_sql(conn: &Connection, space: &Space, filters: &Filter, alias: &str, params: &mut Vec<Value>) -> Result<String> {
    let mut clauses = Vec::new();
    let prefix = if alias.is_empty() { String::new() } else { format!("{alias}.") };
    for clause in filters {
        let dim = space.dimension(&clause.dimension)?;
        let ids = resolve_ids(conn, dim, &clause.coords)?;
        if ids.is_empty() {
            clauses.push("0".to_string());
            continue;
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut sub = format!(
            "{prefix}{col} IN (SELECT child_id FROM {cls} WHERE parent_id IN ({placeholders})",
            col = dim_column(dim),
            cls = dim.closure_table(),
        );
        for id in &ids {
            params.push(Value::Integer(*id));
        }
        if let Some(d) = clause.depth {
            sub.push_str(" AND depth = ?");
            params.push(Value::Integer(d as i64));
        }
        sub.push(')');
        clauses.push(sub);
    }
    Ok(if clauses.is_empty() { "1 = 1".to_string() } else { clauses.join(" AND ") })
}

/// §4.3 step 5's "skip dead rows": a `HAVING` clause rejecting groups whose
/// every summed measure is zero. Individual fact rows never persist all-zero
/// (§3's delete-on-zero invariant), but an aggregate over several rows with
/// offsetting positive/negative `Increment` values can still land on zero.
/// A no-op when there's nothing to group (bare aggregate) or no measure is
/// selected.
fn having_any_measure_nonzero(group_exprs: &[String], n_measures: usize) -> String {
    if group_exprs.is_empty() || n_measures == 0 {
        return String::new();
    }
    let parts: Vec<String> = (0..n_measures).map(|i| format!("s{i} != 0")).collect();
    format!("HAVING {}", parts.join(" OR "))
}

impl Backend for SqliteBackend {
    fn register_dimension(&mut self, dim: &DimensionDef) -> Result<()> {
        let dim_table = dim.dim_table();
        let cls_table = dim.closure_table();
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {dim_table} (id INTEGER PRIMARY KEY AUTOINCREMENT, name {sql_type});
             CREATE TABLE IF NOT EXISTS {cls_table} (
                 parent_id INTEGER NOT NULL,
                 child_id INTEGER NOT NULL,
                 depth INTEGER NOT NULL,
                 PRIMARY KEY (parent_id, child_id)
             );
             CREATE INDEX IF NOT EXISTS {cls_table}_child_idx ON {cls_table}(child_id);
             CREATE INDEX IF NOT EXISTS {cls_table}_parent_depth_idx ON {cls_table}(parent_id, depth);",
            sql_type = dim.scalar_type.sql_type(),
        ))?;
        self.conn.execute(&format!("INSERT OR IGNORE INTO {dim_table} (id, name) VALUES (?, NULL)"), params![ROOT_ID])?;
        self.conn.execute(
            &format!("INSERT OR IGNORE INTO {cls_table} (parent_id, child_id, depth) VALUES (?, ?, 0)"),
            params![ROOT_ID, ROOT_ID],
        )?;
        Ok(())
    }

    fn register_space(&mut self, space: &Space) -> Result<()> {
        let mut cols: Vec<String> = space.dimensions.iter().map(|d| format!("{} INTEGER NOT NULL", dim_column(d))).collect();
        cols.extend(
            space
                .measures
                .iter()
                .filter(|m| m.is_stored())
                .map(|m| format!("{} {} NOT NULL DEFAULT 0", measure_column(m), m.sql_type())),
        );
        let pk = space.dimensions.iter().map(dim_column).collect::<Vec<_>>().join(", ");
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({pk}));
             CREATE TABLE IF NOT EXISTS {} (
                 id INTEGER PRIMARY KEY,
                 signature TEXT NOT NULL UNIQUE,
                 size INTEGER,
                 hits INTEGER NOT NULL DEFAULT 0
             );",
            space.fact_table(),
            cols.join(", "),
            space.profile_table(),
        ))?;
        Ok(())
    }

    fn close(&mut self, _rollback: bool) -> Result<()> {
        // Every multi-statement mutation below opens and commits its own
        // transaction; there is no long-lived session transaction to roll
        // back here.
        Ok(())
    }

    fn size(&mut self, space: &Space) -> Result<u64> {
        let n: i64 = self.conn.query_row(&format!("SELECT COUNT(*) FROM {}", space.fact_table()), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn load(&mut self, space: &Space, rows: &[(Vec<i64>, Vec<f64>)], load_type: LoadType) -> Result<u64> {
        let dim_cols: Vec<String> = space.dimensions.iter().map(dim_column).collect();
        let measure_cols: Vec<String> = space.measures.iter().filter(|m| m.is_stored()).map(measure_column).collect();
        let fact_table = space.fact_table();
        let where_clause = dim_cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(" AND ");
        let select_sql = format!(
            "SELECT 1{} FROM {fact_table} WHERE {where_clause}",
            measure_cols.iter().map(|c| format!(", {c}")).collect::<String>(),
        );
        let all_cols: Vec<String> = dim_cols.iter().chain(measure_cols.iter()).cloned().collect();
        let insert_sql = format!(
            "INSERT INTO {fact_table} ({}) VALUES ({})",
            all_cols.join(", "),
            vec!["?"; all_cols.len()].join(", "),
        );
        let update_sql = format!(
            "UPDATE {fact_table} SET {} WHERE {where_clause}",
            measure_cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(", "),
        );
        let delete_sql = format!("DELETE FROM {fact_table} WHERE {where_clause}");

        let tx = self.conn.transaction()?;
        let mut affected: u64 = 0;
        for (ids, values) in rows {
            let id_params: Vec<Value> = ids.iter().map(|i| Value::Integer(*i)).collect();

            let existing: Option<Vec<f64>> = {
                let mut stmt = tx.prepare_cached(&select_sql)?;
                stmt.query_row(rusqlite::params_from_iter(id_params.iter()), |row| {
                    (0..measure_cols.len()).map(|i| row.get::<_, f64>(i + 1)).collect::<rusqlite::Result<Vec<f64>>>()
                })
                .optional()?
            };

            let do_insert = |tx: &rusqlite::Transaction, values: &[f64]| -> Result<()> {
                let val_params: Vec<Value> = values.iter().map(|v| Value::Real(*v)).collect();
                let all: Vec<Value> = id_params.iter().cloned().chain(val_params).collect();
                tx.execute(&insert_sql, rusqlite::params_from_iter(all.iter()))?;
                Ok(())
            };
            let do_update = |tx: &rusqlite::Transaction, values: &[f64]| -> Result<()> {
                let mut all: Vec<Value> = values.iter().map(|v| Value::Real(*v)).collect();
                all.extend(id_params.iter().cloned());
                tx.execute(&update_sql, rusqlite::params_from_iter(all.iter()))?;
                Ok(())
            };
            let do_delete = |tx: &rusqlite::Transaction| -> Result<()> {
                tx.execute(&delete_sql, rusqlite::params_from_iter(id_params.iter()))?;
                Ok(())
            };
            let all_zero = |v: &[f64]| v.iter().all(|x| *x == 0.0);

            match load_type {
                LoadType::CreateOnly => {
                    if existing.is_none() {
                        do_insert(&tx, values)?;
                        affected += 1;
                    }
                }
                LoadType::Default => match existing {
                    None => {
                        if !all_zero(values) {
                            do_insert(&tx, values)?;
                            affected += 1;
                        }
                    }
                    Some(_) => {
                        if all_zero(values) {
                            do_delete(&tx)?;
                        } else {
                            do_update(&tx, values)?;
                        }
                        affected += 1;
                    }
                },
                LoadType::Increment => match existing {
                    None => {
                        if !all_zero(values) {
                            do_insert(&tx, values)?;
                            affected += 1;
                        }
                    }
                    Some(old) => {
                        let merged: Vec<f64> = old.iter().zip(values).map(|(o, n)| o + n).collect();
                        if all_zero(&merged) {
                            do_delete(&tx)?;
                        } else {
                            do_update(&tx, &merged)?;
                        }
                        affected += 1;
                    }
                },
            }
        }
        tx.commit()?;
        if affected > 0 {
            self.conn.execute_batch(&format!("ANALYZE {fact_table};")).ok();
        }
        Ok(affected)
    }

    fn get(&mut self, space: &Space, key: &[i64]) -> Result<Option<Vec<f64>>> {
        let dim_cols: Vec<String> = space.dimensions.iter().map(dim_column).collect();
        let measure_cols: Vec<String> = space.measures.iter().filter(|m| m.is_stored()).map(measure_column).collect();
        let where_clause = dim_cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(" AND ");
        let sql = format!(
            "SELECT 1{} FROM {} WHERE {where_clause}",
            measure_cols.iter().map(|c| format!(", {c}")).collect::<String>(),
            space.fact_table(),
        );
        let params: Vec<Value> = key.iter().map(|i| Value::Integer(*i)).collect();
        self.conn
            .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
                (0..measure_cols.len()).map(|i| row.get::<_, f64>(i + 1)).collect::<rusqlite::Result<Vec<f64>>>()
            })
            .optional()
            .map_err(Into::into)
    }

    fn delete(&mut self, space: &Space, filters: &Filter) -> Result<u64> {
        let mut params = Vec::new();
        let where_sql = filter_sql(&self.conn, space, filters, "", &mut params)?;
        let sql = format!("DELETE FROM {} WHERE {where_sql}", space.fact_table());
        let n = self.conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(n as u64)
    }

    fn dice(&mut self, space: &Space, plan: &DicePlan) -> Result<Vec<DiceRow>> {
        let group_exprs: Vec<String> = plan
            .levels
            .iter()
            .map(|lvl| {
                format!(
                    "(SELECT c1.parent_id FROM {cls} c1 JOIN {cls} c2 ON c2.child_id = c1.parent_id AND c2.parent_id = {ROOT_ID} \
                     WHERE c1.child_id = f.{col} AND c2.depth = {depth})",
                    cls = lvl.dim.closure_table(),
                    col = dim_column(&lvl.dim),
                    depth = lvl.depth,
                )
            })
            .collect();
        let measure_exprs: Vec<String> = plan.measures.iter().map(|name| format!("SUM(f.m_{})", name.to_lowercase())).collect();

        let select_list = group_exprs
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{e} AS g{i}"))
            .chain(measure_exprs.iter().enumerate().map(|(i, e)| format!("{e} AS s{i}")))
            .collect::<Vec<_>>()
            .join(", ");

        let mut params = Vec::new();
        let where_sql = filter_sql(&self.conn, space, &plan.filters, "f", &mut params)?;
        let group_by = if group_exprs.is_empty() {
            String::new()
        } else {
            format!("GROUP BY {}", (0..group_exprs.len()).map(|i| format!("g{i}")).collect::<Vec<_>>().join(", "))
        };

        let having = having_any_measure_nonzero(&group_exprs, measure_exprs.len());
        let sql = format!("SELECT {select_list} FROM {} f WHERE {where_sql} {group_by} {having}", space.fact_table());
        let n_groups = group_exprs.len();
        let n_measures = measure_exprs.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let group_ids = (0..n_groups).map(|i| row.get::<_, i64>(i)).collect::<rusqlite::Result<Vec<i64>>>()?;
                let measures =
                    (0..n_measures).map(|i| row.get::<_, f64>(n_groups + i)).collect::<rusqlite::Result<Vec<f64>>>()?;
                Ok(DiceRow { group_ids, measures })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn snapshot(&mut self, space: &Space, other: &Space, plan: &DicePlan, to_delete: &Filter) -> Result<u64> {
        let tx = self.conn.transaction()?;

        {
            let mut del_params = Vec::new();
            let where_sql = filter_sql(&tx, other, to_delete, "", &mut del_params)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE {where_sql}", other.fact_table()),
                rusqlite::params_from_iter(del_params.iter()),
            )?;
        }

        let group_exprs: Vec<String> = plan
            .levels
            .iter()
            .map(|lvl| {
                format!(
                    "(SELECT c1.parent_id FROM {cls} c1 JOIN {cls} c2 ON c2.child_id = c1.parent_id AND c2.parent_id = {ROOT_ID} \
                     WHERE c1.child_id = f.{col} AND c2.depth = {depth})",
                    cls = lvl.dim.closure_table(),
                    col = dim_column(&lvl.dim),
                    depth = lvl.depth,
                )
            })
            .collect();
        let measure_exprs: Vec<String> = plan.measures.iter().map(|name| format!("SUM(f.m_{})", name.to_lowercase())).collect();
        let select_list = group_exprs
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{e} AS g{i}"))
            .chain(measure_exprs.iter().enumerate().map(|(i, e)| format!("{e} AS s{i}")))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params = Vec::new();
        let where_sql = filter_sql(&tx, space, &plan.filters, "f", &mut params)?;
        let group_by = if group_exprs.is_empty() {
            String::new()
        } else {
            format!("GROUP BY {}", (0..group_exprs.len()).map(|i| format!("g{i}")).collect::<Vec<_>>().join(", "))
        };
        let having = having_any_measure_nonzero(&group_exprs, measure_exprs.len());
        let select_sql = format!("SELECT {select_list} FROM {} f WHERE {where_sql} {group_by} {having}", space.fact_table());

        let n_groups = group_exprs.len();
        let n_measures = measure_exprs.len();
        let rows: Vec<(Vec<i64>, Vec<f64>)> = {
            let mut stmt = tx.prepare(&select_sql)?;
            stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let ids = (0..n_groups).map(|i| row.get::<_, i64>(i)).collect::<rusqlite::Result<Vec<i64>>>()?;
                let vals =
                    (0..n_measures).map(|i| row.get::<_, f64>(n_groups + i)).collect::<rusqlite::Result<Vec<f64>>>()?;
                Ok((ids, vals))
            })?
            .collect::<rusqlite::Result<_>>()?
        };

        let dim_cols: Vec<String> = other.dimensions.iter().map(dim_column).collect();
        let measure_cols: Vec<String> = other.measures.iter().filter(|m| m.is_stored()).map(measure_column).collect();
        let where_clause = dim_cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(" AND ");
        let select_existing_sql = format!(
            "SELECT 1{} FROM {} WHERE {where_clause}",
            measure_cols.iter().map(|c| format!(", {c}")).collect::<String>(),
            other.fact_table(),
        );
        let all_cols: Vec<String> = dim_cols.iter().chain(measure_cols.iter()).cloned().collect();
        let insert_sql =
            format!("INSERT INTO {} ({}) VALUES ({})", other.fact_table(), all_cols.join(", "), vec!["?"; all_cols.len()].join(", "));
        let update_sql = format!(
            "UPDATE {} SET {} WHERE {where_clause}",
            other.fact_table(),
            measure_cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(", "),
        );

        let mut affected = 0u64;
        for (group_ids, values) in &rows {
            let mut ordered_ids = Vec::with_capacity(other.dimensions.len());
            for od in &other.dimensions {
                let pos = plan
                    .levels
                    .iter()
                    .position(|l| l.dim.name == od.name)
                    .ok_or_else(|| Error::Invariant(format!("snapshot target dimension '{}' not covered by plan", od.name)))?;
                ordered_ids.push(group_ids[pos]);
            }
            let id_params: Vec<Value> = ordered_ids.iter().map(|i| Value::Integer(*i)).collect();

            let existing: Option<Vec<f64>> = tx
                .query_row(&select_existing_sql, rusqlite::params_from_iter(id_params.iter()), |row| {
                    (0..measure_cols.len()).map(|i| row.get::<_, f64>(i + 1)).collect::<rusqlite::Result<Vec<f64>>>()
                })
                .optional()?;

            match existing {
                Some(old) => {
                    let merged: Vec<f64> = old.iter().zip(values).map(|(o, n)| o + n).collect();
                    let mut all: Vec<Value> = merged.iter().map(|v| Value::Real(*v)).collect();
                    all.extend(id_params.iter().cloned());
                    tx.execute(&update_sql, rusqlite::params_from_iter(all.iter()))?;
                }
                None => {
                    let val_params: Vec<Value> = values.iter().map(|v| Value::Real(*v)).collect();
                    let all: Vec<Value> = id_params.iter().cloned().chain(val_params).collect();
                    tx.execute(&insert_sql, rusqlite::params_from_iter(all.iter()))?;
                }
            }
            affected += 1;
        }

        tx.commit()?;
        Ok(affected)
    }

    fn create_coordinate(&mut self, dim: &DimensionDef, name: Option<&Atom>, parent_id: Option<i64>) -> Result<i64> {
        let parent = parent_id.unwrap_or(ROOT_ID);
        let tx = self.conn.transaction()?;
        tx.execute(&format!("INSERT INTO {} (name) VALUES (?)", dim.dim_table()), params![name.map(atom_to_sql)])?;
        let new_id = tx.last_insert_rowid();
        tx.execute(&format!("INSERT INTO {} (parent_id, child_id, depth) VALUES (?, ?, 0)", dim.closure_table()), params![
            new_id, new_id
        ])?;
        tx.execute(
            &format!(
                "INSERT INTO {cls} (parent_id, child_id, depth) SELECT parent_id, ?, depth + 1 FROM {cls} WHERE child_id = ?",
                cls = dim.closure_table(),
            ),
            params![new_id, parent],
        )?;
        tx.commit()?;
        Ok(new_id)
    }

    fn delete_coordinate(&mut self, dim: &DimensionDef, coord_id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&format!("SELECT child_id FROM {} WHERE parent_id = ?", dim.closure_table()))?;
            stmt.query_map(params![coord_id], |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?
        };
        for id in &ids {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?", dim.dim_table()), params![id])?;
            tx.execute(&format!("DELETE FROM {} WHERE parent_id = ? OR child_id = ?", dim.closure_table()), params![
                id, id
            ])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn reparent(&mut self, dim: &DimensionDef, child_id: i64, new_parent_id: i64) -> Result<()> {
        let cls = dim.closure_table();
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM {cls} WHERE child_id IN (SELECT child_id FROM {cls} WHERE parent_id = ?)
                 AND parent_id IN (SELECT parent_id FROM {cls} WHERE child_id = ? AND parent_id != ?)"
            ),
            params![child_id, child_id, child_id],
        )?;
        tx.execute(
            &format!(
                "INSERT INTO {cls} (parent_id, child_id, depth)
                 SELECT p.parent_id, c.child_id, p.depth + c.depth + 1
                 FROM {cls} p, {cls} c
                 WHERE p.child_id = ? AND c.parent_id = ?"
            ),
            params![new_parent_id, child_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn merge(&mut self, dim: &DimensionDef, parent_id: i64, spaces: &[Space]) -> Result<()> {
        let groups: Vec<Vec<i64>> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT d.name, d.id FROM {dimt} d JOIN {cls} c ON c.child_id = d.id WHERE c.parent_id = ? AND c.depth = 1 ORDER BY d.name",
                dimt = dim.dim_table(),
                cls = dim.closure_table(),
            ))?;
            let named: Vec<(Atom, i64)> = stmt
                .query_map(params![parent_id], |r| Ok((value_to_atom(dim.scalar_type, r, 0)?, r.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut by_name: Vec<(Atom, Vec<i64>)> = Vec::new();
            for (name, id) in named {
                match by_name.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1.push(id),
                    None => by_name.push((name, vec![id])),
                }
            }
            by_name.into_iter().map(|(_, ids)| ids).filter(|ids| ids.len() > 1).collect()
        };

        for mut ids in groups {
            ids.sort_unstable();
            let survivor = ids[0];
            for &dup in &ids[1..] {
                let children: Vec<i64> = {
                    let mut stmt =
                        self.conn.prepare(&format!("SELECT child_id FROM {} WHERE parent_id = ? AND depth = 1", dim.closure_table()))?;
                    stmt.query_map(params![dup], |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?
                };
                for child in children {
                    self.reparent(dim, child, survivor)?;
                }
                for space in spaces {
                    if space.dim_index(&dim.name).is_some() {
                        self.merge_fact_rows(space, dim, dup, survivor)?;
                    }
                }
                self.delete_coordinate(dim, dup)?;
            }
            // Combining dup's children into survivor's can itself produce a
            // same-named pair one level down (§4.1 "recurse on the retained
            // child"); idempotent once no duplicates remain.
            self.merge(dim, survivor, spaces)?;
        }
        Ok(())
    }

    fn prune(&mut self, dim: &DimensionDef, node_id: i64) -> Result<()> {
        if node_id == ROOT_ID {
            return Ok(());
        }
        let has_children: bool = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE parent_id = ? AND depth = 1)", dim.closure_table()),
            params![node_id],
            |r| r.get(0),
        )?;
        if !has_children {
            self.delete_coordinate(dim, node_id)?;
        }
        Ok(())
    }

    fn rename(&mut self, dim: &DimensionDef, node_id: i64, new_name: &Atom) -> Result<()> {
        self.conn.execute(&format!("UPDATE {} SET name = ? WHERE id = ?", dim.dim_table()), params![
            atom_to_sql(new_name),
            node_id
        ])?;
        Ok(())
    }

    fn get_children(&mut self, dim: &DimensionDef, parent_id: Option<i64>, depth: usize) -> Result<Vec<(Atom, i64)>> {
        // depth 0 only ever matches a node's own closure self-row (whose
        // `name` is NULL for the root), never an actual child.
        if depth == 0 {
            return Ok(Vec::new());
        }
        let parent = parent_id.unwrap_or(ROOT_ID);
        let sql = format!(
            "SELECT d.name, d.id FROM {dimt} d JOIN {cls} c ON c.child_id = d.id WHERE c.parent_id = ? AND c.depth = ?",
            dimt = dim.dim_table(),
            cls = dim.closure_table(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![parent, depth as i64], |row| Ok((value_to_atom(dim.scalar_type, row, 0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_parents(&mut self, dim: &DimensionDef) -> Result<Vec<(i64, Atom, Option<i64>)>> {
        let sql = format!(
            "SELECT d.id, d.name, c.parent_id FROM {dimt} d JOIN {cls} c ON c.child_id = d.id WHERE c.depth = 1",
            dimt = dim.dim_table(),
            cls = dim.closure_table(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let name = value_to_atom(dim.scalar_type, row, 1)?;
                let parent: i64 = row.get(2)?;
                Ok((id, name, Some(parent)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn glob(
        &mut self,
        dim: &DimensionDef,
        parent_id: Option<i64>,
        _parent_depth: usize,
        target_depth: usize,
        constraints: &[(usize, Atom)],
        filters: &[Vec<(Option<i64>, usize)>],
    ) -> Result<Vec<i64>> {
        let parent = parent_id.unwrap_or(ROOT_ID);
        let mut sql = format!("SELECT c.child_id FROM {cls} c WHERE c.parent_id = ? AND c.depth = ?", cls = dim.closure_table());
        let mut params: Vec<Value> = vec![Value::Integer(parent), Value::Integer(target_depth as i64)];

        for (offset, name) in constraints {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM {cls} anc JOIN {dimt} d2 ON d2.id = anc.parent_id \
                 WHERE anc.child_id = c.child_id AND anc.depth = ? AND d2.name = ?)",
                cls = dim.closure_table(),
                dimt = dim.dim_table(),
            ));
            params.push(Value::Integer(*offset as i64));
            params.push(atom_to_sql(name));
        }

        for clause in filters {
            let mut or_parts = Vec::new();
            for (key, _depth) in clause {
                if let Some(k) = key {
                    or_parts
                        .push(format!("EXISTS (SELECT 1 FROM {cls} r WHERE r.parent_id = ? AND r.child_id = c.child_id)", cls = dim.closure_table()));
                    params.push(Value::Integer(*k));
                }
            }
            if !or_parts.is_empty() {
                sql.push_str(&format!(" AND ({})", or_parts.join(" OR ")));
            }
        }

        sql.push_str(" ORDER BY c.child_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt.query_map(rusqlite::params_from_iter(params.iter()), |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn search(&mut self, dim: &DimensionDef, substring: &str, max_depth: usize) -> Result<Vec<(Atom, usize)>> {
        let pattern = format!("%{}%", substring.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let sql = format!(
            "SELECT d.name, c.depth FROM {dimt} d JOIN {cls} c ON c.child_id = d.id
             WHERE c.parent_id = ? AND c.depth BETWEEN 1 AND ? AND d.name LIKE ? ESCAPE '\\'
             ORDER BY c.depth, d.name",
            dimt = dim.dim_table(),
            cls = dim.closure_table(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![ROOT_ID, max_depth as i64, pattern], |row| {
                Ok((value_to_atom(dim.scalar_type, row, 0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_profiles(&mut self, space: &Space) -> Result<Vec<ProfileRow>> {
        let sql = format!("SELECT id, signature, size, hits FROM {}", space.profile_table());
        let mut stmt = self.conn.prepare(&sql)?;
        let raw: Vec<(i64, String, Option<i64>, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(id, sig_json, size, hits)| {
                let signature: Vec<(String, u32)> = serde_json::from_str(&sig_json)?;
                Ok(ProfileRow { id, signature, size: size.map(|s| s as u64), hits })
            })
            .collect()
    }

    fn inc_profile(&mut self, space: &Space, signature: &[(String, u32)], n: i64) -> Result<()> {
        let sig_json = serde_json::to_string(signature)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {t} (id, signature, size, hits) VALUES ((SELECT COALESCE(MAX(id), 0) + 1 FROM {t}), ?, NULL, ?)
                 ON CONFLICT(signature) DO UPDATE SET hits = hits + excluded.hits",
                t = space.profile_table(),
            ),
            params![sig_json, n],
        )?;
        Ok(())
    }

    fn set_profile(&mut self, space: &Space, id: i64, size: u64) -> Result<()> {
        self.conn.execute(&format!("UPDATE {} SET size = ? WHERE id = ?", space.profile_table()), params![size as i64, id])?;
        Ok(())
    }

    fn reset_profile(&mut self, space: &Space, ghost_space: &Space, id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", ghost_space.fact_table()), [])?;
        tx.execute(&format!("UPDATE {} SET size = NULL, hits = 0 WHERE id = ?", space.profile_table()), params![id])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::measure::Measure;

    fn open() -> SqliteBackend {
        SqliteBackend::open(&Uri::parse("sqlite://:memory:").unwrap()).unwrap()
    }

    fn place_dim() -> DimensionDef {
        DimensionDef::tree("place", vec!["Region", "Country"], ScalarType::String).unwrap()
    }

    #[test]
    fn register_dimension_seeds_root() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let children = be.get_children(&dim, None, 0).unwrap();
        assert_eq!(children, vec![]);
    }

    #[test]
    fn create_coordinate_and_get_children() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let _be2 = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu)).unwrap();

        let top = be.get_children(&dim, None, 1).unwrap();
        assert_eq!(top, vec![(Atom::from("EU"), eu)]);

        let second = be.get_children(&dim, Some(eu), 1).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, Atom::from("BE"));
    }

    #[test]
    fn delete_coordinate_removes_the_node_and_its_whole_subtree() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let be_id = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu)).unwrap();
        let fr_id = be.create_coordinate(&dim, Some(&Atom::from("FR")), Some(eu)).unwrap();

        be.delete_coordinate(&dim, be_id).unwrap();

        let remaining = be.get_children(&dim, Some(eu), 1).unwrap();
        assert_eq!(remaining, vec![(Atom::from("FR"), fr_id)]);
    }

    #[test]
    fn load_and_dice_sums_measures() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();

        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let be_id = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu)).unwrap();
        let fr_id = be.create_coordinate(&dim, Some(&Atom::from("FR")), Some(eu)).unwrap();

        be.load(&space, &[(vec![be_id], vec![10.0]), (vec![fr_id], vec![5.0])], LoadType::Default).unwrap();

        let plan = DicePlan {
            levels: vec![crate::backend::DiceLevel { dim: dim.clone(), depth: 1 }],
            measures: vec!["total".to_string()],
            filters: vec![],
        };
        let rows = be.dice(&space, &plan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_ids, vec![eu]);
        assert_eq!(rows[0].measures, vec![15.0]);
    }

    #[test]
    fn dice_skips_groups_whose_measures_cancel_to_zero() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();

        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let na = be.create_coordinate(&dim, Some(&Atom::from("NA")), None).unwrap();
        let be_id = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu)).unwrap();
        let fr_id = be.create_coordinate(&dim, Some(&Atom::from("FR")), Some(eu)).unwrap();
        let us_id = be.create_coordinate(&dim, Some(&Atom::from("US")), Some(na)).unwrap();

        // EU's two children cancel out; NA's lone child does not.
        be.load(
            &space,
            &[(vec![be_id], vec![5.0]), (vec![fr_id], vec![-5.0]), (vec![us_id], vec![7.0])],
            LoadType::Default,
        )
        .unwrap();

        let plan = DicePlan {
            levels: vec![crate::backend::DiceLevel { dim: dim.clone(), depth: 1 }],
            measures: vec!["total".to_string()],
            filters: vec![],
        };
        let rows = be.dice(&space, &plan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_ids, vec![na]);
        assert_eq!(rows[0].measures, vec![7.0]);
    }

    #[test]
    fn increment_load_sums_old_and_new() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();

        be.load(&space, &[(vec![eu], vec![3.0])], LoadType::Increment).unwrap();
        be.load(&space, &[(vec![eu], vec![4.0])], LoadType::Increment).unwrap();

        let got = be.get(&space, &[eu]).unwrap().unwrap();
        assert_eq!(got, vec![7.0]);
    }

    #[test]
    fn create_only_load_never_overwrites_an_existing_row() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let fr = be.create_coordinate(&dim, Some(&Atom::from("FR")), None).unwrap();

        be.load(&space, &[(vec![eu], vec![3.0])], LoadType::CreateOnly).unwrap();
        be.load(&space, &[(vec![eu], vec![99.0]), (vec![fr], vec![5.0])], LoadType::CreateOnly).unwrap();

        assert_eq!(be.get(&space, &[eu]).unwrap().unwrap(), vec![3.0]);
        assert_eq!(be.get(&space, &[fr]).unwrap().unwrap(), vec![5.0]);
    }

    #[test]
    fn reparent_moves_subtree_and_its_descendants() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let na = be.create_coordinate(&dim, Some(&Atom::from("NA")), None).unwrap();
        let be_id = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu)).unwrap();

        be.reparent(&dim, be_id, na).unwrap();

        let under_eu = be.get_children(&dim, Some(eu), 1).unwrap();
        assert!(under_eu.is_empty());
        let under_na = be.get_children(&dim, Some(na), 1).unwrap();
        assert_eq!(under_na, vec![(Atom::from("BE"), be_id)]);
    }

    #[test]
    fn merge_collapses_duplicate_siblings_and_re_sums_facts() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();

        let eu1 = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let eu2 = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        be.load(&space, &[(vec![eu1], vec![10.0]), (vec![eu2], vec![5.0])], LoadType::Default).unwrap();

        be.merge(&dim, ROOT_ID, std::slice::from_ref(&space)).unwrap();

        let survivor = eu1.min(eu2);
        let got = be.get(&space, &[survivor]).unwrap().unwrap();
        assert_eq!(got, vec![15.0]);
        assert!(be.get(&space, &[eu1.max(eu2)]).unwrap().is_none());
    }

    #[test]
    fn merge_recurses_into_survivor_to_collapse_grandchild_duplicates() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();

        let eu1 = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let eu2 = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        // Both duplicate EU nodes get a child named "BE" — reparenting eu2's
        // children under the survivor produces a second-level duplicate pair
        // that a single, non-recursive merge pass would miss.
        let be1 = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu1)).unwrap();
        let be2 = be.create_coordinate(&dim, Some(&Atom::from("BE")), Some(eu2)).unwrap();
        be.load(&space, &[(vec![be1], vec![10.0]), (vec![be2], vec![5.0])], LoadType::Default).unwrap();

        be.merge(&dim, ROOT_ID, std::slice::from_ref(&space)).unwrap();

        let eu_survivor = eu1.min(eu2);
        let under_eu = be.get_children(&dim, Some(eu_survivor), 1).unwrap();
        assert_eq!(under_eu.len(), 1, "BE duplicates under the surviving EU must collapse to one node");
        assert_eq!(under_eu[0].0, Atom::from("BE"));

        let be_survivor = under_eu[0].1;
        let got = be.get(&space, &[be_survivor]).unwrap().unwrap();
        assert_eq!(got, vec![15.0]);
    }

    #[test]
    fn delete_removes_matching_rows_only() {
        let mut be = open();
        let dim = place_dim();
        be.register_dimension(&dim).unwrap();
        let space = Space::new("Cube", vec![dim.clone()], vec![Measure::sum("total", ScalarType::Float)]).unwrap();
        be.register_space(&space).unwrap();
        let eu = be.create_coordinate(&dim, Some(&Atom::from("EU")), None).unwrap();
        let na = be.create_coordinate(&dim, Some(&Atom::from("NA")), None).unwrap();
        be.load(&space, &[(vec![eu], vec![1.0]), (vec![na], vec![2.0])], LoadType::Default).unwrap();

        let n = be
            .delete(&space, &[crate::model::dimension::Clause { dimension: "place".into(), coords: vec![vec![Atom::from("EU")]], depth: None }])
            .unwrap();
        assert_eq!(n, 1);
        assert!(be.get(&space, &[eu]).unwrap().is_none());
        assert!(be.get(&space, &[na]).unwrap().is_some());
    }
}
