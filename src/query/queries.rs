// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Query execution.
//!
//! Every query kind shares the same header (matched series, where
//! expression) and adds its own fields; the statement's enter steps fill
//! the wrapper, the exit step produces the result.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::backup;
use crate::db::access::{
    access_from_str, check_access, ACCESS_ALTER, ACCESS_COUNT, ACCESS_CREATE, ACCESS_DROP,
    ACCESS_GRANT, ACCESS_LIST, ACCESS_REVOKE, ACCESS_SELECT, ACCESS_SHOW,
};
use crate::db::Database;
use crate::error::{Result, TdbError};
use crate::groups::compile_pattern;
use crate::net::pkg::Pkg;
use crate::net::protocol;
use crate::points::{Points, Value};
use crate::qpack::Packer;
use crate::query::aggregate::Aggregation;
use crate::query::expr::{cmp_int, cmp_str, resolve_time_expr, Condition, Expr};
use crate::query::grammar::{parse, Gid, Node};
use crate::query::walker;
use crate::query::QpVal;
use crate::storage::series::Series;
use crate::storage::shard::{ShardType, FLAG_IS_CORRUPT, FLAG_IS_REMOVED};

/// Common prefix shared by every query wrapper.
#[derive(Default)]
pub struct QueryHeader {
    pub series: Vec<u32>,
    pub where_expr: Option<Expr>,
}

pub struct QuerySelect {
    pub hdr: QueryHeader,
    pub start_ts: u64,
    pub end_ts: u64,
    pub aggr: Option<Aggregation>,
}

pub struct QueryList {
    pub hdr: QueryHeader,
    pub target: String,
    pub columns: Vec<String>,
    pub limit: usize,
}

pub struct QueryCount {
    pub hdr: QueryHeader,
    pub target: String,
}

pub struct QueryDrop {
    pub hdr: QueryHeader,
    pub target: String,
    pub ignore_threshold: bool,
}

enum Wrap {
    None,
    Select(QuerySelect),
    List(QueryList),
    Count(QueryCount),
    Drop(QueryDrop),
    Other,
    Show(Vec<String>),
}

struct QueryTask<'a> {
    db: &'a Arc<Database>,
    user: &'a str,
    wrap: Wrap,
    result: Option<QpVal>,
}

/// Access bits a statement requires.
fn required_access(gid: Gid) -> u32 {
    match gid {
        Gid::Select => ACCESS_SELECT,
        Gid::List => ACCESS_LIST,
        Gid::Count => ACCESS_COUNT,
        Gid::Drop => ACCESS_DROP,
        Gid::Alter => ACCESS_ALTER,
        Gid::Create => ACCESS_CREATE,
        Gid::Grant => ACCESS_GRANT,
        Gid::Revoke => ACCESS_REVOKE,
        Gid::Show => ACCESS_SHOW,
        _ => 0,
    }
}

/// Parse and run one query for an authenticated user.
pub async fn execute(
    db: &Arc<Database>,
    query: &str,
    user: &str,
    user_access: u32,
) -> Result<QpVal> {
    let root = parse(query)?;
    check_access(user_access, required_access(root.gid))?;

    let plan = walker::plan(&root);
    let mut task = QueryTask {
        db,
        user,
        wrap: Wrap::None,
        result: None,
    };
    for node in &plan.enter {
        task.enter(node)?;
    }
    for node in &plan.exit {
        task.exit(node).await?;
    }
    task.result
        .ok_or_else(|| TdbError::Query("query produced no result".into()))
}

impl QueryTask<'_> {
    fn enter(&mut self, node: &Node) -> Result<()> {
        match node.gid {
            Gid::Select => {
                self.wrap = Wrap::Select(QuerySelect {
                    hdr: QueryHeader::default(),
                    start_ts: 0,
                    end_ts: u64::MAX,
                    aggr: None,
                });
            }
            Gid::List => {
                let limit = self.db.meta.lock().list_limit;
                self.wrap = Wrap::List(QueryList {
                    hdr: QueryHeader::default(),
                    target: node.text.clone(),
                    columns: Vec::new(),
                    limit,
                });
            }
            Gid::Count => {
                self.wrap = Wrap::Count(QueryCount {
                    hdr: QueryHeader::default(),
                    target: node.text.clone(),
                });
            }
            Gid::Drop => {
                self.wrap = Wrap::Drop(QueryDrop {
                    hdr: QueryHeader::default(),
                    target: node.text.clone(),
                    ignore_threshold: false,
                });
            }
            Gid::Alter | Gid::Create | Gid::Grant | Gid::Revoke => {
                self.wrap = Wrap::Other;
            }
            Gid::Show => {
                let fields = node
                    .children_of(Gid::ShowField)
                    .map(|f| f.text.clone())
                    .collect();
                self.wrap = Wrap::Show(fields);
            }
            Gid::SeriesMatch => {
                let series = resolve_series_match(self.db, node)?;
                if let Some(hdr) = self.hdr_mut() {
                    hdr.series = series;
                }
            }
            Gid::Where => {
                let expr = Expr::build(&node.children[0], &self.db.time)?;
                if let Some(hdr) = self.hdr_mut() {
                    hdr.where_expr = Some(expr);
                }
            }
            Gid::Between => {
                if let Wrap::Select(select) = &mut self.wrap {
                    select.start_ts = resolve_time_expr(&node.children[0].text, &self.db.time)?;
                    select.end_ts = resolve_time_expr(&node.children[1].text, &self.db.time)?;
                    if select.start_ts > select.end_ts {
                        return Err(TdbError::Query(
                            "start of the time range is after its end".into(),
                        ));
                    }
                }
            }
            Gid::After => {
                if let Wrap::Select(select) = &mut self.wrap {
                    select.start_ts = resolve_time_expr(&node.children[0].text, &self.db.time)?;
                }
            }
            Gid::Before => {
                if let Wrap::Select(select) = &mut self.wrap {
                    // `before t` excludes t itself.
                    let t = resolve_time_expr(&node.children[0].text, &self.db.time)?;
                    select.end_ts = t.saturating_sub(1);
                }
            }
            Gid::Aggregate => {
                if let Wrap::Select(select) = &mut self.wrap {
                    select.aggr = Some(Aggregation::from_node(node, &self.db.time)?);
                }
            }
            Gid::Columns => {
                let columns = node
                    .children_of(Gid::Column)
                    .map(|c| c.text.clone())
                    .collect();
                if let Wrap::List(list) = &mut self.wrap {
                    list.columns = columns;
                }
            }
            Gid::Limit => {
                if let Wrap::List(list) = &mut self.wrap {
                    list.limit = node.text.parse().unwrap_or(list.limit);
                }
            }
            Gid::IgnoreThreshold => {
                if let Wrap::Drop(drop) = &mut self.wrap {
                    drop.ignore_threshold = node.text == "true";
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn hdr_mut(&mut self) -> Option<&mut QueryHeader> {
        match &mut self.wrap {
            Wrap::Select(q) => Some(&mut q.hdr),
            Wrap::List(q) => Some(&mut q.hdr),
            Wrap::Count(q) => Some(&mut q.hdr),
            Wrap::Drop(q) => Some(&mut q.hdr),
            _ => None,
        }
    }

    async fn exit(&mut self, node: &Node) -> Result<()> {
        let result = match node.gid {
            Gid::Select => self.exit_select()?,
            Gid::List => self.exit_list()?,
            Gid::Count => self.exit_count()?,
            Gid::Drop => self.exit_drop(node)?,
            Gid::Alter => self.exit_alter(node)?,
            Gid::Create => self.exit_create(node)?,
            Gid::Grant => self.exit_grant(node, true)?,
            Gid::Revoke => self.exit_grant(node, false)?,
            Gid::Show => self.exit_show()?,
            _ => return Ok(()),
        };
        self.result = Some(result);
        Ok(())
    }

    // ───────────────────────── select ───────────────────────────────────────

    fn exit_select(&mut self) -> Result<QpVal> {
        let Wrap::Select(select) = &self.wrap else {
            return Err(TdbError::Query("malformed select".into()));
        };
        let limit = self.db.meta.lock().select_points_limit;
        let ids = self.filtered_series(&select.hdr)?;

        let mut entries = Vec::with_capacity(ids.len());
        let mut total = 0usize;
        for id in ids {
            let name = {
                let store = self.db.store.lock();
                match store.series.get(id) {
                    Some(s) => s.name.clone(),
                    None => continue,
                }
            };
            let points = self.db.get_points(id, select.start_ts, select.end_ts)?;
            total += points.len();
            if total > limit {
                return Err(TdbError::Query(format!(
                    "query hit the maximum number of selected points ({limit})"
                )));
            }
            let out = match &select.aggr {
                Some(aggr) => aggr.apply(&points)?,
                None => points,
            };
            entries.push((name, points_to_qp(&out)));
        }
        Ok(QpVal::Map(entries))
    }

    // ───────────────────────── list / count ─────────────────────────────────

    fn exit_list(&mut self) -> Result<QpVal> {
        let Wrap::List(list) = &self.wrap else {
            return Err(TdbError::Query("malformed list".into()));
        };
        let columns = if list.columns.is_empty() {
            default_columns(&list.target)?
        } else {
            list.columns.clone()
        };
        let rows = self.target_rows(&list.target, &list.hdr, &columns, list.limit)?;
        Ok(QpVal::Map(vec![
            (
                "columns".into(),
                QpVal::Arr(columns.into_iter().map(QpVal::Str).collect()),
            ),
            (list.target.clone(), QpVal::Arr(rows)),
        ]))
    }

    fn exit_count(&mut self) -> Result<QpVal> {
        let Wrap::Count(count) = &self.wrap else {
            return Err(TdbError::Query("malformed count".into()));
        };
        let n = self
            .target_rows(&count.target, &count.hdr, &["name".into()], usize::MAX)?
            .len();
        Ok(QpVal::Map(vec![(count.target.clone(), QpVal::Int(n as i64))]))
    }

    /// Rows for a list/count target, where-filtered and column-projected.
    fn target_rows(
        &self,
        target: &str,
        hdr: &QueryHeader,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<QpVal>> {
        let db = self.db;
        let mut rows = Vec::new();
        match target {
            "series" => {
                let ids = self.filtered_series(hdr)?;
                let store = db.store.lock();
                for id in ids.into_iter().take(limit) {
                    let Some(series) = store.series.get(id) else { continue };
                    rows.push(QpVal::Arr(
                        columns.iter().map(|c| series_col(series, c)).collect(),
                    ));
                }
            }
            "users" => {
                let users = db.users.lock();
                for user in users.iter() {
                    let keep = hdr.where_expr.as_ref().map_or(true, |e| {
                        e.eval(&|c| user_cb(&user.name, user.access, c))
                    });
                    if keep && rows.len() < limit {
                        rows.push(QpVal::Arr(
                            columns
                                .iter()
                                .map(|col| match col.as_str() {
                                    "name" => QpVal::Str(user.name.clone()),
                                    "access" => QpVal::Str(
                                        crate::db::access::access_to_str(user.access),
                                    ),
                                    _ => QpVal::Null,
                                })
                                .collect(),
                        ));
                    }
                }
            }
            "groups" => {
                let groups = db.groups.lock();
                for group in groups.iter() {
                    let keep = hdr.where_expr.as_ref().map_or(true, |e| {
                        e.eval(&|c| group_cb(&group.name, group.series.len(), &group.pattern, c))
                    });
                    if keep && rows.len() < limit {
                        rows.push(QpVal::Arr(
                            columns
                                .iter()
                                .map(|col| match col.as_str() {
                                    "name" => QpVal::Str(group.name.clone()),
                                    "series" => QpVal::Int(group.series.len() as i64),
                                    "expression" => QpVal::Str(group.pattern.clone()),
                                    _ => QpVal::Null,
                                })
                                .collect(),
                        ));
                    }
                }
            }
            "servers" => {
                let servers = db.servers.lock();
                for server in servers.iter() {
                    let keep = hdr.where_expr.as_ref().map_or(true, |e| {
                        e.eval(&|c| server_cb(server, c))
                    });
                    if keep && rows.len() < limit {
                        rows.push(QpVal::Arr(
                            columns
                                .iter()
                                .map(|col| match col.as_str() {
                                    "name" => QpVal::Str(server.name()),
                                    "address" => QpVal::Str(server.address.clone()),
                                    "port" => QpVal::Int(server.port as i64),
                                    "uuid" => QpVal::Str(server.uuid.to_string()),
                                    "pool" => QpVal::Int(server.pool as i64),
                                    "status" => QpVal::Str(server.status_str()),
                                    _ => QpVal::Null,
                                })
                                .collect(),
                        ));
                    }
                }
            }
            "pools" => {
                // Snapshot under each lock separately; pool and store
                // locks are never held together.
                let snapshot: Vec<(u16, usize)> = {
                    let pools = db.pools.lock();
                    pools
                        .pools
                        .iter()
                        .map(|p| (p.id, p.servers.len()))
                        .collect()
                };
                let mut counts = vec![0usize; snapshot.len()];
                {
                    let store = db.store.lock();
                    store.series.walk(|_, s| {
                        if let Some(n) = counts.get_mut(s.pool as usize) {
                            *n += 1;
                        }
                    });
                }
                for (pool_id, nservers) in snapshot {
                    let series_count = counts.get(pool_id as usize).copied().unwrap_or(0);
                    let keep = hdr.where_expr.as_ref().map_or(true, |e| {
                        e.eval(&|c| pool_cb(pool_id, nservers, series_count, c))
                    });
                    if keep && rows.len() < limit {
                        rows.push(QpVal::Arr(
                            columns
                                .iter()
                                .map(|col| match col.as_str() {
                                    "pool" => QpVal::Int(pool_id as i64),
                                    "servers" => QpVal::Int(nservers as i64),
                                    "series" => QpVal::Int(series_count as i64),
                                    _ => QpVal::Null,
                                })
                                .collect(),
                        ));
                    }
                }
            }
            "shards" => {
                let store = db.store.lock();
                for ((tp, id), shard) in store.shards.iter() {
                    let size = std::fs::metadata(&shard.path).map(|m| m.len()).unwrap_or(0);
                    let start = id * shard.duration;
                    let end = (id + 1) * shard.duration;
                    let keep = hdr.where_expr.as_ref().map_or(true, |e| {
                        e.eval(&|c| shard_cb(*id, size, start, end, *tp, shard.flags, c))
                    });
                    if keep && rows.len() < limit {
                        rows.push(QpVal::Arr(
                            columns
                                .iter()
                                .map(|col| match col.as_str() {
                                    "sid" => QpVal::Int(*id as i64),
                                    "size" => QpVal::Int(size as i64),
                                    "start" => QpVal::Int(start as i64),
                                    "end" => QpVal::Int(end as i64),
                                    "type" => QpVal::Str(
                                        match tp {
                                            ShardType::Num => "number",
                                            ShardType::Log => "log",
                                        }
                                        .into(),
                                    ),
                                    "status" => QpVal::Str(shard_status(shard.flags)),
                                    _ => QpVal::Null,
                                })
                                .collect(),
                        ));
                    }
                }
            }
            other => {
                return Err(TdbError::Query(format!(
                    "cannot list or count '{other}'"
                )))
            }
        }
        Ok(rows)
    }

    /// Series ids of the header, where-filtered. A series query without a
    /// match clause covers every series.
    fn filtered_series(&self, hdr: &QueryHeader) -> Result<Vec<u32>> {
        let store = self.db.store.lock();
        let mut ids = if hdr.series.is_empty() && self.match_all() {
            store.series.to_list()
        } else {
            hdr.series.clone()
        };
        if let Some(expr) = &hdr.where_expr {
            ids.retain(|id| {
                store
                    .series
                    .get(*id)
                    .is_some_and(|s| expr.eval(&|c| series_cb(s, c)))
            });
        }
        Ok(ids)
    }

    /// list/count/drop series without a from-clause address all series;
    /// select always has one.
    fn match_all(&self) -> bool {
        matches!(&self.wrap, Wrap::List(_) | Wrap::Count(_))
    }

    // ───────────────────────── drop ─────────────────────────────────────────

    fn exit_drop(&mut self, node: &Node) -> Result<QpVal> {
        let Wrap::Drop(drop) = &self.wrap else {
            return Err(TdbError::Query("malformed drop".into()));
        };
        match drop.target.as_str() {
            "user" => {
                let name = &node.child(Gid::UserName).unwrap().text;
                self.db.users.lock().drop_user(name)?;
                Ok(QpVal::success(format!("Dropped user '{name}'.")))
            }
            "group" => {
                let name = &node.child(Gid::GroupName).unwrap().text;
                self.db.groups.lock().drop_group(name)?;
                Ok(QpVal::success(format!("Dropped group '{name}'.")))
            }
            _ => {
                let ids = self.filtered_series(&drop.hdr)?;
                let db = self.db;
                let mut store = db.store.lock();

                // Refuse a drop wiping more than the configured share of
                // the database unless explicitly overridden.
                let threshold = db.meta.lock().drop_threshold;
                let total = store.series.len().max(1);
                if !drop.ignore_threshold
                    && (ids.len() as f64 / total as f64) > threshold
                {
                    return Err(TdbError::Query(format!(
                        "this query would drop {} of {} series; the drop \
                         threshold ({threshold}) blocks it, add 'set \
                         ignore_threshold true' to force",
                        ids.len(),
                        total
                    )));
                }

                let mut names = Vec::with_capacity(ids.len());
                for &id in &ids {
                    if let Some(s) = store.series.get(id) {
                        names.push(s.name.clone());
                    }
                    db.drop_prepare(&mut store, id)?;
                }
                db.sync_dropped(&mut store)?;
                for &id in &ids {
                    db.drop_commit(&mut store, id)?;
                }
                drop_series_forward(db, &names)?;
                info!(count = ids.len(), "Series dropped");
                Ok(QpVal::success(format!(
                    "successfully dropped {} series",
                    ids.len()
                )))
            }
        }
    }

    // ───────────────────────── alter / create ───────────────────────────────

    fn exit_alter(&mut self, node: &Node) -> Result<QpVal> {
        match node.text.as_str() {
            "user" => {
                let name = &node.child(Gid::UserName).unwrap().text;
                let pw = &node.child(Gid::Password).unwrap().text;
                self.db.users.lock().set_password(name, pw)?;
                Ok(QpVal::success(format!("Updated password for '{name}'.")))
            }
            "database" => {
                let prop = &node.child(Gid::SetProp).unwrap().text;
                let value = &node.child(Gid::Operand).unwrap().text;
                let mut meta = self.db.meta.lock();
                match prop.as_str() {
                    "drop_threshold" => {
                        let v: f64 = value
                            .parse()
                            .map_err(|_| TdbError::Query("expecting a number".into()))?;
                        if !(0.0..=1.0).contains(&v) {
                            return Err(TdbError::Query(
                                "drop_threshold must be between 0.0 and 1.0".into(),
                            ));
                        }
                        meta.drop_threshold = v;
                    }
                    "select_points_limit" => {
                        meta.select_points_limit = value
                            .parse()
                            .map_err(|_| TdbError::Query("expecting a number".into()))?;
                    }
                    "list_limit" => {
                        meta.list_limit = value
                            .parse()
                            .map_err(|_| TdbError::Query("expecting a number".into()))?;
                    }
                    "expiration_num" => {
                        meta.expiration_num = resolve_time_expr(value, &self.db.time)?;
                    }
                    "expiration_log" => {
                        meta.expiration_log = resolve_time_expr(value, &self.db.time)?;
                    }
                    other => {
                        return Err(TdbError::Query(format!(
                            "cannot alter database property '{other}'"
                        )))
                    }
                }
                drop(meta);
                self.db.save_meta()?;
                Ok(QpVal::success(format!("Updated {prop}.")))
            }
            "server" => {
                let enable = node
                    .child(Gid::BoolVal)
                    .is_some_and(|b| b.text == "true");
                if enable {
                    backup::enable(self.db)?;
                    Ok(QpVal::success("Backup mode enabled."))
                } else {
                    backup::disable(self.db)?;
                    Ok(QpVal::success("Backup mode disabled."))
                }
            }
            other => Err(TdbError::Query(format!("cannot alter '{other}'"))),
        }
    }

    fn exit_create(&mut self, node: &Node) -> Result<QpVal> {
        match node.text.as_str() {
            "user" => {
                let name = &node.child(Gid::UserName).unwrap().text;
                let pw = &node.child(Gid::Password).unwrap().text;
                self.db.users.lock().create(name, pw, 0)?;
                Ok(QpVal::success(format!("Created user '{name}'.")))
            }
            "group" => {
                let name = &node.child(Gid::GroupName).unwrap().text;
                let pattern = &node.child(Gid::SeriesRegex).unwrap().text;
                self.db.groups.lock().create(name, pattern)?;
                Ok(QpVal::success(format!("Created group '{name}'.")))
            }
            other => Err(TdbError::Query(format!("cannot create '{other}'"))),
        }
    }

    fn exit_grant(&mut self, node: &Node, grant: bool) -> Result<QpVal> {
        let name = &node.child(Gid::UserName).unwrap().text;
        let mut bits = 0u32;
        for flag in node.child(Gid::AccessList).unwrap().children_of(Gid::AccessFlag) {
            let bit = access_from_str(&flag.text);
            if bit == 0 {
                return Err(TdbError::Query(format!(
                    "unknown access flag '{}'",
                    flag.text
                )));
            }
            bits |= bit;
        }
        let mut users = self.db.users.lock();
        if grant {
            users.grant(name, bits)?;
            Ok(QpVal::success(format!("Granted access to '{name}'.")))
        } else {
            users.revoke(name, bits)?;
            Ok(QpVal::success(format!("Revoked access from '{name}'.")))
        }
    }

    // ───────────────────────── show ─────────────────────────────────────────

    fn exit_show(&mut self) -> Result<QpVal> {
        let Wrap::Show(fields) = &self.wrap else {
            return Err(TdbError::Query("malformed show".into()));
        };
        let all = [
            "dbname",
            "time_precision",
            "server",
            "uuid",
            "pool",
            "status",
            "buffer_size",
            "duration_num",
            "duration_log",
            "select_points_limit",
            "list_limit",
            "version",
            "who_am_i",
        ];
        let fields: Vec<String> = if fields.is_empty() {
            all.iter().map(|s| s.to_string()).collect()
        } else {
            fields.clone()
        };

        let db = self.db;
        let meta = db.meta.lock();
        let mut data = Vec::new();
        for field in &fields {
            let value = match field.as_str() {
                "dbname" => QpVal::Str(meta.name.clone()),
                "time_precision" => QpVal::Str(meta.precision.as_str().into()),
                "server" => QpVal::Str(db.server.name()),
                "uuid" => QpVal::Str(db.server.uuid.to_string()),
                "pool" => QpVal::Int(db.server.pool as i64),
                "status" => QpVal::Str(db.server.status_str()),
                "buffer_size" => QpVal::Int(meta.buffer_size as i64),
                "duration_num" => QpVal::Int(meta.duration_num as i64),
                "duration_log" => QpVal::Int(meta.duration_log as i64),
                "select_points_limit" => QpVal::Int(meta.select_points_limit as i64),
                "list_limit" => QpVal::Int(meta.list_limit as i64),
                "version" => QpVal::Str(env!("CARGO_PKG_VERSION").into()),
                "who_am_i" => QpVal::Str(self.user.into()),
                other => {
                    return Err(TdbError::Query(format!("unknown show field '{other}'")))
                }
            };
            data.push(QpVal::Map(vec![
                ("name".into(), QpVal::Str(field.clone())),
                ("value".into(), value),
            ]));
        }
        Ok(QpVal::Map(vec![("data".into(), QpVal::Arr(data))]))
    }
}

// ─────────────────────────── series matching ────────────────────────────────

fn resolve_series_match(db: &Arc<Database>, node: &Node) -> Result<Vec<u32>> {
    let mut acc: Vec<u32> = Vec::new();
    for (i, term) in node.children.iter().enumerate() {
        let (gid, inner) = match term.gid {
            Gid::SetUnion | Gid::SetIntersection | Gid::SetDifference => {
                (term.gid, &term.children[0])
            }
            _ => (Gid::SetUnion, term),
        };
        let ids = resolve_series_term(db, inner)?;
        if i == 0 {
            acc = ids;
            continue;
        }
        match gid {
            Gid::SetUnion => {
                let have: HashSet<u32> = acc.iter().copied().collect();
                acc.extend(ids.into_iter().filter(|id| !have.contains(id)));
            }
            Gid::SetIntersection => {
                let keep: HashSet<u32> = ids.into_iter().collect();
                acc.retain(|id| keep.contains(id));
            }
            Gid::SetDifference => {
                let gone: HashSet<u32> = ids.into_iter().collect();
                acc.retain(|id| !gone.contains(id));
            }
            _ => unreachable!(),
        }
    }
    Ok(acc)
}

fn resolve_series_term(db: &Arc<Database>, term: &Node) -> Result<Vec<u32>> {
    match term.gid {
        Gid::SeriesName => Ok(db
            .series_id(&term.text)
            .map(|id| vec![id])
            .unwrap_or_default()),
        Gid::SeriesRegex => {
            let re = compile_pattern(&term.text)?;
            let store = db.store.lock();
            let mut ids = Vec::new();
            store.trie.items(|key, &id| {
                if let Ok(name) = std::str::from_utf8(key) {
                    if re.is_match(name) {
                        ids.push(id);
                    }
                }
            });
            Ok(ids)
        }
        Gid::SeriesGroup => {
            let groups = db.groups.lock();
            let group = groups
                .get(&term.text)
                .ok_or_else(|| TdbError::Query(format!("unknown group '{}'", term.text)))?;
            let store = db.store.lock();
            Ok(group
                .series
                .iter()
                .copied()
                .filter(|&id| store.series.get(id).is_some_and(|s| !s.is_dropped()))
                .collect())
        }
        _ => Err(TdbError::Query("invalid series match".into())),
    }
}

/// Forward a series drop to the replica through the fifo.
fn drop_series_forward(db: &Arc<Database>, names: &[String]) -> Result<()> {
    let Some(fifo) = &db.fifo else {
        return Ok(());
    };
    let mut packer = Packer::new();
    packer.open_array();
    for name in names {
        packer.add_string(name);
    }
    packer.close_array();
    let pkg = Pkg::new(0, protocol::BPROTO_DROP_SERIES, packer.into_bytes());
    fifo.lock().append(&pkg.encode())
}

// ─────────────────────────── property callbacks ─────────────────────────────

fn series_cb(series: &Series, cond: &Condition) -> bool {
    match cond.prop.as_str() {
        "name" => cmp_str(cond.op, &series.name, cond),
        "length" => cmp_int(cond.op, series.length as i64, cond),
        "start" => cmp_int(cond.op, series.start.min(i64::MAX as u64) as i64, cond),
        "end" => cmp_int(cond.op, series.end as i64, cond),
        "pool" => cmp_int(cond.op, series.pool as i64, cond),
        "type" => cmp_str(cond.op, series.tp.as_str(), cond),
        _ => false,
    }
}

fn server_cb(server: &crate::cluster::server::Server, cond: &Condition) -> bool {
    match cond.prop.as_str() {
        "name" => cmp_str(cond.op, &server.name(), cond),
        "address" => cmp_str(cond.op, &server.address, cond),
        "port" => cmp_int(cond.op, server.port as i64, cond),
        "uuid" => cmp_str(cond.op, &server.uuid.to_string(), cond),
        "pool" => cmp_int(cond.op, server.pool as i64, cond),
        "status" => cmp_str(cond.op, &server.status_str(), cond),
        _ => false,
    }
}

fn pool_cb(pool: u16, servers: usize, series: usize, cond: &Condition) -> bool {
    match cond.prop.as_str() {
        "pool" => cmp_int(cond.op, pool as i64, cond),
        "servers" => cmp_int(cond.op, servers as i64, cond),
        "series" => cmp_int(cond.op, series as i64, cond),
        _ => false,
    }
}

fn user_cb(name: &str, access: u32, cond: &Condition) -> bool {
    match cond.prop.as_str() {
        "name" => cmp_str(cond.op, name, cond),
        "access" => cmp_str(cond.op, &crate::db::access::access_to_str(access), cond),
        _ => false,
    }
}

fn group_cb(name: &str, series: usize, expression: &str, cond: &Condition) -> bool {
    match cond.prop.as_str() {
        "name" => cmp_str(cond.op, name, cond),
        "series" => cmp_int(cond.op, series as i64, cond),
        "expression" => cmp_str(cond.op, expression, cond),
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn shard_cb(
    sid: u64,
    size: u64,
    start: u64,
    end: u64,
    tp: ShardType,
    flags: u8,
    cond: &Condition,
) -> bool {
    match cond.prop.as_str() {
        "sid" => cmp_int(cond.op, sid as i64, cond),
        "size" => cmp_int(cond.op, size as i64, cond),
        "start" => cmp_int(cond.op, start as i64, cond),
        "end" => cmp_int(cond.op, end as i64, cond),
        "type" => cmp_str(
            cond.op,
            match tp {
                ShardType::Num => "number",
                ShardType::Log => "log",
            },
            cond,
        ),
        "status" => cmp_str(cond.op, &shard_status(flags), cond),
        _ => false,
    }
}

fn shard_status(flags: u8) -> String {
    if flags & FLAG_IS_REMOVED != 0 {
        "removed".into()
    } else if flags & FLAG_IS_CORRUPT != 0 {
        "corrupt".into()
    } else if flags
        & (crate::storage::shard::FLAG_HAS_OVERLAP
            | crate::storage::shard::FLAG_HAS_NEW_VALUES
            | crate::storage::shard::FLAG_HAS_DROPPED_SERIES)
        != 0
    {
        "optimizing required".into()
    } else {
        "ok".into()
    }
}

fn default_columns(target: &str) -> Result<Vec<String>> {
    let cols: &[&str] = match target {
        "series" => &["name"],
        "users" => &["name", "access"],
        "groups" => &["name", "series"],
        "servers" => &["name", "pool", "status"],
        "pools" => &["pool", "servers", "series"],
        "shards" => &["sid", "start", "end", "type", "size", "status"],
        other => {
            return Err(TdbError::Query(format!("cannot list or count '{other}'")))
        }
    };
    Ok(cols.iter().map(|s| s.to_string()).collect())
}

fn series_col(series: &Series, col: &str) -> QpVal {
    match col {
        "name" => QpVal::Str(series.name.clone()),
        "pool" => QpVal::Int(series.pool as i64),
        "start" => {
            if series.length == 0 {
                QpVal::Null
            } else {
                QpVal::Int(series.start as i64)
            }
        }
        "end" => QpVal::Int(series.end as i64),
        "length" => QpVal::Int(series.length as i64),
        "type" => QpVal::Str(series.tp.as_str().into()),
        _ => QpVal::Null,
    }
}

fn points_to_qp(points: &Points) -> QpVal {
    QpVal::Arr(
        points
            .iter()
            .map(|p| {
                let val = match &p.val {
                    Value::Int(v) => QpVal::Int(*v),
                    Value::Double(v) => QpVal::Double(*v),
                    Value::Log(raw) => {
                        QpVal::Str(String::from_utf8_lossy(raw).into_owned())
                    }
                };
                QpVal::Arr(vec![QpVal::Int(p.ts as i64), val])
            })
            .collect(),
    )
}
