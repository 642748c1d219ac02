// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Insert pipeline.
//!
//! An insert payload is a map (or alternating array) of series names to
//! points; a points item is one `[ts, value]` pair or an array of pairs.
//! The pipeline walks the payload once, validating as it goes, partitions
//! the series over their pools, forwards every non-local pool's slice as a
//! single packet, applies the local slice point by point and finally
//! queues the local slice for the replica.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::server::FLAG_REINDEXING;
use crate::db::Database;
use crate::error::{Result, TdbError};
use crate::net::pkg::Pkg;
use crate::net::promise::DEFAULT_TIMEOUT;
use crate::net::protocol;
use crate::points::Value;
use crate::qpack::{Obj, Packer, Unpacker};

/// Suggested allocation for a per-pool packer.
pub const QP_SUGGESTED_SIZE: usize = 65_536;

/// Validation failures while walking an insert payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertErr {
    ExpectingArray,
    ExpectingSeriesName,
    ExpectingMapOrArray,
    ExpectingIntegerTs,
    TsOutOfRange,
    UnsupportedValue,
    EmptyPoints,
    ExpectingNameAndPoints,
}

impl InsertErr {
    pub fn msg(self) -> &'static str {
        match self {
            InsertErr::ExpectingArray => "Expecting an array of points",
            InsertErr::ExpectingSeriesName => "Expecting a series name",
            InsertErr::ExpectingMapOrArray => "Expecting a map or array with series",
            InsertErr::ExpectingIntegerTs => "Expecting an integer timestamp",
            InsertErr::TsOutOfRange => "Timestamp is out of range",
            InsertErr::UnsupportedValue => "Unsupported value received",
            InsertErr::EmptyPoints => "Series must have at least one point",
            InsertErr::ExpectingNameAndPoints => {
                "Expecting a series name with points"
            }
        }
    }
}

impl From<InsertErr> for TdbError {
    fn from(e: InsertErr) -> Self {
        TdbError::Insert(e.msg().to_string())
    }
}

/// One series slice of a parsed payload; the name borrows the input.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSeries<'a> {
    pub name: &'a str,
    pub points: Vec<(u64, Value)>,
}

type InsertResult<T> = std::result::Result<T, InsertErr>;

/// Walk the payload with a zero-copy unpacker, validating structure and
/// value types.
pub fn parse_payload(data: &[u8]) -> InsertResult<Vec<ParsedSeries<'_>>> {
    let mut up = Unpacker::new(data);
    let mut out = Vec::new();

    enum Outer {
        Fixed(usize),
        Open,
    }
    let outer = match up.next_obj().map_err(|_| InsertErr::ExpectingMapOrArray)? {
        Obj::Map(n) => Outer::Fixed(n),
        Obj::Array(n) => Outer::Fixed(n),
        Obj::MapOpen | Obj::ArrayOpen => Outer::Open,
        _ => return Err(InsertErr::ExpectingMapOrArray),
    };

    let mut remaining = match outer {
        Outer::Fixed(n) => n,
        Outer::Open => usize::MAX,
    };

    while remaining > 0 {
        if matches!(outer, Outer::Open) {
            match up.peek() {
                Ok(Obj::MapClose) | Ok(Obj::ArrayClose) => {
                    let _ = up.next_obj();
                    break;
                }
                Err(_) if up.at_end() => break,
                _ => {}
            }
        } else if up.at_end() {
            break;
        }

        let name = match up.next_obj() {
            Ok(Obj::Raw(raw)) => {
                std::str::from_utf8(raw).map_err(|_| InsertErr::ExpectingSeriesName)?
            }
            _ => return Err(InsertErr::ExpectingSeriesName),
        };
        let points = parse_points(&mut up)?;
        if points.is_empty() {
            return Err(InsertErr::EmptyPoints);
        }
        out.push(ParsedSeries { name, points });
        if remaining != usize::MAX {
            remaining -= 1;
        }
    }

    if out.is_empty() {
        return Err(InsertErr::ExpectingNameAndPoints);
    }
    Ok(out)
}

fn parse_points(up: &mut Unpacker<'_>) -> InsertResult<Vec<(u64, Value)>> {
    let header = up.next_obj().map_err(|_| InsertErr::ExpectingArray)?;
    match header {
        // A fixed two-element array is either one point or a list of two.
        Obj::Array(n) => {
            if let Ok(Obj::Int(_)) = up.peek() {
                if n != 2 {
                    return Err(InsertErr::ExpectingArray);
                }
                Ok(vec![parse_point_body(up)?])
            } else {
                (0..n).map(|_| parse_point(up)).collect()
            }
        }
        Obj::ArrayOpen => {
            let mut points = Vec::new();
            loop {
                match up.peek().map_err(|_| InsertErr::ExpectingArray)? {
                    Obj::ArrayClose => {
                        let _ = up.next_obj();
                        break;
                    }
                    _ => points.push(parse_point(up)?),
                }
            }
            Ok(points)
        }
        _ => Err(InsertErr::ExpectingArray),
    }
}

/// One `[ts, value]` pair including its array header.
fn parse_point(up: &mut Unpacker<'_>) -> InsertResult<(u64, Value)> {
    match up.next_obj().map_err(|_| InsertErr::ExpectingArray)? {
        Obj::Array(2) => parse_point_body(up),
        Obj::ArrayOpen => {
            let point = parse_point_body(up)?;
            match up.next_obj() {
                Ok(Obj::ArrayClose) => Ok(point),
                _ => Err(InsertErr::ExpectingArray),
            }
        }
        _ => Err(InsertErr::ExpectingArray),
    }
}

fn parse_point_body(up: &mut Unpacker<'_>) -> InsertResult<(u64, Value)> {
    let ts = match up.next_obj().map_err(|_| InsertErr::ExpectingIntegerTs)? {
        Obj::Int(ts) if ts >= 0 => ts as u64,
        Obj::Int(_) => return Err(InsertErr::TsOutOfRange),
        _ => return Err(InsertErr::ExpectingIntegerTs),
    };
    let val = match up.next_obj().map_err(|_| InsertErr::UnsupportedValue)? {
        Obj::Int(v) => Value::Int(v),
        Obj::Double(v) => Value::Double(v),
        Obj::Raw(raw) => Value::Log(raw.to_vec()),
        _ => return Err(InsertErr::UnsupportedValue),
    };
    Ok((ts, val))
}

/// Re-encode one series slice into a packer.
fn pack_series(packer: &mut Packer, series: &ParsedSeries<'_>) {
    packer.add_string(series.name);
    packer.open_array();
    for (ts, val) in &series.points {
        packer.fixed_array(2);
        packer.add_int(*ts as i64);
        match val {
            Value::Int(v) => packer.add_int(*v),
            Value::Double(v) => packer.add_double(*v),
            Value::Log(raw) => packer.add_raw(raw),
        }
    }
    packer.close_array();
}

/// Partition a parsed payload over `num_pools` packers; each packer ends
/// up a complete insert payload of its own. Returns per-pool packers
/// (None for pools without data) and the total point count.
pub fn assign_pools<F>(
    parsed: &[ParsedSeries<'_>],
    num_pools: usize,
    pool_for: F,
) -> (Vec<Option<Packer>>, usize)
where
    F: Fn(&str) -> u16,
{
    let suggested = QP_SUGGESTED_SIZE / ((num_pools / 4) + 1);
    let mut packers: Vec<Option<Packer>> = (0..num_pools).map(|_| None).collect();
    let mut total = 0usize;

    for series in parsed {
        let pool = pool_for(series.name) as usize;
        let packer = packers[pool].get_or_insert_with(|| {
            let mut p = Packer::with_capacity(suggested);
            p.open_map();
            p
        });
        pack_series(packer, series);
        total += series.points.len();
    }
    for packer in packers.iter_mut().flatten() {
        packer.close_map();
    }
    (packers, total)
}

/// Apply one payload locally, point by point. Used for the local slice of
/// a client insert and for forwarded `INSERT_POOL` / `INSERT_SERVER`
/// packets from peers; duplicate delivery is safe because duplicate
/// points are preserved and flagged, never corrupting series state.
pub fn insert_local(db: &Database, data: &[u8]) -> Result<usize> {
    let parsed = parse_payload(data).map_err(TdbError::from)?;
    let mut count = 0;
    for series in &parsed {
        for (ts, val) in &series.points {
            db.insert_point(series.name, *ts, val.clone())?;
            count += 1;
        }
    }
    db.flush_log()?;
    Ok(count)
}

/// Full client insert: validate, partition by pool, forward remote
/// slices, apply the local slice, queue the local slice for the replica.
/// Returns the total number of points for the `success_msg` reply.
pub async fn insert(db: &Arc<Database>, data: &[u8]) -> Result<usize> {
    let parsed = parse_payload(data).map_err(TdbError::from)?;

    let (local_pool, num_pools) = {
        let pools = db.pools.lock();
        (pools.local, pools.len())
    };
    let (packers, total) = {
        let pools = db.pools.lock();
        assign_pools(&parsed, num_pools, |name| pools.pool_for(name.as_bytes()))
    };

    // Every remote pool must be reachable before anything is applied.
    {
        let pools = db.pools.lock();
        for (pool, packer) in packers.iter().enumerate() {
            if packer.is_some()
                && pool != local_pool as usize
                && !pools.get(pool as u16).is_some_and(|p| p.accessible())
            {
                return Err(TdbError::Pool(
                    "At least one pool has no server available to process the request"
                        .into(),
                ));
            }
        }
    }

    let insert_tp = if db.server.flags() & FLAG_REINDEXING != 0 {
        protocol::BPROTO_INSERT_TEST_POOL
    } else {
        protocol::BPROTO_INSERT_POOL
    };

    let mut local_payload: Option<Vec<u8>> = None;
    let mut forwards = Vec::new();
    for (pool, packer) in packers.into_iter().enumerate() {
        let Some(packer) = packer else { continue };
        if pool == local_pool as usize {
            local_payload = Some(packer.into_bytes());
        } else {
            forwards.push((pool as u16, packer.into_bytes()));
        }
    }

    // Forward remote slices and wait for the whole fan-out.
    let mut pending = Vec::new();
    for (pool, payload) in forwards {
        let db = db.clone();
        pending.push(tokio::spawn(async move {
            let server = {
                let pools = db.pools.lock();
                pools
                    .get(pool)
                    .and_then(|p| p.pick_accessible())
                    .ok_or_else(|| {
                        TdbError::Pool(
                            "At least one pool has no server available to process the request"
                                .into(),
                        )
                    })?
            };
            let reply = server.send_pkg(insert_tp, payload, DEFAULT_TIMEOUT).await?;
            if protocol::is_bproto_ack(reply.tp) {
                Ok(())
            } else {
                Err(TdbError::Pool(format!(
                    "pool {pool} rejected the insert ({})",
                    protocol::type_name(reply.tp)
                )))
            }
        }));
    }
    for handle in pending {
        handle
            .await
            .map_err(|e| TdbError::Transport(format!("forward task failed: {e}")))??;
    }

    // Local slice: apply, then queue for the replica.
    if let Some(payload) = local_payload {
        insert_local(db, &payload)?;
        if let Some(fifo) = &db.fifo {
            let pkg = Pkg::new(0, protocol::BPROTO_INSERT_SERVER, payload);
            fifo.lock().append(&pkg.encode())?;
        }
    }

    debug!(points = total, "Insert complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::lookup::name_sum;

    fn payload_one_series() -> Vec<u8> {
        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.open_array();
        for (ts, v) in [(10i64, 1i64), (20, 2), (30, 3)] {
            p.fixed_array(2);
            p.add_int(ts);
            p.add_int(v);
        }
        p.close_array();
        p.into_bytes()
    }

    #[test]
    fn test_parse_map_of_series() {
        let data = payload_one_series();
        let parsed = parse_payload(&data).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "cpu");
        assert_eq!(
            parsed[0].points,
            vec![
                (10, Value::Int(1)),
                (20, Value::Int(2)),
                (30, Value::Int(3))
            ]
        );
    }

    #[test]
    fn test_parse_single_point_form() {
        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.fixed_array(2);
        p.add_int(10);
        p.add_double(0.5);
        let bytes = p.into_bytes();
        let parsed = parse_payload(&bytes).unwrap();
        assert_eq!(parsed[0].points, vec![(10, Value::Double(0.5))]);
    }

    #[test]
    fn test_parse_string_value() {
        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("events");
        p.fixed_array(2);
        p.add_int(10);
        p.add_string("reboot");
        let bytes = p.into_bytes();
        let parsed = parse_payload(&bytes).unwrap();
        assert_eq!(parsed[0].points, vec![(10, Value::Log(b"reboot".to_vec()))]);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let mut p = Packer::new();
        p.add_int(5);
        assert_eq!(
            parse_payload(&p.into_bytes()),
            Err(InsertErr::ExpectingMapOrArray)
        );

        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_int(7);
        assert_eq!(
            parse_payload(&p.into_bytes()),
            Err(InsertErr::ExpectingSeriesName)
        );

        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.fixed_array(2);
        p.add_string("not-a-ts");
        p.add_int(1);
        assert_eq!(
            parse_payload(&p.into_bytes()),
            Err(InsertErr::ExpectingIntegerTs)
        );

        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.fixed_array(2);
        p.add_int(-5);
        p.add_int(1);
        assert_eq!(parse_payload(&p.into_bytes()), Err(InsertErr::TsOutOfRange));

        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.fixed_array(2);
        p.add_int(10);
        p.add_bool(true);
        assert_eq!(
            parse_payload(&p.into_bytes()),
            Err(InsertErr::UnsupportedValue)
        );

        let mut p = Packer::new();
        p.fixed_map(1);
        p.add_string("cpu");
        p.open_array();
        p.close_array();
        assert_eq!(parse_payload(&p.into_bytes()), Err(InsertErr::EmptyPoints));
    }

    #[test]
    fn test_assign_pools_partitions_disjointly() {
        // 256 distinct names spread over two pools by their 8-bit sum.
        let names: Vec<String> = (0..256).map(|i| format!("series-{i:03}")).collect();
        let mut p = Packer::new();
        p.open_map();
        for name in &names {
            p.add_string(name);
            p.fixed_array(2);
            p.add_int(1);
            p.add_int(1);
        }
        p.close_map();
        let data = p.into_bytes();
        let parsed = parse_payload(&data).unwrap();

        let pool_of = |name: &str| (name_sum(name.as_bytes()) % 2) as u16;
        let (packers, total) = assign_pools(&parsed, 2, pool_of);
        assert_eq!(total, 256);

        // Both packers re-parse into valid payloads whose union is the
        // input and whose names all map to the right pool.
        let mut seen = 0;
        for (pool, packer) in packers.iter().enumerate() {
            let packer = packer.as_ref().expect("both pools should have data");
            let bytes = packer.as_slice().to_vec();
            let slice = parse_payload(&bytes).unwrap();
            assert!(!slice.is_empty());
            for s in &slice {
                assert_eq!(pool_of(s.name) as usize, pool);
                assert!(names.contains(&s.name.to_string()));
                seen += 1;
            }
        }
        assert_eq!(seen, 256);
    }
}
