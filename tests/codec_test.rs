// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Codec round-trip properties over generated point vectors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tidepool::points::{PointType, Points, Value};
use tidepool::storage::codec::{size_for, unzip, zip};

fn roundtrip(points: &Points, start: usize, end: usize) {
    let (cinfo, bytes) = zip(points, start, end);
    assert_eq!(
        bytes.len(),
        size_for(cinfo, end - start),
        "size law violated for range {start}..{end}"
    );
    let out = unzip(&bytes, end - start, cinfo, points.tp()).expect("unzip");
    assert_eq!(
        out.as_slice(),
        &points.as_slice()[start..end],
        "round trip broke for range {start}..{end}"
    );
}

fn check_all_ranges(points: &Points) {
    let len = points.len();
    let ranges = [
        (0, len),
        (0, 1),
        (0, len / 2 + 1),
        (len / 3, len),
        (len / 3, 2 * len / 3 + 1),
    ];
    for (a, b) in ranges {
        if a < b && b <= len {
            roundtrip(points, a, b);
        }
    }
}

#[test]
fn test_int_roundtrip_generated_vectors() {
    let mut rng = StdRng::seed_from_u64(0x7d1e);
    for len in [2usize, 3, 5, 17, 64, 255, 1024] {
        let mut points = Points::new(len, PointType::Int);
        let mut ts = rng.gen_range(1_000_000u64..2_000_000);
        for _ in 0..len {
            ts += rng.gen_range(1u64..400);
            let val = rng.gen_range(-1_000_000i64..1_000_000);
            points.add_point(ts, Value::Int(val)).unwrap();
        }
        check_all_ranges(&points);
    }
}

#[test]
fn test_int_roundtrip_extreme_values() {
    let mut points = Points::new(6, PointType::Int);
    for (i, v) in [i64::MIN, i64::MAX, 0, -1, i64::MAX, i64::MIN]
        .into_iter()
        .enumerate()
    {
        points.add_point(100 + i as u64, Value::Int(v)).unwrap();
    }
    check_all_ranges(&points);
}

#[test]
fn test_int_roundtrip_constant_timestamps_gap() {
    // Large shared timestamp prefix with small varying tail.
    let mut points = Points::new(64, PointType::Int);
    let base = 1u64 << 40;
    for i in 0..64u64 {
        points
            .add_point(base + i * 1000, Value::Int((i % 7) as i64))
            .unwrap();
    }
    check_all_ranges(&points);
}

#[test]
fn test_double_roundtrip_generated_vectors() {
    let mut rng = StdRng::seed_from_u64(0xd0b1e);
    for len in [2usize, 3, 9, 33, 128, 1024] {
        let mut points = Points::new(len, PointType::Double);
        let mut ts = rng.gen_range(1_000_000u64..2_000_000);
        for _ in 0..len {
            ts += rng.gen_range(1u64..400);
            let val = rng.gen_range(-1e6f64..1e6);
            points.add_point(ts, Value::Double(val)).unwrap();
        }
        check_all_ranges(&points);
    }
}

#[test]
fn test_double_roundtrip_special_values() {
    let vals = [
        0.0f64,
        -0.0,
        1.0,
        -1.0,
        f64::MIN_POSITIVE,
        f64::MAX,
        f64::MIN,
        f64::INFINITY,
        f64::NEG_INFINITY,
        std::f64::consts::PI,
    ];
    let mut points = Points::new(vals.len(), PointType::Double);
    for (i, v) in vals.into_iter().enumerate() {
        points.add_point(10 + i as u64, Value::Double(v)).unwrap();
    }
    // Bit-exact comparison, including negative zero.
    let (cinfo, bytes) = zip(&points, 0, points.len());
    let out = unzip(&bytes, points.len(), cinfo, PointType::Double).unwrap();
    for (a, b) in points.iter().zip(out.iter()) {
        assert_eq!(a.ts, b.ts);
        let (Value::Double(x), Value::Double(y)) = (&a.val, &b.val) else {
            panic!()
        };
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn test_double_compression_beats_raw_for_stable_values() {
    // Values differing in one byte position should pack far below the raw
    // 16 bytes per point.
    let mut points = Points::new(256, PointType::Double);
    for i in 0..256u64 {
        let val = f64::from_bits(4_638_000_000_000_000_000u64 | (i % 200) << 8);
        points.add_point(1000 + i * 60, Value::Double(val)).unwrap();
    }
    let (cinfo, bytes) = zip(&points, 0, 256);
    assert!(bytes.len() < 256 * 8);
    assert_eq!(bytes.len(), size_for(cinfo, 256));
    roundtrip(&points, 0, 256);
}

#[test]
fn test_log_roundtrip_generated_vectors() {
    let mut rng = StdRng::seed_from_u64(0x106);
    for len in [2usize, 8, 100] {
        let mut points = Points::new(len, PointType::Log);
        let mut ts = 500u64;
        for _ in 0..len {
            ts += rng.gen_range(1u64..60);
            let n = rng.gen_range(0usize..300);
            let msg: Vec<u8> = (0..n).map(|_| rng.gen::<u8>()).collect();
            points.add_point(ts, Value::Log(msg)).unwrap();
        }
        let (cinfo, bytes) = zip(&points, 0, len);
        let out = unzip(&bytes, len, cinfo, PointType::Log).unwrap();
        assert_eq!(out.as_slice(), points.as_slice());
    }
}

#[test]
fn test_duplicate_timestamps_survive() {
    let mut points = Points::new(8, PointType::Int);
    for (ts, v) in [(10u64, 1i64), (10, 2), (10, 3), (20, 4), (20, 5)] {
        points.add_point(ts, Value::Int(v)).unwrap();
    }
    check_all_ranges(&points);
}
