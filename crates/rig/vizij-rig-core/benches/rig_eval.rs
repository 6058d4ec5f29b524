//! Benchmarks for rig evaluation.
//!
//! Run with: cargo bench -p vizij-rig-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::DVector;
use vizij_rig_core::{parse_rig_definition_json, DiffData, RigConfig, RigLogic};

fn face_sample() -> RigLogic {
    let json = vizij_test_fixtures::rigs::json("face-sample").expect("fixture json");
    let def = parse_rig_definition_json(&json).expect("rig definition parses");
    RigLogic::init(&def, RigConfig::default()).expect("rig initializes")
}

fn evaluate(rig: &RigLogic, gui: &DiffData, lod: usize) -> (DiffData, DiffData) {
    let raw = rig.evaluate_raw_controls(gui).expect("raw");
    let controls = rig.evaluate_psd(&raw, &[]).expect("psd");
    let joints = rig.evaluate_joints(&controls, lod).expect("joints");
    let maps = rig.evaluate_animated_maps(&controls, lod).expect("maps");
    (joints, maps)
}

fn bench_init(c: &mut Criterion) {
    let json = vizij_test_fixtures::rigs::json("face-sample").expect("fixture json");
    c.bench_function("init_face_sample", |b| {
        b.iter(|| {
            let def = parse_rig_definition_json(black_box(&json)).expect("parse");
            RigLogic::init(&def, RigConfig::default()).expect("init")
        })
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let rig = face_sample();
    let values = DVector::from_vec(vec![0.5, 0.3, 0.6, 0.4]);
    let mut group = c.benchmark_group("evaluate_face_sample");
    for lod in 0..rig.lod_count() {
        group.bench_with_input(BenchmarkId::new("values", lod), &lod, |b, &lod| {
            let gui = DiffData::constant(values.clone());
            b.iter(|| evaluate(&rig, black_box(&gui), lod))
        });
        group.bench_with_input(BenchmarkId::new("with_jacobian", lod), &lod, |b, &lod| {
            let gui = DiffData::variable(values.clone());
            b.iter(|| evaluate(&rig, black_box(&gui), lod))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_init, bench_evaluate);
criterion_main!(benches);
