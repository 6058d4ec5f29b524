use nalgebra::{DMatrix, DVector};
use vizij_rig_core::{
    parse_rig_definition_json, DiffData, RigConfig, RigDefinition, RigError, RigLogic,
    DEG_TO_RAD,
};

fn approx(a: f64, b: f64, eps: f64) {
    assert!((a - b).abs() <= eps, "left={a} right={b} eps={eps}");
}

fn approx_slice(actual: &[f64], expected: &[f64], eps: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, b)) in actual.iter().zip(expected).enumerate() {
        assert!((a - b).abs() <= eps, "index {i}: left={a} right={b} eps={eps}");
    }
}

fn load_def(name: &str) -> RigDefinition {
    let json = vizij_test_fixtures::rigs::json(name).expect("fixture json");
    parse_rig_definition_json(&json).expect("rig definition parses")
}

fn load(name: &str) -> RigLogic {
    RigLogic::init(&load_def(name), RigConfig::default()).expect("rig initializes")
}

/// GUI -> full control vector -> joints and animated maps at `lod`, without Jacobians.
fn pipeline(
    rig: &RigLogic,
    gui: &[f64],
    lod: usize,
) -> (DVector<f64>, DVector<f64>, DVector<f64>, DVector<f64>) {
    let raw = rig.evaluate_raw_controls(&DiffData::from_slice(gui)).unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    let joints = rig.evaluate_joints(&controls, lod).unwrap();
    let maps = rig.evaluate_animated_maps(&controls, lod).unwrap();
    (
        raw.value().clone(),
        controls.value().clone(),
        joints.value().clone(),
        maps.value().clone(),
    )
}

#[test]
fn minimal_rig_maps_and_clamps_gui_values() {
    let rig = load("minimal");
    assert_eq!(rig.counts().gui, 2);
    assert_eq!(rig.counts().raw, 2);

    let raw = rig.evaluate_raw_controls(&DiffData::from_slice(&[0.5, 0.0])).unwrap();
    approx_slice(raw.value().as_slice(), &[0.5, 0.0], 1e-12);
    assert!(!raw.has_jacobian());

    // above the domain clamps to the segment end, below to its start
    let raw = rig.evaluate_raw_controls(&DiffData::from_slice(&[1.5, -0.5])).unwrap();
    approx_slice(raw.value().as_slice(), &[1.0, 0.0], 1e-12);
}

#[test]
fn minimal_rig_jacobian_is_identity_inside_domain() {
    let rig = load("minimal");
    let gui = DiffData::variable(DVector::from_vec(vec![0.5, 0.25]));
    let raw = rig.evaluate_raw_controls(&gui).unwrap();
    let jac = raw.jacobian().expect("jacobian").to_dense();
    assert_eq!(jac, DMatrix::identity(2, 2));
}

#[test]
fn raw_values_outside_unit_interval_have_no_control_gradient() {
    let mut def = load_def("minimal");
    def.gui_to_raw.slope_values[0] = 3.0;
    let rig = RigLogic::init(&def, RigConfig::default()).unwrap();

    let raw = rig
        .evaluate_raw_controls(&DiffData::variable(DVector::from_vec(vec![0.5, 0.0])))
        .unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    // raw values pass through unclamped
    approx(controls.value()[0], 1.5, 1e-12);
    let jac = controls.jacobian().expect("jacobian");
    assert_eq!(jac.row_nnz(0), 0);
    approx(jac.to_dense()[(1, 1)], 1.0, 0.0);

    let raw = rig
        .evaluate_raw_controls(&DiffData::variable(DVector::from_vec(vec![0.2, 0.0])))
        .unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    approx(controls.value()[0], 0.6, 1e-12);
    approx(controls.jacobian().unwrap().to_dense()[(0, 0)], 3.0, 1e-12);
}

#[test]
fn wrong_input_sizes_are_rejected() {
    let rig = load("face-sample");
    let err = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[0.0; 3]))
        .unwrap_err();
    assert!(matches!(err, RigError::Configuration { .. }));

    assert!(rig.evaluate_psd(&DiffData::from_slice(&[0.0; 4]), &[]).is_err());
    assert!(rig.evaluate_joints(&DiffData::from_slice(&[0.0; 8]), 0).is_err());
    assert!(rig
        .evaluate_animated_maps(&DiffData::from_slice(&[0.0; 10]), 0)
        .is_err());
}

#[test]
fn invalid_lod_is_rejected() {
    let rig = load("face-sample");
    let controls = DiffData::from_slice(&[0.0; 9]);
    assert!(rig.evaluate_joints(&controls, 2).is_err());
    assert!(rig.evaluate_animated_maps(&controls, 2).is_err());
    assert!(rig.joint_matrix(2).is_err());
}

#[test]
fn face_sample_introspection() {
    let rig = load("face-sample");
    let counts = rig.counts();
    assert_eq!(
        (counts.gui, counts.raw, counts.psd, counts.ml, counts.rbf_pose),
        (4, 5, 3, 1, 0)
    );
    assert_eq!(counts.total(), 9);
    assert_eq!(rig.lod_count(), 2);
    assert_eq!(rig.num_joints(), 3);
    assert!(!rig.with_joint_scaling());
    assert_eq!(rig.ml_network_names(), ["jaw".to_string()]);
    assert_eq!(
        rig.joint_group_index_per_joint(),
        &[Some(0), Some(0), Some(1)]
    );
    assert_eq!(rig.gui_control_ranges()[3], [-1.0, 1.0]);
    assert_eq!(rig.gui_control_ranges()[0], [0.0, 1.0]);
    assert!(!rig.psd_depends_on_ml_or_rbf());
    assert_eq!(rig.psd_to_raw_map().rows(), 8);
    assert_eq!(rig.psd_to_raw_map().cols(), 9);
    assert_eq!(rig.animated_maps().map_count(), 2);
    assert!(rig.rbf_solver().is_none());
}

#[test]
fn face_sample_raw_controls_split_bidirectional_gui() {
    let rig = load("face-sample");
    let raw = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[0.5, 0.0, 0.8, -0.5]))
        .unwrap();
    approx_slice(raw.value().as_slice(), &[0.5, 0.0, 0.8, 0.5, 0.0], 1e-12);

    let raw = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[0.0, 0.0, 0.0, 0.25]))
        .unwrap();
    approx_slice(raw.value().as_slice(), &[0.0, 0.0, 0.0, 0.0, 0.25], 1e-12);

    // far outside the domain the outermost segments clamp
    let raw = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[2.0, -1.0, 0.0, -3.0]))
        .unwrap();
    approx_slice(raw.value().as_slice(), &[1.0, 0.0, 0.0, 1.0, 0.0], 1e-12);
}

#[test]
fn face_sample_full_pipeline_values() {
    let rig = load("face-sample");
    let gui = [0.5, 0.0, 0.8, -0.5];

    let (_, controls, joints, maps) = pipeline(&rig, &gui, 1);
    approx_slice(
        controls.as_slice(),
        &[0.5, 0.0, 0.8, 0.5, 0.0, 0.4, 0.0, 0.0, 0.525],
        1e-6,
    );

    assert_eq!(joints.len(), 18);
    let mut expected = vec![0.0; 18];
    expected[0] = 0.15; // L brow tx
    expected[1] = 1.2; // L brow ty
    expected[5] = 5.0 * DEG_TO_RAD; // L brow rz
    expected[13] = -0.8; // jaw ty
    expected[15] = 16.0 * DEG_TO_RAD; // jaw rx
    approx_slice(joints.as_slice(), &expected, 1e-6);
    approx_slice(maps.as_slice(), &[1.0, 0.0], 1e-6);

    let (_, _, joints, maps) = pipeline(&rig, &gui, 0);
    let mut expected = vec![0.0; 18];
    expected[1] = 1.2;
    expected[15] = 16.0 * DEG_TO_RAD;
    approx_slice(joints.as_slice(), &expected, 1e-6);
    approx_slice(maps.as_slice(), &[0.4, 0.0], 1e-6);
}

#[test]
fn correctives_stay_within_unit_interval() {
    let rig = load("face-sample");
    let samples: [f64; 7] = [-1.5, -1.0, -0.3, 0.0, 0.4, 1.0, 2.0];
    for &a in &samples {
        for &b in &samples {
            let gui = [a, b, (a + b).abs(), a * b];
            let (_, controls, _, maps) = pipeline(&rig, &gui, 1);
            for row in rig.counts().psd_region() {
                let v = controls[row];
                assert!((0.0..=1.0).contains(&v), "psd {row} = {v} for {gui:?}");
            }
            assert!(maps.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }
}

#[test]
fn higher_lods_extend_lower_lods() {
    let rig = load("face-sample");
    let lod0 = rig.joint_matrix(0).unwrap();
    let lod1 = rig.joint_matrix(1).unwrap();
    assert!(lod0.nnz() < lod1.nnz());
    for (row, col, value) in lod0.triplets() {
        assert_eq!(lod1.get(row, col), value, "lod1 misses ({row}, {col})");
    }

    let (_, _, joints0, _) = pipeline(&rig, &[0.3, 0.7, 0.9, 0.6], 0);
    let (_, _, joints1, _) = pipeline(&rig, &[0.3, 0.7, 0.9, 0.6], 1);
    for (row, value) in joints0.iter().enumerate() {
        if *value != 0.0 {
            approx(joints1[row], *value, 1e-12);
        }
    }
}

#[test]
fn joint_scaling_keeps_scale_rows() {
    let config = RigConfig {
        with_joint_scaling: true,
        ..RigConfig::default()
    };
    let rig = RigLogic::init(&load_def("face-sample"), config).unwrap();
    assert!(rig.with_joint_scaling());
    let (_, _, joints, _) = pipeline(&rig, &[0.0, 0.0, 0.8, 0.0], 1);
    assert_eq!(joints.len(), 27);
    approx(joints[24], 0.08, 1e-6); // jaw sx
    approx(joints[21], 16.0 * DEG_TO_RAD, 1e-6); // jaw rx
}

#[test]
fn explicit_joint_matrix_matches_lod_evaluation() {
    let rig = load("face-sample");
    let raw = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[0.2, 0.9, 0.4, 0.1]))
        .unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    let by_lod = rig.evaluate_joints(&controls, 1).unwrap();
    let matrix = rig.joint_matrix(1).unwrap().clone();
    let by_matrix = rig.evaluate_joints_with_matrix(&controls, &matrix).unwrap();
    assert_eq!(by_lod.value(), by_matrix.value());
}

#[test]
fn jacobians_match_finite_differences() {
    let rig = load("face-sample");
    let gui = [0.5, 0.3, 0.6, 0.4];
    let lod = 1;

    let raw = rig
        .evaluate_raw_controls(&DiffData::variable(DVector::from_column_slice(&gui)))
        .unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    let joints = rig.evaluate_joints(&controls, lod).unwrap();
    let maps = rig.evaluate_animated_maps(&controls, lod).unwrap();
    let analytic = [
        raw.jacobian().unwrap().to_dense(),
        controls.jacobian().unwrap().to_dense(),
        joints.jacobian().unwrap().to_dense(),
        maps.jacobian().unwrap().to_dense(),
    ];

    let eps = 1e-6;
    for k in 0..gui.len() {
        let mut plus = gui;
        let mut minus = gui;
        plus[k] += eps;
        minus[k] -= eps;
        let (r1, c1, j1, m1) = pipeline(&rig, &plus, lod);
        let (r0, c0, j0, m0) = pipeline(&rig, &minus, lod);
        let numeric = [
            (r1 - r0) / (2.0 * eps),
            (c1 - c0) / (2.0 * eps),
            (j1 - j0) / (2.0 * eps),
            (m1 - m0) / (2.0 * eps),
        ];
        for (stage, (jac, fd)) in analytic.iter().zip(&numeric).enumerate() {
            assert_eq!(jac.nrows(), fd.len());
            assert_eq!(jac.ncols(), gui.len());
            for row in 0..fd.len() {
                assert!(
                    (jac[(row, k)] - fd[row]).abs() <= 1e-5,
                    "stage {stage} row {row} gui {k}: analytic={} numeric={}",
                    jac[(row, k)],
                    fd[row]
                );
            }
        }
    }
}

#[test]
fn constant_input_carries_no_jacobian_through_all_stages() {
    let rig = load("face-sample");
    let raw = rig
        .evaluate_raw_controls(&DiffData::from_slice(&[0.1, 0.2, 0.3, 0.4]))
        .unwrap();
    let controls = rig.evaluate_psd(&raw, &[]).unwrap();
    assert!(!controls.has_jacobian());
    assert!(!rig.evaluate_joints(&controls, 0).unwrap().has_jacobian());
    assert!(!rig.evaluate_animated_maps(&controls, 0).unwrap().has_jacobian());
}

#[test]
fn gui_controls_without_mapping_fail_init() {
    let mut def = load_def("minimal");
    def.gui_control_names.push("CTRL_c".into());
    let err = RigLogic::init(&def, RigConfig::default()).unwrap_err();
    assert!(err.to_string().contains("not all gui controls are being used"));
}

#[test]
fn engine_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<RigLogic>();

    let rig = std::sync::Arc::new(load("face-sample"));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let rig = std::sync::Arc::clone(&rig);
            std::thread::spawn(move || {
                let gui = [0.25 * i as f64, 0.5, 0.5, 0.0];
                pipeline(&rig, &gui, 1).2
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let joints = handle.join().unwrap();
        let expected = pipeline(&rig, &[0.25 * i as f64, 0.5, 0.5, 0.0], 1).2;
        assert_eq!(joints, expected);
    }
}
