use graphnet::config::PipelineConfig;
use graphnet::crossval::{CancellationToken, CrossValidator, FoldPlan};
use graphnet::gridsearch::{GridSearchConfig, GridSearcher};
use graphnet::io::{NiftiVolumeSource, VolumeSource, read_nifti, save_volume};
use graphnet::pipeline::{self, prepare_subjects};
use graphnet::progress::NoopGridProgress;
use graphnet::sampler::{MatrixSampler, SamplingOptions};
use graphnet::solver::{PenalizedSolver, PenaltyParams};
use graphnet::test_fixtures::{FUNCTIONAL_NAME, MARKER_NAME, SyntheticStudy, SyntheticStudyBuilder};
use std::fs;
use std::time::Instant;

fn config_for(study: &SyntheticStudy, ceiling: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data.mask = study.mask_path.clone();
    config.data.functional_name = FUNCTIONAL_NAME.to_string();
    config.data.marker_name = MARKER_NAME.to_string();
    config.data.lag = study.lag;
    config.data.selected_offsets = study.selected_offsets.clone();
    config.sampling.replacement_ceiling = ceiling;
    config
}

#[test]
fn default_workflow_trains_unmasks_and_crossvalidates() {
    let study = SyntheticStudyBuilder::new(3).build();
    let mut config = config_for(&study, 8);
    config.penalty.adaptive = true;
    let prepared = prepare_subjects(&config, &study.source, &study.subject_dirs).unwrap();

    let solver = PenalizedSolver::new(config.solver.clone());
    let sampled = &prepared.sampled;
    let fit = solver
        .train(sampled.x.view(), sampled.y.view(), &sampled.trial_mask, &config.penalty)
        .unwrap();
    let coefficients = fit.coefficients[0].clone();
    assert_eq!(coefficients.len(), 40);

    let maps = MatrixSampler::new(&prepared.mask)
        .unmask(coefficients.with_intercept().view(), 4, 1)
        .unwrap();
    assert_eq!(maps.shape(), &[4, 3, 1, 4]);

    let mut cv = CrossValidator::new(&prepared.base, config.sampling.clone(), solver);
    cv.configure(3, true).unwrap();
    let report = cv.crossvalidate(&config.penalty).unwrap();
    let accuracies = report.accuracies();
    assert_eq!(accuracies.len(), 3);
    for (fold, accuracy) in accuracies.iter().enumerate() {
        let accuracy = accuracy.unwrap_or_else(|| panic!("fold {fold} was not scored: {report:?}"));
        assert!((0.0..=1.0).contains(&accuracy), "fold {fold} accuracy {accuracy}");
    }
    assert_eq!(report.nonzero_counts().len(), 3);
}

#[test]
fn seven_subjects_split_into_three_folds() {
    let study = SyntheticStudyBuilder::new(7).build_prepared().unwrap();
    let mut cv = CrossValidator::new(
        &study.base,
        SamplingOptions::default(),
        PenalizedSolver::default(),
    );
    let plan: FoldPlan = cv.configure(3, true).unwrap().clone();
    let sizes: Vec<usize> = plan.folds().iter().map(Vec::len).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 7);
    assert!(sizes.iter().all(|&s| s >= 2));

    let params = PenaltyParams {
        l1: 1.0,
        l2: 1.0,
        l3: 1.0,
        ..PenaltyParams::default()
    };
    let report = cv.crossvalidate(&params).unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert!(!report.partial);
}

#[test]
fn nifti_study_on_disk_round_trips_to_a_coefficient_map() {
    let study = SyntheticStudyBuilder::new(3).build();
    let root = tempfile::tempdir().unwrap();

    let mask = study.source.load_volume(&study.mask_path).unwrap();
    save_volume(mask.data.view(), [2.0, 2.0, 2.5], &root.path().join("mask.nii.gz")).unwrap();

    for (index, dir) in study.subject_dirs.iter().enumerate() {
        let subject_dir = root.path().join(format!("subj{}", index + 1));
        fs::create_dir(&subject_dir).unwrap();
        let functional = study.source.load_volume(&dir.join(FUNCTIONAL_NAME)).unwrap();
        let functional_path = subject_dir.join(FUNCTIONAL_NAME);
        save_volume(functional.data.view(), functional.pixdim, &functional_path).unwrap();
        let markers = study.source.load_markers(&dir.join(MARKER_NAME)).unwrap();
        let text: Vec<String> = markers.iter().map(|m| m.to_string()).collect();
        let contents = format!("# onsets\n{}\n", text.join("\n"));
        fs::write(subject_dir.join(MARKER_NAME), contents).unwrap();
    }
    fs::create_dir(root.path().join("notes")).unwrap();

    let mut config = config_for(&study, 8);
    config.data.subject_top_dir = root.path().to_path_buf();
    config.data.subject_prefixes = vec!["subj".to_string()];
    config.data.mask = root.path().join("mask.nii.gz");
    let output = root.path().join("graphnet_coef_map");

    let prepared = pipeline::prepare(&config, &NiftiVolumeSource).unwrap();
    assert_eq!(prepared.base.subject_ids, vec!["subj1", "subj2", "subj3"]);
    let params = PenaltyParams {
        l1: 1.0,
        l2: 1.0,
        l3: 1.0,
        ..PenaltyParams::default()
    };
    let (fit, path) = pipeline::train_and_export(&config, &prepared, &params, &output).unwrap();
    assert_eq!(path, root.path().join("graphnet_coef_map.nii"));

    let written = read_nifti(&path).unwrap();
    assert_eq!(written.data.shape(), &[4, 3, 1, 4]);
    assert_eq!(written.pixdim, [2.0, 2.0, 2.5]);
    let remasked = MatrixSampler::new(&prepared.mask).mask_maps(written.data.view());
    for (stored, fitted) in remasked.iter().zip(fit.primary().iter()) {
        assert!((stored - fitted).abs() < 1e-4 * fitted.abs().max(1.0));
    }
}

#[test]
fn grid_search_over_real_crossvalidation_never_regresses() {
    let study = SyntheticStudyBuilder::new(4)
        .trials_per_subject(6)
        .build_prepared()
        .unwrap();
    let mut cv = CrossValidator::new(
        &study.base,
        SamplingOptions {
            replacement_ceiling: 9,
            ..SamplingOptions::default()
        },
        PenalizedSolver::default(),
    );
    cv.configure(2, true).unwrap();

    let config = GridSearchConfig {
        initial_l1_min: 0.5,
        initial_l1_max: 8.5,
        l1_stepsizes: vec![2.0, 1.0],
        deltas: vec![0.3],
        ..GridSearchConfig::default()
    };
    let base = PenaltyParams {
        l2: 1.0,
        l3: 1.0,
        ..PenaltyParams::default()
    };
    let report = GridSearcher::new(config, base)
        .zoom_gridsearch(&cv, "synthetic_zoom", false)
        .unwrap();

    assert_eq!(report.name, "synthetic_zoom");
    assert_eq!(report.passes.len(), 2);
    assert!(report.passes[1].windows[0].width() < report.passes[0].windows[0].width());
    let first = report.passes[0].best.as_ref().and_then(|b| b.accuracy).unwrap();
    let second = report.passes[1].best.as_ref().and_then(|b| b.accuracy).unwrap();
    assert!(second >= first - 1e-12);
    let best = report.best.unwrap();
    assert!((0.5..=8.5).contains(&best.params.l1));
    assert_eq!(best.params.l2, 1.0);
}

#[test]
fn expired_deadline_yields_an_empty_partial_search() {
    let study = SyntheticStudyBuilder::new(3).build_prepared().unwrap();
    let mut cv = CrossValidator::new(
        &study.base,
        SamplingOptions::default(),
        PenalizedSolver::default(),
    );
    cv.configure(3, true).unwrap();
    let cancel = CancellationToken::with_deadline(Instant::now());
    let report = GridSearcher::new(GridSearchConfig::default(), PenaltyParams::default())
        .zoom_gridsearch_with(&cv, "late", true, &cancel, &NoopGridProgress)
        .unwrap();
    assert!(report.partial);
    assert!(report.best.is_none());
}
