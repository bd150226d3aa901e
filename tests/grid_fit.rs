use beem_fit::data::{Grid, GridOptions, SynthOptions, generate_grid};
use beem_fit::domain::{Parallelism, PassMode};
use beem_fit::fit::SearchOptions;

fn synthetic_grid(pass_mode: PassMode) -> Grid {
    let sweeps = generate_grid(&SynthOptions {
        nx: 4,
        ny: 3,
        sweeps_per_point: 2,
        passes: 2,
        both_directions: true,
        dead_fraction: 0.2,
        seed: 11,
        ..SynthOptions::default()
    })
    .unwrap();
    Grid::new(
        sweeps,
        &GridOptions {
            pass_mode,
            ..GridOptions::default()
        },
    )
    .unwrap()
}

fn fitted(parallelism: Parallelism) -> Grid {
    let mut grid = synthetic_grid(PassMode::Chronological);
    grid.fit_all(parallelism, &SearchOptions::default()).unwrap();
    grid
}

#[test]
fn parallel_fit_matches_sequential() {
    let sequential = fitted(Parallelism::Sequential);
    for parallelism in [Parallelism::Threads(2), Parallelism::Auto] {
        let parallel = fitted(parallelism);
        assert_eq!(parallel.summary(), sequential.summary());
        for (a, b) in sequential.points().iter().zip(parallel.points()) {
            assert_eq!(a.key(), b.key());
            assert_eq!(a.status(), b.status());
            assert_eq!(a.window(), b.window());
            assert_eq!(a.barrier_heights(), b.barrier_heights());
            assert_eq!(a.r_squared(), b.r_squared());
        }
    }
}

#[test]
fn every_sweep_lands_in_exactly_one_point() {
    for pass_mode in [PassMode::Chronological, PassMode::Merged] {
        let grid = synthetic_grid(pass_mode);
        let mut seen = vec![0usize; grid.sweeps().len()];
        for point in grid.points() {
            for &i in grid.sweep_indices(&point.key()) {
                seen[i] += 1;
                let sweep = &grid.sweeps()[i];
                assert_eq!(sweep.key, Some(point.key()));
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "{pass_mode:?}: {seen:?}");
    }
}

#[test]
fn good_points_have_plausible_barriers() {
    let grid = fitted(Parallelism::Auto);
    let good = grid.extract_good(0.6);
    assert!(!good.is_empty());
    for point in good {
        let phi = point.barrier_heights().unwrap()[0];
        assert!((phi + 0.8).abs() < 0.2, "{}: phi = {phi}", point.key());
    }
}
