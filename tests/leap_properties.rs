//! Randomized mass-action networks driven through the public API, checking
//! the invariants the engine promises for every committed trajectory.

use proptest::collection::vec;
use proptest::prelude::*;

use tauleap::{Model, ReactionDef, RunConfig, RunStatus, run_ensemble};

/// Small random networks: up to three species, up to three first-order or
/// birth reactions. Stoichiometric entries stay in -2..=1 so no reaction can
/// be explosively autocatalytic within the test horizon.
fn arb_network() -> impl Strategy<Value = (usize, Vec<i32>, Vec<f64>, Vec<i32>, u64)> {
    (1usize..=3, 1usize..=3).prop_flat_map(|(n_species, n_reactions)| {
        (
            Just(n_species),
            vec(-2i32..=1, n_species * n_reactions),
            vec(0.0f64..1.0, n_reactions),
            vec(0i32..60, n_species),
            any::<u64>(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_networks_respect_engine_invariants(
        (n_species, stoich, rates, initial, seed) in arb_network()
    ) {
        let reactions = rates.iter().map(|&k| ReactionDef::mass_action(k)).collect();
        let model = Model::new(n_species, &stoich, reactions, Vec::new()).unwrap();

        let mut config = RunConfig::new(1.0, 0.25);
        config.seed = Some(seed);
        config.trajectories = 2;
        let result = run_ensemble(&model, &initial, &config).unwrap();

        prop_assert_eq!(result.status, RunStatus::Completed);
        prop_assert_eq!(result.time_points.len(), 5);
        for pair in result.time_points.windows(2) {
            prop_assert!((pair[1] - pair[0] - 0.25).abs() < 1e-9);
        }
        for trajectory in &result.trajectories {
            prop_assert_eq!(trajectory.recorded, 5);
            prop_assert!((trajectory.final_time - 1.0).abs() < 1e-9);
            // No committed sample may ever hold a negative population.
            prop_assert!(trajectory.states.iter().all(|&x| x >= 0));
        }

        // Same seed, same model: bit-identical trajectories.
        let again = run_ensemble(&model, &initial, &config).unwrap();
        for (a, b) in result.trajectories.iter().zip(&again.trajectories) {
            prop_assert_eq!(&a.states, &b.states);
        }
    }
}
