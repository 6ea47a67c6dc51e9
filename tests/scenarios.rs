//! End-to-end estimator scenarios over a simulated planar world.
//!
//! A seeded world generator drives the event log the way the simulator
//! would: per timestep, observations of visible landmarks, a step
//! boundary, then the odometry measurement of the next motion. The
//! estimators subscribe as listeners and are compared against the true
//! trajectory.

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use taraka_slam::{
    ControlModel, FastSlam, FastSlamConfig, FeatureId, Gaussian, GraphSlam, GraphSlamConfig,
    Listener, McmcSlam, McmcSlamConfig, ObservationModel, Point2D, Pose2D, SlamData, SlamResult,
    Timestep,
};

/// Simulated world: a robot on a slow left turn among fixed landmarks,
/// with noisy odometry and noisy range-bearing readings.
struct World {
    rng: ChaCha8Rng,
    landmarks: Vec<Point2D>,
    truth: Vec<Pose2D>,
    control_noise: Gaussian<3>,
    observation_noise: Gaussian<2>,
    obs_chol: Matrix2<f64>,
    control_chol: Matrix3<f64>,
}

impl World {
    fn new(seed: u64, landmarks: Vec<Point2D>) -> Self {
        let control_chol = Matrix3::from_diagonal(&Vector3::new(0.05, 0.02, 0.02));
        let obs_chol = Matrix2::from_diagonal(&Vector2::new(0.1, 0.05));
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            landmarks,
            truth: vec![Pose2D::identity()],
            control_noise: Gaussian::new(Vector3::zeros(), control_chol),
            observation_noise: Gaussian::new(Vector2::zeros(), obs_chol),
            obs_chol,
            control_chol,
        }
    }

    fn observe_landmarks(&mut self, data: &SlamData) {
        let pose = *self.truth.last().unwrap();
        for (i, landmark) in self.landmarks.iter().enumerate() {
            let reading = ObservationModel::observe(&(-pose + *landmark))
                + self.observation_noise.sample(&mut self.rng);
            if reading[0] <= 0.0 {
                continue;
            }
            data.add_observation(
                FeatureId(i),
                ObservationModel::new(reading, self.obs_chol),
            );
        }
    }

    fn move_robot(&mut self, data: &SlamData) {
        let increment = Pose2D::new(0.5, 0.0, 0.04);
        let pose = *self.truth.last().unwrap();
        self.truth.push(pose + increment);

        let measured = increment.to_vector() + self.control_noise.sample(&mut self.rng);
        data.add_control(ControlModel::new(measured, self.control_chol));
    }

    /// Run `steps` timesteps against the log and return the dead-reckoned
    /// trajectory (composition of the odometry means).
    fn run(&mut self, data: &SlamData, steps: usize) -> Vec<Pose2D> {
        let mut dead_reckoning = vec![Pose2D::identity()];
        self.observe_landmarks(data);
        data.end_timestep();
        for t in 0..steps {
            self.move_robot(data);
            let mean = data.control(Timestep(t)).mean_pose();
            dead_reckoning.push(*dead_reckoning.last().unwrap() + mean);
            self.observe_landmarks(data);
            data.end_timestep();
        }
        data.end_simulation();
        dead_reckoning
    }
}

fn rms_position_error(estimate: &[Pose2D], truth: &[Pose2D]) -> f64 {
    assert_eq!(estimate.len(), truth.len());
    let sum: f64 = estimate
        .iter()
        .zip(truth)
        .map(|(e, t)| (e.x - t.x).powi(2) + (e.y - t.y).powi(2))
        .sum();
    (sum / truth.len() as f64).sqrt()
}

fn estimated_trajectory(result: &dyn SlamResult, steps: usize) -> Vec<Pose2D> {
    (0..=steps).map(|t| result.get_state(Timestep(t))).collect()
}

fn ring_of_landmarks() -> Vec<Point2D> {
    vec![
        Point2D::new(5.0, 10.0),
        Point2D::new(-5.0, 15.0),
        Point2D::new(10.0, 20.0),
        Point2D::new(0.0, 25.0),
        Point2D::new(-8.0, 5.0),
    ]
}

#[test]
fn controls_only_trajectory_tracks_odometry() {
    let data = Rc::new(SlamData::new());
    let mcmc = Rc::new(RefCell::new(McmcSlam::new(
        data.clone(),
        McmcSlamConfig {
            mcmc_steps: 0,
            seed: Some(1),
            ..McmcSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(mcmc.clone() as Rc<RefCell<dyn Listener>>));

    data.end_timestep();
    for _ in 0..10 {
        data.add_control(ControlModel::new(
            Vector3::new(1.0, 0.0, 0.0),
            Matrix3::identity() * 0.1,
        ));
        data.end_timestep();
    }
    data.end_simulation();

    let mut mcmc = mcmc.borrow_mut();
    for t in 0..=10 {
        assert_relative_eq!(mcmc.get_state(Timestep(t)).x, t as f64, epsilon = 1e-12);
    }
    assert!(mcmc.get_feature_map().is_empty());
    assert_eq!(mcmc.get_trajectory().len(), 10);
}

#[test]
fn single_observation_initializes_feature() {
    let data = Rc::new(SlamData::new());
    let fastslam = Rc::new(RefCell::new(FastSlam::new(
        FastSlamConfig {
            num_particles: 20,
            seed: Some(2),
            ..FastSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(fastslam.clone() as Rc<RefCell<dyn Listener>>));

    // landmark at (5, 0) seen from the identity pose, essentially
    // noise-free
    data.add_observation(
        FeatureId(0),
        ObservationModel::new(Vector2::new(5.0, 0.0), Matrix2::identity() * 1e-6),
    );
    data.end_timestep();
    data.end_simulation();

    let feature = fastslam.borrow().get_feature(FeatureId(0));
    assert_relative_eq!(feature.x, 5.0, epsilon = 1e-6);
    assert_relative_eq!(feature.y, 0.0, epsilon = 1e-6);
}

#[test]
fn mcmc_log_likelihood_matches_brute_force() {
    let data = Rc::new(SlamData::new());
    let mcmc = Rc::new(RefCell::new(McmcSlam::new(
        data.clone(),
        McmcSlamConfig {
            mcmc_steps: 25,
            seed: Some(3),
            ..McmcSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(mcmc.clone() as Rc<RefCell<dyn Listener>>));

    let landmark = Point2D::new(5.0, 0.0);
    let obs_chol = Matrix2::identity() * 0.01;

    // observation of feature 0 at t = 0
    data.add_observation(
        FeatureId(0),
        ObservationModel::new(
            ObservationModel::observe(&(-Pose2D::identity() + landmark)),
            obs_chol,
        ),
    );
    data.end_timestep();

    // two +x controls, then a re-observation at t = 2
    for _ in 0..2 {
        data.add_control(ControlModel::new(
            Vector3::new(1.0, 0.0, 0.0),
            Matrix3::identity() * 0.1,
        ));
        data.end_timestep();
    }
    data.add_observation(
        FeatureId(0),
        ObservationModel::new(
            ObservationModel::observe(&(-Pose2D::new(2.0, 0.0, 0.0) + landmark)),
            obs_chol,
        ),
    );
    data.end_timestep();
    data.end_simulation();

    let mcmc = mcmc.borrow();
    assert_relative_eq!(
        mcmc.log_likelihood(),
        mcmc.recompute_log_likelihood(),
        epsilon = 1e-9
    );
}

#[test]
fn fastslam_beats_dead_reckoning_over_long_run() {
    let data = Rc::new(SlamData::new());
    let fastslam = Rc::new(RefCell::new(FastSlam::new(
        FastSlamConfig {
            num_particles: 50,
            seed: Some(42),
            ..FastSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(fastslam.clone() as Rc<RefCell<dyn Listener>>));

    let mut world = World::new(42, ring_of_landmarks());
    let dead_reckoning = world.run(&data, 100);

    let fastslam = fastslam.borrow();
    let estimated = estimated_trajectory(&*fastslam, 100);

    let slam_rms = rms_position_error(&estimated, &world.truth);
    let odometry_rms = rms_position_error(&dead_reckoning, &world.truth);

    assert!(
        slam_rms < odometry_rms,
        "fastslam rms {:.3} not better than dead reckoning rms {:.3}",
        slam_rms,
        odometry_rms
    );
    assert!(fastslam.fault().is_none());
}

#[test]
fn mcmc_invariant_holds_over_long_run() {
    let data = Rc::new(SlamData::new());
    let mcmc = Rc::new(RefCell::new(McmcSlam::new(
        data.clone(),
        McmcSlamConfig {
            mcmc_steps: 5,
            seed: Some(7),
            ..McmcSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(mcmc.clone() as Rc<RefCell<dyn Listener>>));

    let mut world = World::new(7, ring_of_landmarks());
    world.run(&data, 60);

    let mcmc = mcmc.borrow();
    assert_relative_eq!(
        mcmc.log_likelihood(),
        mcmc.recompute_log_likelihood(),
        epsilon = 1e-6
    );
    assert_eq!(mcmc.current_timestep(), Timestep(60));
}

#[test]
fn graph_slam_improves_on_fastslam_initializer() {
    let data = Rc::new(SlamData::new());
    let fastslam = Rc::new(RefCell::new(FastSlam::new(
        FastSlamConfig {
            num_particles: 50,
            seed: Some(42),
            ..FastSlamConfig::default()
        },
        0,
    )));
    let graph = Rc::new(RefCell::new(GraphSlam::new(
        GraphSlamConfig::default(),
        Some(fastslam.clone() as Rc<RefCell<dyn SlamResult>>),
    )));
    // the initializer must be registered first so it has advanced when
    // the graph grows
    data.add_listener(&(fastslam.clone() as Rc<RefCell<dyn Listener>>));
    data.add_listener(&(graph.clone() as Rc<RefCell<dyn Listener>>));

    let mut world = World::new(42, ring_of_landmarks());
    world.run(&data, 60);

    let mut graph = graph.borrow_mut();
    graph.reinitialise(&mut *fastslam.borrow_mut());
    let initializer_residual = graph.objective_value();

    let result = graph.optimize(100);
    assert!(
        result.final_error <= initializer_residual,
        "optimization did not improve on the initializer: {:.3} -> {:.3}",
        initializer_residual,
        result.final_error
    );
    assert!(result.iterations > 0);

    // the optimized trajectory should also beat dead reckoning
    let estimated = estimated_trajectory(&*graph, 60);
    let slam_rms = rms_position_error(&estimated, &world.truth);
    assert!(slam_rms < 2.0, "graph-slam rms {:.3}", slam_rms);
}

#[test]
fn estimators_agree_on_timestep_and_features() {
    let data = Rc::new(SlamData::new());
    let fastslam = Rc::new(RefCell::new(FastSlam::new(
        FastSlamConfig {
            num_particles: 30,
            seed: Some(5),
            ..FastSlamConfig::default()
        },
        0,
    )));
    let mcmc = Rc::new(RefCell::new(McmcSlam::new(
        data.clone(),
        McmcSlamConfig {
            mcmc_steps: 2,
            seed: Some(5),
            ..McmcSlamConfig::default()
        },
        0,
    )));
    data.add_listener(&(fastslam.clone() as Rc<RefCell<dyn Listener>>));
    data.add_listener(&(mcmc.clone() as Rc<RefCell<dyn Listener>>));

    let mut world = World::new(5, ring_of_landmarks());
    world.run(&data, 30);

    let mut fastslam = fastslam.borrow_mut();
    let mut mcmc = mcmc.borrow_mut();

    assert_eq!(fastslam.current_timestep(), Timestep(30));
    assert_eq!(mcmc.current_timestep(), Timestep(30));
    assert_eq!(fastslam.get_trajectory().len(), 30);
    assert_eq!(mcmc.get_trajectory().len(), 30);

    let fastslam_ids: Vec<FeatureId> = fastslam.get_feature_map().keys().copied().collect();
    let mcmc_ids: Vec<FeatureId> = mcmc.get_feature_map().keys().copied().collect();
    assert_eq!(fastslam_ids, mcmc_ids);
    assert_eq!(fastslam_ids.len(), 5);

    // both estimates place every landmark in the right neighborhood;
    // fastslam fuses every observation, mcmc's map is a posterior sample
    for (i, landmark) in world.landmarks.iter().enumerate() {
        let from_fastslam = fastslam.get_feature(FeatureId(i));
        let from_mcmc = mcmc.get_feature(FeatureId(i));
        assert!(from_fastslam.distance(landmark) < 2.0);
        assert!(from_mcmc.distance(landmark) < 3.5);
    }
}

#[test]
fn same_seed_reproduces_bit_identical_results() {
    let run = || {
        let data = Rc::new(SlamData::new());
        let fastslam = Rc::new(RefCell::new(FastSlam::new(
            FastSlamConfig {
                num_particles: 25,
                seed: Some(9),
                ..FastSlamConfig::default()
            },
            0,
        )));
        data.add_listener(&(fastslam.clone() as Rc<RefCell<dyn Listener>>));

        let mut world = World::new(9, ring_of_landmarks());
        world.run(&data, 25);

        let fastslam = fastslam.borrow();
        (
            estimated_trajectory(&*fastslam, 25),
            fastslam.get_feature(FeatureId(0)),
        )
    };

    let (trajectory_a, feature_a) = run();
    let (trajectory_b, feature_b) = run();
    assert_eq!(trajectory_a, trajectory_b);
    assert_eq!(feature_a, feature_b);
}
