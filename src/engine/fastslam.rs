//! FastSLAM 2.0: a Rao-Blackwellized particle filter.
//!
//! Each particle carries a sampled trajectory and, conditioned on it, an
//! analytic Gaussian posterior per landmark. Trajectories are
//! singly-linked lists whose tails are shared between particles, so
//! resampling clones ancestry in O(1); feature posteriors live in a
//! copy-on-write map shared the same way.
//!
//! The state proposal is the FastSLAM 2.0 one: the control-propagated
//! prior is refined by conditioning a joint state-feature distribution
//! on each observation of an already-mapped landmark, all through the
//! unscented transform, and the particle weight compensates the proposal
//! with `exp(log p(z|x) + log p(x|prior) - log q(x|proposal))`.

use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::{Matrix2, SMatrix, SVector, Vector2, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::particle::ParticleFilter;
use crate::algorithms::unscented::{
    unscented_transform, unscented_update, UnscentedParams, UnscentedWeights,
};
use crate::core::gaussian::Gaussian;
use crate::core::models::{ControlModel, ObservationModel};
use crate::core::pose::{Point2D, Pose2D};
use crate::core::types::{FeatureId, Timestep};
use crate::data::Listener;
use crate::engine::interfaces::SlamResult;
use crate::error::{Error, Result};
use crate::utils::bitree::Bitree;
use crate::utils::cowmap::CowMap;

/// FastSLAM 2.0 parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FastSlamConfig {
    /// Particle population size.
    pub num_particles: usize,
    /// Resample when the effective particle ratio falls below this.
    pub resample_threshold: f64,
    /// Report collapse when the effective particle ratio falls below
    /// this. The population is never mutated on collapse; the condition
    /// is only diagnosed.
    pub collapse_threshold: f64,
    /// Keep per-particle trajectory history. When false the trajectory
    /// is compacted incrementally from the max-weight particle instead.
    pub keep_history: bool,
    /// Sigma-point scaling shared by all unscented operations.
    pub ukf: UnscentedParams,
    /// RNG seed. When absent, the constructor-supplied seed is used and
    /// stored back here for reproducibility logs.
    pub seed: Option<u64>,
}

impl Default for FastSlamConfig {
    fn default() -> Self {
        Self {
            num_particles: 100,
            resample_threshold: 0.75,
            collapse_threshold: 0.5,
            keep_history: true,
            ukf: UnscentedParams::default(),
            seed: None,
        }
    }
}

/// One node of a shared trajectory list.
#[derive(Debug)]
struct StateNode {
    state: Pose2D,
    previous: Option<Rc<StateNode>>,
}

/// Per-particle state: current pose, shared ancestry, and the
/// copy-on-write map of landmark posteriors (world frame).
#[derive(Debug, Clone)]
struct FastSlamParticle {
    state: Pose2D,
    previous: Option<Rc<StateNode>>,
    features: CowMap<FeatureId, Gaussian<2>>,
}

/// Unscented weights for every dimension FastSLAM transforms through.
#[derive(Debug, Clone)]
struct UkfWeights {
    control: UnscentedWeights,
    observation: UnscentedWeights,
    feature: UnscentedWeights,
    state_feature: UnscentedWeights,
}

impl UkfWeights {
    fn new(params: &UnscentedParams) -> Self {
        Self {
            control: UnscentedWeights::new(ControlModel::DIM, params),
            observation: UnscentedWeights::new(ObservationModel::DIM, params),
            feature: UnscentedWeights::new(2, params),
            state_feature: UnscentedWeights::new(3 + 2, params),
        }
    }
}

/// FastSLAM 2.0 estimator.
#[derive(Debug)]
pub struct FastSlam {
    config: FastSlamConfig,
    rng: ChaCha8Rng,
    weights: UkfWeights,
    next_timestep: Timestep,
    current_control: Option<ControlModel>,
    seen_features: Vec<(FeatureId, ObservationModel)>,
    new_features: Vec<(FeatureId, ObservationModel)>,
    num_features: usize,
    particles: ParticleFilter<FastSlamParticle>,
    trajectory_estimate: Bitree<Pose2D>,
    map_estimate: BTreeMap<FeatureId, Point2D>,
    collapsed: bool,
    fault: Option<Error>,
}

impl FastSlam {
    /// Create an estimator. `seed` is used when `config.seed` is absent
    /// and the chosen value is written back into the stored config.
    pub fn new(mut config: FastSlamConfig, seed: u64) -> Self {
        let seed = *config.seed.get_or_insert(seed);
        log::info!("fastslam: seeding rng with {}", seed);
        let weights = UkfWeights::new(&config.ukf);
        let particles = ParticleFilter::initialize(
            config.num_particles,
            FastSlamParticle {
                state: Pose2D::identity(),
                previous: None,
                features: CowMap::new(),
            },
        );
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            weights,
            particles,
            config,
            next_timestep: Timestep(0),
            current_control: None,
            seen_features: Vec::new(),
            new_features: Vec::new(),
            num_features: 0,
            trajectory_estimate: Bitree::new(),
            map_estimate: BTreeMap::new(),
            collapsed: false,
            fault: None,
        }
    }

    /// The effective configuration, including the chosen seed.
    pub fn config(&self) -> &FastSlamConfig {
        &self.config
    }

    /// Effective particle size divided by the population size.
    pub fn effective_ratio(&self) -> f64 {
        self.particles.effective_size() / self.particles.len() as f64
    }

    /// Whether the effective ratio ever fell below the collapse
    /// threshold.
    pub fn collapsed(&self) -> bool {
        self.collapsed
    }

    /// The first numerical failure encountered, if any. The filter keeps
    /// running on the affected particles' prior estimates.
    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    fn resample_required(&self) -> bool {
        self.particles.effective_size()
            < self.config.resample_threshold * self.config.num_particles as f64
    }

    /// Advance the posterior to timestep `t`. Called by the event log at
    /// each step boundary; earlier timesteps are ignored, skipping ahead
    /// is a contract violation.
    pub fn timestep(&mut self, t: Timestep) {
        if t < self.next_timestep {
            return;
        }
        assert_eq!(
            t, self.next_timestep,
            "fastslam: timestep {} delivered out of order (expected {})",
            t, self.next_timestep
        );

        if t.index() > 0 {
            if self.resample_required() {
                log::debug!(
                    "fastslam: resampling, effective size {:.1}",
                    self.particles.effective_size()
                );
                let n = self.config.num_particles;
                let Self { particles, rng, .. } = self;
                if let Err(e) = particles.resample(rng, n) {
                    log::warn!("fastslam: {}", e);
                    self.fault.get_or_insert(e);
                }
            }

            let control = self
                .current_control
                .take()
                .expect("fastslam: timestep advanced without a control");

            let fault = {
                let Self {
                    particles,
                    rng,
                    weights,
                    seen_features,
                    config,
                    ..
                } = self;
                let seen: &[(FeatureId, ObservationModel)] = seen_features;
                let weights: &UkfWeights = weights;
                let keep_history = config.keep_history;
                let mut fault = None;
                particles.update(|particle| {
                    match particle_state_update(
                        particle,
                        &control,
                        seen,
                        weights,
                        rng,
                        keep_history,
                    ) {
                        Ok(multiplier) => multiplier,
                        Err(e) => {
                            // the particle keeps its prior estimate
                            fault.get_or_insert(e);
                            1.0
                        }
                    }
                });
                fault
            };
            if let Some(e) = fault {
                log::warn!("fastslam: state update fault: {}", e);
                self.fault.get_or_insert(e);
            }

            if !self.config.keep_history {
                let state = self.particles.max_weight_particle().state;
                self.trajectory_estimate.push_back_accumulated(state);
            }
        }

        let fault = {
            let Self {
                particles,
                weights,
                seen_features,
                new_features,
                ..
            } = self;
            let mut fault = None;

            // condition each mapped landmark's posterior on this step's
            // observation, with the sampled state held fixed
            for (id, obs) in seen_features.iter() {
                for particle in particles.iter_mut() {
                    let state = particle.state;
                    let mut feature = particle.features.get(id).clone();
                    let updated = unscented_update(
                        &weights.feature,
                        |f: &Vector2<f64>| {
                            ObservationModel::observe(&(-state + Point2D::from_vector(*f)))
                        },
                        &mut feature,
                        obs.mean(),
                        obs.chol_cov(),
                        ObservationModel::subtract,
                    );
                    match updated {
                        Ok(()) => {
                            particle.features.insert(*id, feature);
                        }
                        Err(e) => {
                            fault.get_or_insert(e);
                        }
                    }
                }
            }

            // initialize newly seen landmarks by pushing the observation
            // through the inverse observation map
            for (id, obs) in new_features.iter() {
                for particle in particles.iter_mut() {
                    let state = particle.state;
                    let initialized = unscented_transform(
                        &weights.observation,
                        |z: &Vector2<f64>| {
                            (state + ObservationModel::inv_observe(z)).to_vector()
                        },
                        obs.dist(),
                        None,
                        |a, b| a - b,
                    );
                    let feature = match initialized {
                        Ok(g) => g,
                        Err(e) => {
                            // degenerate init keeps the landmark queryable
                            fault.get_or_insert(e);
                            Gaussian::new(
                                (state + obs.mean_feature()).to_vector(),
                                Matrix2::identity() * 1e-6,
                            )
                        }
                    };
                    particle.features.insert(*id, feature);
                }
            }
            fault
        };
        if let Some(e) = fault {
            log::warn!("fastslam: feature update fault: {}", e);
            self.fault.get_or_insert(e);
        }

        self.num_features += self.new_features.len();
        self.seen_features.clear();
        self.new_features.clear();
        self.map_estimate.clear();
        self.next_timestep += 1;

        let ratio = self.effective_ratio();
        if ratio < self.config.collapse_threshold && !self.collapsed {
            log::warn!(
                "fastslam: particle filter collapsed, effective ratio {:.3} below {:.3}",
                ratio,
                self.config.collapse_threshold
            );
            self.collapsed = true;
        }
        log::debug!(
            "fastslam: {} -> effective particle size {:.1}",
            t,
            self.particles.effective_size()
        );
    }
}

/// Propagate one particle through the control, refine the proposal with
/// this step's observations of mapped landmarks, sample the new state
/// and return the weight multiplier.
fn particle_state_update(
    particle: &mut FastSlamParticle,
    control: &ControlModel,
    seen: &[(FeatureId, ObservationModel)],
    weights: &UkfWeights,
    rng: &mut ChaCha8Rng,
    keep_history: bool,
) -> Result<f64> {
    let prev = particle.state;

    // proposal prior p(x_t | x_{t-1}, u_t)
    let prior: Gaussian<3> = unscented_transform(
        &weights.control,
        |u: &Vector3<f64>| (prev + Pose2D::from_vector(*u)).to_vector(),
        control.dist(),
        None,
        ControlModel::subtract,
    )?;

    // refine by conditioning the joint (state, feature) distribution on
    // each observation of an already-mapped landmark; the feature block
    // is rebuilt per landmark, the state block carries forward
    let mut joint: Gaussian<5> = {
        let mut mean = SVector::<f64, 5>::zeros();
        mean.fixed_rows_mut::<3>(0).copy_from(prior.mean());
        let mut chol = SMatrix::<f64, 5, 5>::zeros();
        chol.fixed_view_mut::<3, 3>(0, 0).copy_from(prior.chol_cov());
        Gaussian::new(mean, chol)
    };
    for (id, obs) in seen {
        let feature = particle.features.get(id);
        joint
            .mean_mut()
            .fixed_rows_mut::<2>(3)
            .copy_from(feature.mean());
        let chol = joint.chol_cov_mut();
        chol.fixed_view_mut::<2, 2>(3, 3).copy_from(feature.chol_cov());
        chol.fixed_view_mut::<3, 2>(0, 3).fill(0.0);
        chol.fixed_view_mut::<2, 3>(3, 0).fill(0.0);

        unscented_update(
            &weights.state_feature,
            |x: &SVector<f64, 5>| {
                let pose = Pose2D::new(x[0], x[1], x[2]);
                let feature = Point2D::new(x[3], x[4]);
                ObservationModel::observe(&(-pose + feature))
            },
            &mut joint,
            obs.mean(),
            obs.chol_cov(),
            ObservationModel::subtract,
        )?;
    }
    let proposal = Gaussian::new(
        joint.mean().fixed_rows::<3>(0).into_owned(),
        joint.chol_cov().fixed_view::<3, 3>(0, 0).into_owned(),
    );

    if keep_history {
        particle.previous = Some(Rc::new(StateNode {
            state: prev,
            previous: particle.previous.take(),
        }));
    }
    particle.state = Pose2D::from_vector(proposal.sample(rng));

    let obs_ll = particle_log_weight(particle, seen, weights)?;
    let state_vec = particle.state.to_vector();
    let prior_ll =
        prior.log_likelihood_residual(&ControlModel::subtract(&state_vec, prior.mean()));
    let proposal_ll =
        proposal.log_likelihood_residual(&ControlModel::subtract(&state_vec, proposal.mean()));

    Ok((obs_ll + prior_ll - proposal_ll).exp())
}

/// Log likelihood of this step's observations given the particle's
/// sampled state and its landmark posteriors.
fn particle_log_weight(
    particle: &FastSlamParticle,
    seen: &[(FeatureId, ObservationModel)],
    weights: &UkfWeights,
) -> Result<f64> {
    let state = particle.state;
    let mut log_weight = 0.0;
    for (id, obs) in seen {
        let feature = particle.features.get(id);
        let predicted: Gaussian<2> = unscented_transform(
            &weights.feature,
            |f: &Vector2<f64>| ObservationModel::observe(&(-state + Point2D::from_vector(*f))),
            feature,
            Some(obs.chol_cov()),
            ObservationModel::subtract,
        )?;
        log_weight += predicted
            .log_likelihood_residual(&ObservationModel::subtract(obs.mean(), predicted.mean()));
    }
    Ok(log_weight)
}

impl Listener for FastSlam {
    fn on_control(&mut self, t: Timestep, control: &ControlModel) {
        assert_eq!(
            t + 1,
            self.next_timestep,
            "fastslam: control for {} delivered out of order",
            t
        );
        assert!(
            self.current_control.is_none(),
            "fastslam: control for {} delivered twice",
            t
        );
        self.current_control = Some(control.clone());
    }

    fn on_observation(
        &mut self,
        t: Timestep,
        id: FeatureId,
        obs: &ObservationModel,
        new_feature: bool,
    ) {
        assert_eq!(
            t, self.next_timestep,
            "fastslam: observation for {} delivered out of order",
            t
        );
        if new_feature {
            self.new_features.push((id, obs.clone()));
        } else {
            self.seen_features.push((id, obs.clone()));
        }
    }

    fn on_timestep(&mut self, t: Timestep) {
        self.timestep(t);
    }
}

impl SlamResult for FastSlam {
    fn current_timestep(&self) -> Timestep {
        assert!(
            self.next_timestep.index() > 0,
            "fastslam: no timestep processed yet"
        );
        self.next_timestep - 1
    }

    fn get_state(&self, t: Timestep) -> Pose2D {
        let current = self.current_timestep();
        assert!(t <= current, "fastslam: {} is in the future", t);
        if self.config.keep_history && self.trajectory_estimate.len() != current.index() {
            let best = self.particles.max_weight_particle();
            let mut state = best.state;
            let mut prev = &best.previous;
            for _ in 0..(current.index() - t.index()) {
                let node = prev
                    .as_ref()
                    .expect("fastslam: trajectory history shorter than timestep");
                state = node.state;
                prev = &node.previous;
            }
            state
        } else {
            self.trajectory_estimate.accumulate_prefix(t.index())
        }
    }

    fn get_feature(&self, id: FeatureId) -> Point2D {
        Point2D::from_vector(*self.particles.max_weight_particle().features.get(&id).mean())
    }

    fn get_trajectory(&mut self) -> &Bitree<Pose2D> {
        let current = self.current_timestep().index();
        if self.config.keep_history && self.trajectory_estimate.len() != current {
            let states_reversed = {
                let best = self.particles.max_weight_particle();
                let mut states = Vec::with_capacity(current);
                let mut state = best.state;
                let mut prev = &best.previous;
                while let Some(node) = prev {
                    states.push(state);
                    state = node.state;
                    prev = &node.previous;
                }
                states
            };
            self.trajectory_estimate.clear();
            for state in states_reversed.into_iter().rev() {
                self.trajectory_estimate.push_back_accumulated(state);
            }
        }
        assert_eq!(self.trajectory_estimate.len(), current);
        &self.trajectory_estimate
    }

    fn get_feature_map(&mut self) -> &BTreeMap<FeatureId, Point2D> {
        if self.map_estimate.len() != self.num_features {
            let mut map = BTreeMap::new();
            self.particles.max_weight_particle().features.for_each(|id, g| {
                map.insert(*id, Point2D::from_vector(*g.mean()));
            });
            self.map_estimate = map;
        }
        assert_eq!(self.map_estimate.len(), self.num_features);
        &self.map_estimate
    }
}
