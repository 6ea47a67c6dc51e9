//! MCMC-SLAM: Metropolis-Hastings over the spanning-tree factorization
//! of the pose-graph posterior.
//!
//! Every control is a *state edge* between consecutive pose vertices.
//! For each feature, its first observation is the *feature edge* tying
//! the feature vertex to its parent timestep; later observations are
//! non-tree factors. Edge labels (the state increments and parent-frame
//! feature estimates) fully determine the posterior, and one MCMC step
//! re-proposes a single label from its own edge distribution.
//!
//! Edges are selected with probability proportional to
//! `exp(log d - log_likelihood / d)` where `d` is the edge importance
//! (its measurement dimension by default): poorly explained edges are
//! revisited more often. The weights live in two Fenwick trees so
//! selection is a weighted binary search, and the acceptance ratio
//! carries a `1 + (w_new - w_old)/W` normalizer correcting for the
//! label-dependent proposal kernel.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::core::models::{ControlModel, ObservationModel};
use crate::core::pose::{Point2D, Pose2D};
use crate::core::types::{FeatureId, Timestep};
use crate::data::{Listener, SlamData};
use crate::engine::interfaces::SlamResult;
use crate::utils::bitree::Bitree;

/// MCMC-SLAM parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct McmcSlamConfig {
    /// MCMC iterations per simulation step.
    pub mcmc_steps: usize,
    /// Degrees of freedom `d` of state edges in the edge weight.
    pub control_edge_importance: f64,
    /// Degrees of freedom `d` of feature edges in the edge weight.
    pub observation_edge_importance: f64,
    /// RNG seed. When absent, the constructor-supplied seed is used and
    /// stored back here for reproducibility logs.
    pub seed: Option<u64>,
}

impl Default for McmcSlamConfig {
    fn default() -> Self {
        Self {
            mcmc_steps: 1,
            control_edge_importance: ControlModel::DIM as f64,
            observation_edge_importance: ObservationModel::DIM as f64,
            seed: None,
        }
    }
}

/// One feature's spanning-tree edge: the estimate is expressed in the
/// frame of the parent timestep (its first observation).
#[derive(Debug, Clone)]
struct FeatureEstimate {
    id: FeatureId,
    parent_timestep: Timestep,
    estimate: Point2D,
}

/// MCMC-SLAM estimator.
pub struct McmcSlam {
    data: Rc<SlamData>,
    config: McmcSlamConfig,
    rng: ChaCha8Rng,
    initializer: Option<Rc<RefCell<dyn SlamResult>>>,

    /// State edge labels: increment `t -> t+1` at index `t`.
    state_estimates: Bitree<Pose2D>,
    state_weights: Bitree<f64>,

    feature_estimates: Vec<FeatureEstimate>,
    feature_weights: Bitree<f64>,
    feature_index: BTreeMap<FeatureId, usize>,

    map_estimate: BTreeMap<FeatureId, Point2D>,

    /// Observations delivered since the last processed step, in arrival
    /// order: `(timestep, id, observation, new_feature)`.
    pending_observations: Vec<(Timestep, FeatureId, ObservationModel, bool)>,

    next_timestep: Timestep,
    log_likelihood: f64,
}

impl McmcSlam {
    /// Create an estimator over `data`. `seed` is used when
    /// `config.seed` is absent and the chosen value is written back into
    /// the stored config.
    pub fn new(data: Rc<SlamData>, mut config: McmcSlamConfig, seed: u64) -> Self {
        let seed = *config.seed.get_or_insert(seed);
        log::info!("mcmc-slam: seeding rng with {}", seed);
        Self {
            data,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            initializer: None,
            state_estimates: Bitree::new(),
            state_weights: Bitree::new(),
            feature_estimates: Vec::new(),
            feature_weights: Bitree::new(),
            feature_index: BTreeMap::new(),
            map_estimate: BTreeMap::new(),
            pending_observations: Vec::new(),
            next_timestep: Timestep(0),
            log_likelihood: 0.0,
        }
    }

    /// The effective configuration, including the chosen seed.
    pub fn config(&self) -> &McmcSlamConfig {
        &self.config
    }

    /// Use another estimator's running posterior to label new edges
    /// instead of the raw measurement means. The initializer must be
    /// registered on the event log before this estimator so it has
    /// advanced when edges are labeled.
    pub fn set_initializer(&mut self, initializer: Rc<RefCell<dyn SlamResult>>) {
        self.initializer = Some(initializer);
    }

    /// Log likelihood of the current trajectory and map labels.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    fn edge_log_weight(&self, edge_log_likelihood: f64, dim: f64) -> f64 {
        dim.ln() - edge_log_likelihood / dim
    }

    /// Increment from the initializer's states `t -> t + 1`, when it has
    /// advanced that far.
    fn initializer_increment(&self, t: Timestep) -> Option<Pose2D> {
        let init = self.initializer.as_ref()?;
        let init = init.borrow();
        if init.current_timestep() >= t + 1 {
            Some(-init.get_state(t) + init.get_state(t + 1))
        } else {
            None
        }
    }

    /// The initializer's estimate of `id` in the frame of `t`, when
    /// available.
    fn initializer_feature(&self, t: Timestep, id: FeatureId) -> Option<Point2D> {
        let init = self.initializer.as_ref()?;
        let init = init.borrow();
        if init.current_timestep() >= t {
            Some(-init.get_state(t) + init.get_feature(id))
        } else {
            None
        }
    }

    fn add_state_edge(&mut self) {
        let t = Timestep(self.state_estimates.len());
        let control = self.data.control(t);

        let estimate = self
            .initializer_increment(t)
            .unwrap_or_else(|| control.mean_pose());

        let edge_log_likelihood = control.log_likelihood(&estimate);
        let weight = self
            .edge_log_weight(edge_log_likelihood, self.config.control_edge_importance)
            .exp();

        self.state_estimates.push_back(estimate);
        self.state_weights.push_back(weight);
        self.log_likelihood += edge_log_likelihood;

        debug_assert_eq!(self.state_estimates.len(), self.state_weights.len());
    }

    fn add_feature_edge(&mut self, id: FeatureId, obs: &ObservationModel) {
        let parent = self.current_timestep_internal();

        let estimate = self
            .initializer_feature(parent, id)
            .unwrap_or_else(|| obs.mean_feature());

        let edge_log_likelihood = obs.log_likelihood(&estimate);
        let weight = self
            .edge_log_weight(edge_log_likelihood, self.config.observation_edge_importance)
            .exp();

        self.feature_index.insert(id, self.feature_estimates.len());
        self.feature_estimates.push(FeatureEstimate {
            id,
            parent_timestep: parent,
            estimate,
        });
        self.feature_weights.push_back(weight);
        self.log_likelihood += edge_log_likelihood;
        self.map_estimate.clear();

        debug_assert_eq!(self.feature_estimates.len(), self.feature_weights.len());
    }

    fn current_timestep_internal(&self) -> Timestep {
        Timestep(self.state_estimates.len())
    }

    /// Advance the posterior to timestep `t`, then run the configured
    /// number of MCMC iterations.
    pub fn timestep(&mut self, t: Timestep) {
        assert!(
            t <= self.data.current_timestep(),
            "mcmc-slam: timestep {} is ahead of the event log",
            t
        );

        let mut mcmc_updates = 0;
        while self.next_timestep <= t {
            let step = self.next_timestep;
            if step.index() > 0 {
                self.add_state_edge();
            }

            let pending: Vec<_> = self
                .pending_observations
                .iter()
                .filter(|(obs_t, ..)| *obs_t == step)
                .cloned()
                .collect();
            for (_, id, obs, new_feature) in pending {
                if new_feature {
                    self.add_feature_edge(id, &obs);
                } else {
                    let index = self.feature_index[&id];
                    let feature = &self.feature_estimates[index];
                    let relative = self
                        .state_estimates
                        .accumulate_range(step.index(), feature.parent_timestep.index())
                        + feature.estimate;
                    self.log_likelihood += obs.log_likelihood(&relative);
                }
            }
            self.pending_observations.retain(|(obs_t, ..)| *obs_t > step);

            debug_assert_eq!(step, self.current_timestep_internal());
            self.next_timestep += 1;
            mcmc_updates += self.config.mcmc_steps;
        }

        for _ in 0..mcmc_updates {
            self.update();
        }
    }

    /// One Metropolis-Hastings step. Returns whether the proposal was
    /// accepted.
    pub fn update(&mut self) -> bool {
        let state_weight = self.state_weights.accumulate();
        let feature_weight = self.feature_weights.accumulate();
        if state_weight == 0.0 && feature_weight == 0.0 {
            return false;
        }

        if (state_weight + feature_weight) * self.rng.gen::<f64>() < state_weight {
            let t = loop {
                let i = self
                    .state_weights
                    .binary_search(state_weight * self.rng.gen::<f64>());
                if i < self.state_estimates.len() {
                    break Timestep(i);
                }
            };
            self.update_state_edge(t)
        } else {
            let index = loop {
                let i = self
                    .feature_weights
                    .binary_search(feature_weight * self.rng.gen::<f64>());
                if i < self.feature_estimates.len() {
                    break i;
                }
            };
            self.update_feature_edge(index)
        }
    }

    fn update_state_edge(&mut self, t: Timestep) -> bool {
        let control = self.data.control(t);
        let proposed = control.sample_pose(&mut self.rng);

        let log_ratio = self.state_edge_log_ratio(t, &proposed);

        let old_log_likelihood = control.log_likelihood(self.state_estimates.get(t.index()));
        let new_log_likelihood = control.log_likelihood(&proposed);
        let dim = self.config.control_edge_importance;

        if self.accept(log_ratio, old_log_likelihood, new_log_likelihood, dim) {
            self.state_estimates.set(t.index(), proposed);
            let new_weight = self.edge_log_weight(new_log_likelihood, dim).exp();
            self.state_weights.set(t.index(), new_weight);
            self.log_likelihood += log_ratio - old_log_likelihood + new_log_likelihood;
            self.map_estimate.clear();
            true
        } else {
            false
        }
    }

    fn update_feature_edge(&mut self, index: usize) -> bool {
        let (id, parent) = {
            let feature = &self.feature_estimates[index];
            (feature.id, feature.parent_timestep)
        };
        let distribution = self.data.observation(id, parent);
        let proposed = distribution.sample_feature(&mut self.rng);

        let log_ratio = self.feature_edge_log_ratio(index, &proposed);

        let old_log_likelihood =
            distribution.log_likelihood(&self.feature_estimates[index].estimate);
        let new_log_likelihood = distribution.log_likelihood(&proposed);
        let dim = self.config.observation_edge_importance;

        if self.accept(log_ratio, old_log_likelihood, new_log_likelihood, dim) {
            self.feature_estimates[index].estimate = proposed;
            let new_weight = self.edge_log_weight(new_log_likelihood, dim).exp();
            self.feature_weights.set(index, new_weight);
            self.log_likelihood += log_ratio - old_log_likelihood + new_log_likelihood;
            self.map_estimate.clear();
            true
        } else {
            false
        }
    }

    /// Metropolis-Hastings acceptance with the edge-weight normalizer:
    /// the proposal kernel selects edges by weight, so the acceptance
    /// ratio divides by `1 + (w_new - w_old)/W`.
    fn accept(
        &mut self,
        log_ratio: f64,
        old_log_likelihood: f64,
        new_log_likelihood: f64,
        dim: f64,
    ) -> bool {
        let old_log_weight = self.edge_log_weight(old_log_likelihood, dim);
        let new_log_weight = self.edge_log_weight(new_log_likelihood, dim);
        let weight_sum = self.state_weights.accumulate() + self.feature_weights.accumulate();
        let normalizer = 1.0 + (new_log_weight.exp() - old_log_weight.exp()) / weight_sum;
        normalizer * self.rng.gen::<f64>() < (log_ratio + new_log_weight - old_log_weight).exp()
    }

    /// Change in the log posterior over all non-tree observations when
    /// state edge `t` is relabeled to `proposed`.
    ///
    /// Relabeling a state edge cuts the spanning tree in two. A feature
    /// whose parent timestep is after `t` sits on the far side of the
    /// cut, so only its observations at or before `t` are re-scored;
    /// otherwise only its observations after `t` are.
    fn state_edge_log_ratio(&self, t: Timestep, proposed: &Pose2D) -> f64 {
        let mut log_ratio = 0.0;

        for feature in &self.feature_estimates {
            let timeline = self.data.feature_timeline(feature.id);
            let parent = feature.parent_timestep.index();

            log_ratio += if t < feature.parent_timestep {
                let new_obs = *proposed
                    + (self
                        .state_estimates
                        .accumulate_range(t.index() + 1, parent)
                        + feature.estimate);
                self.obs_likelihood_ratio(
                    feature,
                    timeline.range(..=t),
                    t,
                    new_obs,
                )
            } else {
                let new_obs = -*proposed
                    + (self.state_estimates.accumulate_range(t.index(), parent)
                        + feature.estimate);
                self.obs_likelihood_ratio(
                    feature,
                    timeline.range(t + 1..),
                    t + 1,
                    new_obs,
                )
            };
        }

        log_ratio
    }

    /// Change in the log posterior over all non-tree observations of one
    /// feature when its feature edge is relabeled to `proposed`.
    fn feature_edge_log_ratio(&self, index: usize, proposed: &Point2D) -> f64 {
        let feature = &self.feature_estimates[index];
        let timeline = self.data.feature_timeline(feature.id);
        self.obs_likelihood_ratio(feature, timeline.iter(), feature.parent_timestep, *proposed)
    }

    /// Walk the given observations of `feature`, carrying the old and
    /// proposed feature positions from frame to frame by composing the
    /// intermediate state increments, and sum the likelihood differences.
    ///
    /// `new_obs` is the proposed feature position expressed in the frame
    /// of `obs_timestep`; the observation at the parent timestep is the
    /// tree edge itself and is skipped.
    fn obs_likelihood_ratio<'a>(
        &self,
        feature: &FeatureEstimate,
        observations: impl Iterator<Item = (&'a Timestep, &'a ObservationModel)>,
        mut obs_timestep: Timestep,
        mut new_obs: Point2D,
    ) -> f64 {
        let mut log_ratio = 0.0;

        let mut old_obs = self
            .state_estimates
            .accumulate_range(obs_timestep.index(), feature.parent_timestep.index())
            + feature.estimate;

        for (&t, obs) in observations {
            if t == feature.parent_timestep {
                continue;
            }
            let state_change = self
                .state_estimates
                .accumulate_range(t.index(), obs_timestep.index());
            new_obs = state_change + new_obs;
            old_obs = state_change + old_obs;
            obs_timestep = t;

            log_ratio += obs.log_likelihood(&new_obs) - obs.log_likelihood(&old_obs);
        }

        log_ratio
    }

    /// Recompute the log likelihood from scratch over every edge and
    /// non-tree observation. Used to verify the running value.
    pub fn recompute_log_likelihood(&self) -> f64 {
        let mut total = 0.0;

        for t in 0..self.state_estimates.len() {
            let control = self.data.control(Timestep(t));
            total += control.log_likelihood(self.state_estimates.get(t));
        }

        for feature in &self.feature_estimates {
            let timeline = self.data.feature_timeline(feature.id);
            for (&t, obs) in timeline.iter() {
                if t >= self.next_timestep {
                    continue;
                }
                let relative = self
                    .state_estimates
                    .accumulate_range(t.index(), feature.parent_timestep.index())
                    + feature.estimate;
                total += obs.log_likelihood(&relative);
            }
        }

        total
    }
}

impl Listener for McmcSlam {
    fn on_observation(
        &mut self,
        t: Timestep,
        id: FeatureId,
        obs: &ObservationModel,
        new_feature: bool,
    ) {
        self.pending_observations
            .push((t, id, obs.clone(), new_feature));
    }

    fn on_timestep(&mut self, t: Timestep) {
        self.timestep(t);
    }
}

impl SlamResult for McmcSlam {
    fn current_timestep(&self) -> Timestep {
        self.current_timestep_internal()
    }

    fn get_state(&self, t: Timestep) -> Pose2D {
        assert!(
            t <= self.current_timestep_internal(),
            "mcmc-slam: {} is in the future",
            t
        );
        self.state_estimates.accumulate_prefix(t.index())
    }

    fn get_feature(&self, id: FeatureId) -> Point2D {
        let feature = &self.feature_estimates[self.feature_index[&id]];
        self.get_state(feature.parent_timestep) + feature.estimate
    }

    fn get_trajectory(&mut self) -> &Bitree<Pose2D> {
        &self.state_estimates
    }

    fn get_feature_map(&mut self) -> &BTreeMap<FeatureId, Point2D> {
        if self.map_estimate.len() != self.feature_estimates.len() {
            let mut map = BTreeMap::new();
            for (&id, &index) in &self.feature_index {
                let feature = &self.feature_estimates[index];
                map.insert(
                    id,
                    self.state_estimates
                        .accumulate_prefix(feature.parent_timestep.index())
                        + feature.estimate,
                );
            }
            self.map_estimate = map;
        }
        assert_eq!(self.map_estimate.len(), self.feature_estimates.len());
        &self.map_estimate
    }
}
