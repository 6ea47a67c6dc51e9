//! Graph-optimization SLAM.
//!
//! Maintains a pose-landmark factor graph: one pose vertex per timestep
//! (vertex 0 pinned to the identity to remove gauge freedom), one
//! landmark vertex per feature, a control edge between consecutive poses
//! and an observation edge per observation. The nonlinear least-squares
//! problem is solved by Levenberg-Marquardt over the whitened normal
//! equations, assembled sparsely:
//!
//! ```text
//! minimize  F(x) = Σ e(x)ᵀ Ω e(x),   Ω = (L Lᵀ)⁻¹
//! step      (Jᵀ J + λ diag) δ = -Jᵀ r,   r = L⁻¹ e
//! ```
//!
//! Each control edge touches two poses and each observation edge one
//! pose and one landmark, so the Jacobian has a constant number of
//! non-zeros per row. New vertices are seeded from an initializer (any
//! other estimator's running posterior, or dead reckoning via the
//! measurement means when none is attached), composed onto the graph's
//! current estimate.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::core::models::{ControlModel, ObservationModel};
use crate::core::pose::{Point2D, Pose2D};
use crate::core::types::{FeatureId, Timestep};
use crate::data::Listener;
use crate::engine::interfaces::SlamResult;
use crate::utils::bitree::Bitree;

/// Graph-SLAM parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraphSlamConfig {
    /// Solver iterations after each simulation step.
    pub steps_per_timestep: usize,
    /// Solver iterations when the simulation completes.
    pub end_steps: usize,
    /// Stop when the relative error gain of a step falls below this.
    pub gain_threshold: f64,
    /// Initial Levenberg-Marquardt damping.
    pub initial_lambda: f64,
}

impl Default for GraphSlamConfig {
    fn default() -> Self {
        Self {
            steps_per_timestep: 0,
            end_steps: 0,
            gain_threshold: 1e-8,
            initial_lambda: 1e-3,
        }
    }
}

/// Why an [`optimize`](GraphSlam::optimize) call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Relative gain fell below the threshold.
    Converged,
    /// The iteration limit was reached.
    MaxIterations,
    /// Damping grew past its cap without finding a descent step.
    Diverged,
    /// The damped normal equations could not be factored.
    SolveFailed,
    /// There was nothing to optimize yet.
    NoEdges,
}

/// Outcome of one [`optimize`](GraphSlam::optimize) call. Never an
/// error: non-convergence is reported, not raised.
#[derive(Debug, Clone)]
pub struct OptimizeResult {
    /// Iterations performed.
    pub iterations: usize,
    /// Objective before the first iteration.
    pub initial_error: f64,
    /// Objective after the last accepted step.
    pub final_error: f64,
    /// Whether the gain threshold was reached.
    pub converged: bool,
    /// Why iteration stopped.
    pub termination: TerminationReason,
}

struct ControlEdge {
    /// Pose vertex index `t`; the edge connects `t` and `t + 1`.
    from: usize,
    model: ControlModel,
    /// Whitening factor `L⁻¹` of the control covariance.
    sqrt_info: Matrix3<f64>,
}

struct ObservationEdge {
    pose: usize,
    feature: FeatureId,
    model: ObservationModel,
    sqrt_info: Matrix2<f64>,
}

/// Events buffered between step boundaries. The graph grows at
/// `on_timestep`, after earlier-registered listeners (in particular the
/// initializer) have advanced past the step.
enum PendingEvent {
    Control(Timestep, ControlModel),
    Observation(Timestep, FeatureId, ObservationModel, bool),
}

/// Graph-optimization SLAM estimator.
pub struct GraphSlam {
    config: GraphSlamConfig,
    initializer: Option<Rc<RefCell<dyn SlamResult>>>,

    /// Pose vertex estimates; index = timestep. Vertex 0 is fixed.
    poses: Vec<Pose2D>,
    landmarks: BTreeMap<FeatureId, Point2D>,
    /// Column order of landmark variables, in insertion order.
    landmark_order: Vec<FeatureId>,

    control_edges: Vec<ControlEdge>,
    observation_edges: Vec<ObservationEdge>,

    pending: Vec<PendingEvent>,

    trajectory_estimate: Bitree<Pose2D>,
    map_estimate: BTreeMap<FeatureId, Point2D>,

    next_timestep: Timestep,
}

/// Invert a lower-triangular Cholesky factor by back substitution.
fn invert_lower_triangular3(l: &Matrix3<f64>) -> Matrix3<f64> {
    l.solve_lower_triangular(&Matrix3::identity())
        .expect("control covariance factor must be nonsingular")
}

fn invert_lower_triangular2(l: &Matrix2<f64>) -> Matrix2<f64> {
    l.solve_lower_triangular(&Matrix2::identity())
        .expect("observation covariance factor must be nonsingular")
}

impl GraphSlam {
    /// Create an estimator whose new vertices are seeded from
    /// `initializer`, or from dead reckoning when `None`.
    pub fn new(config: GraphSlamConfig, initializer: Option<Rc<RefCell<dyn SlamResult>>>) -> Self {
        Self {
            config,
            initializer,
            poses: vec![Pose2D::identity()],
            landmarks: BTreeMap::new(),
            landmark_order: Vec::new(),
            control_edges: Vec::new(),
            observation_edges: Vec::new(),
            pending: Vec::new(),
            trajectory_estimate: Bitree::new(),
            map_estimate: BTreeMap::new(),
            next_timestep: Timestep(0),
        }
    }

    pub fn config(&self) -> &GraphSlamConfig {
        &self.config
    }

    /// Current value of the weighted least-squares objective.
    pub fn objective_value(&self) -> f64 {
        self.chi_squared()
    }

    /// Re-seed every vertex estimate from another estimator's posterior.
    pub fn reinitialise(&mut self, initializer: &mut dyn SlamResult) {
        let trajectory = initializer.get_trajectory();
        for t in 1..self.poses.len() {
            self.poses[t] = trajectory.accumulate_prefix(t);
        }
        self.trajectory_estimate.clear();

        let initial_state = initializer.get_initial_state();
        for (&id, &feature) in initializer.get_feature_map() {
            if let Some(landmark) = self.landmarks.get_mut(&id) {
                *landmark = -initial_state + feature;
            }
        }
        self.map_estimate.clear();
    }

    fn initializer_increment(&self, t: Timestep) -> Option<Pose2D> {
        let init = self.initializer.as_ref()?;
        let init = init.borrow();
        if init.current_timestep() >= t + 1 {
            Some(-init.get_state(t) + init.get_state(t + 1))
        } else {
            None
        }
    }

    fn initializer_feature(&self, t: Timestep, id: FeatureId) -> Option<Point2D> {
        let init = self.initializer.as_ref()?;
        let init = init.borrow();
        if init.current_timestep() >= t {
            Some(-init.get_state(t) + init.get_feature(id))
        } else {
            None
        }
    }

    /// Number of free variables: 3 per non-fixed pose, 2 per landmark.
    fn num_variables(&self) -> usize {
        (self.poses.len() - 1) * 3 + self.landmarks.len() * 2
    }

    fn pose_column(&self, t: usize) -> Option<usize> {
        if t == 0 {
            None
        } else {
            Some((t - 1) * 3)
        }
    }

    fn landmark_column(&self, order_index: usize) -> usize {
        (self.poses.len() - 1) * 3 + order_index * 2
    }

    fn control_error(&self, edge: &ControlEdge) -> Vector3<f64> {
        let predicted =
            ControlModel::observe(&(-self.poses[edge.from] + self.poses[edge.from + 1]));
        ControlModel::subtract(&predicted, edge.model.mean())
    }

    fn observation_error(&self, edge: &ObservationEdge) -> Vector2<f64> {
        let landmark = self.landmarks[&edge.feature];
        let predicted = ObservationModel::observe(&(-self.poses[edge.pose] + landmark));
        ObservationModel::subtract(&predicted, edge.model.mean())
    }

    /// Weighted squared error over all edges.
    fn chi_squared(&self) -> f64 {
        let mut chi2 = 0.0;
        for edge in &self.control_edges {
            chi2 += (edge.sqrt_info * self.control_error(edge)).norm_squared();
        }
        for edge in &self.observation_edges {
            chi2 += (edge.sqrt_info * self.observation_error(edge)).norm_squared();
        }
        chi2
    }

    /// Assemble the whitened Jacobian (sparse triplets) and the gradient
    /// `b = Jᵀ r`.
    fn build_system(&self) -> (CsMat<f64>, DVector<f64>) {
        let n_vars = self.num_variables();
        let n_residuals = self.control_edges.len() * 3 + self.observation_edges.len() * 2;
        let landmark_index: BTreeMap<FeatureId, usize> = self
            .landmark_order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        let mut triplets = TriMat::new((n_residuals, n_vars));
        let mut gradient = DVector::zeros(n_vars);
        let mut row = 0;

        let mut add_block = |triplets: &mut TriMat<f64>,
                             gradient: &mut DVector<f64>,
                             row: usize,
                             col: usize,
                             jacobian: &[f64],
                             rows: usize,
                             cols: usize,
                             residual: &[f64]| {
            for i in 0..rows {
                for j in 0..cols {
                    let value = jacobian[i * cols + j];
                    if value != 0.0 {
                        triplets.add_triplet(row + i, col + j, value);
                        gradient[col + j] += value * residual[i];
                    }
                }
            }
        };

        for edge in &self.control_edges {
            let pose = self.poses[edge.from];
            let next = self.poses[edge.from + 1];
            let (sin_t, cos_t) = pose.theta.sin_cos();
            let dx = next.x - pose.x;
            let dy = next.y - pose.y;

            let residual = edge.sqrt_info * self.control_error(edge);

            // error = observe(-v_t + v_{t+1}) - z, differentiated in the
            // frame of v_t
            let j_from = Matrix3::new(
                -cos_t,
                -sin_t,
                -sin_t * dx + cos_t * dy,
                sin_t,
                -cos_t,
                -cos_t * dx - sin_t * dy,
                0.0,
                0.0,
                -1.0,
            );
            let j_to = Matrix3::new(
                cos_t, sin_t, 0.0, //
                -sin_t, cos_t, 0.0, //
                0.0, 0.0, 1.0,
            );

            if let Some(col) = self.pose_column(edge.from) {
                let whitened = edge.sqrt_info * j_from;
                add_block(
                    &mut triplets,
                    &mut gradient,
                    row,
                    col,
                    whitened.transpose().as_slice(),
                    3,
                    3,
                    residual.as_slice(),
                );
            }
            if let Some(col) = self.pose_column(edge.from + 1) {
                let whitened = edge.sqrt_info * j_to;
                add_block(
                    &mut triplets,
                    &mut gradient,
                    row,
                    col,
                    whitened.transpose().as_slice(),
                    3,
                    3,
                    residual.as_slice(),
                );
            }
            row += 3;
        }

        for edge in &self.observation_edges {
            let pose = self.poses[edge.pose];
            let landmark = self.landmarks[&edge.feature];
            let dx = landmark.x - pose.x;
            let dy = landmark.y - pose.y;
            let q = (dx * dx + dy * dy).max(1e-12);
            let sqrt_q = q.sqrt();

            let residual = edge.sqrt_info * self.observation_error(edge);

            // range-bearing error differentiated at the world coordinates
            let j_pose = Matrix2x3::new(
                -dx / sqrt_q,
                -dy / sqrt_q,
                0.0,
                dy / q,
                -dx / q,
                -1.0,
            );
            let j_landmark = Matrix2::new(dx / sqrt_q, dy / sqrt_q, -dy / q, dx / q);

            if let Some(col) = self.pose_column(edge.pose) {
                let whitened = edge.sqrt_info * j_pose;
                add_block(
                    &mut triplets,
                    &mut gradient,
                    row,
                    col,
                    whitened.transpose().as_slice(),
                    2,
                    3,
                    residual.as_slice(),
                );
            }
            let col = self.landmark_column(landmark_index[&edge.feature]);
            let whitened = edge.sqrt_info * j_landmark;
            add_block(
                &mut triplets,
                &mut gradient,
                row,
                col,
                whitened.transpose().as_slice(),
                2,
                2,
                residual.as_slice(),
            );
            row += 2;
        }

        (triplets.to_csr(), gradient)
    }

    /// Solve `(JᵀJ + λ diag) δ = -b`.
    fn solve_step(jacobian: &CsMat<f64>, gradient: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
        let n_vars = jacobian.cols();
        let jt = jacobian.transpose_view();
        let jtj = &jt * jacobian;

        let mut hessian = DMatrix::zeros(n_vars, n_vars);
        for (value, (r, c)) in jtj.iter() {
            hessian[(r, c)] += *value;
        }
        for i in 0..n_vars {
            let diagonal: f64 = hessian[(i, i)];
            hessian[(i, i)] += lambda * diagonal.max(1.0);
        }

        let chol = hessian.cholesky()?;
        Some(chol.solve(&(-gradient)))
    }

    fn apply_update(&mut self, delta: &DVector<f64>) {
        for t in 1..self.poses.len() {
            let base = (t - 1) * 3;
            let step = Pose2D::from_vector(Vector3::new(
                delta[base],
                delta[base + 1],
                delta[base + 2],
            ));
            self.poses[t] = self.poses[t] + step;
        }
        for (i, id) in self.landmark_order.iter().enumerate() {
            let base = self.landmark_column(i);
            let landmark = self.landmarks.get_mut(id).expect("landmark order is stale");
            landmark.x += delta[base];
            landmark.y += delta[base + 1];
        }
    }

    /// Run up to `max_iterations` Levenberg-Marquardt iterations.
    pub fn optimize(&mut self, max_iterations: usize) -> OptimizeResult {
        if max_iterations == 0 || self.poses.len() <= 1 || self.observation_edges.is_empty() {
            let error = self.chi_squared();
            return OptimizeResult {
                iterations: 0,
                initial_error: error,
                final_error: error,
                converged: true,
                termination: TerminationReason::NoEdges,
            };
        }

        let initial_error = self.chi_squared();
        let mut current_error = initial_error;
        let mut lambda = self.config.initial_lambda;
        let mut iterations = 0;

        for _ in 0..max_iterations {
            iterations += 1;

            let (jacobian, gradient) = self.build_system();
            let delta = match Self::solve_step(&jacobian, &gradient, lambda) {
                Some(delta) => delta,
                None => {
                    log::warn!("graph-slam: normal equations could not be factored");
                    self.invalidate_caches();
                    return OptimizeResult {
                        iterations,
                        initial_error,
                        final_error: current_error,
                        converged: false,
                        termination: TerminationReason::SolveFailed,
                    };
                }
            };

            let saved_poses = self.poses.clone();
            let saved_landmarks = self.landmarks.clone();
            self.apply_update(&delta);
            let new_error = self.chi_squared();

            if !new_error.is_finite() || new_error > current_error {
                // reject the step and raise damping
                self.poses = saved_poses;
                self.landmarks = saved_landmarks;
                lambda *= 10.0;
                if lambda > 1e10 {
                    self.invalidate_caches();
                    return OptimizeResult {
                        iterations,
                        initial_error,
                        final_error: current_error,
                        converged: false,
                        termination: TerminationReason::Diverged,
                    };
                }
                continue;
            }

            lambda = (lambda * 0.1).max(1e-12);
            let gain = (current_error - new_error) / current_error.max(f64::MIN_POSITIVE);
            current_error = new_error;

            if gain < self.config.gain_threshold {
                self.invalidate_caches();
                return OptimizeResult {
                    iterations,
                    initial_error,
                    final_error: current_error,
                    converged: true,
                    termination: TerminationReason::Converged,
                };
            }
        }

        self.invalidate_caches();
        OptimizeResult {
            iterations,
            initial_error,
            final_error: current_error,
            converged: false,
            termination: TerminationReason::MaxIterations,
        }
    }

    fn invalidate_caches(&mut self) {
        self.trajectory_estimate.clear();
        self.map_estimate.clear();
    }
}

impl GraphSlam {
    fn process_control(&mut self, t: Timestep, control: &ControlModel) {
        assert_eq!(
            t.index(),
            self.poses.len() - 1,
            "graph-slam: control for {} delivered out of order",
            t
        );
        let increment = self
            .initializer_increment(t)
            .unwrap_or_else(|| control.mean_pose());
        let previous = *self.poses.last().expect("pose vertex 0 always exists");
        self.poses.push(previous + increment);

        self.control_edges.push(ControlEdge {
            from: t.index(),
            sqrt_info: invert_lower_triangular3(control.chol_cov()),
            model: control.clone(),
        });
    }

    fn process_observation(
        &mut self,
        t: Timestep,
        id: FeatureId,
        obs: &ObservationModel,
        new_feature: bool,
    ) {
        assert_eq!(
            t.index(),
            self.poses.len() - 1,
            "graph-slam: observation for {} delivered out of order",
            t
        );
        if new_feature {
            let relative = self
                .initializer_feature(t, id)
                .unwrap_or_else(|| obs.mean_feature());
            let estimate = self.poses[t.index()] + relative;
            self.landmarks.insert(id, estimate);
            self.landmark_order.push(id);
        }

        self.observation_edges.push(ObservationEdge {
            pose: t.index(),
            feature: id,
            sqrt_info: invert_lower_triangular2(obs.chol_cov()),
            model: obs.clone(),
        });
    }
}

impl Listener for GraphSlam {
    fn on_control(&mut self, t: Timestep, control: &ControlModel) {
        self.pending.push(PendingEvent::Control(t, control.clone()));
    }

    fn on_observation(
        &mut self,
        t: Timestep,
        id: FeatureId,
        obs: &ObservationModel,
        new_feature: bool,
    ) {
        self.pending
            .push(PendingEvent::Observation(t, id, obs.clone(), new_feature));
    }

    fn on_timestep(&mut self, t: Timestep) {
        if t < self.next_timestep {
            return;
        }
        assert_eq!(
            t, self.next_timestep,
            "graph-slam: timestep {} delivered out of order",
            t
        );

        // grow the graph only at step boundaries, once earlier listeners
        // (the initializer among them) have advanced past this step
        for event in std::mem::take(&mut self.pending) {
            match event {
                PendingEvent::Control(t, control) => self.process_control(t, &control),
                PendingEvent::Observation(t, id, obs, new_feature) => {
                    self.process_observation(t, id, &obs, new_feature)
                }
            }
        }

        self.next_timestep += 1;
        if self.config.steps_per_timestep > 0 {
            let result = self.optimize(self.config.steps_per_timestep);
            log::debug!(
                "graph-slam: {} iterations at {}, error {:.6} -> {:.6}",
                result.iterations,
                t,
                result.initial_error,
                result.final_error
            );
        }
    }

    fn on_completed(&mut self) {
        for event in std::mem::take(&mut self.pending) {
            match event {
                PendingEvent::Control(t, control) => self.process_control(t, &control),
                PendingEvent::Observation(t, id, obs, new_feature) => {
                    self.process_observation(t, id, &obs, new_feature)
                }
            }
        }
        if self.config.end_steps > 0 {
            let result = self.optimize(self.config.end_steps);
            log::info!(
                "graph-slam: final {} iterations ({:?}), error {:.6} -> {:.6}",
                result.iterations,
                result.termination,
                result.initial_error,
                result.final_error
            );
        }
    }
}

impl SlamResult for GraphSlam {
    fn current_timestep(&self) -> Timestep {
        assert!(
            self.next_timestep.index() > 0,
            "graph-slam: no timestep processed yet"
        );
        self.next_timestep - 1
    }

    fn get_state(&self, t: Timestep) -> Pose2D {
        assert!(
            t.index() < self.poses.len(),
            "graph-slam: no pose vertex for {}",
            t
        );
        self.poses[t.index()]
    }

    fn get_feature(&self, id: FeatureId) -> Point2D {
        self.landmarks[&id]
    }

    fn get_trajectory(&mut self) -> &Bitree<Pose2D> {
        let current = self.current_timestep().index();
        if self.trajectory_estimate.len() != current {
            self.trajectory_estimate.clear();
            for t in 1..=current {
                self.trajectory_estimate.push_back_accumulated(self.poses[t]);
            }
        }
        assert_eq!(self.trajectory_estimate.len(), current);
        &self.trajectory_estimate
    }

    fn get_feature_map(&mut self) -> &BTreeMap<FeatureId, Point2D> {
        if self.map_estimate.len() != self.landmarks.len() {
            self.map_estimate = self.landmarks.clone();
        }
        &self.map_estimate
    }
}
