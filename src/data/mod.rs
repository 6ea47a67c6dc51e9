//! The shared event log.
//!
//! [`SlamData`] is an append-only record of everything the robot knew:
//! one control distribution per timestep and, for every landmark, a
//! sparse timeline of observation distributions. All estimators replay
//! the same log; the driver is its only writer.
//!
//! Listeners register through [`Weak`] handles and are notified in
//! registration order as events are appended. A dropped listener's slot
//! is collected on the next broadcast. Mutation goes through `&self`
//! (interior mutability) so the driver can hold the same shared handle
//! the listeners read from; the whole arrangement is single-threaded.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::core::models::{ControlModel, ObservationModel};
use crate::core::types::{FeatureId, Timestep};

/// Sparse observation timeline of one feature.
pub type FeatureTimeline = BTreeMap<Timestep, ObservationModel>;

/// Callbacks fired by [`SlamData`] as events are appended.
///
/// All methods default to no-ops so listeners implement only what they
/// consume.
pub trait Listener {
    /// A control taking state `t` to state `t + 1` was appended.
    fn on_control(&mut self, _t: Timestep, _control: &ControlModel) {}

    /// An observation of `id` was appended at timestep `t`.
    /// `new_feature` is true iff this is the first observation of `id`.
    fn on_observation(
        &mut self,
        _t: Timestep,
        _id: FeatureId,
        _obs: &ObservationModel,
        _new_feature: bool,
    ) {
    }

    /// All events of timestep `t` have been delivered.
    fn on_timestep(&mut self, _t: Timestep) {}

    /// The simulation is over; no further events will arrive.
    fn on_completed(&mut self) {}
}

/// Append-only store of controls and observations with listener
/// multicast.
#[derive(Default)]
pub struct SlamData {
    controls: RefCell<Vec<ControlModel>>,
    features: RefCell<BTreeMap<FeatureId, FeatureTimeline>>,
    listeners: RefCell<Vec<Weak<RefCell<dyn Listener>>>>,
}

impl SlamData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The log keeps only a weak handle.
    pub fn add_listener(&self, listener: &Rc<RefCell<dyn Listener>>) {
        self.listeners.borrow_mut().push(Rc::downgrade(listener));
    }

    /// The timestep the next control will be labeled with; equals the
    /// number of controls recorded so far.
    pub fn current_timestep(&self) -> Timestep {
        Timestep(self.controls.borrow().len())
    }

    /// The control taking state `t` to state `t + 1`.
    pub fn control(&self, t: Timestep) -> ControlModel {
        let controls = self.controls.borrow();
        assert!(
            t.index() < controls.len(),
            "no control recorded for {}",
            t
        );
        controls[t.index()].clone()
    }

    /// The observation timeline of `id`. The feature must have been
    /// observed at least once.
    pub fn feature_timeline(&self, id: FeatureId) -> Ref<'_, FeatureTimeline> {
        Ref::map(self.features.borrow(), |features| {
            features
                .get(&id)
                .unwrap_or_else(|| panic!("feature {} was never observed", id))
        })
    }

    /// The observation of `id` at `t`.
    pub fn observation(&self, id: FeatureId, t: Timestep) -> ObservationModel {
        self.feature_timeline(id)
            .get(&t)
            .unwrap_or_else(|| panic!("feature {} has no observation at {}", id, t))
            .clone()
    }

    /// The first timestep `id` was observed at (its parent timestep).
    pub fn parent_timestep(&self, id: FeatureId) -> Timestep {
        *self
            .feature_timeline(id)
            .keys()
            .next()
            .expect("feature timeline cannot be empty")
    }

    /// Number of distinct features observed so far.
    pub fn num_features(&self) -> usize {
        self.features.borrow().len()
    }

    /// Ids of all observed features, in order.
    pub fn feature_ids(&self) -> Vec<FeatureId> {
        self.features.borrow().keys().copied().collect()
    }

    /// Append a control and notify listeners. Advances
    /// `current_timestep`.
    pub fn add_control(&self, control: ControlModel) {
        let t = self.current_timestep();
        self.controls.borrow_mut().push(control.clone());
        self.for_each_listener(|listener| listener.on_control(t, &control));
    }

    /// Append an observation of `id` at the current timestep and notify
    /// listeners.
    ///
    /// A second observation of the same `(feature, timestep)` pair is
    /// ignored without notification.
    pub fn add_observation(&self, id: FeatureId, obs: ObservationModel) {
        let t = self.current_timestep();
        let new_feature = {
            let mut features = self.features.borrow_mut();
            let (new_feature, timeline) = match features.entry(id) {
                std::collections::btree_map::Entry::Vacant(e) => (true, e.insert(BTreeMap::new())),
                std::collections::btree_map::Entry::Occupied(e) => (false, e.into_mut()),
            };
            match timeline.entry(t) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(obs.clone());
                }
                std::collections::btree_map::Entry::Occupied(_) => return,
            }
            new_feature
        };
        self.for_each_listener(|listener| listener.on_observation(t, id, &obs, new_feature));
    }

    /// Signal that all events of the current timestep have been
    /// delivered.
    pub fn end_timestep(&self) {
        let t = self.current_timestep();
        self.for_each_listener(|listener| listener.on_timestep(t));
    }

    /// Signal the end of the simulation.
    pub fn end_simulation(&self) {
        self.for_each_listener(|listener| listener.on_completed());
    }

    fn for_each_listener<F: FnMut(&mut dyn Listener)>(&self, mut f: F) {
        // snapshot the registry so callbacks may read the log freely
        let snapshot: Vec<Weak<RefCell<dyn Listener>>> = self.listeners.borrow().clone();
        let mut any_dead = false;
        for weak in &snapshot {
            match weak.upgrade() {
                Some(listener) => f(&mut *listener.borrow_mut()),
                None => any_dead = true,
            }
        }
        if any_dead {
            self.listeners
                .borrow_mut()
                .retain(|weak| weak.strong_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

    fn control(dx: f64) -> ControlModel {
        ControlModel::new(Vector3::new(dx, 0.0, 0.0), Matrix3::identity() * 0.1)
    }

    fn observation(range: f64) -> ObservationModel {
        ObservationModel::new(Vector2::new(range, 0.0), Matrix2::identity() * 0.1)
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl Listener for Recorder {
        fn on_control(&mut self, t: Timestep, _control: &ControlModel) {
            self.events.push(format!("control@{}", t));
        }
        fn on_observation(
            &mut self,
            t: Timestep,
            id: FeatureId,
            _obs: &ObservationModel,
            new_feature: bool,
        ) {
            self.events
                .push(format!("obs@{} {} new={}", t, id, new_feature));
        }
        fn on_timestep(&mut self, t: Timestep) {
            self.events.push(format!("step@{}", t));
        }
        fn on_completed(&mut self) {
            self.events.push("completed".to_string());
        }
    }

    #[test]
    fn test_event_sequence_and_new_feature_flag() {
        let data = SlamData::new();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        data.add_listener(&(recorder.clone() as Rc<RefCell<dyn Listener>>));

        data.add_observation(FeatureId(0), observation(5.0));
        data.end_timestep();
        data.add_control(control(1.0));
        data.add_observation(FeatureId(0), observation(4.0));
        data.add_observation(FeatureId(1), observation(2.0));
        data.end_timestep();
        data.end_simulation();

        assert_eq!(
            recorder.borrow().events,
            vec![
                "obs@t0 f0 new=true",
                "step@t0",
                "control@t0",
                "obs@t1 f0 new=false",
                "obs@t1 f1 new=true",
                "step@t1",
                "completed",
            ]
        );
    }

    #[test]
    fn test_duplicate_observation_ignored() {
        let data = SlamData::new();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        data.add_listener(&(recorder.clone() as Rc<RefCell<dyn Listener>>));

        data.add_observation(FeatureId(3), observation(5.0));
        data.add_observation(FeatureId(3), observation(6.0));

        assert_eq!(recorder.borrow().events.len(), 1);
        assert_eq!(data.feature_timeline(FeatureId(3)).len(), 1);
        // the first observation wins
        let obs = data.observation(FeatureId(3), Timestep(0));
        assert_eq!(obs.mean()[0], 5.0);
    }

    #[test]
    fn test_timeline_and_parent_timestep() {
        let data = SlamData::new();
        data.add_observation(FeatureId(0), observation(5.0));
        data.add_control(control(1.0));
        data.add_control(control(1.0));
        data.add_observation(FeatureId(0), observation(3.0));

        assert_eq!(data.current_timestep(), Timestep(2));
        assert_eq!(data.parent_timestep(FeatureId(0)), Timestep(0));
        let keys: Vec<Timestep> = data.feature_timeline(FeatureId(0)).keys().copied().collect();
        assert_eq!(keys, vec![Timestep(0), Timestep(2)]);
        assert_eq!(data.num_features(), 1);
    }

    #[test]
    fn test_dropped_listener_is_collected() {
        let data = SlamData::new();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        data.add_listener(&(recorder.clone() as Rc<RefCell<dyn Listener>>));
        assert_eq!(data.listeners.borrow().len(), 1);

        drop(recorder);
        data.add_control(control(1.0));
        assert_eq!(data.listeners.borrow().len(), 0);
    }

    #[test]
    #[should_panic(expected = "never observed")]
    fn test_missing_feature_timeline_panics() {
        let data = SlamData::new();
        let _ = data.feature_timeline(FeatureId(9));
    }
}
