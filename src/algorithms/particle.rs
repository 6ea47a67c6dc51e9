//! Generic weighted particle population.
//!
//! The filter itself is estimator-agnostic: FastSLAM supplies the
//! per-particle state and the step closure, this module owns the
//! weights, the effective-size diagnostic and systematic resampling.

use rand::Rng;

use crate::error::{Error, Result};

/// One weighted particle.
#[derive(Debug, Clone)]
struct Particle<P> {
    weight: f64,
    value: P,
}

/// A weighted multiset of particles.
#[derive(Debug, Clone, Default)]
pub struct ParticleFilter<P> {
    particles: Vec<Particle<P>>,
}

impl<P> ParticleFilter<P> {
    /// Create an empty population.
    pub fn new() -> Self {
        Self {
            particles: Vec::new(),
        }
    }

    /// Create a population of `n` copies of `value`, each with weight
    /// `1/n`.
    pub fn initialize(n: usize, value: P) -> Self
    where
        P: Clone,
    {
        let weight = 1.0 / n as f64;
        Self {
            particles: (0..n)
                .map(|_| Particle {
                    weight,
                    value: value.clone(),
                })
                .collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Append a particle with unit weight.
    pub fn push(&mut self, value: P) {
        self.particles.push(Particle { weight: 1.0, value });
    }

    /// Apply `step` to each particle and multiply its weight by the
    /// returned factor.
    pub fn update<F: FnMut(&mut P) -> f64>(&mut self, mut step: F) {
        for particle in &mut self.particles {
            particle.weight *= step(&mut particle.value);
        }
    }

    /// Sum of all weights.
    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }

    /// Effective sample size `(Σw)² / Σw²`.
    pub fn effective_size(&self) -> f64 {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        let sum_sq: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_sq > 0.0 {
            sum * sum / sum_sq
        } else {
            0.0
        }
    }

    /// The particle with the largest weight; ties resolve to the earliest
    /// inserted. The population must be nonempty.
    pub fn max_weight_particle(&self) -> &P {
        let mut best = self
            .particles
            .first()
            .expect("max_weight_particle on empty population");
        for particle in &self.particles[1..] {
            if particle.weight > best.weight {
                best = particle;
            }
        }
        &best.value
    }

    /// Systematic resampling to a population of exactly `n`.
    ///
    /// Draws a single uniform `u ∈ [0, 1/n)` and selects the particles at
    /// cumulative weights `(u + i/n)·Σw`. All weights are reset to `1/n`.
    /// Fails with [`Error::ParticleDepletion`] when every weight is zero.
    pub fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R, n: usize) -> Result<()>
    where
        P: Clone,
    {
        let total = self.total_weight();
        if total <= 0.0 || !total.is_finite() {
            return Err(Error::ParticleDepletion);
        }

        let step = total / n as f64;
        let mut target = rng.gen::<f64>() * step;
        let mut cumulative = 0.0;
        let mut source = self.particles.iter();
        let mut current: Option<&Particle<P>> = None;

        let uniform = 1.0 / n as f64;
        let mut resampled = Vec::with_capacity(n);
        for _ in 0..n {
            while cumulative <= target {
                match source.next() {
                    Some(p) => {
                        cumulative += p.weight;
                        current = Some(p);
                    }
                    // guard against the comb landing past the last
                    // cumulative weight through rounding
                    None => break,
                }
            }
            let chosen = current.expect("resampling selected before any weight");
            resampled.push(Particle {
                weight: uniform,
                value: chosen.value.clone(),
            });
            target += step;
        }

        self.particles = resampled;
        Ok(())
    }

    /// Iterate over particle values.
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.particles.iter().map(|p| &p.value)
    }

    /// Iterate mutably over particle values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> {
        self.particles.iter_mut().map(|p| &mut p.value)
    }

    /// Iterate over `(weight, value)` pairs.
    pub fn iter_weighted(&self) -> impl Iterator<Item = (f64, &P)> {
        self.particles.iter().map(|p| (p.weight, &p.value))
    }
}
