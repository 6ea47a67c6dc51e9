//! Binary indexed tree (Fenwick tree) over group elements.
//!
//! [`Bitree`] is a mutable sequence with cached range compositions,
//! giving O(log n) prefix accumulation and point assignment. Elements
//! come from a [`Group`]: composition need not commute, so the same
//! structure indexes both scalar edge weights (`f64`) and trajectories of
//! pose increments ([`Pose2D`]), where `accumulate_prefix(t)` is the pose
//! at time `t`.
//!
//! Each internal node caches the composition of the elements in its
//! range, composed left to right. Point assignment recomputes the caches
//! of the nodes covering the changed position from their children, which
//! keeps the cached compositions exactly equal to an on-demand
//! recomputation at all times.

use crate::core::pose::Pose2D;

/// A monoid with inverses, composed left to right.
pub trait Group: Clone {
    /// The neutral element.
    fn identity() -> Self;
    /// Composition `self ∘ other`.
    fn op(&self, other: &Self) -> Self;
    /// The element such that `x ∘ x⁻¹ == identity`.
    fn inverse(&self) -> Self;
}

impl Group for f64 {
    #[inline]
    fn identity() -> f64 {
        0.0
    }
    #[inline]
    fn op(&self, other: &f64) -> f64 {
        self + other
    }
    #[inline]
    fn inverse(&self) -> f64 {
        -self
    }
}

impl Group for Pose2D {
    #[inline]
    fn identity() -> Pose2D {
        Pose2D::identity()
    }
    #[inline]
    fn op(&self, other: &Pose2D) -> Pose2D {
        self.compose(other)
    }
    #[inline]
    fn inverse(&self) -> Pose2D {
        Pose2D::inverse(self)
    }
}

#[inline]
fn lowbit(i: usize) -> usize {
    i & i.wrapping_neg()
}

/// Fenwick tree over group elements.
///
/// Node `p` (1-based) caches the composition of elements in the range
/// `(p - lowbit(p), p]`.
#[derive(Debug, Clone)]
pub struct Bitree<T: Group> {
    elems: Vec<T>,
    tree: Vec<T>,
}

impl<T: Group> Default for Bitree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Group> Bitree<T> {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            tree: vec![T::identity()],
        }
    }

    /// Create an empty tree with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut tree = Vec::with_capacity(capacity + 1);
        tree.push(T::identity());
        Self {
            elems: Vec::with_capacity(capacity),
            tree,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// The element at `i`.
    #[inline]
    pub fn get(&self, i: usize) -> &T {
        &self.elems[i]
    }

    /// Iterate over the raw elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.elems.iter()
    }

    /// Recompute the cache of node `p` from its element and the caches of
    /// its child nodes (which must already be current).
    fn recompute_node(&mut self, p: usize) {
        let mut v = self.elems[p - 1].clone();
        let bottom = p - lowbit(p);
        let mut q = p - 1;
        while q > bottom {
            v = self.tree[q].op(&v);
            q -= lowbit(q);
        }
        self.tree[p] = v;
    }

    /// Append an element.
    pub fn push_back(&mut self, x: T) {
        self.elems.push(x);
        self.tree.push(T::identity());
        let p = self.elems.len();
        self.recompute_node(p);
    }

    /// Append the element that makes the total composition equal `total`.
    pub fn push_back_accumulated(&mut self, total: T) {
        let increment = self.accumulate().inverse().op(&total);
        self.push_back(increment);
    }

    /// Remove and return the last element.
    pub fn pop_back(&mut self) -> Option<T> {
        let x = self.elems.pop()?;
        self.tree.pop();
        Some(x)
    }

    /// Resize to `n` elements; new slots hold the identity.
    pub fn resize(&mut self, n: usize) {
        while self.len() > n {
            self.pop_back();
        }
        while self.len() < n {
            self.push_back(T::identity());
        }
    }

    /// Remove all elements.
    pub fn clear(&mut self) {
        self.elems.clear();
        self.tree.truncate(1);
    }

    /// Assign the element at `i`, updating the affected caches.
    pub fn set(&mut self, i: usize, x: T) {
        assert!(i < self.len(), "bitree index {} out of range {}", i, self.len());
        self.elems[i] = x;
        let n = self.len();
        let mut p = i + 1;
        while p <= n {
            self.recompute_node(p);
            p += lowbit(p);
        }
    }

    /// Composition of the first `i` elements, left to right.
    pub fn accumulate_prefix(&self, i: usize) -> T {
        assert!(i <= self.len(), "bitree prefix {} out of range {}", i, self.len());
        let mut acc = T::identity();
        let mut j = i;
        while j > 0 {
            acc = self.tree[j].op(&acc);
            j -= lowbit(j);
        }
        acc
    }

    /// Composition of all elements.
    pub fn accumulate(&self) -> T {
        self.accumulate_prefix(self.len())
    }

    /// Group difference of prefixes: `accumulate_prefix(a)⁻¹ ∘
    /// accumulate_prefix(b)`.
    ///
    /// For trajectories this is the relative motion from the pose at `a`
    /// to the pose at `b`; either order of `a` and `b` is valid.
    pub fn accumulate_range(&self, a: usize, b: usize) -> T {
        self.accumulate_prefix(a).inverse().op(&self.accumulate_prefix(b))
    }
}

impl Bitree<f64> {
    /// Smallest index `i` such that `accumulate_prefix(i + 1) > x`, for
    /// nonnegative weights; ties resolve to the left. Returns `len()`
    /// when no prefix exceeds `x`.
    pub fn binary_search(&self, x: f64) -> usize {
        let n = self.len();
        if n == 0 {
            return 0;
        }
        let mut bit = 1usize;
        while bit * 2 <= n {
            bit *= 2;
        }
        let mut pos = 0;
        let mut rem = x;
        while bit > 0 {
            let next = pos + bit;
            if next <= n && self.tree[next] <= rem {
                rem -= self.tree[next];
                pos = next;
            }
            bit >>= 1;
        }
        pos
    }
}

impl<T: Group + PartialEq> PartialEq for Bitree<T> {
    fn eq(&self, other: &Self) -> bool {
        self.elems == other.elems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn naive_prefix(elems: &[f64], i: usize) -> f64 {
        elems[..i].iter().sum()
    }

    #[test]
    fn test_prefix_matches_naive_after_mixed_operations() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tree = Bitree::new();
        let mut shadow: Vec<f64> = Vec::new();

        for step in 0..500 {
            match step % 7 {
                0 | 1 | 2 => {
                    let x = rng.gen::<f64>();
                    tree.push_back(x);
                    shadow.push(x);
                }
                3 if !shadow.is_empty() => {
                    let i = rng.gen_range(0..shadow.len());
                    let x = rng.gen::<f64>();
                    tree.set(i, x);
                    shadow[i] = x;
                }
                4 if !shadow.is_empty() => {
                    tree.pop_back();
                    shadow.pop();
                }
                5 => {
                    let n = rng.gen_range(0..=shadow.len() + 3);
                    tree.resize(n);
                    shadow.resize(n, 0.0);
                }
                _ => {}
            }
            for i in 0..=shadow.len() {
                assert_relative_eq!(
                    tree.accumulate_prefix(i),
                    naive_prefix(&shadow, i),
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn test_pose_prefix_is_composed_in_order() {
        use std::f64::consts::FRAC_PI_2;
        let mut tree = Bitree::new();
        tree.push_back(Pose2D::new(1.0, 0.0, FRAC_PI_2));
        tree.push_back(Pose2D::new(1.0, 0.0, 0.0));
        tree.push_back(Pose2D::new(1.0, 0.0, FRAC_PI_2));

        // walk 1m, turn left, walk 1m, turn left, walk 1m
        let p = tree.accumulate_prefix(2);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-12);

        let total = tree.accumulate();
        assert_relative_eq!(total.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(total.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_prefix_matches_naive_after_updates() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut tree = Bitree::new();
        let mut shadow: Vec<Pose2D> = Vec::new();

        for _ in 0..80 {
            let p = Pose2D::new(
                rng.gen::<f64>() - 0.5,
                rng.gen::<f64>() - 0.5,
                rng.gen::<f64>() - 0.5,
            );
            tree.push_back(p);
            shadow.push(p);
        }
        for _ in 0..40 {
            let i = rng.gen_range(0..shadow.len());
            let p = Pose2D::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>());
            tree.set(i, p);
            shadow[i] = p;
        }

        for i in 0..=shadow.len() {
            let expected = shadow[..i]
                .iter()
                .fold(Pose2D::identity(), |acc, p| acc.compose(p));
            let got = tree.accumulate_prefix(i);
            assert_relative_eq!(got.x, expected.x, epsilon = 1e-9);
            assert_relative_eq!(got.y, expected.y, epsilon = 1e-9);
            assert_relative_eq!(got.theta, expected.theta, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_accumulate_range_is_relative_motion() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut tree = Bitree::new();
        for _ in 0..20 {
            tree.push_back(Pose2D::new(
                rng.gen::<f64>(),
                rng.gen::<f64>(),
                rng.gen::<f64>(),
            ));
        }
        for (a, b) in [(0, 20), (5, 13), (13, 5), (7, 7)] {
            let rel = tree.accumulate_range(a, b);
            let recomposed = tree.accumulate_prefix(a).compose(&rel);
            let expected = tree.accumulate_prefix(b);
            assert_relative_eq!(recomposed.x, expected.x, epsilon = 1e-9);
            assert_relative_eq!(recomposed.y, expected.y, epsilon = 1e-9);
            assert_relative_eq!(recomposed.theta, expected.theta, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_push_back_accumulated() {
        let mut tree = Bitree::new();
        tree.push_back_accumulated(Pose2D::new(1.0, 0.0, 0.0));
        tree.push_back_accumulated(Pose2D::new(2.0, 1.0, 0.3));
        tree.push_back_accumulated(Pose2D::new(2.5, 1.0, 0.3));

        let p = tree.accumulate_prefix(2);
        assert_relative_eq!(p.x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-12);
        let p = tree.accumulate();
        assert_relative_eq!(p.x, 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_binary_search_first_exceeding_prefix() {
        let mut tree = Bitree::new();
        for w in [1.0, 0.0, 2.0, 1.0] {
            tree.push_back(w);
        }
        // prefixes: 1, 1, 3, 4
        assert_eq!(tree.binary_search(0.0), 0);
        assert_eq!(tree.binary_search(0.5), 0);
        assert_eq!(tree.binary_search(1.0), 2); // prefix(1) == 1 does not exceed
        assert_eq!(tree.binary_search(2.9), 2);
        assert_eq!(tree.binary_search(3.0), 3);
        assert_eq!(tree.binary_search(3.5), 3);
        assert_eq!(tree.binary_search(4.0), 4); // out of range: nothing exceeds
    }

    #[test]
    fn test_binary_search_matches_linear_scan() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut tree = Bitree::new();
        let mut weights = Vec::new();
        for _ in 0..37 {
            let w = rng.gen::<f64>();
            tree.push_back(w);
            weights.push(w);
        }
        let total: f64 = weights.iter().sum();
        for _ in 0..200 {
            let x = rng.gen::<f64>() * total;
            let expected = {
                let mut acc = 0.0;
                let mut idx = weights.len();
                for (i, w) in weights.iter().enumerate() {
                    acc += w;
                    if acc > x {
                        idx = i;
                        break;
                    }
                }
                idx
            };
            assert_eq!(tree.binary_search(x), expected);
        }
    }

    #[test]
    fn test_clear_and_empty() {
        let mut tree: Bitree<f64> = Bitree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.accumulate(), 0.0);
        tree.push_back(1.0);
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.binary_search(0.0), 0);
    }
}
