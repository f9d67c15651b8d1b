//! Progress tracking for transfers and decodes
//!
//! Progress is a tree: a [`ProgressLeaf`] per transfer or decode, a
//! [`ProgressComposite`] per book (download + decrypt) and one composite for
//! the whole library. Every node synchronizes on its own state only, so many
//! workers can update different leaves without contending on a global lock.
//!
//! Composite percentages are computed from summed byte counts, not by
//! averaging child percentages.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Anything that can report a (total, current) pair
pub trait ProgressSource: Send + Sync {
    /// Returns `(total, current)`
    fn totals(&self) -> (u64, u64);

    /// Fraction complete in `0.0..`, defined as 0 when the total is 0
    fn percent(&self) -> f64 {
        let (total, current) = self.totals();
        ratio(total, current)
    }
}

fn ratio(total: u64, current: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        current as f64 / total as f64
    }
}

/// Mutable (total, current) counter
#[derive(Default)]
pub struct ProgressLeaf {
    total: AtomicU64,
    current: AtomicU64,
}

impl ProgressLeaf {
    /// Create a shareable leaf starting at zero
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    /// Record the completed count; never moves backwards
    pub fn set_current(&self, current: u64) {
        self.current.fetch_max(current, Ordering::AcqRel);
    }

    /// Convenience for progress callbacks that report both values
    pub fn update(&self, total: u64, current: u64) {
        self.set_total(total);
        self.set_current(current);
    }

    /// Mark as finished at whatever total is known
    pub fn complete(&self) {
        let total = self.total.load(Ordering::Acquire);
        self.set_current(total);
    }
}

impl ProgressSource for ProgressLeaf {
    fn totals(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Acquire),
            self.current.load(Ordering::Acquire),
        )
    }
}

impl fmt::Debug for ProgressLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (total, current) = self.totals();
        f.debug_struct("ProgressLeaf")
            .field("total", &total)
            .field("current", &current)
            .finish()
    }
}

/// Growable set of child progress sources
#[derive(Default)]
pub struct ProgressComposite {
    parts: RwLock<Vec<Arc<dyn ProgressSource>>>,
}

impl ProgressComposite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a child (leaf or composite)
    pub fn add(&self, part: Arc<dyn ProgressSource>) {
        match self.parts.write() {
            Ok(mut parts) => parts.push(part),
            Err(poisoned) => poisoned.into_inner().push(part),
        }
    }

    /// Create a new leaf attached to this composite
    pub fn add_leaf(&self) -> Arc<ProgressLeaf> {
        let leaf = ProgressLeaf::new();
        self.add(leaf.clone());
        leaf
    }

    /// Create a nested composite attached to this composite
    pub fn add_composite(&self) -> Arc<ProgressComposite> {
        let composite = ProgressComposite::new();
        self.add(composite.clone());
        composite
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        match self.parts.read() {
            Ok(parts) => parts.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressSource for ProgressComposite {
    fn totals(&self) -> (u64, u64) {
        // Snapshot the child list so child reads happen without holding our lock
        let parts: Vec<Arc<dyn ProgressSource>> = match self.parts.read() {
            Ok(parts) => parts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        parts.iter().fold((0, 0), |(total, current), part| {
            let (t, c) = part.totals();
            (total.saturating_add(t), current.saturating_add(c))
        })
    }
}

impl fmt::Debug for ProgressComposite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (total, current) = self.totals();
        f.debug_struct("ProgressComposite")
            .field("children", &self.len())
            .field("total", &total)
            .field("current", &current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_percent_zero_total() {
        let leaf = ProgressLeaf::new();
        assert_eq!(leaf.percent(), 0.0);
        leaf.set_current(10);
        assert_eq!(leaf.percent(), 0.0);
        assert!(!leaf.percent().is_nan());
    }

    #[test]
    fn test_leaf_percent() {
        let leaf = ProgressLeaf::new();
        leaf.update(200, 50);
        assert_eq!(leaf.totals(), (200, 50));
        assert!((leaf.percent() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_leaf_current_is_monotonic() {
        let leaf = ProgressLeaf::new();
        leaf.update(100, 60);
        leaf.set_current(20);
        assert_eq!(leaf.totals(), (100, 60));
        leaf.complete();
        assert_eq!(leaf.totals(), (100, 100));
    }

    #[test]
    fn test_composite_sums_rather_than_averages() {
        let composite = ProgressComposite::new();
        let small = composite.add_leaf();
        let large = composite.add_leaf();

        small.update(10, 10); // 100%
        large.update(90, 0); // 0%

        // Averaging percentages would give 0.5
        assert_eq!(composite.totals(), (100, 10));
        assert!((composite.percent() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_nested_composites() {
        let library = ProgressComposite::new();
        let book = library.add_composite();
        let download = book.add_leaf();
        let decode = book.add_leaf();
        let other_book = library.add_composite();
        let other = other_book.add_leaf();

        download.update(100, 100);
        decode.update(100, 50);
        other.update(200, 0);

        assert_eq!(book.totals(), (200, 150));
        assert_eq!(library.totals(), (400, 150));
        assert_eq!(library.len(), 2);
    }

    #[test]
    fn test_empty_composite_is_zero() {
        let composite = ProgressComposite::new();
        assert!(composite.is_empty());
        assert_eq!(composite.percent(), 0.0);

        composite.add_leaf();
        assert_eq!(composite.percent(), 0.0);
    }

    #[test]
    fn test_concurrent_leaf_updates() {
        let composite = ProgressComposite::new();
        let leaves: Vec<_> = (0..8).map(|_| composite.add_leaf()).collect();

        std::thread::scope(|scope| {
            for leaf in &leaves {
                scope.spawn(move || {
                    leaf.set_total(1000);
                    for i in 0..=1000 {
                        leaf.set_current(i);
                    }
                });
            }
        });

        assert_eq!(composite.totals(), (8000, 8000));
        assert!((composite.percent() - 1.0).abs() < f64::EPSILON);
    }
}
