//! String interning for decoded constants

use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Deduplicating string pool
///
/// Identical strings decoded through the same interner share one allocation.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: FxHashSet<Arc<str>>,
}

impl StringInterner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `value`, inserting it on first sight
    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return Arc::clone(existing);
        }
        let shared: Arc<str> = Arc::from(value);
        self.strings.insert(Arc::clone(&shared));
        shared
    }

    /// Number of distinct strings held
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_shares_storage() {
        let mut interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        let c = interner.intern("world");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
    }
}
