//! Utility functions and types used throughout anvil.
//!
//! This module provides various helper types including:
//! - [`Size`] - Memory size representation
//! - Constants for memory operations ([`PAGE_SIZE`], [`CL_SIZE`], etc.)
//! - Core pinning for hammer workers ([`pin_current_thread`])
//! - Progress reporting utilities ([`NamedProgress`])
//! - Random number generation ([`Rng`])

mod affinity;
mod constants;
mod named_progress;
mod rng;
mod size;

pub use self::affinity::{AffinityError, online_cpus, pin_current_thread};
pub use self::constants::*;
pub use self::named_progress::{NamedProgress, named_bar};
pub use self::rng::Rng;
pub use self::size::{ParseSizeError, Size};

use std::collections::HashMap;

/// Trait for grouping collection elements by a key function.
///
/// Similar to SQL's GROUP BY operation.
pub trait GroupBy<V> {
    /// Groups elements by the result of applying a function to each element.
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&V) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<V>>;
}

impl<T> GroupBy<T> for Vec<T> {
    fn group_by<K: std::hash::Hash + std::cmp::Eq, F: Fn(&T) -> K>(
        self,
        f: F,
    ) -> HashMap<K, Vec<T>> {
        let mut out = HashMap::new();
        for elem in self {
            let k = f(&elem);
            out.entry(k).or_insert(vec![]).push(elem);
        }
        out
    }
}
