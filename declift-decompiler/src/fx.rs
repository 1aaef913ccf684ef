//! HashMap/HashSet aliases using the deterministic Fx hasher.

pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
