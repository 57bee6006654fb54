pub use std::collections::{hash_map, hash_set};

pub type HashSet<K> = ahash::HashSet<K>;
pub type HashMap<K, V> = ahash::HashMap<K, V>;
