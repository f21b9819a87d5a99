//! Construction-time knobs for a [`crate::store::Store`].

/// Settings a [`crate::store::Store`] is opened with. Every field has a
/// sensible default; only override what a deployment actually needs to
/// change.
#[derive(Debug, Clone)]
pub struct Config {
    /// Byte width of every [`crate::hash::Hash`] this store accepts.
    pub hash_size: u8,
    /// Number of on-disk partitions hashes are routed across.
    pub set_count: u16,
    /// Spacing, in index entries, between sparse in-memory index
    /// samples. Smaller values cost more memory per subset but narrow
    /// the linear scan a lookup falls back to.
    pub sample_interval: usize,
    /// Store-wide in-memory cache budget, in bytes, split evenly across
    /// subsets when `save` trims against it. `usize::MAX` disables
    /// trimming.
    pub target_cache_data_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hash_size: 32,
            set_count: 256,
            sample_interval: 256,
            target_cache_data_size: usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let config = Config::default();
        assert_eq!(config.hash_size, 32);
        assert_eq!(config.set_count, 256);
        assert_eq!(config.target_cache_data_size, usize::MAX);
    }
}
