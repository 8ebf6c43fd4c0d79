use serde::Deserialize;

use crate::transform::{BlockCodec, Key, DEFAULT_PBKDF2_ITERATIONS, DEFAULT_SALT};

/// Store-wide settings, usually read from the query string of the store
/// URL, e.g. `sled:///var/lib/tfhfs?shared=true&pad_to=4096`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreOptions {
    /// Try LZ4 on every block, keeping the result only if it is smaller.
    #[serde(default = "default_compress")]
    pub compress: bool,

    /// Round stored payloads up to a multiple of this many bytes.
    #[serde(default)]
    pub pad_to: Option<u32>,

    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Defer deletion of unreferenced blocks to [super::BlockStore::gc], as
    /// other writers may share the backend.
    #[serde(default)]
    pub shared: bool,

    /// Number of decoded blocks to keep in memory. 0 disables the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_compress() -> bool {
    true
}

fn default_pbkdf2_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

fn default_cache_size() -> usize {
    1024
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compress: default_compress(),
            pad_to: None,
            pbkdf2_iterations: default_pbkdf2_iterations(),
            shared: false,
            cache_size: default_cache_size(),
        }
    }
}

impl StoreOptions {
    /// Derives the store key from a passphrase.
    /// This is deliberately slow, callers in async context should move it to
    /// the blocking pool.
    pub fn derive_key(&self, passphrase: &[u8]) -> Key {
        Key::derive(passphrase, DEFAULT_SALT, self.pbkdf2_iterations)
    }

    pub fn codec(&self, key: Option<Key>) -> BlockCodec {
        BlockCodec::new(key)
            .with_compression(self.compress)
            .with_padding(self.pad_to)
    }
}
