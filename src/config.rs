//! Table configuration.

/// The default bucket count hint.
const DEFAULT_MIN_SIZE: usize = 32;
/// The default collision threshold.
const DEFAULT_MAX_COLLISION: usize = 10;

/// Configuration of a table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// The bucket count hint.
    ///
    /// The initial number of buckets is the smallest prime strictly above `min_size + 1`.
    pub min_size: usize,
    /// Whether the table may grow on its own.
    pub allow_resize: bool,
    /// The collision threshold.
    ///
    /// When an insert leaves its chain with more than this number of entries (and resizing is
    /// allowed), the table is grown.
    ///
    /// Growing only helps if the chain splits. Keys with equal hashes (e.g. `"a"` and `"\0a"`)
    /// never do, so once more than `max_collision` of them are present, every further insert of
    /// such a key doubles the table again.
    pub max_collision: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            min_size: DEFAULT_MIN_SIZE,
            allow_resize: true,
            max_collision: DEFAULT_MAX_COLLISION,
        }
    }
}

impl Config {
    /// Set the bucket count hint.
    pub fn min_size(mut self, min_size: usize) -> Config {
        self.min_size = min_size;
        self
    }

    /// Enable or disable automatic growth.
    pub fn allow_resize(mut self, allow_resize: bool) -> Config {
        self.allow_resize = allow_resize;
        self
    }

    /// Set the collision threshold.
    pub fn max_collision(mut self, max_collision: usize) -> Config {
        self.max_collision = max_collision;
        self
    }
}
