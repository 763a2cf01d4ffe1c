use crate::util::constants::*;
use std::default::Default;

/// The prefix of environment variables that can set options, e.g. `MMTK_VERIFY_METASPACE=true`.
pub const ENV_VAR_PREFIX: &str = "MMTK_";

/// Default word size of a freshly reserved non-class virtual space node (2 MB).
pub const DEFAULT_VIRTUAL_SPACE_NODE_WORDS: usize = (2 * BYTES_IN_MBYTE) >> LOG_BYTES_IN_WORD;
/// Default reserve limit for the non-class metaspace (64 MB).
pub const DEFAULT_MAX_METASPACE_WORDS: usize = (64 * BYTES_IN_MBYTE) >> LOG_BYTES_IN_WORD;
/// Default size of the single class space node (16 MB).
pub const DEFAULT_CLASS_SPACE_WORDS: usize = (16 * BYTES_IN_MBYTE) >> LOG_BYTES_IN_WORD;
/// Default commit granule (64 KB).
pub const DEFAULT_COMMIT_GRANULE_WORDS: usize = (64 * BYTES_IN_KBYTE) >> LOG_BYTES_IN_WORD;

fn always_valid<T>(_: &T) -> bool {
    true
}

fn positive(v: &usize) -> bool {
    *v > 0
}

fn valid_percent(v: &usize) -> bool {
    *v <= 100
}

// Chunks must at least hold their header plus one payload word.
fn valid_chunk_words(v: &usize) -> bool {
    *v > crate::metaspace::Metachunk::overhead()
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        /// Runtime options. Each option has a type, a validator and a default value.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from a string key and a string value. Returns true if the
            /// key is known and the value can be parsed and passes validation.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling process()) to the right type
                    $(stringify!($name) => if let Ok(val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(&val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val;
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option key {:?}", s);
                        false
                    }
                }
            }

            /// Names of all the options.
            pub const OPTION_NAMES: &'static [&'static str] = &[$(stringify!($name)),*];
        }
        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
    ]
}

options! {
    /// Number of GC worker threads used by a parallel candidate rebuild.
    threads:                        usize [positive] = num_cpus::get(),
    /// Run structural verification of chunks, nodes and the chooser, and mangle fresh chunks.
    verify_metaspace:               bool  [always_valid] = cfg!(debug_assertions),
    /// Word size of a specialized chunk in the non-class space. This is the occupancy map granule.
    specialized_chunk_words:        usize [valid_chunk_words] = 128,
    /// Word size of a small chunk in the non-class space.
    small_chunk_words:              usize [valid_chunk_words] = 512,
    /// Word size of a medium chunk in the non-class space.
    medium_chunk_words:             usize [valid_chunk_words] = 8 * 1024,
    /// Word size of a specialized chunk in the class space.
    class_specialized_chunk_words:  usize [valid_chunk_words] = 128,
    /// Word size of a small chunk in the class space.
    class_small_chunk_words:        usize [valid_chunk_words] = 256,
    /// Word size of a medium chunk in the class space.
    class_medium_chunk_words:       usize [valid_chunk_words] = 4 * 1024,
    /// Word size of a newly reserved non-class node.
    virtual_space_node_words:       usize [positive] = DEFAULT_VIRTUAL_SPACE_NODE_WORDS,
    /// Upper bound of the words reserved by all non-class nodes.
    max_metaspace_words:            usize [positive] = DEFAULT_MAX_METASPACE_WORDS,
    /// Word size of the class space. The class space is a single node.
    class_space_words:              usize [positive] = DEFAULT_CLASS_SPACE_WORDS,
    /// Nodes are committed in multiples of this many words.
    commit_granule_words:           usize [positive] = DEFAULT_COMMIT_GRANULE_WORDS,
    /// Size of a heap region in bytes.
    region_bytes:                   usize [positive] = DEFAULT_REGION_BYTES,
    /// Regions with more live bytes than this percentage of the region size are not candidates.
    mixed_gc_live_threshold_percent: usize [valid_percent] = DEFAULT_MIXED_GC_LIVE_THRESHOLD_PERCENT,
}

impl Options {
    /// Set options in bulk from a string of space-separated `key=value` pairs.
    /// Returns false if any pair is malformed or rejected; the remaining pairs are still applied.
    pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
        let mut all_ok = true;
        for opt in options.split_ascii_whitespace() {
            match opt.split_once('=') {
                Some((key, val)) => {
                    if !self.set_from_str(key, val) {
                        all_ok = false;
                    }
                }
                None => {
                    warn!("Malformed option {:?}, expected key=value", opt);
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Read options from environment variables that start with `MMTK_` and match an option
    /// name, such as `MMTK_MIXED_GC_LIVE_THRESHOLD_PERCENT`.
    pub fn read_env_var_settings(&mut self) {
        for (key, val) in std::env::vars() {
            // strip the prefix, and get the lower case string
            if let Some(rest_of_key) = key.strip_prefix(ENV_VAR_PREFIX) {
                let lowercase: &str = &rest_of_key.to_lowercase();
                if Self::OPTION_NAMES.contains(&lowercase) {
                    self.set_from_str(lowercase, &val);
                }
            }
        }
    }

    /// Default options overridden by `MMTK_` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.read_env_var_settings();
        options
    }
}
