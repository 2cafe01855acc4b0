// SPDX-License-Identifier: MIT OR Apache-2.0

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::graph::DEFAULT_MAX_DEPTH;

/// Settings of a [`Manager`](crate::Manager).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// How many levels of parent groups are followed when resolving permissions.
    pub max_inheritance_depth: usize,

    /// Maximum number of cached resolutions before the least recently used ones are evicted.
    pub cache_capacity: usize,

    /// Primary group of new users and fallback when a user loses their primary group.
    pub default_group: String,

    /// Track used by [`Manager::select_track`](crate::Manager::select_track) when several exist.
    pub default_track: String,
}

impl Config {
    pub fn with_max_inheritance_depth(mut self, depth: usize) -> Self {
        self.max_inheritance_depth = depth;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_default_group(mut self, group: &str) -> Self {
        self.default_group = group.to_string();
        self
    }

    pub fn with_default_track(mut self, track: &str) -> Self {
        self.default_track = track.to_string();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_inheritance_depth: DEFAULT_MAX_DEPTH,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            default_group: "default".to_string(),
            default_track: "default".to_string(),
        }
    }
}
