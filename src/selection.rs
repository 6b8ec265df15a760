//! Strategies for picking the next image out of the pool.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::pool::ImageCandidate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Walk the pool in order, wrapping around.
    #[default]
    Sequential,
    /// Pick uniformly at random with replacement.
    Random,
}

impl SelectionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Sequential => "sequential",
            SelectionMode::Random => "random",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(SelectionMode::Sequential),
            "random" => Ok(SelectionMode::Random),
            other => Err(format!(
                "unknown selection mode '{other}' (expected 'sequential' or 'random')"
            )),
        }
    }
}

/// Runtime selection state.
///
/// The sequential counter advances on every call, whether or not the caller
/// manages to upload the returned image, so a persistently failing image
/// never blocks the ones after it.
#[derive(Debug, Clone)]
pub enum Selector {
    Sequential { cycle: u64 },
    Random { rng: StdRng },
}

impl Selector {
    pub fn new(mode: SelectionMode, seed: Option<u64>) -> Self {
        match mode {
            SelectionMode::Sequential => Selector::Sequential { cycle: 0 },
            SelectionMode::Random => {
                let rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                Selector::Random { rng }
            }
        }
    }

    pub fn mode(&self) -> SelectionMode {
        match self {
            Selector::Sequential { .. } => SelectionMode::Sequential,
            Selector::Random { .. } => SelectionMode::Random,
        }
    }

    /// Number of selections made so far by the sequential strategy.
    pub fn cycle(&self) -> Option<u64> {
        match self {
            Selector::Sequential { cycle } => Some(*cycle),
            Selector::Random { .. } => None,
        }
    }

    /// Pick the next candidate.
    ///
    /// # Panics
    /// Panics if `pool` is empty; callers check for an empty pool first.
    pub fn select_next<'a>(&mut self, pool: &'a [ImageCandidate]) -> &'a ImageCandidate {
        assert!(!pool.is_empty(), "select_next called with an empty pool");
        let index = match self {
            Selector::Sequential { cycle } => {
                let index = (*cycle % pool.len() as u64) as usize;
                *cycle = cycle.wrapping_add(1);
                index
            }
            Selector::Random { rng } => rng.random_range(0..pool.len()),
        };
        &pool[index]
    }
}

/// Dry-run the selector for `iterations` cycles without touching the remote side.
pub fn plan(
    pool: &[ImageCandidate],
    mode: SelectionMode,
    seed: Option<u64>,
    iterations: usize,
) -> Vec<PathBuf> {
    if pool.is_empty() {
        return Vec::new();
    }
    let mut selector = Selector::new(mode, seed);
    (0..iterations)
        .map(|_| selector.select_next(pool).path().to_path_buf())
        .collect()
}
