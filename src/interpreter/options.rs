//! Named runtime tunables

use std::collections::HashMap;
use parking_lot::RwLock;

use crate::config::OptionConfig;
use crate::error::{AnvilError, AnvilResult};

/// `2`: fully asynchronous. `1`: `apply_op` waits when output metadata
/// cannot be inferred eagerly. `0`: every `apply_op` waits and raises
/// failures on the calling thread.
pub const ASYNC_LEVEL: &str = "async_level";
/// Non-zero lets `drop_value` release storage of regenerable tensors
pub const ENABLE_DROP: &str = "enable_drop";
/// Non-zero infers output metadata at submission time when the op can
pub const EAGER_SHAPE_INFERENCE: &str = "eager_shape_inference";
/// Number of host values remembered for storage reuse by `put`
pub const CANDIDATE_CACHE_SIZE: &str = "candidate_cache_size";
/// Largest element count a `put` value may have to be cached
pub const CANDIDATE_MAX_ELEMENTS: &str = "candidate_max_elements";

pub const OPTION_NAMES: [&str; 5] = [
    ASYNC_LEVEL,
    ENABLE_DROP,
    EAGER_SHAPE_INFERENCE,
    CANDIDATE_CACHE_SIZE,
    CANDIDATE_MAX_ELEMENTS,
];

#[derive(Debug)]
pub struct OptionRegistry {
    values: RwLock<HashMap<&'static str, usize>>,
}

impl OptionRegistry {
    pub fn new(config: &OptionConfig) -> Self {
        let values = HashMap::from([
            (ASYNC_LEVEL, config.async_level),
            (ENABLE_DROP, config.enable_drop as usize),
            (EAGER_SHAPE_INFERENCE, config.eager_shape_inference as usize),
            (CANDIDATE_CACHE_SIZE, config.candidate_cache_size),
            (CANDIDATE_MAX_ELEMENTS, config.candidate_max_elements),
        ]);
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn get(&self, name: &str) -> AnvilResult<usize> {
        self.values
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| unknown(name))
    }

    pub fn set(&self, name: &str, value: usize) -> AnvilResult<()> {
        let key = OPTION_NAMES
            .iter()
            .copied()
            .find(|n| *n == name)
            .ok_or_else(|| unknown(name))?;
        let max = match key {
            ASYNC_LEVEL => 2,
            ENABLE_DROP | EAGER_SHAPE_INFERENCE => 1,
            _ => usize::MAX,
        };
        if value > max {
            return Err(AnvilError::ConfigurationError(format!(
                "option '{}' accepts values up to {}, got {}",
                name, max, value
            )));
        }
        self.values.write().insert(key, value);
        tracing::debug!(option = name, value, "option set");
        Ok(())
    }

    /// Read a known option; names come from the constants in this module
    pub(crate) fn value(&self, name: &'static str) -> usize {
        self.values.read().get(name).copied().unwrap_or_default()
    }

    pub(crate) fn flag(&self, name: &'static str) -> bool {
        self.value(name) != 0
    }
}

fn unknown(name: &str) -> AnvilError {
    AnvilError::ConfigurationError(format!("unknown option '{}'", name))
}
