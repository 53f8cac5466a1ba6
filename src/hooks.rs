//! Named pre- and post-transformation hooks.
//!
//! Datasets refer to hooks by name in their configuration. Names are resolved
//! against a [`HookRegistry`] when the configuration is validated, so a typo
//! is reported before any granule is processed rather than partway through.
use indexmap::IndexMap;
use ndarray::ArrayD;

use crate::config::ConfigError;
use crate::source::SourceDataset;

/// Absolute values at or above this are treated as fill values by `mask_fill_values`.
pub const LARGE_FILL_THRESHOLD: f64 = 1e30;
pub const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new<S: ToString>(msg: S) -> Self {
        Self(msg.to_string())
    }
}

/// Runs on the whole source dataset before any field is mapped.
pub type PreHook = fn(SourceDataset) -> Result<SourceDataset, HookError>;

/// Runs on one mapped field; receives the mapped values and the field name.
pub type PostHook = fn(ArrayD<f64>, &str) -> Result<ArrayD<f64>, HookError>;

#[derive(Clone)]
pub struct HookRegistry {
    pre: IndexMap<String, PreHook>,
    post: IndexMap<String, PostHook>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("pre", &self.pre.keys().collect::<Vec<_>>())
            .field("post", &self.post.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            pre: IndexMap::new(),
            post: IndexMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.register_pre("mask_fill_values", mask_fill_values);
        reg.register_pre("remove_negative_values", remove_negative_values);
        reg.register_post("kelvin_to_celsius", kelvin_to_celsius);
        reg.register_post("seaice_concentration_to_fraction", seaice_concentration_to_fraction);
        reg.register_post("clamp_negative_to_zero", clamp_negative_to_zero);
        reg
    }

    pub fn register_pre<S: Into<String>>(&mut self, name: S, hook: PreHook) {
        self.pre.insert(name.into(), hook);
    }

    pub fn register_post<S: Into<String>>(&mut self, name: S, hook: PostHook) {
        self.post.insert(name.into(), hook);
    }

    pub fn pre_names(&self) -> impl Iterator<Item = &str> {
        self.pre.keys().map(|k| k.as_str())
    }

    pub fn post_names(&self) -> impl Iterator<Item = &str> {
        self.post.keys().map(|k| k.as_str())
    }

    /// Look up pre-transformation hooks in the given order.
    pub fn resolve_pre(&self, names: &[String]) -> Result<Vec<(String, PreHook)>, ConfigError> {
        names
            .iter()
            .map(|n| {
                self.pre
                    .get(n)
                    .map(|&h| (n.clone(), h))
                    .ok_or_else(|| ConfigError::UnknownHook {
                        stage: "pre",
                        name: n.clone(),
                    })
            })
            .collect()
    }

    /// Look up post-transformation hooks in the given order.
    pub fn resolve_post(&self, names: &[String]) -> Result<Vec<(String, PostHook)>, ConfigError> {
        names
            .iter()
            .map(|n| {
                self.post
                    .get(n)
                    .map(|&h| (n.clone(), h))
                    .ok_or_else(|| ConfigError::UnknownHook {
                        stage: "post",
                        name: n.clone(),
                    })
            })
            .collect()
    }
}

/// Set values with a very large magnitude (typical undeclared fill values) to NaN.
pub fn mask_fill_values(mut ds: SourceDataset) -> Result<SourceDataset, HookError> {
    for values in ds.variables.values_mut() {
        values.mapv_inplace(|v| if v.abs() >= LARGE_FILL_THRESHOLD { f64::NAN } else { v });
    }
    Ok(ds)
}

/// Set negative values in every variable to NaN.
pub fn remove_negative_values(mut ds: SourceDataset) -> Result<SourceDataset, HookError> {
    for values in ds.variables.values_mut() {
        values.mapv_inplace(|v| if v < 0.0 { f64::NAN } else { v });
    }
    Ok(ds)
}

pub fn kelvin_to_celsius(values: ArrayD<f64>, field: &str) -> Result<ArrayD<f64>, HookError> {
    // Anything negative in kelvin means the field was not in kelvin to begin with
    if values.iter().any(|&v| v < 0.0) {
        return Err(HookError::new(format!(
            "{field} has negative values, so cannot be in kelvin"
        )));
    }
    Ok(values.mapv(|v| v - KELVIN_OFFSET))
}

/// Convert a percent concentration to a 0-1 fraction.
pub fn seaice_concentration_to_fraction(values: ArrayD<f64>, _field: &str) -> Result<ArrayD<f64>, HookError> {
    Ok(values.mapv(|v| v / 100.0))
}

pub fn clamp_negative_to_zero(values: ArrayD<f64>, _field: &str) -> Result<ArrayD<f64>, HookError> {
    Ok(values.mapv(|v| if v < 0.0 { 0.0 } else { v }))
}
