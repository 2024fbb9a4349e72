//! Typed hyperparameters and the providers that produce them.
//!
//! A [`ParamProvider`] answers one request per parameter, keyed by name. The
//! search backend samples fresh values; [`FixedParams`] replays a literal
//! mapping so a known-good configuration can be rebuilt without a study.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    config::SearchLimits,
    error::{AeError, Result},
};

/// Value handed out by a provider for one named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Categorical(String),
}

impl ParameterValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Categorical(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Categorical(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Categorical(v.to_string())
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Categorical(s) => f.write_str(s),
        }
    }
}

/// Parameter name -> value, in a stable order.
pub type ParamSet = BTreeMap<String, ParameterValue>;

/// Source of hyperparameter values, one method per parameter kind.
pub trait ParamProvider {
    /// Integer in `[low, high]`.
    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64>;

    /// One of `choices`.
    fn suggest_categorical(&mut self, name: &str, choices: &[ParameterValue]) -> Result<ParameterValue>;

    /// Float in `[low, high]` drawn on a log scale.
    fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64>;

    /// Float in `[low, high]`.
    fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64>;
}

/// Replays a literal parameter mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixedParams {
    values: ParamSet,
}

impl FixedParams {
    pub fn new(values: ParamSet) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &ParamSet {
        &self.values
    }

    /// Best configuration found by an earlier search over the default limits.
    pub fn best_known() -> Self {
        let entries: [(&str, ParameterValue); 14] = [
            ("batch_sz", 2.9506247104991368.into()),
            ("e0_activation", "linear".into()),
            ("e0_kernel_size", 3i64.into()),
            ("e0_l2", 0.00013594687445836733.into()),
            ("e1_activation", "elu".into()),
            ("e1_kernel_size", 3i64.into()),
            ("e1_l2", 9.78917558249139e-06.into()),
            ("lr", 0.00015131215093961426.into()),
            ("lt_activation", "linear".into()),
            ("lt_l2", 2.445066982451763e-06.into()),
            ("lt_sz", 90i64.into()),
            ("n0_flts", 66i64.into()),
            ("n1_flts", 75i64.into()),
            ("n_layers", 2i64.into()),
        ];
        Self::new(
            entries
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    fn lookup(&self, name: &str) -> Result<&ParameterValue> {
        self.values
            .get(name)
            .ok_or_else(|| AeError::MissingParameter(name.to_string()))
    }

    fn float_in(&self, name: &str, low: f64, high: f64) -> Result<f64> {
        let value = self
            .lookup(name)?
            .as_float()
            .ok_or_else(|| AeError::invalid(name, "expected a number"))?;
        if !(low..=high).contains(&value) {
            return Err(AeError::invalid(name, format!("{value} outside [{low}, {high}]")));
        }
        Ok(value)
    }
}

impl ParamProvider for FixedParams {
    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64> {
        let value = self
            .lookup(name)?
            .as_int()
            .ok_or_else(|| AeError::invalid(name, "expected an integer"))?;
        if !(low..=high).contains(&value) {
            return Err(AeError::invalid(name, format!("{value} outside [{low}, {high}]")));
        }
        Ok(value)
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[ParameterValue]) -> Result<ParameterValue> {
        let value = self.lookup(name)?;
        if !choices.contains(value) {
            return Err(AeError::invalid(name, format!("{value} is not one of {choices:?}")));
        }
        Ok(value.clone())
    }

    fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        self.float_in(name, low, high)
    }

    fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        self.float_in(name, low, high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Elu,
    Tanh,
    Linear,
}

impl FromStr for Activation {
    type Err = AeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Self::Relu),
            "elu" => Ok(Self::Elu),
            "tanh" => Ok(Self::Tanh),
            "linear" => Ok(Self::Linear),
            _ => Err(AeError::UnknownActivation(s.to_string())),
        }
    }
}

/// Settings of one encoder layer; the decoder mirrors them in reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub filters: usize,
    pub kernel_size: usize,
    pub activation: Activation,
    pub l2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub layers: Vec<LayerParams>,
    pub latent_size: usize,
    pub latent_activation: Activation,
    /// Integer part of the sampled `lt_l2`, so sampled values below 1 give 0.
    pub latent_l2: f64,
    pub learning_rate: f64,
    pub batch_size: usize,
}

const DEFAULT_LEARNING_RATE: f64 = 1e-3;

impl HyperParams {
    /// Draws every parameter from `provider` in a fixed order.
    pub fn suggest<P: ParamProvider + ?Sized>(provider: &mut P, limits: &SearchLimits) -> Result<Self> {
        let kernels: Vec<ParameterValue> = limits.kernel_sizes.iter().map(|k| ParameterValue::Int(*k)).collect();
        let activations: Vec<ParameterValue> = limits
            .activations
            .iter()
            .map(|a| ParameterValue::Categorical(a.clone()))
            .collect();

        let n_layers = provider.suggest_int("n_layers", limits.layers[0], limits.layers[1])?;
        let mut layers = Vec::with_capacity(n_layers.max(0) as usize);
        for i in 0..n_layers.max(0) as usize {
            let [low, high] = *limits
                .filters
                .get(i)
                .ok_or_else(|| AeError::invalid("n_layers", format!("no filter range for layer {i}")))?;
            let filters = provider.suggest_int(&format!("n{i}_flts"), low, high)?;
            let kernel = provider.suggest_categorical(&format!("e{i}_kernel_size"), &kernels)?;
            let activation = provider.suggest_categorical(&format!("e{i}_activation"), &activations)?;
            let l2 = provider.suggest_loguniform(&format!("e{i}_l2"), limits.l2[0], limits.l2[1])?;

            layers.push(LayerParams {
                filters: positive(&format!("n{i}_flts"), filters)?,
                kernel_size: positive(
                    &format!("e{i}_kernel_size"),
                    kernel
                        .as_int()
                        .ok_or_else(|| AeError::invalid(format!("e{i}_kernel_size"), "expected an integer"))?,
                )?,
                activation: parse_activation(&activation)?,
                l2,
            });
        }

        let latent_activation = provider.suggest_categorical("lt_activation", &activations)?;
        let lt_l2 = provider.suggest_loguniform("lt_l2", limits.l2[0], limits.l2[1])?;
        let latent_size = provider.suggest_int("lt_sz", limits.latent_size[0], limits.latent_size[1])?;
        let lr = provider.suggest_loguniform("lr", limits.learning_rate[0], limits.learning_rate[1])?;
        let batch = provider.suggest_uniform("batch_sz", limits.batch_size[0], limits.batch_size[1])?;

        Ok(Self {
            layers,
            latent_size: positive("lt_sz", latent_size)?,
            latent_activation: parse_activation(&latent_activation)?,
            latent_l2: lt_l2.trunc(),
            learning_rate: lr,
            batch_size: positive("batch_sz", batch.trunc() as i64)?,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Learning rate handed to the optimizer; non-positive values fall back to the default.
    pub fn effective_learning_rate(&self) -> f64 {
        if self.learning_rate > 0.0 {
            self.learning_rate
        } else {
            DEFAULT_LEARNING_RATE
        }
    }
}

fn positive(name: &str, value: i64) -> Result<usize> {
    if value <= 0 {
        return Err(AeError::invalid(name, format!("{value} must be positive")));
    }
    Ok(value as usize)
}

fn parse_activation(value: &ParameterValue) -> Result<Activation> {
    match value {
        ParameterValue::Categorical(name) => name.parse(),
        other => Err(AeError::UnknownActivation(other.to_string())),
    }
}

/// Records every value a wrapped provider hands out.
pub struct Recording<'a, P: ?Sized> {
    inner: &'a mut P,
    pub params: ParamSet,
}

impl<'a, P: ParamProvider + ?Sized> Recording<'a, P> {
    pub fn new(inner: &'a mut P) -> Self {
        Self {
            inner,
            params: ParamSet::new(),
        }
    }
}

impl<P: ParamProvider + ?Sized> ParamProvider for Recording<'_, P> {
    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64> {
        let v = self.inner.suggest_int(name, low, high)?;
        self.params.insert(name.to_string(), ParameterValue::Int(v));
        Ok(v)
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[ParameterValue]) -> Result<ParameterValue> {
        let v = self.inner.suggest_categorical(name, choices)?;
        self.params.insert(name.to_string(), v.clone());
        Ok(v)
    }

    fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        let v = self.inner.suggest_loguniform(name, low, high)?;
        self.params.insert(name.to_string(), ParameterValue::Float(v));
        Ok(v)
    }

    fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        let v = self.inner.suggest_uniform(name, low, high)?;
        self.params.insert(name.to_string(), ParameterValue::Float(v));
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_known_replay() {
        let mut fixed = FixedParams::best_known();
        let hp = HyperParams::suggest(&mut fixed, &SearchLimits::default()).unwrap();

        assert_eq!(hp.n_layers(), 2);
        assert_eq!(
            hp.layers[0],
            LayerParams {
                filters: 66,
                kernel_size: 3,
                activation: Activation::Linear,
                l2: 0.00013594687445836733,
            }
        );
        assert_eq!(hp.layers[1].filters, 75);
        assert_eq!(hp.layers[1].activation, Activation::Elu);
        assert_eq!(hp.latent_size, 90);
        assert_eq!(hp.latent_activation, Activation::Linear);
        assert_eq!(hp.batch_size, 2);
        assert_eq!(hp.learning_rate, 0.00015131215093961426);
    }

    #[test]
    fn test_latent_l2_is_truncated() {
        let mut fixed = FixedParams::best_known();
        let hp = HyperParams::suggest(&mut fixed, &SearchLimits::default()).unwrap();
        assert_eq!(hp.latent_l2, 0.0);
    }

    #[test]
    fn test_missing_key_fails() {
        let mut values = FixedParams::best_known().values().clone();
        values.remove("e1_l2");
        let err = HyperParams::suggest(&mut FixedParams::new(values), &SearchLimits::default()).unwrap_err();
        assert!(matches!(err, AeError::MissingParameter(name) if name == "e1_l2"));
    }

    #[test]
    fn test_out_of_range_value_fails() {
        let mut values = FixedParams::best_known().values().clone();
        values.insert("lt_sz".to_string(), ParameterValue::Int(400));
        let err = HyperParams::suggest(&mut FixedParams::new(values), &SearchLimits::default()).unwrap_err();
        assert!(matches!(err, AeError::InvalidParameter { name, .. } if name == "lt_sz"));
    }

    #[test]
    fn test_unknown_activation_choice_fails() {
        let mut values = FixedParams::best_known().values().clone();
        values.insert("e0_activation".to_string(), "swish".into());
        let mut limits = SearchLimits::default();
        limits.activations.push("swish".to_string());
        let err = HyperParams::suggest(&mut FixedParams::new(values), &limits).unwrap_err();
        assert!(matches!(err, AeError::UnknownActivation(name) if name == "swish"));
    }

    #[test]
    fn test_recording_keeps_requested_keys() {
        let mut fixed = FixedParams::best_known();
        let mut recording = Recording::new(&mut fixed);
        HyperParams::suggest(&mut recording, &SearchLimits::default()).unwrap();
        assert_eq!(&recording.params, FixedParams::best_known().values());
    }

    #[test]
    fn test_param_set_json_round_trip() {
        let values = FixedParams::best_known().values().clone();
        let json = serde_json::to_string(&values).unwrap();
        let back: ParamSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_non_positive_learning_rate_falls_back() {
        let mut fixed = FixedParams::best_known();
        let mut hp = HyperParams::suggest(&mut fixed, &SearchLimits::default()).unwrap();
        hp.learning_rate = 0.0;
        assert_eq!(hp.effective_learning_rate(), 1e-3);
    }
}
