use derive_more::{Display, From};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::LayerError;
use crate::{hal::cpu::im2col::Size2d, loom::tensor::Tensor};

/// A scalar or vector configuration value of a layer.
#[derive(Debug, Clone, PartialEq, From, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(untagged))]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[display("[{}]", _0.iter().format(", "))]
    Ints(Vec<i64>),
    #[display("[{}]", _0.iter().format(", "))]
    Floats(Vec<f64>),
}

impl From<i32> for ParamValue {
    #[inline]
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<usize> for ParamValue {
    #[inline]
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f32> for ParamValue {
    #[inline]
    fn from(value: f32) -> Self {
        Self::Float(value.into())
    }
}

impl From<&str> for ParamValue {
    #[inline]
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<Vec<f32>> for ParamValue {
    #[inline]
    fn from(value: Vec<f32>) -> Self {
        Self::Floats(value.into_iter().map_into().collect())
    }
}

impl From<Vec<usize>> for ParamValue {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self::Ints(value.into_iter().map(|x| x as i64).collect())
    }
}

/// Conversion out of a [`ParamValue`]. Integers convert to floats, not the other way around.
pub trait FromParam: Sized {
    fn from_param(value: &ParamValue) -> Option<Self>;
}

impl FromParam for bool {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            &ParamValue::Bool(x) => Some(x),
            _ => None,
        }
    }
}

impl FromParam for i64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            &ParamValue::Int(x) => Some(x),
            _ => None,
        }
    }
}

impl FromParam for isize {
    fn from_param(value: &ParamValue) -> Option<Self> {
        i64::from_param(value).and_then(|x| x.try_into().ok())
    }
}

impl FromParam for usize {
    fn from_param(value: &ParamValue) -> Option<Self> {
        i64::from_param(value).and_then(|x| x.try_into().ok())
    }
}

impl FromParam for f64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            &ParamValue::Float(x) => Some(x),
            &ParamValue::Int(x) => Some(x as f64),
            _ => None,
        }
    }
}

impl FromParam for f32 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        f64::from_param(value).map(|x| x as f32)
    }
}

impl FromParam for String {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Str(x) => Some(x.clone()),
            _ => None,
        }
    }
}

impl FromParam for Vec<f32> {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Floats(x) => Some(x.iter().map(|&x| x as f32).collect()),
            ParamValue::Ints(x) => Some(x.iter().map(|&x| x as f32).collect()),
            &ParamValue::Float(x) => Some(vec![x as f32]),
            &ParamValue::Int(x) => Some(vec![x as f32]),
            _ => None,
        }
    }
}

impl FromParam for Vec<usize> {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Ints(x) => x.iter().map(|&x| x.try_into().ok()).collect(),
            ParamValue::Int(_) => usize::from_param(value).map(|x| vec![x]),
            _ => None,
        }
    }
}

/// Parameter record a layer is constructed from: name, type tag, learned blobs,
/// and a dictionary of configuration values.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerParams {
    pub name: String,
    pub kind: String,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub blobs: Vec<Tensor>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub values: HashMap<String, ParamValue>,
}

impl LayerParams {
    pub fn new(kind: impl ToString, name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    /// Sets a configuration value.
    pub fn with(mut self, key: impl ToString, value: impl Into<ParamValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Appends a learned blob.
    pub fn with_blob(mut self, blob: Tensor) -> Self {
        self.blobs.push(blob);
        self
    }

    #[inline]
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[inline]
    pub fn value(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Typed value of `key`. `Ok(None)` if absent; a `Config` error if of the wrong type.
    pub fn get<T: FromParam>(&self, key: &str) -> Result<Option<T>, LayerError> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        match T::from_param(value) {
            Some(value) => Ok(Some(value)),
            None => Err(LayerError::config(
                &self.name,
                format!(
                    "parameter `{key}` has unexpected value {value} for {}",
                    std::any::type_name::<T>()
                ),
            )),
        }
    }

    /// Typed value of `key`, or `default` if absent.
    #[inline]
    pub fn get_or<T: FromParam>(&self, key: &str, default: T) -> Result<T, LayerError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Typed value of `key`; a `Config` error if absent.
    pub fn require<T: FromParam>(&self, key: &str) -> Result<T, LayerError> {
        self.get(key)?.ok_or_else(|| {
            LayerError::config(&self.name, format!("missing required parameter `{key}`"))
        })
    }

    /// A spatial pair given either as `{prefix}_h` and `{prefix}_w`, or as a single
    /// `{prefix}_size` or `{prefix}` value. Falls back to `default` when none is present.
    pub fn size2d(&self, prefix: &str, default: Option<usize>) -> Result<Size2d, LayerError> {
        let height = self.get::<usize>(&format!("{prefix}_h"))?;
        let width = self.get::<usize>(&format!("{prefix}_w"))?;
        match (height, width) {
            (Some(height), Some(width)) => return Ok(Size2d::new(height, width)),
            (None, None) => {}
            _ => {
                return Err(LayerError::config(
                    &self.name,
                    format!("parameters `{prefix}_h` and `{prefix}_w` must be given together"),
                ));
            }
        }

        let size = match self.get::<usize>(&format!("{prefix}_size"))? {
            Some(size) => Some(size),
            None => self.get::<usize>(prefix)?,
        };
        match size.or(default) {
            Some(size) => Ok(size.into()),
            None => Err(LayerError::config(
                &self.name,
                format!("missing required parameter `{prefix}`"),
            )),
        }
    }

    /// The learned blob at `index`; a `Config` error if absent.
    pub fn blob(&self, index: usize) -> Result<&Tensor, LayerError> {
        self.blobs.get(index).ok_or_else(|| {
            LayerError::config(
                &self.name,
                format!("missing blob {index}, {} given", self.blobs.len()),
            )
        })
    }
}
