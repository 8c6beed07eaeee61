//! A modified DenseNet built from burn's layer primitives.
//!
//! The topology has a 3x3 stem, three dense stages with a growth rate of 10 separated by two
//! uncompressed transitions, and an optional classifier or global pooling head. The fourth stage
//! of the canonical network is disabled unless [`DenseNetConfig::fourth_stage`] is set.

pub mod block;
mod error;
pub mod layer;
pub mod model;
pub mod shape;
pub mod variant;

pub use error::{BuildError, InputError};
pub use model::{
    ClassifierActivation, DenseNet, DenseNetConfig, GlobalPooling, Model, Output, Weights,
};
pub use shape::{DataFormat, ImageShape, OutputShape};
pub use variant::{densenet121, densenet169, densenet201, Variant};
