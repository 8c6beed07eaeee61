use std::path::PathBuf;

use burn::record::RecorderError;

use crate::{layer::LayerId, model::ClassifierActivation, shape::ImageShape};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("input must have 3 channels, got {channels}")]
    InvalidChannels { channels: usize },
    #[error("input size must be at least {min_size}x{min_size}, got {shape}")]
    InputTooSmall { shape: ImageShape, min_size: usize },
    #[error("when including the top with pretrained weights the input shape must be {expected}, got {actual}")]
    PretrainedShapeMismatch {
        expected: ImageShape,
        actual: ImageShape,
    },
    #[error("input tensor has shape {tensor} but the configured input shape is {configured}")]
    InputTensorMismatch {
        tensor: ImageShape,
        configured: ImageShape,
    },
    #[error("only softmax and linear classifier activations are allowed with pretrained weights, got {0}")]
    InvalidActivation(ClassifierActivation),
    #[error("a classifier must have at least one class")]
    NoClasses,
    #[error("reduction {reduction} leaves no channels out of {channels}")]
    InvalidReduction { reduction: f64, channels: usize },
    #[error("dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error("layer {0} is registered twice")]
    DuplicateLayer(LayerId),
    #[error("failed to load weights from {path}")]
    LoadWeights {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
}

/// A batch of images that does not fit the input of a built model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum InputError {
    #[error("images of shape {actual} do not fit the model input {expected}")]
    ShapeMismatch {
        expected: ImageShape,
        actual: ImageShape,
    },
    #[error("images must be at least {min_size}x{min_size}, got {actual}")]
    TooSmall { actual: ImageShape, min_size: usize },
}
