//! Input preprocessing and prediction decoding for the ImageNet-style classifier head.

pub mod decode;
pub mod preprocess;

pub use decode::{decode_predictions, ClassIndex, DecodeError, Prediction, CLASSES};
pub use preprocess::preprocess_input;
