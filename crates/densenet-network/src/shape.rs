use std::fmt::{self, Display};

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Side length the classifier head and pretrained weights assume.
pub const DEFAULT_SIZE: usize = 224;
/// Smallest side length the stem and the two transitions can reduce without vanishing.
pub const MIN_SIZE: usize = 16;
pub const INPUT_CHANNELS: usize = 3;

/// How image tensors and 3-tuple input shapes are laid out.
///
/// The network itself always runs channels-first, the layout burn's convolutions expect; this
/// only governs what callers pass in and get back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    /// `(batch, height, width, channels)`.
    #[default]
    ChannelsLast,
    /// `(batch, channels, height, width)`.
    ChannelsFirst,
}

impl DataFormat {
    pub fn channel_axis(self) -> usize {
        match self {
            Self::ChannelsLast => 3,
            Self::ChannelsFirst => 1,
        }
    }

    /// Interprets a per-image shape (without the batch dimension) in this layout.
    pub fn image_shape(self, dims: [usize; 3]) -> ImageShape {
        match self {
            Self::ChannelsLast => ImageShape::fixed(dims[0], dims[1], dims[2]),
            Self::ChannelsFirst => ImageShape::fixed(dims[1], dims[2], dims[0]),
        }
    }

    pub fn to_channels_first<B: Backend>(self, tensor: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            // (b, h, w, c) -> (b, c, w, h) -> (b, c, h, w)
            Self::ChannelsLast => tensor.swap_dims(1, 3).swap_dims(2, 3),
            Self::ChannelsFirst => tensor,
        }
    }

    pub fn from_channels_first<B: Backend>(self, tensor: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            // (b, c, h, w) -> (b, w, h, c) -> (b, h, w, c)
            Self::ChannelsLast => tensor.swap_dims(1, 3).swap_dims(1, 2),
            Self::ChannelsFirst => tensor,
        }
    }
}

/// The shape of a single feature map. Spatial dimensions are `None` when the model accepts any
/// image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub channels: usize,
}

impl ImageShape {
    pub const fn fixed(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            channels,
        }
    }

    pub const fn dynamic(channels: usize) -> Self {
        Self {
            height: None,
            width: None,
            channels,
        }
    }

    pub fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }

    /// The shape after a sliding window (convolution or pooling) with a square kernel.
    pub fn window(self, kernel: usize, stride: usize, padding: usize) -> Self {
        let reduce = |size: usize| {
            (size + 2 * padding)
                .checked_sub(kernel)
                .map_or(0, |span| span / stride + 1)
        };

        Self {
            height: self.height.map(reduce),
            width: self.width.map(reduce),
            channels: self.channels,
        }
    }
}

fn fmt_dimension(dimension: Option<usize>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match dimension {
        Some(size) => write!(f, "{size}"),
        None => "None".fmt(f),
    }
}

impl Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "(".fmt(f)?;
        fmt_dimension(self.height, f)?;
        ", ".fmt(f)?;
        fmt_dimension(self.width, f)?;
        write!(f, ", {})", self.channels)
    }
}

/// The shape a layer produces, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputShape {
    Map(ImageShape),
    Vector(usize),
}

impl OutputShape {
    /// Tensor rank including the batch dimension.
    pub fn rank(self) -> usize {
        match self {
            Self::Map(_) => 4,
            Self::Vector(_) => 2,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            Self::Map(shape) => shape.channels,
            Self::Vector(length) => length,
        }
    }
}

impl Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(shape) => {
                "(None, ".fmt(f)?;
                fmt_dimension(shape.height, f)?;
                ", ".fmt(f)?;
                fmt_dimension(shape.width, f)?;
                write!(f, ", {})", shape.channels)
            }
            Self::Vector(length) => write!(f, "(None, {length})"),
        }
    }
}

/// Picks the input shape of a model and checks it can carry the topology.
///
/// A requested shape is validated as-is. Without one, the default square input is used when the
/// classifier is included and spatial dimensions are left dynamic otherwise. Including the
/// classifier together with pretrained weights pins the input to the default.
pub fn resolve_input_shape(
    requested: Option<ImageShape>,
    include_top: bool,
    pretrained: bool,
) -> Result<ImageShape, BuildError> {
    let default_shape = ImageShape::fixed(DEFAULT_SIZE, DEFAULT_SIZE, INPUT_CHANNELS);

    let Some(shape) = requested else {
        return Ok(if include_top {
            default_shape
        } else {
            ImageShape::dynamic(INPUT_CHANNELS)
        });
    };

    if pretrained && include_top && shape != default_shape {
        return Err(BuildError::PretrainedShapeMismatch {
            expected: default_shape,
            actual: shape,
        });
    }

    if shape.channels != INPUT_CHANNELS {
        return Err(BuildError::InvalidChannels {
            channels: shape.channels,
        });
    }

    let too_small = |size: Option<usize>| size.is_some_and(|size| size < MIN_SIZE);

    if too_small(shape.height) || too_small(shape.width) {
        return Err(BuildError::InputTooSmall {
            shape,
            min_size: MIN_SIZE,
        });
    }

    Ok(shape)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Shape, Tensor};
    use burn_ndarray::NdArray;
    use test_case::test_case;

    use super::*;

    #[test_case(224, 3, 1, 1, 224; "same padded conv")]
    #[test_case(224, 3, 2, 1, 112; "stem max pool")]
    #[test_case(225, 3, 2, 1, 113; "stem max pool odd")]
    #[test_case(112, 2, 2, 0, 56; "transition pool")]
    #[test_case(7, 2, 2, 0, 3; "transition pool odd")]
    #[test_case(3, 3, 1, 0, 1; "kernel sized")]
    #[test_case(1, 3, 1, 0, 0; "smaller than kernel")]
    #[test_case(1, 2, 2, 0, 0; "smaller than pool")]
    fn window_arithmetic(size: usize, kernel: usize, stride: usize, padding: usize, expected: usize) {
        let shape = ImageShape::fixed(size, size, 8).window(kernel, stride, padding);

        assert_eq!(shape, ImageShape::fixed(expected, expected, 8));
    }

    #[test]
    fn window_keeps_dynamic_dimensions() {
        assert_eq!(
            ImageShape::dynamic(3).window(3, 2, 1),
            ImageShape::dynamic(3)
        );
    }

    #[test]
    fn default_shape_with_top() {
        assert_eq!(
            resolve_input_shape(None, true, true).unwrap(),
            ImageShape::fixed(224, 224, 3)
        );
    }

    #[test]
    fn dynamic_shape_without_top() {
        assert_eq!(
            resolve_input_shape(None, false, true).unwrap(),
            ImageShape::dynamic(3)
        );
    }

    #[test_case(ImageShape::fixed(64, 64, 1); "grayscale")]
    #[test_case(ImageShape::fixed(64, 64, 4); "rgba")]
    fn rejects_non_rgb(shape: ImageShape) {
        assert!(matches!(
            resolve_input_shape(Some(shape), false, false),
            Err(BuildError::InvalidChannels { channels }) if channels == shape.channels
        ));
    }

    #[test_case(ImageShape::fixed(15, 64, 3); "short")]
    #[test_case(ImageShape::fixed(64, 8, 3); "narrow")]
    fn rejects_small_inputs(shape: ImageShape) {
        assert!(matches!(
            resolve_input_shape(Some(shape), false, false),
            Err(BuildError::InputTooSmall { shape: rejected, min_size: MIN_SIZE })
                if rejected == shape
        ));
    }

    #[test]
    fn minimum_size_is_accepted() {
        let shape = ImageShape::fixed(MIN_SIZE, MIN_SIZE, 3);

        assert_eq!(resolve_input_shape(Some(shape), true, false).unwrap(), shape);
    }

    #[test]
    fn pretrained_top_pins_the_input() {
        let shape = ImageShape::fixed(128, 128, 3);

        assert!(matches!(
            resolve_input_shape(Some(shape), true, true),
            Err(BuildError::PretrainedShapeMismatch { expected, actual })
                if expected == ImageShape::fixed(224, 224, 3) && actual == shape
        ));
        assert_eq!(resolve_input_shape(Some(shape), false, true).unwrap(), shape);
    }

    #[test]
    fn channels_first_interpretation() {
        assert_eq!(
            DataFormat::ChannelsFirst.image_shape([3, 32, 48]),
            ImageShape::fixed(32, 48, 3)
        );
        assert_eq!(
            DataFormat::ChannelsLast.image_shape([32, 48, 3]),
            ImageShape::fixed(32, 48, 3)
        );
    }

    #[test]
    fn layout_conversion() {
        let images = Tensor::<NdArray, 1>::from_floats([0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .reshape(Shape::new([1, 1, 2, 3]));

        let channels_first = DataFormat::ChannelsLast.to_channels_first(images.clone());

        assert_eq!(channels_first.dims(), [1, 3, 1, 2]);
        // Channel 2 of pixel (0, 1) is element 5 of the channels-last buffer.
        assert_eq!(
            channels_first
                .clone()
                .slice([0..1, 2..3, 0..1, 1..2])
                .into_data()
                .convert::<f32>()
                .value,
            vec![5.0]
        );

        let restored = DataFormat::ChannelsLast.from_channels_first(channels_first);

        assert_eq!(restored.dims(), [1, 1, 2, 3]);
        assert_eq!(
            restored.into_data().convert::<f32>().value,
            images.into_data().convert::<f32>().value
        );
    }

    #[test]
    fn output_shape_display() {
        assert_eq!(
            OutputShape::Map(ImageShape::fixed(56, 56, 90)).to_string(),
            "(None, 56, 56, 90)"
        );
        assert_eq!(
            OutputShape::Map(ImageShape::dynamic(3)).to_string(),
            "(None, None, None, 3)"
        );
        assert_eq!(OutputShape::Vector(1000).to_string(), "(None, 1000)");
    }
}
