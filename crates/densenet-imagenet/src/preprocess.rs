use burn::tensor::{backend::Backend, Shape, Tensor};
use densenet_network::DataFormat;

/// Per-channel RGB statistics of the ImageNet training set, on a `[0, 1]` scale.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

fn channel_constant<B: Backend>(
    values: [f32; 3],
    data_format: DataFormat,
    device: &B::Device,
) -> Tensor<B, 4> {
    let mut shape = [1; 4];
    shape[data_format.channel_axis()] = values.len();

    Tensor::from_floats(values)
        .reshape(Shape::new(shape))
        .to_device(device)
}

/// Scales RGB images in `[0, 255]` to `[0, 1]` and standardises every channel with the ImageNet
/// statistics.
pub fn preprocess_input<B: Backend>(images: Tensor<B, 4>, data_format: DataFormat) -> Tensor<B, 4> {
    let device = images.device();
    let mean = channel_constant::<B>(MEAN, data_format, &device);
    let std = channel_constant::<B>(STD, data_format, &device);

    images.div_scalar(255.0).sub(mean).div(std)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Shape, Tensor};
    use burn_ndarray::NdArray;
    use test_case::test_case;

    use super::*;

    type TestBackend = NdArray;

    fn assert_close(actual: Vec<f32>, expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());

        for (actual, expected) in actual.iter().zip(expected) {
            assert!(
                (actual - expected).abs() < 1e-4,
                "{actual} is not close to {expected}"
            );
        }
    }

    #[test_case(DataFormat::ChannelsLast, [1, 1, 1, 3]; "channels last")]
    #[test_case(DataFormat::ChannelsFirst, [1, 3, 1, 1]; "channels first")]
    fn mean_pixel_maps_to_zero(data_format: DataFormat, shape: [usize; 4]) {
        let pixel = Tensor::<TestBackend, 1>::from_floats(MEAN.map(|mean| mean * 255.0))
            .reshape(Shape::new(shape));

        let output = preprocess_input(pixel, data_format);

        assert_close(output.into_data().convert::<f32>().value, &[0.0; 3]);
    }

    #[test]
    fn extremes_are_standardised() {
        let images = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 0.0, 255.0, 255.0, 255.0])
            .reshape(Shape::new([1, 1, 2, 3]));

        let output = preprocess_input(images, DataFormat::ChannelsLast);

        let expected = [
            -MEAN[0] / STD[0],
            -MEAN[1] / STD[1],
            -MEAN[2] / STD[2],
            (1.0 - MEAN[0]) / STD[0],
            (1.0 - MEAN[1]) / STD[1],
            (1.0 - MEAN[2]) / STD[2],
        ];

        assert_close(output.into_data().convert::<f32>().value, &expected);
    }

    #[test]
    fn shape_is_preserved() {
        let images = Tensor::<TestBackend, 4>::ones(Shape::new([2, 5, 7, 3]));

        assert_eq!(
            preprocess_input(images, DataFormat::ChannelsLast).dims(),
            [2, 5, 7, 3]
        );
    }
}
