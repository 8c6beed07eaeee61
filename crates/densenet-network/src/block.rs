use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, ReLU,
    },
    tensor::{backend::Backend, Distribution, Shape, Tensor},
};

use crate::{
    error::BuildError,
    layer::{LayerId, LayerRegistry, Role, Scope},
    shape::{ImageShape, OutputShape},
};

// Burn's momentum weighs the new batch statistics, the complement of the usual 0.99 decay.
const NORM_MOMENTUM: f64 = 0.01;

/// He-normal initialisation, `std = sqrt(2 / fan_in)`.
pub(crate) fn he_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: std::f64::consts::SQRT_2,
        fan_out_only: false,
    }
}

/// A bias-free square convolution with stride 1.
pub(crate) fn conv<B: Backend>(channels: [usize; 2], kernel: usize, padding: usize) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .with_initializer(he_normal())
        .init()
}

pub(crate) fn batch_norm<B: Backend>(channels: usize, epsilon: f64) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_epsilon(epsilon)
        .with_momentum(NORM_MOMENTUM)
        .init()
}

/// Drops whole feature maps while training, rescaling the kept ones.
fn spatial_dropout<B: Backend>(input: Tensor<B, 4>, prob: f64) -> Tensor<B, 4> {
    if prob == 0.0 || !B::ad_enabled() {
        return input;
    }

    let [batch, channels, _, _] = input.dims();
    let keep = 1.0 - prob;
    let mask = input
        .clone()
        .slice([0..batch, 0..channels, 0..1, 0..1])
        .random_like(Distribution::Bernoulli(keep));

    input * mask.div_scalar(keep)
}

fn squared_sum<B: Backend>(conv: &Conv2d<B>) -> Tensor<B, 1> {
    let weight = conv.clone().into_record().weight.val();

    (weight.clone() * weight).sum()
}

#[derive(Module, Debug)]
struct PreConvBlock<B: Backend> {
    batch_norm: BatchNorm<B, 2>,
    activation: ReLU,
    conv: Conv2d<B>,
    dropout: f64,
}

impl<B: Backend> PreConvBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.batch_norm.forward(input);
        let x = self.activation.forward(x);
        let x = self.conv.forward(x);

        spatial_dropout(x, self.dropout)
    }
}

/// Registers the normalisation, activation, convolution and (when enabled) dropout layers of a
/// pre-activated convolution and returns the convolution's output shape.
fn register_preconv(
    registry: &mut LayerRegistry,
    id: impl Fn(Role) -> LayerId,
    input: ImageShape,
    filters: usize,
    dropout: f64,
) -> Result<ImageShape, BuildError> {
    registry.register(id(Role::Norm), OutputShape::Map(input))?;
    registry.register(id(Role::Relu), OutputShape::Map(input))?;

    let output = input.with_channels(filters);

    registry.register(id(Role::Conv), OutputShape::Map(output))?;

    if dropout > 0.0 {
        registry.register(id(Role::Dropout), OutputShape::Map(output))?;
    }

    Ok(output)
}

/// BN, ReLU, 3x3 convolution to `growth_rate` maps, then concatenation onto the input.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    preconv: PreConvBlock<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.preconv.forward(input.clone());

        Tensor::cat(vec![input, x], 1)
    }

    pub fn squared_weights(&self) -> Tensor<B, 1> {
        squared_sum(&self.preconv.conv)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    #[config(default = 10)]
    pub growth_rate: usize,
    #[config(default = 1.001e-5)]
    pub epsilon: f64,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(
        &self,
        input: ImageShape,
        stage: usize,
        block: usize,
        registry: &mut LayerRegistry,
    ) -> Result<(ConvBlock<B>, ImageShape), BuildError> {
        let scope = Scope::Stage(stage);
        let new_maps = register_preconv(
            registry,
            |role| LayerId::in_block(scope, block, role),
            input,
            self.growth_rate,
            self.dropout,
        )?;
        let output = input.with_channels(input.channels + new_maps.channels);

        registry.register(
            LayerId::in_block(scope, block, Role::Concat),
            OutputShape::Map(output),
        )?;

        let preconv = PreConvBlock {
            batch_norm: batch_norm(input.channels, self.epsilon),
            activation: ReLU::default(),
            conv: conv([input.channels, self.growth_rate], 3, 1),
            dropout: self.dropout,
        };

        Ok((ConvBlock { preconv }, output))
    }
}

/// A run of building blocks, each seeing the concatenation of every earlier output.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(input, |x, block| block.forward(x))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn squared_weights(&self) -> Tensor<B, 1> {
        self.blocks
            .iter()
            .fold(Tensor::zeros(Shape::new([1])), |sum, block| {
                sum + block.squared_weights()
            })
    }
}

#[derive(Config, Debug)]
pub struct DenseBlockConfig {
    pub blocks: usize,
    pub conv_block: ConvBlockConfig,
}

impl DenseBlockConfig {
    pub fn init<B: Backend>(
        &self,
        input: ImageShape,
        stage: usize,
        registry: &mut LayerRegistry,
    ) -> Result<(DenseBlock<B>, ImageShape), BuildError> {
        let mut shape = input;
        let mut blocks = Vec::with_capacity(self.blocks);

        for block in 1..=self.blocks {
            let (conv_block, output) = self.conv_block.init(shape, stage, block, registry)?;

            blocks.push(conv_block);
            shape = output;
        }

        Ok((DenseBlock { blocks }, shape))
    }
}

/// BN, ReLU, 1x1 convolution compressing the channels by `reduction`, then 2x2 average pooling.
#[derive(Module, Debug)]
pub struct TransitionBlock<B: Backend> {
    preconv: PreConvBlock<B>,
    pool: AvgPool2d,
}

impl<B: Backend> TransitionBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.preconv.forward(input);

        self.pool.forward(x)
    }

    pub fn squared_weights(&self) -> Tensor<B, 1> {
        squared_sum(&self.preconv.conv)
    }
}

#[derive(Config, Debug)]
pub struct TransitionBlockConfig {
    #[config(default = 1.0)]
    pub reduction: f64,
    #[config(default = 1.001e-5)]
    pub epsilon: f64,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl TransitionBlockConfig {
    pub fn init<B: Backend>(
        &self,
        input: ImageShape,
        transition: usize,
        registry: &mut LayerRegistry,
    ) -> Result<(TransitionBlock<B>, ImageShape), BuildError> {
        let filters = (input.channels as f64 * self.reduction).floor() as usize;

        if filters == 0 {
            return Err(BuildError::InvalidReduction {
                reduction: self.reduction,
                channels: input.channels,
            });
        }

        let scope = Scope::Transition(transition);
        let compressed = register_preconv(
            registry,
            |role| LayerId::new(scope, role),
            input,
            filters,
            self.dropout,
        )?;
        let output = compressed.window(2, 2, 0);

        registry.register(LayerId::new(scope, Role::AvgPool), OutputShape::Map(output))?;

        let preconv = PreConvBlock {
            batch_norm: batch_norm(input.channels, self.epsilon),
            activation: ReLU::default(),
            conv: conv([input.channels, filters], 1, 0),
            dropout: self.dropout,
        };

        Ok((
            TransitionBlock {
                preconv,
                pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            },
            output,
        ))
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::Autodiff,
        tensor::{Shape, Tensor},
    };
    use burn_ndarray::NdArray;
    use test_case::test_case;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn conv_block_grows_channels() {
        let mut registry = LayerRegistry::new();
        let (block, output) = ConvBlockConfig::new()
            .init::<TestBackend>(ImageShape::fixed(8, 8, 50), 1, 1, &mut registry)
            .unwrap();

        assert_eq!(output, ImageShape::fixed(8, 8, 60));

        let x = block.forward(Tensor::ones(Shape::new([2, 50, 8, 8])));

        assert_eq!(x.dims(), [2, 60, 8, 8]);
    }

    #[test]
    fn conv_block_keeps_its_input() {
        let mut registry = LayerRegistry::new();
        let (block, _) = ConvBlockConfig::new()
            .with_growth_rate(4)
            .init::<TestBackend>(ImageShape::fixed(4, 4, 3), 1, 1, &mut registry)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::ones(Shape::new([1, 3, 4, 4])).mul_scalar(7.0);
        let passed_through = block.forward(input).slice([0..1, 0..3, 0..4, 0..4]);

        assert!(passed_through
            .into_data()
            .convert::<f32>()
            .value
            .iter()
            .all(|&value| value == 7.0));
    }

    #[test]
    fn conv_block_registers_keras_layers() {
        let mut registry = LayerRegistry::new();
        ConvBlockConfig::new()
            .init::<TestBackend>(ImageShape::fixed(8, 8, 50), 2, 3, &mut registry)
            .unwrap();

        let names = registry
            .into_layers()
            .iter()
            .map(|layer| layer.id.to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            [
                "conv3_block3_1_bn",
                "conv3_block3_1_relu",
                "conv3_block3_2_conv",
                "conv3_block3_concat"
            ]
        );
    }

    #[test]
    fn dropout_is_registered_when_enabled() {
        let mut registry = LayerRegistry::new();
        ConvBlockConfig::new()
            .with_dropout(0.1)
            .init::<TestBackend>(ImageShape::fixed(8, 8, 50), 1, 1, &mut registry)
            .unwrap();

        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn dropout_is_inactive_without_autodiff() {
        let x = Tensor::<TestBackend, 4>::ones(Shape::new([1, 2, 3, 3]));
        let y = spatial_dropout(x, 0.5);

        assert_eq!(y.sum().into_scalar(), 18.0);
    }

    #[test_case(0.5; "half")]
    #[test_case(0.2; "fifth")]
    fn dropout_drops_whole_maps_while_training(prob: f64) {
        let x = Tensor::<Autodiff<TestBackend>, 4>::ones(Shape::new([4, 16, 3, 3]));
        let y = spatial_dropout(x, prob);

        assert_eq!(y.dims(), [4, 16, 3, 3]);

        let kept = (1.0 / (1.0 - prob)) as f32;
        let values = y.into_data().convert::<f32>().value;

        for map in values.chunks_exact(9) {
            let first = map[0];

            assert!(
                first == 0.0 || (first - kept).abs() < 1e-5,
                "map value {first} is neither dropped nor rescaled"
            );
            assert!(map.iter().all(|&value| value == first));
        }
    }

    #[test]
    fn conv_block_with_dropout_keeps_its_input() {
        let mut registry = LayerRegistry::new();
        let (block, _) = ConvBlockConfig::new()
            .with_dropout(0.5)
            .init::<Autodiff<TestBackend>>(ImageShape::fixed(4, 4, 3), 1, 1, &mut registry)
            .unwrap();

        let x = block.forward(Tensor::ones(Shape::new([2, 3, 4, 4])));

        assert_eq!(x.dims(), [2, 13, 4, 4]);
        assert_eq!(x.slice([0..2, 0..3, 0..4, 0..4]).sum().into_scalar(), 96.0);
    }

    #[test_case(0, 50; "empty")]
    #[test_case(1, 60; "single")]
    #[test_case(4, 90; "four")]
    #[test_case(10, 150; "ten")]
    fn dense_block_channels(blocks: usize, expected: usize) {
        let mut registry = LayerRegistry::new();
        let (dense_block, output) = DenseBlockConfig::new(blocks, ConvBlockConfig::new())
            .init::<TestBackend>(ImageShape::fixed(4, 4, 50), 1, &mut registry)
            .unwrap();

        assert_eq!(dense_block.len(), blocks);
        assert_eq!(output.channels, expected);
        assert_eq!(registry.len(), 4 * blocks);

        let x = dense_block.forward(Tensor::ones(Shape::new([1, 50, 4, 4])));

        assert_eq!(x.dims(), [1, expected, 4, 4]);
    }

    #[test_case(8, 4; "even")]
    #[test_case(7, 3; "odd")]
    fn transition_halves_resolution(size: usize, expected: usize) {
        let mut registry = LayerRegistry::new();
        let (transition, output) = TransitionBlockConfig::new()
            .init::<TestBackend>(ImageShape::fixed(size, size, 90), 1, &mut registry)
            .unwrap();

        assert_eq!(output, ImageShape::fixed(expected, expected, 90));

        let x = transition.forward(Tensor::ones(Shape::new([1, 90, size, size])));

        assert_eq!(x.dims(), [1, 90, expected, expected]);
    }

    #[test]
    fn transition_compresses() {
        let mut registry = LayerRegistry::new();
        let (_, output) = TransitionBlockConfig::new()
            .with_reduction(0.5)
            .init::<TestBackend>(ImageShape::fixed(8, 8, 91), 1, &mut registry)
            .unwrap();

        assert_eq!(output.channels, 45);
    }

    #[test]
    fn transition_rejects_vanishing_reduction() {
        let mut registry = LayerRegistry::new();
        let result = TransitionBlockConfig::new()
            .with_reduction(0.01)
            .init::<TestBackend>(ImageShape::fixed(8, 8, 50), 1, &mut registry);

        assert!(matches!(
            result.err(),
            Some(BuildError::InvalidReduction {
                reduction,
                channels: 50
            }) if reduction == 0.01
        ));
    }

    #[test]
    fn squared_weights_are_positive() {
        let mut registry = LayerRegistry::new();
        let (dense_block, _) = DenseBlockConfig::new(2, ConvBlockConfig::new())
            .init::<TestBackend>(ImageShape::fixed(4, 4, 8), 1, &mut registry)
            .unwrap();

        assert!(dense_block.squared_weights().into_scalar() > 0.0);
    }
}
