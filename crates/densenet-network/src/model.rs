use std::{
    convert::Infallible,
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::Conv2d,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, Initializer, Linear, LinearConfig, PaddingConfig2d, ReLU,
    },
    record::{CompactRecorder, RecorderError},
    tensor::{activation, backend::Backend, Shape, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    block::{
        self, ConvBlockConfig, DenseBlock, DenseBlockConfig, TransitionBlock,
        TransitionBlockConfig,
    },
    error::{BuildError, InputError},
    layer::{LayerId, LayerRegistry, LayerSummary, Role, Scope},
    shape::{self, DataFormat, ImageShape, OutputShape},
    variant::Variant,
};

/// Where the initial parameters of a model come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weights {
    /// Fresh He-normal initialisation.
    Random,
    /// The conventional pretrained identifier. It constrains the input shape and classifier
    /// activation; no checkpoint exists for the modified topology, so parameters stay freshly
    /// initialised.
    ImageNet,
    /// A record previously written by [`Model::save`] to the same path. The recorder picks the
    /// file extension.
    File(PathBuf),
}

impl FromStr for Weights {
    type Err = Infallible;

    /// `random` and `imagenet` name the identifiers, anything else is a path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "random" => Self::Random,
            "imagenet" => Self::ImageNet,
            path => Self::File(PathBuf::from(path)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalPooling {
    Avg,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pooling must be one of `avg` or `max`, got `{0}`")]
pub struct ParsePoolingError(String);

impl FromStr for GlobalPooling {
    type Err = ParsePoolingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Self::Avg),
            "max" => Ok(Self::Max),
            other => Err(ParsePoolingError(other.to_owned())),
        }
    }
}

/// Collapses the spatial dimensions of a channels-first feature map.
pub fn global_pool<B: Backend>(input: Tensor<B, 4>, pooling: GlobalPooling) -> Tensor<B, 2> {
    let [batch, channels, height, width] = input.dims();
    let x = input.reshape(Shape::new([batch, channels, height * width]));
    let x = match pooling {
        GlobalPooling::Avg => x.mean_dim(2),
        GlobalPooling::Max => x.max_dim(2),
    };

    x.reshape(Shape::new([batch, channels]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierActivation {
    Softmax,
    Sigmoid,
    /// No activation; the classifier returns logits.
    Linear,
}

impl ClassifierActivation {
    pub fn apply<B: Backend>(self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Softmax => activation::softmax(logits, 1),
            Self::Sigmoid => activation::sigmoid(logits),
            Self::Linear => logits,
        }
    }
}

impl Display for ClassifierActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Softmax => "softmax",
            Self::Sigmoid => "sigmoid",
            Self::Linear => "linear",
        }
        .fmt(f)
    }
}

#[derive(Module, Debug)]
struct Stem<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: BatchNorm<B, 2>,
    activation: ReLU,
    pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.batch_norm.forward(x);
        let x = self.activation.forward(x);

        // The input is non-negative after the ReLU, so the pooling padding acts as zero padding.
        self.pool.forward(x)
    }
}

/// The parameterised part of the topology: stem, dense blocks with the transitions between them,
/// final normalisation and the optional classifier.
#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    stem: Stem<B>,
    dense_blocks: Vec<DenseBlock<B>>,
    transitions: Vec<TransitionBlock<B>>,
    batch_norm: BatchNorm<B, 2>,
    activation: ReLU,
    classifier: Option<Linear<B>>,
}

impl<B: Backend> DenseNet<B> {
    /// Runs everything up to the head on a channels-first batch.
    pub fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(input);
        let mut transitions = self.transitions.iter();

        for dense_block in &self.dense_blocks {
            x = dense_block.forward(x);

            if let Some(transition) = transitions.next() {
                x = transition.forward(x);
            }
        }

        let x = self.batch_norm.forward(x);

        self.activation.forward(x)
    }

    fn logits(&self, pooled: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.classifier {
            Some(classifier) => classifier.forward(pooled),
            None => pooled,
        }
    }

    pub fn dense_blocks(&self) -> &[DenseBlock<B>] {
        &self.dense_blocks
    }

    /// Sum of the squares of every convolution kernel.
    pub fn squared_weights(&self) -> Tensor<B, 1> {
        let stem_weight = self.stem.conv.clone().into_record().weight.val();
        let stem = (stem_weight.clone() * stem_weight).sum();

        let stem_and_blocks = self
            .dense_blocks
            .iter()
            .fold(stem, |sum, dense_block| sum + dense_block.squared_weights());

        self.transitions
            .iter()
            .fold(stem_and_blocks, |sum, transition| {
                sum + transition.squared_weights()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Head {
    Classifier(ClassifierActivation),
    Pooling(GlobalPooling),
    Features,
}

pub enum Output<B: Backend> {
    /// Feature maps in the model's data format.
    Features(Tensor<B, 4>),
    /// Class scores or pooled features, `(batch, length)`.
    Vector(Tensor<B, 2>),
}

impl<B: Backend> Output<B> {
    pub fn rank(&self) -> usize {
        match self {
            Self::Features(_) => 4,
            Self::Vector(_) => 2,
        }
    }

    pub fn into_features(self) -> Option<Tensor<B, 4>> {
        match self {
            Self::Features(features) => Some(features),
            Self::Vector(_) => None,
        }
    }

    pub fn into_vector(self) -> Option<Tensor<B, 2>> {
        match self {
            Self::Vector(vector) => Some(vector),
            Self::Features(_) => None,
        }
    }
}

/// A finished network together with its input and output description and its name.
#[derive(Debug)]
pub struct Model<B: Backend> {
    network: DenseNet<B>,
    name: String,
    data_format: DataFormat,
    input_shape: ImageShape,
    output_shape: OutputShape,
    head: Head,
    weight_decay: f64,
    layers: Vec<LayerSummary>,
}

impl<B: Backend> Model<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    pub fn output_shape(&self) -> OutputShape {
        self.output_shape
    }

    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    pub fn layers(&self) -> &[LayerSummary] {
        &self.layers
    }

    pub fn network(&self) -> &DenseNet<B> {
        &self.network
    }

    pub fn into_network(self) -> DenseNet<B> {
        self.network
    }

    pub fn num_params(&self) -> usize {
        self.network.num_params()
    }

    /// Checks that a batch of images laid out in the model's data format fits the input shape.
    pub fn check_input(&self, images: &Tensor<B, 4>) -> Result<(), InputError> {
        let [_, first, second, third] = images.dims();
        let actual = self.data_format.image_shape([first, second, third]);
        let expected = self.input_shape;

        let fits = |configured: Option<usize>, size: Option<usize>| match configured {
            Some(_) => configured == size,
            None => true,
        };

        if actual.channels != expected.channels
            || !fits(expected.height, actual.height)
            || !fits(expected.width, actual.width)
        {
            return Err(InputError::ShapeMismatch { expected, actual });
        }

        if [actual.height, actual.width]
            .into_iter()
            .flatten()
            .any(|size| size < shape::MIN_SIZE)
        {
            return Err(InputError::TooSmall {
                actual,
                min_size: shape::MIN_SIZE,
            });
        }

        Ok(())
    }

    /// Runs a batch of images laid out in the model's data format.
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Output<B>, InputError> {
        self.check_input(&images)?;

        let x = self.data_format.to_channels_first(images);
        let features = self.network.forward_features(x);

        Ok(match self.head {
            Head::Classifier(activation) => {
                let pooled = global_pool(features, GlobalPooling::Avg);

                Output::Vector(activation.apply(self.network.logits(pooled)))
            }
            Head::Pooling(pooling) => Output::Vector(global_pool(features, pooling)),
            Head::Features => Output::Features(self.data_format.from_channels_first(features)),
        })
    }

    /// The L2 penalty on the convolution kernels, to be added to the training loss.
    pub fn regularization_loss(&self) -> Tensor<B, 1> {
        self.network.squared_weights().mul_scalar(self.weight_decay)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecorderError> {
        self.network
            .clone()
            .save_file(path.as_ref().to_path_buf(), &CompactRecorder::new())
    }

    pub fn summary(&self) -> Summary<'_, B> {
        Summary(self)
    }
}

pub struct Summary<'a, B: Backend>(&'a Model<B>);

impl<B: Backend> Display for Summary<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = self.0;

        writeln!(f, "Model: \"{}\"", model.name)?;
        writeln!(f, "{:<32} {}", "Layer", "Output Shape")?;

        for layer in &model.layers {
            writeln!(f, "{:<32} {}", layer.id.to_string(), layer.output)?;
        }

        writeln!(f, "Total params: {}", model.num_params())
    }
}

/// Name given to a model without an explicit variant.
///
/// The comparison is against the four-stage descriptors of the canonical networks, so a model
/// without the fourth stage is always called `densenet`.
pub fn legacy_name(stages: &[usize]) -> &'static str {
    match stages {
        [6, 12, 24, 16] => "densenet121",
        [6, 12, 32, 32] => "densenet169",
        [6, 12, 48, 32] => "densenet201",
        _ => "densenet",
    }
}

#[derive(Config, Debug)]
pub struct DenseNetConfig {
    /// Building blocks in each of the three dense stages.
    pub blocks: [usize; 3],
    #[config(default = true)]
    pub include_top: bool,
    #[config(default = "Weights::ImageNet")]
    pub weights: Weights,
    /// Per-image input shape, laid out according to `data_format`.
    pub input_shape: Option<[usize; 3]>,
    /// Global pooling applied when the classifier is not included.
    pub pooling: Option<GlobalPooling>,
    #[config(default = 1000)]
    pub classes: usize,
    #[config(default = "ClassifierActivation::Softmax")]
    pub classifier_activation: ClassifierActivation,
    #[config(default = "DataFormat::ChannelsLast")]
    pub data_format: DataFormat,
    #[config(default = 50)]
    pub stem_filters: usize,
    #[config(default = 10)]
    pub growth_rate: usize,
    #[config(default = 1.0)]
    pub reduction: f64,
    #[config(default = 1.001e-5)]
    pub epsilon: f64,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    /// Spatial dropout after every convolution outside the stem, off by default.
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Blocks of an extra transition and dense stage after the third stage.
    pub fourth_stage: Option<usize>,
    /// Explicit name tag, taking precedence over [`legacy_name`].
    pub variant: Option<Variant>,
}

impl DenseNetConfig {
    pub fn init<B: Backend>(&self) -> Result<Model<B>, BuildError> {
        let requested = self
            .input_shape
            .map(|dims| self.data_format.image_shape(dims));

        self.build(requested)
    }

    /// Builds a model whose input matches an existing batch of images.
    pub fn init_for<B: Backend>(&self, input: &Tensor<B, 4>) -> Result<Model<B>, BuildError> {
        let [_, first, second, third] = input.dims();
        let tensor = self.data_format.image_shape([first, second, third]);

        if let Some(dims) = self.input_shape {
            let configured = self.data_format.image_shape(dims);

            if configured != tensor {
                return Err(BuildError::InputTensorMismatch { tensor, configured });
            }
        }

        self.build(Some(tensor))
    }

    /// Block counts of every stage that will be built.
    pub fn stages(&self) -> Vec<usize> {
        self.blocks.iter().copied().chain(self.fourth_stage).collect()
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.include_top {
            if self.weights != Weights::Random
                && !matches!(
                    self.classifier_activation,
                    ClassifierActivation::Softmax | ClassifierActivation::Linear
                )
            {
                return Err(BuildError::InvalidActivation(self.classifier_activation));
            }

            if self.classes == 0 {
                return Err(BuildError::NoClasses);
            }
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(BuildError::InvalidDropout(self.dropout));
        }

        Ok(())
    }

    fn init_stem<B: Backend>(
        &self,
        input: ImageShape,
        registry: &mut LayerRegistry,
    ) -> Result<(Stem<B>, ImageShape), BuildError> {
        let register = |registry: &mut LayerRegistry, role, shape| {
            registry.register(LayerId::new(Scope::Stem, role), OutputShape::Map(shape))
        };

        let padded = input.window(1, 1, 1);
        register(registry, Role::Padding(0), padded)?;

        let convolved = padded.window(3, 1, 0).with_channels(self.stem_filters);
        register(registry, Role::Conv, convolved)?;
        register(registry, Role::Norm, convolved)?;
        register(registry, Role::Relu, convolved)?;

        let padded = convolved.window(1, 1, 1);
        register(registry, Role::Padding(1), padded)?;

        let pooled = padded.window(3, 2, 0);
        register(registry, Role::MaxPool, pooled)?;

        let stem = Stem {
            conv: block::conv([input.channels, self.stem_filters], 3, 1),
            batch_norm: block::batch_norm(self.stem_filters, self.epsilon),
            activation: ReLU::default(),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        };

        Ok((stem, pooled))
    }

    #[instrument(name = "build densenet", skip_all, fields(blocks = ?self.blocks, fourth_stage = ?self.fourth_stage))]
    fn build<B: Backend>(&self, requested: Option<ImageShape>) -> Result<Model<B>, BuildError> {
        let input_shape = shape::resolve_input_shape(
            requested,
            self.include_top,
            self.weights == Weights::ImageNet,
        )?;
        self.validate()?;

        let mut registry = LayerRegistry::new();
        registry.register(
            LayerId::new(Scope::Stem, Role::Input),
            OutputShape::Map(input_shape),
        )?;

        let (stem, mut shape) = self.init_stem(input_shape, &mut registry)?;

        tracing::debug!(shape = %shape, "built stem");

        let conv_block = ConvBlockConfig::new()
            .with_growth_rate(self.growth_rate)
            .with_epsilon(self.epsilon)
            .with_dropout(self.dropout);
        let transition = TransitionBlockConfig::new()
            .with_reduction(self.reduction)
            .with_epsilon(self.epsilon)
            .with_dropout(self.dropout);

        let stages = self.stages();
        let mut dense_blocks = Vec::with_capacity(stages.len());
        let mut transitions = Vec::with_capacity(stages.len() - 1);

        for (index, &blocks) in stages.iter().enumerate() {
            let stage = index + 1;
            let (dense_block, output) = DenseBlockConfig::new(blocks, conv_block.clone())
                .init(shape, stage, &mut registry)?;

            dense_blocks.push(dense_block);
            shape = output;

            tracing::info!(stage, blocks, channels = shape.channels, "built dense block");

            if stage < stages.len() {
                let (transition_block, output) = transition.init(shape, stage, &mut registry)?;

                transitions.push(transition_block);
                shape = output;

                tracing::debug!(transition = stage, shape = %shape, "built transition block");
            }
        }

        registry.register(LayerId::new(Scope::Top, Role::Norm), OutputShape::Map(shape))?;
        registry.register(LayerId::new(Scope::Top, Role::Relu), OutputShape::Map(shape))?;

        let (classifier, head, output_shape) = if self.include_top {
            registry.register(
                LayerId::new(Scope::Top, Role::AvgPool),
                OutputShape::Vector(shape.channels),
            )?;
            registry.register(
                LayerId::new(Scope::Top, Role::Dense),
                OutputShape::Vector(self.classes),
            )?;

            let classifier = LinearConfig::new(shape.channels, self.classes)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init();

            (
                Some(classifier),
                Head::Classifier(self.classifier_activation),
                OutputShape::Vector(self.classes),
            )
        } else if let Some(pooling) = self.pooling {
            let role = match pooling {
                GlobalPooling::Avg => Role::AvgPool,
                GlobalPooling::Max => Role::MaxPool,
            };

            registry.register(
                LayerId::new(Scope::Top, role),
                OutputShape::Vector(shape.channels),
            )?;

            (
                None,
                Head::Pooling(pooling),
                OutputShape::Vector(shape.channels),
            )
        } else {
            (None, Head::Features, OutputShape::Map(shape))
        };

        let network = DenseNet {
            stem,
            dense_blocks,
            transitions,
            batch_norm: block::batch_norm(shape.channels, self.epsilon),
            activation: ReLU::default(),
            classifier,
        };

        let network = match &self.weights {
            Weights::Random => network,
            Weights::ImageNet => {
                tracing::warn!(
                    "no pretrained checkpoint exists for this topology, keeping fresh parameters"
                );

                network
            }
            Weights::File(path) => network
                .load_file(path.clone(), &CompactRecorder::new())
                .map_err(|source| BuildError::LoadWeights {
                    path: path.clone(),
                    source,
                })?,
        };

        let name = match self.variant {
            Some(variant) => variant.name(),
            None => legacy_name(&stages),
        };

        tracing::info!(
            name,
            layers = registry.len(),
            output = %output_shape,
            "built model"
        );

        Ok(Model {
            network,
            name: name.to_owned(),
            data_format: self.data_format,
            input_shape,
            output_shape,
            head,
            weight_decay: self.weight_decay,
            layers: registry.into_layers(),
        })
    }
}
