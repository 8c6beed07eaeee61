use std::{error::Error, fs::File, io, path::PathBuf};

use burn::{
    config::{Config, ConfigError},
    record::RecorderError,
    tensor::backend::Backend,
};
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use clap::{Args, Parser, Subcommand, ValueEnum};
use densenet_network::{
    model::ParsePoolingError, variant::ParseVariantError, DataFormat, DenseNetConfig,
    GlobalPooling, Model, Variant, Weights,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version = "0.1.0")]
#[command(about = "Build and inspect the modified DenseNet models")]
struct Cli {
    #[arg(
        short,
        long,
        help = "Write JSON traces to the specified file after truncating or creating it"
    )]
    trace_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = BackendKind::Cpu, help = "Backend the model is built on")]
    backend: BackendKind,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Cpu,
    Wgpu,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print every layer of the model with its output shape")]
    Summary(ModelArgs),
    #[command(about = "Save the initial parameters of the model")]
    Save {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(short, long, help = "Destination of the record, without extension")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long, default_value = "densenet121", value_parser = parse_variant)]
    variant: Variant,
    #[arg(long, help = "Load the model configuration from a JSON file instead of a variant")]
    config: Option<PathBuf>,
    #[arg(long, help = "`random`, `imagenet` or the path of a saved record")]
    weights: Option<Weights>,
    #[arg(long, help = "Side length of the square input images")]
    input_size: Option<usize>,
    #[arg(long, help = "Leave out the classifier")]
    no_top: bool,
    #[arg(long, value_parser = parse_pooling, help = "`avg` or `max` pooling without the classifier")]
    pooling: Option<GlobalPooling>,
    #[arg(long)]
    classes: Option<usize>,
    #[arg(long, help = "Restore the fourth dense stage with this many blocks")]
    fourth_stage: Option<usize>,
    #[arg(long, help = "Name the model after the variant")]
    tag: bool,
}

fn parse_variant(s: &str) -> Result<Variant, ParseVariantError> {
    s.parse()
}

fn parse_pooling(s: &str) -> Result<GlobalPooling, ParsePoolingError> {
    s.parse()
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
enum CliError {
    #[error("failed to load config {path}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("failed to save weights to {path}")]
    SaveWeights {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
}

impl ModelArgs {
    fn config(&self) -> Result<DenseNetConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => DenseNetConfig::load(path).map_err(|source| CliError::LoadConfig {
                path: path.clone(),
                source,
            })?,
            None => self.variant.config(),
        };

        if let Some(weights) = &self.weights {
            config.weights = weights.clone();
        }

        if let Some(size) = self.input_size {
            config.input_shape = Some(match config.data_format {
                DataFormat::ChannelsFirst => [3, size, size],
                DataFormat::ChannelsLast => [size, size, 3],
            });
        }

        if self.no_top {
            config.include_top = false;
        }

        if self.pooling.is_some() {
            config.pooling = self.pooling;
        }

        if let Some(classes) = self.classes {
            config.classes = classes;
        }

        if self.fourth_stage.is_some() {
            config.fourth_stage = self.fourth_stage;
        }

        if self.tag {
            config.variant = Some(self.variant);
        }

        Ok(config)
    }

    fn build<B: Backend>(&self) -> Result<Model<B>, Box<dyn Error>> {
        let config = self.config()?;

        tracing::info!(%config, "building model");

        Ok(config.init()?)
    }
}

fn initialize_tracing(trace_file: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    match trace_file {
        Some(trace_file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(File::create(trace_file)?)
                .event_format(tracing_subscriber::fmt::format().without_time().json())
                .with_max_level(Level::TRACE)
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(io::stderr)
                .with_env_filter(EnvFilter::from_default_env())
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
    }
}

fn run<B: Backend>(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Summary(model) => {
            let model = model.build::<B>()?;

            print!("{}", model.summary());
        }
        Command::Save { model, output } => {
            let model = model.build::<B>()?;

            model.save(&output).map_err(|source| CliError::SaveWeights {
                path: output.clone(),
                source,
            })?;

            tracing::info!(path = %output.display(), params = model.num_params(), "saved weights");
        }
    }

    Ok(())
}

pub fn cli() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    initialize_tracing(cli.trace_file)?;

    match cli.backend {
        BackendKind::Cpu => run::<NdArray>(cli.command),
        BackendKind::Wgpu => run::<Wgpu>(cli.command),
    }
}
