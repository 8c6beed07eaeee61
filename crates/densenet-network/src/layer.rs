use std::{
    collections::HashSet,
    fmt::{self, Display},
};

use crate::{error::BuildError, shape::OutputShape};

/// The part of the network a layer belongs to. Stages and transitions are numbered from 1, in
/// the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Stem,
    Stage(usize),
    Transition(usize),
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Input,
    /// Zero padding, numbered within its scope.
    Padding(usize),
    Norm,
    Relu,
    Conv,
    Dropout,
    Concat,
    MaxPool,
    AvgPool,
    Dense,
}

/// Structured name of a single layer. Two layers of one model never share an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId {
    pub scope: Scope,
    /// 1-based index of the building block within a dense stage.
    pub block: Option<usize>,
    pub role: Role,
}

impl LayerId {
    pub const fn new(scope: Scope, role: Role) -> Self {
        Self {
            scope,
            block: None,
            role,
        }
    }

    pub const fn in_block(scope: Scope, block: usize, role: Role) -> Self {
        Self {
            scope,
            block: Some(block),
            role,
        }
    }
}

// Rendered with the conventional DenseNet layer names: the stem is "conv1"/"pool1" and stage n
// is "conv{n+1}" followed by transition "pool{n+1}".
impl Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.scope, self.role) {
            (_, Role::Input) => "input".fmt(f),
            (_, Role::Padding(0)) => "zero_padding2d".fmt(f),
            (_, Role::Padding(index)) => write!(f, "zero_padding2d_{index}"),
            (Scope::Stem, Role::MaxPool) => "pool1".fmt(f),
            (Scope::Stem, role) => write!(f, "conv1/{}", role_suffix(role)),
            (Scope::Stage(stage), role) => {
                write!(f, "conv{}", stage + 1)?;

                if let Some(block) = self.block {
                    write!(f, "_block{block}")?;
                }

                match role {
                    Role::Norm | Role::Relu => write!(f, "_1_{}", role_suffix(role)),
                    Role::Conv | Role::Dropout => write!(f, "_2_{}", role_suffix(role)),
                    role => write!(f, "_{}", role_suffix(role)),
                }
            }
            (Scope::Transition(transition), role) => {
                write!(f, "pool{}_{}", transition + 1, role_suffix(role))
            }
            (Scope::Top, Role::Dense) => "predictions".fmt(f),
            (Scope::Top, Role::AvgPool) => "avg_pool".fmt(f),
            (Scope::Top, Role::MaxPool) => "max_pool".fmt(f),
            (Scope::Top, role) => role_suffix(role).fmt(f),
        }
    }
}

fn role_suffix(role: Role) -> &'static str {
    match role {
        Role::Input => "input",
        Role::Padding(_) => "pad",
        Role::Norm => "bn",
        Role::Relu => "relu",
        Role::Conv => "conv",
        Role::Dropout => "dropout",
        Role::Concat => "concat",
        Role::MaxPool | Role::AvgPool => "pool",
        Role::Dense => "dense",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSummary {
    pub id: LayerId,
    pub output: OutputShape,
}

/// Records every layer of a model as it is built, in construction order, rejecting identifiers
/// that were already used.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: Vec<LayerSummary>,
    seen: HashSet<LayerId>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: LayerId, output: OutputShape) -> Result<(), BuildError> {
        if !self.seen.insert(id) {
            return Err(BuildError::DuplicateLayer(id));
        }

        tracing::trace!(layer = %id, output = %output, "registered layer");

        self.layers.push(LayerSummary { id, output });

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn into_layers(self) -> Vec<LayerSummary> {
        self.layers
    }
}
