use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use burn::tensor::{backend::Backend, Tensor};

/// Number of classes of an ImageNet classifier.
pub const CLASSES: usize = 1000;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("failed to read class index {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("class index must be a JSON object of `\"class\": [\"wnid\", \"label\"]` entries")]
    InvalidJson(#[source] serde_json::Error),
    #[error("class index key `{0}` is not a class number")]
    InvalidKey(String),
    #[error("class index has no entry for class {0}")]
    MissingClass(usize),
    #[error("predictions must have shape (samples, 1000), got ({samples}, {classes})")]
    InvalidShape { samples: usize, classes: usize },
}

/// WordNet identifier and readable label of every class, by class number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    classes: Vec<(String, String)>,
}

impl ClassIndex {
    /// Parses the conventional `{"0": ["n01440764", "tench"], ...}` layout. Class numbers must be
    /// contiguous from 0.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let entries: HashMap<String, (String, String)> =
            serde_json::from_str(json).map_err(DecodeError::InvalidJson)?;

        let mut numbered = entries
            .into_iter()
            .map(|(key, entry)| {
                key.parse::<usize>()
                    .map(|class| (class, entry))
                    .map_err(|_| DecodeError::InvalidKey(key))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let classes = (0..numbered.len())
            .map(|class| {
                numbered
                    .remove(&class)
                    .ok_or(DecodeError::MissingClass(class))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { classes })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| DecodeError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let index = Self::from_json(&json)?;

        tracing::debug!(path = %path.display(), classes = index.len(), "loaded class index");

        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// The WordNet identifier and label of a class.
    pub fn get(&self, class: usize) -> Option<(&str, &str)> {
        self.classes
            .get(class)
            .map(|(wnid, label)| (wnid.as_str(), label.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub wnid: String,
    pub label: String,
    pub score: f32,
}

/// The `top` best scoring classes of every sample, best first.
pub fn decode_predictions<B: Backend>(
    predictions: Tensor<B, 2>,
    top: usize,
    index: &ClassIndex,
) -> Result<Vec<Vec<Prediction>>, DecodeError> {
    let [samples, classes] = predictions.dims();

    if classes != CLASSES {
        return Err(DecodeError::InvalidShape { samples, classes });
    }

    if let Some(missing) = (0..classes).find(|&class| index.get(class).is_none()) {
        return Err(DecodeError::MissingClass(missing));
    }

    let scores = predictions.into_data().convert::<f32>().value;

    Ok(scores
        .chunks_exact(classes)
        .map(|row| {
            let mut ranked = (0..classes).collect::<Vec<_>>();
            ranked.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

            ranked
                .into_iter()
                .take(top)
                .filter_map(|class| {
                    let (wnid, label) = index.get(class)?;

                    Some(Prediction {
                        class,
                        wnid: wnid.to_owned(),
                        label: label.to_owned(),
                        score: row[class],
                    })
                })
                .collect()
        })
        .collect())
}
