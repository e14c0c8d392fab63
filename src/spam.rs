//! Pre-trained spam model.
//!
//! Two JSON artifacts are produced offline: a vectorizer (vocabulary plus
//! term weighting) and a binary decision function over its feature space.
//! Both are loaded once at startup and never change afterwards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::ModelError;

pub const FORMAT_VERSION: u32 = 1;

/// Two or more word characters, the tokenizer the artifacts are trained with.
const TOKEN_PATTERN: &str = r"(?u)\b\w\w+\b";

/// Sparse feature vector, sorted by column.
pub type Features = Vec<(usize, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
}

#[derive(Debug, Deserialize)]
struct VectorizerArtifact {
    format_version: u32,
    vocabulary: HashMap<String, usize>,
    #[serde(default)]
    idf: Option<Vec<f64>>,
    #[serde(default = "default_lowercase")]
    lowercase: bool,
    #[serde(default = "default_ngram_range")]
    ngram_range: (usize, usize),
    #[serde(default)]
    stop_words: Vec<String>,
    #[serde(default)]
    binary: bool,
    #[serde(default)]
    sublinear_tf: bool,
    #[serde(default)]
    norm: Option<Norm>,
}

fn default_lowercase() -> bool {
    true
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

/// Bag-of-terms transform with optional TF-IDF weighting.
#[derive(Debug)]
pub struct Vectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Option<Vec<f64>>,
    lowercase: bool,
    ngram_range: (usize, usize),
    stop_words: HashSet<String>,
    binary: bool,
    sublinear_tf: bool,
    norm: Option<Norm>,
    token_pattern: Regex,
}

impl Vectorizer {
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let artifact: VectorizerArtifact =
            serde_json::from_str(json).map_err(|source| ModelError::Parse {
                artifact: "vectorizer".to_string(),
                source,
            })?;
        Self::from_artifact(artifact)
    }

    fn from_artifact(artifact: VectorizerArtifact) -> Result<Self, ModelError> {
        if artifact.format_version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                artifact: "vectorizer".to_string(),
                found: artifact.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let dimension = artifact.vocabulary.len();
        if dimension == 0 {
            return Err(ModelError::Invalid("vectorizer vocabulary is empty".into()));
        }
        let mut seen = HashSet::with_capacity(dimension);
        for (term, &column) in &artifact.vocabulary {
            if column >= dimension || !seen.insert(column) {
                return Err(ModelError::Invalid(format!(
                    "vocabulary term {:?} has invalid column {}",
                    term, column
                )));
            }
        }
        if let Some(idf) = &artifact.idf {
            if idf.len() != dimension {
                return Err(ModelError::Invalid(format!(
                    "idf has {} weights for a vocabulary of {}",
                    idf.len(),
                    dimension
                )));
            }
        }
        let (min_n, max_n) = artifact.ngram_range;
        if min_n == 0 || min_n > max_n {
            return Err(ModelError::Invalid(format!(
                "invalid ngram range ({}, {})",
                min_n, max_n
            )));
        }

        let token_pattern = Regex::new(TOKEN_PATTERN)
            .map_err(|e| ModelError::Invalid(format!("token pattern: {}", e)))?;

        Ok(Self {
            vocabulary: artifact.vocabulary,
            idf: artifact.idf,
            lowercase: artifact.lowercase,
            ngram_range: artifact.ngram_range,
            stop_words: artifact.stop_words.into_iter().collect(),
            binary: artifact.binary,
            sublinear_tf: artifact.sublinear_tf,
            norm: artifact.norm,
            token_pattern,
        })
    }

    pub fn dimension(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn transform(&self, text: &str) -> Features {
        let text = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };

        let tokens: Vec<&str> = self
            .token_pattern
            .find_iter(&text)
            .map(|m| m.as_str())
            .filter(|t| !self.stop_words.contains(*t))
            .collect();

        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        let (min_n, max_n) = self.ngram_range;
        for n in min_n..=max_n {
            for window in tokens.windows(n) {
                let term = window.join(" ");
                if let Some(&column) = self.vocabulary.get(&term) {
                    *counts.entry(column).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut features: Features = counts
            .into_iter()
            .map(|(column, tf)| {
                let tf = if self.binary {
                    1.0
                } else if self.sublinear_tf {
                    1.0 + tf.ln()
                } else {
                    tf
                };
                let weight = self.idf.as_ref().map_or(1.0, |idf| idf[column]);
                (column, tf * weight)
            })
            .collect();

        let norm = match self.norm {
            Some(Norm::L2) => features.iter().map(|(_, v)| v * v).sum::<f64>().sqrt(),
            Some(Norm::L1) => features.iter().map(|(_, v)| v.abs()).sum::<f64>(),
            None => 0.0,
        };
        if norm > 0.0 {
            for (_, v) in features.iter_mut() {
                *v /= norm;
            }
        }

        features
    }
}

#[derive(Debug, Deserialize)]
struct ClassifierArtifact {
    format_version: u32,
    #[serde(flatten)]
    decision: DecisionFunction,
}

/// Binary decision over a feature vector. Class 1 is spam.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionFunction {
    /// Spam when `w . x + b > 0`.
    Linear { coefficients: Vec<f64>, intercept: f64 },
    /// Spam when the spam class has the higher joint log likelihood.
    MultinomialNb {
        class_log_prior: [f64; 2],
        feature_log_prob: [Vec<f64>; 2],
    },
}

impl DecisionFunction {
    fn dimension_matches(&self, dimension: usize) -> bool {
        match self {
            Self::Linear { coefficients, .. } => coefficients.len() == dimension,
            Self::MultinomialNb {
                feature_log_prob, ..
            } => feature_log_prob.iter().all(|p| p.len() == dimension),
        }
    }

    pub fn is_spam(&self, features: &[(usize, f64)]) -> bool {
        match self {
            Self::Linear {
                coefficients,
                intercept,
            } => {
                let score: f64 = features
                    .iter()
                    .map(|&(column, value)| coefficients[column] * value)
                    .sum::<f64>()
                    + intercept;
                score > 0.0
            }
            Self::MultinomialNb {
                class_log_prior,
                feature_log_prob,
            } => {
                let joint = |class: usize| {
                    class_log_prior[class]
                        + features
                            .iter()
                            .map(|&(column, value)| feature_log_prob[class][column] * value)
                            .sum::<f64>()
                };
                joint(1) > joint(0)
            }
        }
    }
}

/// Vectorizer and decision function loaded as one immutable unit.
#[derive(Debug)]
pub struct SpamClassifier {
    vectorizer: Vectorizer,
    decision: DecisionFunction,
}

impl SpamClassifier {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        vectorizer_path: P,
        classifier_path: Q,
    ) -> Result<Self, ModelError> {
        let vectorizer_json = read_artifact(vectorizer_path.as_ref())?;
        let classifier_json = read_artifact(classifier_path.as_ref())?;
        let classifier = Self::from_json(&vectorizer_json, &classifier_json)?;
        info!(
            vectorizer = %vectorizer_path.as_ref().display(),
            classifier = %classifier_path.as_ref().display(),
            features = classifier.vectorizer.dimension(),
            "Loaded spam model"
        );
        Ok(classifier)
    }

    pub fn from_json(vectorizer_json: &str, classifier_json: &str) -> Result<Self, ModelError> {
        let vectorizer = Vectorizer::from_json(vectorizer_json)?;
        let artifact: ClassifierArtifact =
            serde_json::from_str(classifier_json).map_err(|source| ModelError::Parse {
                artifact: "classifier".to_string(),
                source,
            })?;
        if artifact.format_version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                artifact: "classifier".to_string(),
                found: artifact.format_version,
                expected: FORMAT_VERSION,
            });
        }
        if !artifact.decision.dimension_matches(vectorizer.dimension()) {
            return Err(ModelError::Invalid(format!(
                "classifier dimensions do not match the vocabulary size {}",
                vectorizer.dimension()
            )));
        }
        Ok(Self {
            vectorizer,
            decision: artifact.decision,
        })
    }

    /// True when the model labels `subject` as spam.
    pub fn predict(&self, subject: &str) -> bool {
        let features = self.vectorizer.transform(subject);
        self.decision.is_spam(&features)
    }
}

fn read_artifact(path: &Path) -> Result<String, ModelError> {
    std::fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}
