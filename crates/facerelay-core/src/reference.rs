//! Reference identity database: index-aligned embeddings and labels.
//!
//! Loaded once per processing context from a JSON file of the form
//! `{"labels": [...], "embeddings": [[...], ...]}` and never mutated.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference database {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reference database is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reference database is empty")]
    Empty,
    #[error("{embeddings} embeddings but {labels} labels")]
    LengthMismatch { embeddings: usize, labels: usize },
    #[error("embedding {index} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("embedding {index} contains a non-finite value")]
    NonFinite { index: usize },
}

#[derive(Serialize, Deserialize)]
struct ReferenceFile {
    labels: Vec<String>,
    embeddings: Vec<Vec<f32>>,
}

/// Immutable `(embedding, label)` pairs; position `i` of one pairs with position `i` of the other.
#[derive(Debug, Clone)]
pub struct ReferenceDatabase {
    embeddings: Vec<Embedding>,
    labels: Vec<String>,
    dimension: usize,
}

impl ReferenceDatabase {
    /// Build a database, validating shape and contents.
    pub fn new(embeddings: Vec<Embedding>, labels: Vec<String>) -> Result<Self, ReferenceError> {
        if embeddings.len() != labels.len() {
            return Err(ReferenceError::LengthMismatch {
                embeddings: embeddings.len(),
                labels: labels.len(),
            });
        }
        let Some(first) = embeddings.first() else {
            return Err(ReferenceError::Empty);
        };
        let dimension = first.dimension();

        for (index, e) in embeddings.iter().enumerate() {
            if e.dimension() != dimension || dimension == 0 {
                return Err(ReferenceError::DimensionMismatch {
                    index,
                    expected: dimension.max(1),
                    actual: e.dimension(),
                });
            }
            if e.values.iter().any(|v| !v.is_finite()) {
                return Err(ReferenceError::NonFinite { index });
            }
        }

        Ok(Self { embeddings, labels, dimension })
    }

    /// Load and validate a JSON reference file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ReferenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let db = Self::from_json(&bytes)?;
        tracing::info!(
            path = %path.display(),
            identities = db.len(),
            dimension = db.dimension(),
            "reference database loaded"
        );
        Ok(db)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ReferenceError> {
        let file: ReferenceFile = serde_json::from_slice(bytes)?;
        Self::new(
            file.embeddings.into_iter().map(Embedding::new).collect(),
            file.labels,
        )
    }

    pub fn to_json(&self) -> Result<String, ReferenceError> {
        let file = ReferenceFile {
            labels: self.labels.clone(),
            embeddings: self.embeddings.iter().map(|e| e.values.clone()).collect(),
        };
        Ok(serde_json::to_string(&file)?)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Always false for a constructed database; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Embedding, &str)> {
        self.embeddings.iter().zip(self.labels.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn db(rows: &[(&str, &[f32])]) -> Result<ReferenceDatabase, ReferenceError> {
        ReferenceDatabase::new(
            rows.iter().map(|(_, v)| Embedding::new(v.to_vec())).collect(),
            rows.iter().map(|(l, _)| l.to_string()).collect(),
        )
    }

    #[test]
    fn test_valid_database() {
        let d = db(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d.dimension(), 2);
        assert_eq!(d.label(1), Some("bob"));
        assert_eq!(d.label(2), None);
        let labels: Vec<&str> = d.iter().map(|(_, l)| l).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(db(&[]), Err(ReferenceError::Empty)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = ReferenceDatabase::new(
            vec![Embedding::new(vec![1.0])],
            vec!["a".into(), "b".into()],
        )
        .unwrap_err();
        assert!(matches!(err, ReferenceError::LengthMismatch { embeddings: 1, labels: 2 }));
    }

    #[test]
    fn test_ragged_dimensions_rejected() {
        let err = db(&[("a", &[1.0, 0.0]), ("b", &[1.0])]).unwrap_err();
        assert!(matches!(err, ReferenceError::DimensionMismatch { index: 1, expected: 2, actual: 1 }));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(db(&[("a", &[])]), Err(ReferenceError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = db(&[("a", &[1.0, f32::INFINITY])]).unwrap_err();
        assert!(matches!(err, ReferenceError::NonFinite { index: 0 }));
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let d = db(&[("alice", &[0.5, 0.25]), ("bob", &[0.0, 1.0])]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(d.to_json().unwrap().as_bytes()).unwrap();

        let loaded = ReferenceDatabase::load(file.path()).unwrap();
        assert_eq!(loaded.labels(), d.labels());
        assert_eq!(loaded.embeddings(), d.embeddings());
    }

    #[test]
    fn test_missing_file() {
        let err = ReferenceDatabase::load("/nonexistent/facerelay/ref.json").unwrap_err();
        assert!(matches!(err, ReferenceError::Io { .. }));
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            ReferenceDatabase::from_json(b"{\"labels\": [\"a\"]}"),
            Err(ReferenceError::Parse(_))
        ));
    }
}
