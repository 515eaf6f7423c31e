//! Nearest-neighbor identity matching.
//!
//! A full linear scan over the reference database. Ties on distance go to
//! the lowest index, so results depend only on the query and the database
//! order.

use crate::reference::ReferenceDatabase;
use crate::types::Embedding;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("reference database is empty")]
    EmptyDatabase,
    #[error("query has dimension {actual}, reference database has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Distance used to rank reference embeddings. Smaller is closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Euclidean,
    /// `1 - cosine similarity`, in [0, 2].
    Cosine,
}

impl Metric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Euclidean => a.euclidean_distance(b),
            Metric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric {other:?} (expected euclidean or cosine)")),
        }
    }
}

/// Best reference entry for a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Match<'a> {
    pub index: usize,
    pub label: &'a str,
    pub distance: f32,
}

/// Strategy for finding the reference identity closest to a query.
pub trait Matcher: Send + Sync {
    /// `Ok(None)` means no usable match (e.g. beyond a distance threshold).
    fn best_match<'a>(
        &self,
        query: &Embedding,
        database: &'a ReferenceDatabase,
    ) -> Result<Option<Match<'a>>, MatchError>;
}

/// Linear-scan nearest neighbor with an optional maximum distance.
#[derive(Debug, Clone, Default)]
pub struct NearestNeighborMatcher {
    pub metric: Metric,
    /// Matches farther than this are reported as no usable match.
    pub max_distance: Option<f32>,
}

impl NearestNeighborMatcher {
    pub fn new(metric: Metric, max_distance: Option<f32>) -> Self {
        Self { metric, max_distance }
    }

    /// Distances from `query` to every reference embedding, index-aligned with the labels.
    pub fn distances(
        &self,
        query: &Embedding,
        database: &ReferenceDatabase,
    ) -> Result<Vec<f32>, MatchError> {
        if database.is_empty() {
            return Err(MatchError::EmptyDatabase);
        }
        if query.dimension() != database.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: database.dimension(),
                actual: query.dimension(),
            });
        }
        Ok(database
            .embeddings()
            .iter()
            .map(|reference| self.metric.distance(query, reference))
            .collect())
    }
}

/// Index of the smallest value; first occurrence wins ties. NaN never wins.
pub fn argmin(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

impl Matcher for NearestNeighborMatcher {
    fn best_match<'a>(
        &self,
        query: &Embedding,
        database: &'a ReferenceDatabase,
    ) -> Result<Option<Match<'a>>, MatchError> {
        let distances = self.distances(query, database)?;
        let Some(index) = argmin(&distances) else {
            return Ok(None);
        };
        let distance = distances[index];

        if let Some(max) = self.max_distance {
            if distance > max {
                tracing::debug!(distance, max, "nearest identity beyond max distance");
                return Ok(None);
            }
        }

        Ok(database.label(index).map(|label| Match { index, label, distance }))
    }
}
