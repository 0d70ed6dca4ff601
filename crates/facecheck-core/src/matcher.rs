//! Match engine: decides whether a query embedding matches any stored one.
//!
//! A match is any candidate whose Euclidean distance to the query is
//! strictly below the threshold. The default strategy stops at the first
//! such candidate; the nearest strategy scans everything and reports the
//! closest. Both agree on whether a match exists.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query embedding is empty")]
    EmptyQuery,
    #[error("invalid threshold {0}: must be finite and non-negative")]
    InvalidThreshold(f32),
    #[error("dimension mismatch at candidate {index}: query has {expected} dims, candidate has {found}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
}

/// Decision for one query against one candidate set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    /// Candidate at `index` (position in the candidate sequence) is within threshold.
    Matched { index: usize, distance: f32 },
    /// No candidate within threshold. `closest` is the smallest distance seen,
    /// or `None` when the set was empty.
    NoMatch { closest: Option<f32> },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// How the candidate set is scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Return on the first candidate below threshold.
    #[default]
    First,
    /// Scan all candidates; report the closest if it is below threshold.
    Nearest,
}

impl MatchStrategy {
    pub fn evaluate<'a, I>(
        self,
        query: &Embedding,
        candidates: I,
        threshold: f32,
    ) -> Result<MatchOutcome, MatchError>
    where
        I: IntoIterator<Item = &'a Embedding>,
        I::IntoIter: Clone,
    {
        match self {
            MatchStrategy::First => evaluate(query, candidates, threshold),
            MatchStrategy::Nearest => evaluate_nearest(query, candidates, threshold),
        }
    }
}

impl std::str::FromStr for MatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MatchStrategy::First),
            "nearest" => Ok(MatchStrategy::Nearest),
            other => Err(format!("unknown match strategy '{other}' (expected first or nearest)")),
        }
    }
}

/// Short-circuit match: the first candidate strictly closer than `threshold` wins.
///
/// Every candidate's dimensionality is checked before any distance is
/// computed, so a mismatch anywhere in the set is reported regardless of
/// where a match would have been found.
pub fn evaluate<'a, I>(
    query: &Embedding,
    candidates: I,
    threshold: f32,
) -> Result<MatchOutcome, MatchError>
where
    I: IntoIterator<Item = &'a Embedding>,
    I::IntoIter: Clone,
{
    let candidates = validate(query, candidates, threshold)?;

    let mut closest: Option<f32> = None;
    for (index, candidate) in candidates.enumerate() {
        let distance = distance(query, candidate, index)?;
        if distance < threshold {
            return Ok(MatchOutcome::Matched { index, distance });
        }
        closest = Some(closest.map_or(distance, |c| c.min(distance)));
    }

    Ok(MatchOutcome::NoMatch { closest })
}

/// Closest-match variant: scans the whole set, ties resolve to the earliest candidate.
pub fn evaluate_nearest<'a, I>(
    query: &Embedding,
    candidates: I,
    threshold: f32,
) -> Result<MatchOutcome, MatchError>
where
    I: IntoIterator<Item = &'a Embedding>,
    I::IntoIter: Clone,
{
    let candidates = validate(query, candidates, threshold)?;

    let mut best: Option<(usize, f32)> = None;
    for (index, candidate) in candidates.enumerate() {
        let d = distance(query, candidate, index)?;
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((index, d));
        }
    }

    Ok(match best {
        Some((index, distance)) if distance < threshold => MatchOutcome::Matched { index, distance },
        other => MatchOutcome::NoMatch {
            closest: other.map(|(_, d)| d),
        },
    })
}

fn validate<'a, I>(
    query: &Embedding,
    candidates: I,
    threshold: f32,
) -> Result<I::IntoIter, MatchError>
where
    I: IntoIterator<Item = &'a Embedding>,
    I::IntoIter: Clone,
{
    if query.is_empty() {
        return Err(MatchError::EmptyQuery);
    }
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(MatchError::InvalidThreshold(threshold));
    }

    let iter = candidates.into_iter();
    let expected = query.dim();
    if let Some((index, c)) = iter.clone().enumerate().find(|(_, c)| c.dim() != expected) {
        return Err(MatchError::DimensionMismatch {
            index,
            expected,
            found: c.dim(),
        });
    }
    Ok(iter)
}

fn distance(query: &Embedding, candidate: &Embedding, index: usize) -> Result<f32, MatchError> {
    query
        .euclidean_distance(candidate)
        .ok_or(MatchError::DimensionMismatch {
            index,
            expected: query.dim(),
            found: candidate.dim(),
        })
}
