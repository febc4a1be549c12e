//! Error types and utilities for the trackfuse toolkit
//!
//! Provides the pipeline error taxonomy and fuzzy matching for column names
//! referenced in configuration.

use std::fmt;
use strsim::{jaro_winkler, normalized_levenshtein};
use thiserror::Error;

/// External dependency an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Road-network map-matching service
    Matching,
    /// Terrain elevation service
    Elevation,
    /// Geodata (way/node tag) service
    Geodata,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Matching => write!(f, "map-matching"),
            Service::Elevation => write!(f, "elevation"),
            Service::Geodata => write!(f, "geodata"),
        }
    }
}

/// Find the best fuzzy match among known column names
///
/// Scores candidates with Jaro-Winkler (70%) plus normalized Levenshtein (30%),
/// then adds a prefix bonus for names sharing their first characters
/// (`way_max` vs `way_maxspeed`) and a small bonus for similar lengths.
///
/// Minimum threshold: 0.7 similarity, so unrelated names yield no suggestion.
fn find_best_fuzzy_match<'a>(input: &str, candidates: &'a [String]) -> Option<&'a str> {
    let input_lower = input.to_lowercase();
    let mut best_match = None;
    let mut best_score = 0.0f64;

    let min_threshold = 0.7;

    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        if candidate_lower == input_lower {
            // Differs only by case
            return Some(candidate.as_str());
        }

        let jw_score = jaro_winkler(&input_lower, &candidate_lower);
        let lev_score = normalized_levenshtein(&input_lower, &candidate_lower);
        let mut score = (jw_score * 0.7) + (lev_score * 0.3);

        let prefix: String = input_lower.chars().take(6).collect();
        if prefix.chars().count() >= 3 && candidate_lower.starts_with(&prefix) {
            score += 0.1;
        }

        let len_a = input_lower.chars().count() as f64;
        let len_b = candidate_lower.chars().count() as f64;
        let length_ratio = len_a.min(len_b) / len_a.max(len_b).max(1.0);
        if length_ratio > 0.8 {
            score += 0.05 * length_ratio;
        }

        if score > best_score {
            best_score = score;
            best_match = Some(candidate.as_str());
        }
    }

    if best_score >= min_threshold {
        best_match
    } else {
        None
    }
}

/// Suggest a known column name for a possibly misspelled one
///
/// Returns `None` when the input already names a column exactly or when
/// nothing is similar enough to be a plausible typo.
pub fn suggest_column(input: &str, known: &[String]) -> Option<String> {
    if known.iter().any(|k| k == input) {
        return None;
    }
    find_best_fuzzy_match(input, known).map(str::to_string)
}

/// Main error type for trackfuse operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unsupported input document
    #[error("Parse error: {0}")]
    Parse(String),

    /// Too few usable points left to build a route
    #[error("Insufficient data: need at least {required} points, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// External call did not answer in time
    #[error("{service} service timed out: {message}")]
    ServiceTimeout { service: Service, message: String },

    /// External service unreachable or temporarily failing
    #[error("{service} service unavailable: {message}")]
    ServiceUnavailable { service: Service, message: String },

    /// External service answered, but refused the request or sent garbage
    #[error("{service} service rejected the request: {message}")]
    ServiceRejected { service: Service, message: String },

    /// Map matching could not be completed in strict mode
    #[error("Map matching failed: {0}")]
    MapMatch(String),

    /// Column enrichment produced output inconsistent with its declared schema
    #[error("Schema mismatch in column '{column}': {message}")]
    SchemaMismatch { column: String, message: String },

    /// Invalid or conflicting configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Segmentation grid could not be built
    #[error("Segmentation error: {0}")]
    Segmentation(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient errors are worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ServiceTimeout { .. } | Error::ServiceUnavailable { .. }
        )
    }

    /// Service the error originated from, if any
    pub fn service(&self) -> Option<Service> {
        match self {
            Error::ServiceTimeout { service, .. }
            | Error::ServiceUnavailable { service, .. }
            | Error::ServiceRejected { service, .. } => Some(*service),
            _ => None,
        }
    }

    /// Configuration error for an unknown column, with a suggestion when one is close
    pub fn unknown_column(context: &str, column: &str, known: &[String]) -> Self {
        match suggest_column(column, known) {
            Some(suggestion) => Error::Configuration(format!(
                "Unknown column '{column}' in {context}. Did you mean '{suggestion}'?"
            )),
            None => Error::Configuration(format!(
                "Unknown column '{column}' in {context}. Known columns: {}",
                known.join(", ")
            )),
        }
    }

    /// Classify a transport-level failure from reqwest
    #[cfg(feature = "http")]
    pub fn transport(service: Service, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::ServiceTimeout {
                service,
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Error::ServiceRejected {
                service,
                message: err.to_string(),
            }
        } else {
            Error::ServiceUnavailable {
                service,
                message: err.to_string(),
            }
        }
    }
}

/// Convenience result type for trackfuse operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<String> {
        [
            "latitude",
            "longitude",
            "elevation",
            "speed",
            "way_maxspeed",
            "way_highway",
            "node_tags",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_suggest_column_typos() {
        let known = columns();
        assert_eq!(suggest_column("lattitude", &known), Some("latitude".to_string()));
        assert_eq!(suggest_column("elevaton", &known), Some("elevation".to_string()));
        assert_eq!(suggest_column("spead", &known), Some("speed".to_string()));
        assert_eq!(
            suggest_column("way_maxsped", &known),
            Some("way_maxspeed".to_string())
        );
    }

    #[test]
    fn test_suggest_column_case_only() {
        let known = columns();
        assert_eq!(suggest_column("Latitude", &known), Some("latitude".to_string()));
    }

    #[test]
    fn test_suggest_column_no_match() {
        let known = columns();
        assert_eq!(suggest_column("latitude", &known), None); // exact name
        assert_eq!(suggest_column("qqqqqqqqqqqqqqqqq", &known), None); // too different
    }

    #[test]
    fn test_unknown_column_message() {
        let err = Error::unknown_column("segmentation options", "spead", &columns());
        let message = err.to_string();
        assert!(message.contains("spead"));
        assert!(message.contains("Did you mean 'speed'?"));
    }

    #[test]
    fn test_transient_classification() {
        let timeout = Error::ServiceTimeout {
            service: Service::Elevation,
            message: "slow".to_string(),
        };
        let rejected = Error::ServiceRejected {
            service: Service::Elevation,
            message: "400".to_string(),
        };
        assert!(timeout.is_transient());
        assert!(!rejected.is_transient());
        assert!(!Error::Segmentation("flat".to_string()).is_transient());
        assert_eq!(timeout.service(), Some(Service::Elevation));
        assert_eq!(Error::Configuration("x".into()).service(), None);
    }

    #[test]
    fn test_error_display() {
        let err = Error::InsufficientData {
            required: 2,
            actual: 1,
        };
        assert!(err.to_string().contains("at least 2"));
        let err = Error::ServiceUnavailable {
            service: Service::Matching,
            message: "503".to_string(),
        };
        assert_eq!(err.to_string(), "map-matching service unavailable: 503");
    }
}
