//! Golden embedding harness for model validation.
//!
//! Validates pooled embeddings against reference vectors recorded from a
//! trusted implementation of the same checkpoint. Golden tests catch layout
//! regressions (QKV fusion order, transposes, pooling index) that unit tests
//! on synthetic weights cannot.
//!
//! # Architecture
//!
//! The harness consists of:
//! - [`GoldenCase`] - One request plus the vectors it must produce
//! - [`GoldenTestHarness`] - Collection of cases with validation
//! - [`GoldenResult`] - Comparison result with error metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use flashbert_core::model::{GoldenCase, GoldenTestHarness};
//!
//! let harness = GoldenTestHarness::from_json_file("golden/bge-small.json".as_ref())?;
//! let summary = harness.validate(&model);
//! assert!(summary.all_passed(), "{summary}");
//! ```
//!
//! # Tolerances
//!
//! A case passes when every component satisfies
//! `|actual - expected| <= tolerance` or, for large components,
//! `|actual - expected| / |expected| <= tolerance`. Half-precision models
//! need looser tolerances than f32 ones.

use super::{Embedding, FlashBertModel};
use crate::batch::{Batch, EmbedRequest};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// A single golden test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenCase {
    /// Test case name for identification.
    pub name: String,
    /// Packed request to embed.
    pub request: EmbedRequest,
    /// One expected vector per sequence in `request`.
    pub expected: Vec<Embedding>,
    /// Allowed per-component error.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Tags for filtering tests.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_tolerance() -> f32 {
    1e-4
}

impl GoldenCase {
    /// Create a case with the default tolerance.
    pub fn new(name: impl Into<String>, request: EmbedRequest, expected: Vec<Embedding>) -> Self {
        Self {
            name: name.into(),
            request,
            expected,
            tolerance: default_tolerance(),
            description: None,
            tags: Vec::new(),
        }
    }

    /// Add a tag to the test case.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Set tolerance.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Result of a single golden test.
#[derive(Debug, Clone)]
pub struct GoldenResult {
    /// Test case name.
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Largest absolute component error.
    pub max_abs_error: f32,
    /// Largest relative component error.
    pub max_rel_error: f32,
    /// First `(vector, component)` outside tolerance.
    pub first_divergence: Option<(usize, usize)>,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Execution time in milliseconds.
    pub time_ms: f64,
}

impl GoldenResult {
    /// Compare `actual` against `expected` within `tolerance`.
    pub fn compare(
        name: String,
        expected: &[Embedding],
        actual: &[Embedding],
        tolerance: f32,
        time_ms: f64,
    ) -> Self {
        if expected.len() != actual.len() {
            return Self::error(
                name,
                format!(
                    "expected {} vectors, got {}",
                    expected.len(),
                    actual.len()
                ),
            );
        }

        let mut max_abs_error = 0f32;
        let mut max_rel_error = 0f32;
        let mut first_divergence = None;
        for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
            if e.len() != a.len() {
                return Self::error(
                    name,
                    format!("vector {} has length {}, expected {}", i, a.len(), e.len()),
                );
            }
            for (j, (&x, &y)) in e.iter().zip(a.iter()).enumerate() {
                let abs = (x - y).abs();
                let rel = if x.abs() > f32::EPSILON { abs / x.abs() } else { abs };
                if abs.is_nan() || (abs > tolerance && rel > tolerance) {
                    first_divergence.get_or_insert((i, j));
                }
                max_abs_error = max_abs_error.max(abs);
                max_rel_error = max_rel_error.max(rel);
            }
        }

        let error = first_divergence.map(|(i, j)| {
            format!(
                "vector {} component {}: expected {}, got {}",
                i, j, expected[i][j], actual[i][j]
            )
        });

        Self {
            name,
            passed: first_divergence.is_none(),
            max_abs_error,
            max_rel_error,
            first_divergence,
            error,
            time_ms,
        }
    }

    /// Create an error result.
    pub fn error(name: String, error: String) -> Self {
        Self {
            name,
            passed: false,
            max_abs_error: f32::INFINITY,
            max_rel_error: f32::INFINITY,
            first_divergence: None,
            error: Some(error),
            time_ms: 0.0,
        }
    }
}

impl fmt::Display for GoldenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "[{}] {} (abs {:.2e}, rel {:.2e}, {:.1}ms)",
            status, self.name, self.max_abs_error, self.max_rel_error, self.time_ms
        )?;

        if let Some(ref err) = self.error {
            write!(f, "\n  Error: {}", err)?;
        }

        Ok(())
    }
}

/// Summary of golden test results.
#[derive(Debug, Clone, Default)]
pub struct GoldenSummary {
    /// Total number of tests.
    pub total: usize,
    /// Number of passed tests.
    pub passed: usize,
    /// Number of failed tests.
    pub failed: usize,
    /// Total execution time in milliseconds.
    pub total_time_ms: f64,
    /// Results by name.
    pub results: HashMap<String, GoldenResult>,
}

impl GoldenSummary {
    /// Create from results.
    pub fn from_results(results: Vec<GoldenResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let total_time_ms = results.iter().map(|r| r.time_ms).sum();

        Self {
            total,
            passed,
            failed: total - passed,
            total_time_ms,
            results: results.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Check if all tests passed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Worst absolute error over all cases that produced output.
    pub fn max_abs_error(&self) -> f32 {
        self.results
            .values()
            .filter(|r| r.max_abs_error.is_finite())
            .map(|r| r.max_abs_error)
            .fold(0.0, f32::max)
    }
}

impl fmt::Display for GoldenSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Golden Embedding Summary")?;
        writeln!(f, "========================")?;
        writeln!(f, "Total:  {}", self.total)?;
        writeln!(f, "Passed: {}", self.passed)?;
        writeln!(f, "Failed: {}", self.failed)?;
        writeln!(f, "Worst abs error: {:.2e}", self.max_abs_error())?;
        writeln!(f, "Time:   {:.1}ms", self.total_time_ms)?;

        if self.failed > 0 {
            writeln!(f, "\nFailed tests:")?;
            for result in self.results.values().filter(|r| !r.passed) {
                writeln!(f, "  - {}", result)?;
            }
        }

        Ok(())
    }
}

/// Golden test harness for model validation.
#[derive(Debug, Clone, Default)]
pub struct GoldenTestHarness {
    cases: Vec<GoldenCase>,
}

impl GoldenTestHarness {
    /// Create a new test harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load cases from a JSON array of [`GoldenCase`].
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let cases: Vec<GoldenCase> = serde_json::from_str(&contents)?;
        Ok(Self { cases })
    }

    /// Write cases as a JSON array.
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.cases)?)?;
        Ok(())
    }

    /// Add a test case.
    pub fn add_case(&mut self, case: GoldenCase) {
        self.cases.push(case);
    }

    /// Add multiple test cases.
    pub fn add_cases(&mut self, cases: impl IntoIterator<Item = GoldenCase>) {
        self.cases.extend(cases);
    }

    /// Get all test cases.
    pub fn cases(&self) -> &[GoldenCase] {
        &self.cases
    }

    /// Filter cases by tag.
    pub fn filter_by_tag(&self, tag: &str) -> Vec<&GoldenCase> {
        self.cases
            .iter()
            .filter(|c| c.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Compare vectors for a single case.
    pub fn compare(&self, case: &GoldenCase, actual: &[Embedding]) -> GoldenResult {
        GoldenResult::compare(case.name.clone(), &case.expected, actual, case.tolerance, 0.0)
    }

    /// Run all cases through `embed`.
    pub fn run_with<F>(&self, mut embed: F) -> GoldenSummary
    where
        F: FnMut(&EmbedRequest) -> Result<Vec<Embedding>>,
    {
        let results = self
            .cases
            .iter()
            .map(|case| {
                let start = std::time::Instant::now();
                match embed(&case.request) {
                    Ok(actual) => GoldenResult::compare(
                        case.name.clone(),
                        &case.expected,
                        &actual,
                        case.tolerance,
                        start.elapsed().as_secs_f64() * 1000.0,
                    ),
                    Err(err) => GoldenResult::error(case.name.clone(), err.to_string()),
                }
            })
            .collect();

        GoldenSummary::from_results(results)
    }

    /// Run all cases against `model`, building each batch in the layout the
    /// model's backend accepts.
    pub fn validate(&self, model: &FlashBertModel) -> GoldenSummary {
        self.run_with(|req| {
            let batch = Batch::from_request(
                req,
                model.backend(),
                model.device(),
                model.max_input_length(),
                None,
            )?;
            model.embed(&batch)
        })
    }
}
