//! Quality metrics engine: fast, local, rule-based scoring of extracted text.
//!
//! [`QualityChecker::check`] is total: every input, including empty or
//! binary-looking text, produces a report. Only `error`-severity metrics can
//! fail a page; length, unicode, repetition and structure are advisory.

use crate::config::HeuristicThresholds;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const METRIC_EMPTY: &str = "Empty output";
pub const METRIC_WORD_COUNT: &str = "Word count";
pub const METRIC_AVG_WORD_LENGTH: &str = "Avg word length";
pub const METRIC_GARBAGE_RATIO: &str = "Garbage ratio";
pub const METRIC_UNICODE: &str = "Unicode issues";
pub const METRIC_REPEATS: &str = "Repeated patterns";
pub const METRIC_STRUCTURE: &str = "Has structure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One scored check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: String,
    pub threshold: Option<String>,
    pub passed: bool,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeuristicsReport {
    pub passed: bool,
    pub metrics: Vec<Metric>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Default for HeuristicsReport {
    fn default() -> Self {
        Self {
            passed: true,
            metrics: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl HeuristicsReport {
    fn add(&mut self, metric: Metric) {
        if !metric.passed {
            let line = format!("{}: {}", metric.name, metric.value);
            if metric.severity == Severity::Error {
                self.passed = false;
                self.errors.push(line);
            } else {
                self.warnings.push(line);
            }
        }
        self.metrics.push(metric);
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

static RE_GARBAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\w\s.,!?;:'"()\[\]{}<>@#$%&*+=/\\-]"#).unwrap());
static RE_WIDE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{4,}").unwrap());
static RE_PRIVATE_USE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x{E000}-\x{F8FF}]").unwrap());
static RE_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").unwrap());
static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());
static RE_STRUCTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#+\s+\w|^\d+\.\s+\w|^[-*•]\s+\w").unwrap());

/// Scores text against [`HeuristicThresholds`].
#[derive(Debug, Clone, Default)]
pub struct QualityChecker {
    thresholds: HeuristicThresholds,
}

impl QualityChecker {
    pub fn new(thresholds: HeuristicThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(&self, text: &str) -> HeuristicsReport {
        let t = &self.thresholds;
        let mut report = HeuristicsReport::default();

        if text.trim().is_empty() {
            report.add(Metric {
                name: METRIC_EMPTY,
                value: "No text extracted".into(),
                threshold: None,
                passed: false,
                severity: Severity::Error,
            });
            return report;
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let word_count = words.len();
        let enough_words = word_count >= t.min_word_count;
        report.add(Metric {
            name: METRIC_WORD_COUNT,
            value: word_count.to_string(),
            threshold: Some(t.min_word_count.to_string()),
            passed: enough_words,
            severity: if enough_words { Severity::Info } else { Severity::Error },
        });

        let avg = words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / word_count as f64;
        report.add(Metric {
            name: METRIC_AVG_WORD_LENGTH,
            value: format!("{avg:.1}"),
            threshold: Some(format!("{}-{}", t.min_avg_word_length, t.max_avg_word_length)),
            passed: (t.min_avg_word_length..=t.max_avg_word_length).contains(&avg),
            severity: Severity::Warning,
        });

        let ratio = garbage_ratio(text);
        let clean = ratio <= t.max_garbage_ratio;
        report.add(Metric {
            name: METRIC_GARBAGE_RATIO,
            value: format!("{:.1}%", ratio * 100.0),
            threshold: Some(format!("<{:.0}%", t.max_garbage_ratio * 100.0)),
            passed: clean,
            severity: if clean { Severity::Info } else { Severity::Error },
        });

        let unicode = unicode_issues(text);
        if !unicode.is_empty() {
            report.add(Metric {
                name: METRIC_UNICODE,
                value: unicode.join(", "),
                threshold: None,
                passed: false,
                severity: Severity::Warning,
            });
        }

        let repeats = repeated_patterns(text);
        if !repeats.is_empty() {
            report.add(Metric {
                name: METRIC_REPEATS,
                value: format!("{} suspicious patterns", repeats.len()),
                threshold: None,
                passed: false,
                severity: Severity::Warning,
            });
        }

        report.add(Metric {
            name: METRIC_STRUCTURE,
            value: if has_structure(text) { "Yes" } else { "No" }.into(),
            threshold: None,
            passed: true,
            severity: Severity::Info,
        });

        report
    }
}

/// Characters outside the allow-list plus runs of 4+ whitespace, over total chars.
pub fn garbage_ratio(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let garbage = RE_GARBAGE.find_iter(text).count() + RE_WIDE_WHITESPACE.find_iter(text).count();
    garbage as f64 / total as f64
}

fn unicode_issues(text: &str) -> Vec<&'static str> {
    let mut issues = Vec::new();
    if text.contains('\u{FFFD}') {
        issues.push("replacement chars (\u{FFFD})");
    }
    if RE_PRIVATE_USE.is_match(text) {
        issues.push("private use chars");
    }
    if RE_CONTROL.is_match(text) {
        issues.push("control chars");
    }
    issues
}

fn repeated_patterns(text: &str) -> Vec<&'static str> {
    let chars: Vec<char> = text.chars().collect();
    let mut found = Vec::new();
    if has_char_run(&chars, 5) {
        found.push("repeated chars");
    }
    if has_repeated_word(text, 3) {
        found.push("repeated words");
    }
    if has_pair_run(&chars, 4) {
        found.push("alternating patterns");
    }
    found
}

/// A non-newline character repeated `n` or more times in a row.
fn has_char_run(chars: &[char], n: usize) -> bool {
    let mut run = 0;
    let mut prev: Option<char> = None;
    for &c in chars {
        if c != '\n' && Some(c) == prev {
            run += 1;
        } else {
            run = 1;
        }
        if c != '\n' && run >= n {
            return true;
        }
        prev = Some(c);
    }
    false
}

/// A two-character unit (no newlines) repeated `n` or more times back to back.
fn has_pair_run(chars: &[char], n: usize) -> bool {
    let span = 2 * n;
    if chars.len() < span {
        return false;
    }
    (0..=chars.len() - span).any(|i| {
        let unit = &chars[i..i + 2];
        !unit.contains(&'\n') && (1..n).all(|k| &chars[i + 2 * k..i + 2 * k + 2] == unit)
    })
}

/// The same whole word `n` times in a row, separated only by whitespace,
/// compared case-insensitively.
fn has_repeated_word(text: &str, n: usize) -> bool {
    let words: Vec<regex::Match<'_>> = RE_WORD.find_iter(text).collect();
    words.windows(n).any(|w| {
        let first = w[0].as_str().to_lowercase();
        w.windows(2).all(|pair| {
            let gap = &text[pair[0].end()..pair[1].start()];
            !gap.is_empty() && gap.chars().all(char::is_whitespace)
        }) && w[1..].iter().all(|m| m.as_str().to_lowercase() == first)
    })
}

fn has_structure(text: &str) -> bool {
    RE_STRUCTURE.is_match(text) || text.split("\n\n").count() > 2
}
