//! Structural validation of records before they reach the enrichment service.
//!
//! A record that fails here is a data-shape error: it is counted as failed
//! and never retried.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{fields, Record};

/// Limits applied to question records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeRules {
    pub min_options: usize,
    pub max_options: usize,
}

impl Default for ShapeRules {
    fn default() -> Self {
        Self {
            min_options: 2,
            max_options: 6,
        }
    }
}

/// A structural problem found on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ShapeIssue {
    MissingTitle,
    MissingQuestionText,
    MissingOptions,
    OptionCount { found: usize, min: usize, max: usize },
    BlankOption { index: usize },
    MissingCorrectAnswer,
    AnswerOutOfRange { index: i64, options: usize },
}

impl ShapeIssue {
    /// How bad the issue is for integrity reporting.
    pub fn severity(&self) -> Severity {
        match self {
            ShapeIssue::BlankOption { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for ShapeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeIssue::MissingTitle => write!(f, "missing title"),
            ShapeIssue::MissingQuestionText => write!(f, "missing question text"),
            ShapeIssue::MissingOptions => write!(f, "missing options"),
            ShapeIssue::OptionCount { found, min, max } => write!(
                f,
                "expected {}..={} options, found {}",
                min, max, found
            ),
            ShapeIssue::BlankOption { index } => write!(f, "option {} is blank", index),
            ShapeIssue::MissingCorrectAnswer => write!(f, "missing correct answer index"),
            ShapeIssue::AnswerOutOfRange { index, options } => write!(
                f,
                "correct answer index {} out of range for {} options",
                index, options
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// Check a collection (course) record. Only the title is required.
pub fn validate_collection(record: &Record) -> Result<(), ShapeIssue> {
    if record.text(fields::TITLE).is_none() {
        return Err(ShapeIssue::MissingTitle);
    }
    Ok(())
}

/// Check a question record: text, option cardinality, answer index.
pub fn validate_question(record: &Record, rules: &ShapeRules) -> Result<(), ShapeIssue> {
    let issues = question_issues(record, rules);
    match issues.into_iter().find(|i| i.severity() == Severity::Error) {
        Some(issue) => Err(issue),
        None => Ok(()),
    }
}

/// Every issue on a question record, errors and warnings alike.
pub fn question_issues(record: &Record, rules: &ShapeRules) -> Vec<ShapeIssue> {
    let mut issues = Vec::new();

    if record.text(fields::QUESTION).is_none() {
        issues.push(ShapeIssue::MissingQuestionText);
    }

    let options = match record.text_list(fields::OPTIONS) {
        Some(options) => options,
        None => {
            issues.push(ShapeIssue::MissingOptions);
            return issues;
        }
    };

    if options.len() < rules.min_options || options.len() > rules.max_options {
        issues.push(ShapeIssue::OptionCount {
            found: options.len(),
            min: rules.min_options,
            max: rules.max_options,
        });
    }

    for (index, option) in options.iter().enumerate() {
        if option.trim().is_empty() {
            issues.push(ShapeIssue::BlankOption { index });
        }
    }

    match record.integer(fields::CORRECT_ANSWER) {
        None => issues.push(ShapeIssue::MissingCorrectAnswer),
        Some(index) if index < 0 || index as usize >= options.len() => {
            issues.push(ShapeIssue::AnswerOutOfRange {
                index,
                options: options.len(),
            })
        }
        Some(_) => {}
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldMap, FieldValue, RecordRef};

    fn question(text: &str, options: &[&str], answer: Option<i64>) -> Record {
        let mut f = FieldMap::new();
        f.insert(fields::QUESTION.into(), FieldValue::Text(text.into()));
        f.insert(
            fields::OPTIONS.into(),
            FieldValue::TextList(options.iter().map(|s| s.to_string()).collect()),
        );
        if let Some(a) = answer {
            f.insert(fields::CORRECT_ANSWER.into(), FieldValue::Integer(a));
        }
        Record::new(RecordRef::child("c", "q"), f)
    }

    #[test]
    fn valid_question_passes() {
        let r = question("What is 2+2?", &["3", "4", "5", "6"], Some(1));
        assert_eq!(validate_question(&r, &ShapeRules::default()), Ok(()));
    }

    #[test]
    fn missing_text_is_reported_first() {
        let r = question("", &["a", "b"], Some(0));
        assert_eq!(
            validate_question(&r, &ShapeRules::default()),
            Err(ShapeIssue::MissingQuestionText)
        );
    }

    #[test]
    fn wrong_cardinality() {
        let r = question("Pick one", &["only"], Some(0));
        assert_eq!(
            validate_question(&r, &ShapeRules::default()),
            Err(ShapeIssue::OptionCount {
                found: 1,
                min: 2,
                max: 6
            })
        );
    }

    #[test]
    fn answer_out_of_range() {
        let r = question("Pick one", &["a", "b", "c"], Some(3));
        assert_eq!(
            validate_question(&r, &ShapeRules::default()),
            Err(ShapeIssue::AnswerOutOfRange {
                index: 3,
                options: 3
            })
        );
        let r = question("Pick one", &["a", "b", "c"], Some(-1));
        assert!(validate_question(&r, &ShapeRules::default()).is_err());
    }

    #[test]
    fn blank_option_is_only_a_warning() {
        let r = question("Pick one", &["a", " ", "c"], Some(0));
        assert_eq!(validate_question(&r, &ShapeRules::default()), Ok(()));
        assert_eq!(
            question_issues(&r, &ShapeRules::default()),
            vec![ShapeIssue::BlankOption { index: 1 }]
        );
    }

    #[test]
    fn collection_needs_title() {
        let r = Record::new(RecordRef::collection("c"), FieldMap::new());
        assert_eq!(validate_collection(&r), Err(ShapeIssue::MissingTitle));
    }
}
