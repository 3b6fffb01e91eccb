//! Concrete [`RecordOperation`]s driven by the engine.
//!
//! - [`EnhanceQuestions`]: sends each question to the enrichment service
//!   and stores the derived explanation, difficulty and tags.
//! - [`InferField`]: fills a missing classification field from the
//!   keyword table in [`course_harness_core::inference`]. Used by the
//!   built-in migration plans; never calls out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use course_harness_core::inference::infer_category;
use course_harness_core::models::{fields, Collection, FieldMap, FieldValue, Record, TargetLevel};
use course_harness_core::validate::{validate_collection, validate_question, ShapeIssue, ShapeRules};

use crate::engine::RecordOperation;
use crate::enrichment::{EnrichmentRequest, EnrichmentService};
use crate::error::PipelineError;

/// Question enhancement through the external enrichment service.
///
/// A question counts as done when `enrichedBy` equals the operation name
/// and `enrichmentVersion` is at least the configured version. Bumping the
/// version in config re-enriches everything.
pub struct EnhanceQuestions {
    service: Arc<dyn EnrichmentService>,
    operation: String,
    version: i64,
    rules: ShapeRules,
}

impl EnhanceQuestions {
    pub fn new(
        service: Arc<dyn EnrichmentService>,
        operation: impl Into<String>,
        version: i64,
        rules: ShapeRules,
    ) -> Self {
        Self {
            service,
            operation: operation.into(),
            version,
            rules,
        }
    }
}

#[async_trait]
impl RecordOperation for EnhanceQuestions {
    fn name(&self) -> &str {
        &self.operation
    }

    fn target(&self) -> TargetLevel {
        TargetLevel::Records
    }

    fn is_applied(&self, record: &Record) -> bool {
        record.text(fields::ENRICHED_BY) == Some(self.operation.as_str())
            && record
                .integer(fields::ENRICHMENT_VERSION)
                .map(|v| v >= self.version)
                .unwrap_or(false)
    }

    fn validate(&self, record: &Record) -> Result<(), ShapeIssue> {
        validate_question(record, &self.rules)
    }

    fn uses_external_service(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        record: &Record,
        parent: Option<&Collection>,
    ) -> Result<FieldMap, PipelineError> {
        let course_title = parent
            .and_then(|c| c.fields.get(fields::TITLE))
            .and_then(FieldValue::as_text)
            .map(str::to_string);
        let request = EnrichmentRequest::from_record(record, course_title)?;
        self.service.enrich(&request).await
    }

    fn marker_fields(&self, _record: &Record) -> FieldMap {
        let mut markers = FieldMap::new();
        markers.insert(
            fields::ENRICHED_BY.into(),
            FieldValue::Text(self.operation.clone()),
        );
        markers.insert(
            fields::ENRICHMENT_VERSION.into(),
            FieldValue::Integer(self.version),
        );
        markers.insert(fields::ENRICHED_AT.into(), FieldValue::Timestamp(Utc::now()));
        markers
    }
}

/// Fills `field` from keywords found in `sources` when it is missing.
///
/// Marker fields: `migrationVersion` is raised to the plan version and the
/// plan name is appended to `migratedBy`. A record is already applied when
/// the target field is present or the plan name is in `migratedBy`.
pub struct InferField {
    plan: String,
    version: i64,
    target: TargetLevel,
    field: &'static str,
    sources: Vec<&'static str>,
    rules: ShapeRules,
}

impl InferField {
    pub fn new(
        plan: impl Into<String>,
        version: i64,
        target: TargetLevel,
        field: &'static str,
        sources: Vec<&'static str>,
        rules: ShapeRules,
    ) -> Self {
        Self {
            plan: plan.into(),
            version,
            target,
            field,
            sources,
            rules,
        }
    }

    fn source_text(&self, record: &Record) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for name in &self.sources {
            match record.get(name) {
                Some(FieldValue::Text(s)) => parts.push(s),
                Some(FieldValue::TextList(items)) => parts.extend(items.iter().map(String::as_str)),
                _ => {}
            }
        }
        parts.join(" ")
    }
}

/// True when `plan` is listed in the record's `migratedBy` marker.
pub fn migrated_by(record: &Record, plan: &str) -> bool {
    record
        .text_list(fields::MIGRATED_BY)
        .map(|plans| plans.iter().any(|p| p == plan))
        .unwrap_or(false)
}

#[async_trait]
impl RecordOperation for InferField {
    fn name(&self) -> &str {
        &self.plan
    }

    fn target(&self) -> TargetLevel {
        self.target
    }

    fn is_applied(&self, record: &Record) -> bool {
        record.has(self.field) || migrated_by(record, &self.plan)
    }

    fn validate(&self, record: &Record) -> Result<(), ShapeIssue> {
        match self.target {
            TargetLevel::Collections => validate_collection(record),
            TargetLevel::Records => validate_question(record, &self.rules),
        }
    }

    async fn apply(
        &self,
        record: &Record,
        _parent: Option<&Collection>,
    ) -> Result<FieldMap, PipelineError> {
        let label = infer_category(&self.source_text(record));
        let mut out = FieldMap::new();
        out.insert(self.field.to_string(), FieldValue::Text(label.to_string()));
        Ok(out)
    }

    fn marker_fields(&self, record: &Record) -> FieldMap {
        let version = record
            .integer(fields::MIGRATION_VERSION)
            .map(|v| v.max(self.version))
            .unwrap_or(self.version);
        let mut plans: Vec<String> = record
            .text_list(fields::MIGRATED_BY)
            .map(|p| p.to_vec())
            .unwrap_or_default();
        if !plans.contains(&self.plan) {
            plans.push(self.plan.clone());
        }

        let mut markers = FieldMap::new();
        markers.insert(fields::MIGRATION_VERSION.into(), FieldValue::Integer(version));
        markers.insert(fields::MIGRATED_BY.into(), FieldValue::TextList(plans));
        markers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use course_harness_core::models::RecordRef;

    fn course(title: &str) -> Record {
        let mut f = FieldMap::new();
        f.insert(fields::TITLE.into(), title.into());
        Record::new(RecordRef::collection("c1"), f)
    }

    fn category_op() -> InferField {
        InferField::new(
            "course-category",
            1,
            TargetLevel::Collections,
            fields::CATEGORY,
            vec![fields::TITLE, fields::DESCRIPTION],
            ShapeRules::default(),
        )
    }

    #[tokio::test]
    async fn infers_category_from_title() {
        let op = category_op();
        let out = op.apply(&course("Calculus and Geometry"), None).await.unwrap();
        assert_eq!(out[fields::CATEGORY], FieldValue::Text("mathematics".into()));
    }

    #[test]
    fn present_field_or_marker_means_applied() {
        let op = category_op();
        let mut r = course("Anything");
        assert!(!op.is_applied(&r));

        r.fields
            .insert(fields::MIGRATED_BY.into(), vec!["course-category".to_string()].into());
        assert!(op.is_applied(&r));

        let mut r = course("Anything");
        r.fields.insert(fields::CATEGORY.into(), "arts".into());
        assert!(op.is_applied(&r));
    }

    #[test]
    fn markers_keep_earlier_plans_and_highest_version() {
        let op = category_op();
        let mut r = course("x");
        r.fields
            .insert(fields::MIGRATED_BY.into(), vec!["question-topic".to_string()].into());
        r.fields.insert(fields::MIGRATION_VERSION.into(), 3.into());

        let m = op.marker_fields(&r);
        assert_eq!(m[fields::MIGRATION_VERSION], FieldValue::Integer(3));
        assert_eq!(
            m[fields::MIGRATED_BY],
            FieldValue::TextList(vec!["question-topic".into(), "course-category".into()])
        );
    }

    #[test]
    fn untitled_course_fails_validation() {
        let r = Record::new(RecordRef::collection("c1"), FieldMap::new());
        assert_eq!(category_op().validate(&r), Err(ShapeIssue::MissingTitle));
    }
}
