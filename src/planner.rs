//! Migration plans: catalogue, scope estimation, and execution.
//!
//! Each built-in plan fills one missing classification field using the
//! keyword table, walking either the collections or their child records.
//! Running a plan optionally takes a backup first and then hands an
//! [`InferField`] operation to the [`Engine`].
//!
//! Backup failure policy: a plan that `requires_backup` aborts with a
//! `Failed` result when the backup cannot be taken; other plans log a
//! warning and carry on.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use course_harness_core::models::{fields, TargetLevel};
use course_harness_core::store::Store;
use course_harness_core::validate::ShapeRules;

use crate::backup::BackupManager;
use crate::engine::{Engine, MigrationResult, RecordOperation};
use crate::error::PipelineError;
use crate::operations::InferField;
use crate::progress::ProgressReporter;

/// Static description of a built-in plan.
struct PlanDef {
    name: &'static str,
    description: &'static str,
    target: TargetLevel,
    field: &'static str,
    sources: &'static [&'static str],
    version: i64,
    requires_backup: bool,
    risks: &'static [&'static str],
}

const PLANS: &[PlanDef] = &[
    PlanDef {
        name: "course-category",
        description: "Infer a category for courses that have none, from title and description",
        target: TargetLevel::Collections,
        field: fields::CATEGORY,
        sources: &[fields::TITLE, fields::DESCRIPTION],
        version: 1,
        requires_backup: true,
        risks: &[
            "Rewrites top-level course records",
            "Keyword inference may pick a broader category than a human would",
        ],
    },
    PlanDef {
        name: "question-topic",
        description: "Infer a topic for questions that have none, from question text and options",
        target: TargetLevel::Records,
        field: fields::TOPIC,
        sources: &[fields::QUESTION, fields::OPTIONS],
        version: 1,
        requires_backup: false,
        risks: &["Questions failing shape validation are reported and left untouched"],
    },
];

#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub name: String,
    pub description: String,
    pub target: TargetLevel,
    pub version: i64,
    pub estimated_item_count: u64,
    pub requires_backup: bool,
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionCount {
    pub id: String,
    pub records: u64,
}

/// Size of the data set and how much of it each plan would touch.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeEstimate {
    pub collections: Vec<CollectionCount>,
    pub total_collections: u64,
    pub total_records: u64,
    /// Plan name → items not yet migrated.
    pub needing_migration: BTreeMap<String, u64>,
}

pub struct MigrationPlanner {
    store: Arc<dyn Store>,
    rules: ShapeRules,
}

impl MigrationPlanner {
    pub fn new(store: Arc<dyn Store>, rules: ShapeRules) -> Self {
        Self { store, rules }
    }

    fn operation_for(&self, def: &PlanDef) -> InferField {
        InferField::new(
            def.name,
            def.version,
            def.target,
            def.field,
            def.sources.to_vec(),
            self.rules,
        )
    }

    /// The engine operation behind plan `name`, if it exists.
    pub fn operation(&self, name: &str) -> Option<InferField> {
        find_plan(name).map(|def| self.operation_for(def))
    }

    /// Every built-in plan with a live item estimate.
    pub async fn list_plans(&self) -> Result<Vec<MigrationPlan>> {
        let scope = self.estimate_scope().await?;
        Ok(PLANS
            .iter()
            .map(|def| MigrationPlan {
                name: def.name.to_string(),
                description: def.description.to_string(),
                target: def.target,
                version: def.version,
                estimated_item_count: scope.needing_migration.get(def.name).copied().unwrap_or(0),
                requires_backup: def.requires_backup,
                risks: def.risks.iter().map(|r| r.to_string()).collect(),
            })
            .collect())
    }

    /// Read-only walk counting collections, records, and pending work per plan.
    pub async fn estimate_scope(&self) -> Result<ScopeEstimate> {
        let ops: Vec<(TargetLevel, InferField)> = PLANS
            .iter()
            .map(|def| (def.target, self.operation_for(def)))
            .collect();
        let mut needing: BTreeMap<String, u64> =
            PLANS.iter().map(|def| (def.name.to_string(), 0)).collect();

        let collections = self.store.list_collections().await?;
        let mut counts = Vec::with_capacity(collections.len());
        let mut total_records = 0u64;

        for collection in &collections {
            let as_record = collection.to_record();
            for (target, op) in &ops {
                if *target == TargetLevel::Collections && !op.is_applied(&as_record) {
                    *needing.entry(op.name().to_string()).or_default() += 1;
                }
            }

            let refs = self.store.list_records(&collection.id).await?;
            for reference in &refs {
                let Some(record) = self.store.get_record(reference).await? else {
                    continue;
                };
                for (target, op) in &ops {
                    if *target == TargetLevel::Records && !op.is_applied(&record) {
                        *needing.entry(op.name().to_string()).or_default() += 1;
                    }
                }
            }

            total_records += refs.len() as u64;
            counts.push(CollectionCount {
                id: collection.id.clone(),
                records: refs.len() as u64,
            });
        }

        Ok(ScopeEstimate {
            total_collections: counts.len() as u64,
            total_records,
            collections: counts,
            needing_migration: needing,
        })
    }

    /// Run plan `name` on `engine`, taking a backup first when asked.
    pub async fn run(
        &self,
        engine: &Engine,
        backups: &BackupManager,
        name: &str,
        backup_first: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<MigrationResult, PipelineError> {
        let def = find_plan(name)
            .ok_or_else(|| PipelineError::Setup(format!("unknown migration plan: {}", name)))?;

        let mut backup_id = None;
        if backup_first {
            let label = format!("pre-{}-{}", def.name, Utc::now().format("%Y%m%dT%H%M%SZ"));
            match backups.create_backup(&label, None).await {
                Ok(snapshot) => backup_id = Some(snapshot.id),
                Err(e) if def.requires_backup => {
                    let err = PipelineError::Backup(e);
                    tracing::error!(plan = def.name, error = %err, "backup failed, migration aborted");
                    return Ok(MigrationResult::aborted(def.name, &err));
                }
                Err(e) => {
                    tracing::warn!(plan = def.name, error = %e, "backup failed, continuing without one");
                }
            }
        } else if def.requires_backup {
            tracing::warn!(plan = def.name, "running without the backup this plan asks for");
        }

        let op = self.operation_for(def);
        let mut result = engine.run(&op, None, reporter).await?;
        result.backup_id = backup_id;
        Ok(result)
    }
}

fn find_plan(name: &str) -> Option<&'static PlanDef> {
    PLANS.iter().find(|def| def.name == name)
}

/// Names of the built-in plans.
pub fn plan_names() -> Vec<&'static str> {
    PLANS.iter().map(|def| def.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use course_harness_core::models::{FieldMap, FieldValue};
    use course_harness_core::store::memory::InMemoryStore;

    fn seeded() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        let mut rust = FieldMap::new();
        rust.insert(fields::TITLE.into(), "Rust programming".into());
        store.insert_collection("rust", rust).unwrap();

        let mut art = FieldMap::new();
        art.insert(fields::TITLE.into(), "Painting".into());
        art.insert(fields::CATEGORY.into(), "arts".into());
        store.insert_collection("art", art).unwrap();

        let mut q = FieldMap::new();
        q.insert(fields::QUESTION.into(), "Which keyword declares a variable?".into());
        q.insert(
            fields::OPTIONS.into(),
            FieldValue::TextList(vec!["let".into(), "var".into()]),
        );
        q.insert(fields::CORRECT_ANSWER.into(), FieldValue::Integer(0));
        store.insert_record("rust", "q1", q.clone()).unwrap();
        q.insert(fields::TOPIC.into(), "programming".into());
        store.insert_record("rust", "q2", q).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn estimate_counts_pending_work_per_plan() {
        let planner = MigrationPlanner::new(seeded(), ShapeRules::default());
        let scope = planner.estimate_scope().await.unwrap();
        assert_eq!(scope.total_collections, 2);
        assert_eq!(scope.total_records, 2);
        assert_eq!(scope.needing_migration["course-category"], 1);
        assert_eq!(scope.needing_migration["question-topic"], 1);
    }

    #[tokio::test]
    async fn plans_carry_live_estimates() {
        let planner = MigrationPlanner::new(seeded(), ShapeRules::default());
        let plans = planner.list_plans().await.unwrap();
        assert_eq!(plans.len(), 2);
        let category = plans.iter().find(|p| p.name == "course-category").unwrap();
        assert!(category.requires_backup);
        assert_eq!(category.estimated_item_count, 1);
    }

    #[test]
    fn unknown_plan_has_no_operation() {
        let planner = MigrationPlanner::new(Arc::new(InMemoryStore::new()), ShapeRules::default());
        assert!(planner.operation("drop-everything").is_none());
        assert_eq!(plan_names(), vec!["course-category", "question-topic"]);
    }
}
