//! The pipeline facade: one object owning the store, the enrichment
//! service, the outbound rate limiter and the cancellation token, and
//! exposing every user-facing operation.
//!
//! | Operation | Returns |
//! |-----------|---------|
//! | [`run_enhancement`](Pipeline::run_enhancement) | [`MigrationResult`] |
//! | [`run_migration`](Pipeline::run_migration) | [`MigrationResult`] |
//! | [`run_health_check`](Pipeline::run_health_check) | [`HealthVerdict`] |
//! | [`estimate_scope`](Pipeline::estimate_scope) | [`ScopeEstimate`] |
//! | [`create_backup`](Pipeline::create_backup) | [`BackupSnapshot`] |
//! | [`list_backups`](Pipeline::list_backups) | [`BackupSummary`] list |
//! | [`restore_backup`](Pipeline::restore_backup) | [`RestoreSummary`] |
//! | [`data_integrity_check`](Pipeline::data_integrity_check) | [`IntegrityReport`] |
//! | [`list_plans`](Pipeline::list_plans) | [`MigrationPlan`] list |
//! | [`cancel`](Pipeline::cancel) | stops in-flight runs |

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use course_harness_core::models::{BackupSnapshot, BackupSummary};
use course_harness_core::rate_limit::RateLimiter;
use course_harness_core::store::Store;

use crate::backup::{BackupManager, RestoreSummary};
use crate::config::Config;
use crate::db;
use crate::engine::{Engine, MigrationResult};
use crate::enrichment::{create_service, EnrichmentService};
use crate::error::PipelineError;
use crate::health::{HealthChecker, HealthVerdict, IntegrityReport};
use crate::migrate;
use crate::operations::EnhanceQuestions;
use crate::planner::{MigrationPlan, MigrationPlanner, ScopeEstimate};
use crate::progress::ProgressReporter;
use crate::sqlite_store::SqliteStore;

pub struct Pipeline {
    config: Config,
    store: Arc<dyn Store>,
    service: Arc<dyn EnrichmentService>,
    limiter: Arc<RateLimiter>,
    cancel: Mutex<CancellationToken>,
    backups: BackupManager,
    planner: MigrationPlanner,
    health: HealthChecker,
}

impl Pipeline {
    pub fn new(config: Config, store: Arc<dyn Store>, service: Arc<dyn EnrichmentService>) -> Self {
        let backups = BackupManager::new(
            store.clone(),
            config.batch.capacity,
            config.batch.safety_margin,
        );
        let planner = MigrationPlanner::new(store.clone(), config.validation);
        let health = HealthChecker::new(
            store.clone(),
            service.clone(),
            config.validation,
            config.enrichment.call_timeout(),
        );
        Self {
            config,
            store,
            service,
            limiter: Arc::new(RateLimiter::new()),
            cancel: Mutex::new(CancellationToken::new()),
            backups,
            planner,
            health,
        }
    }

    /// Open the SQLite store named in `config` (creating the schema if
    /// needed) and the configured enrichment service.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let service = create_service(&config.enrichment)?;
        Ok(Self::new(config, store, service))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Engine bound to the current cancellation token. Runs started after
    /// a [`cancel`](Pipeline::cancel) get a fresh token.
    fn engine(&self) -> Engine {
        Engine::from_config(self.store.clone(), self.limiter.clone(), &self.config)
            .with_cancellation(self.current_token())
    }

    /// Enrich every question, or only those of collection `scope`.
    pub async fn run_enhancement(
        &self,
        scope: Option<&str>,
        reporter: &dyn ProgressReporter,
    ) -> Result<MigrationResult, PipelineError> {
        let op = EnhanceQuestions::new(
            self.service.clone(),
            self.config.enrichment.operation.clone(),
            self.config.enrichment.version,
            self.config.validation,
        );
        self.engine().run(&op, scope, reporter).await
    }

    pub async fn run_migration(
        &self,
        plan: &str,
        backup_first: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<MigrationResult, PipelineError> {
        self.planner
            .run(&self.engine(), &self.backups, plan, backup_first, reporter)
            .await
    }

    pub async fn run_health_check(&self) -> HealthVerdict {
        self.health.check().await
    }

    pub async fn data_integrity_check(&self) -> Result<IntegrityReport> {
        self.health.data_integrity_check().await
    }

    pub async fn estimate_scope(&self) -> Result<ScopeEstimate> {
        self.planner.estimate_scope().await
    }

    pub async fn list_plans(&self) -> Result<Vec<MigrationPlan>> {
        self.planner.list_plans().await
    }

    pub async fn create_backup(&self, label: &str, scope: Option<&str>) -> Result<BackupSnapshot> {
        self.backups.create_backup(label, scope).await
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        self.backups.list_backups().await
    }

    pub async fn restore_backup(
        &self,
        id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<RestoreSummary, PipelineError> {
        self.backups.restore_backup(id, reporter).await
    }

    pub async fn export_backup(&self, id: &str, output: Option<&Path>) -> Result<usize> {
        self.backups.export_backup(id, output).await
    }

    /// Cancel every in-flight run. Each stops before its next record and
    /// still flushes what it has staged.
    pub fn cancel(&self) {
        let mut guard = match self.cancel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.cancel();
        *guard = CancellationToken::new();
        tracing::warn!("pipeline runs cancelled");
    }
}
