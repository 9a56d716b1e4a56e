//! Background reindex jobs.
//!
//! A reindex builds a fresh index, streams documents into it in batches and
//! flips the alias only when every batch succeeded, so a failed job never
//! disturbs the live index. One reindex per (project, entity type) runs at a
//! time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};
use uuid::Uuid;

use tessella_config::ConfigResolver;
use tessella_core::{CoreError, GraphStore};

use crate::docs::DocBuilder;
use crate::docstore::{BulkDoc, DocStore};
use crate::error::{Result, SearchError};
use crate::index::IndexManager;
use crate::retry::with_retries;

pub const BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Started,
    Success,
    Error,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobStoreError(pub String);

impl From<JobStoreError> for SearchError {
    fn from(error: JobStoreError) -> Self {
        Self::JobStore(error.0)
    }
}

/// Persists job state transitions.
///
/// Transitions are monotonic: `end_with_success` implies `counter = total`,
/// `end_with_error` leaves the counter where it was.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(
        &self,
        project_id: Uuid,
        entity_type_id: Uuid,
    ) -> std::result::Result<Uuid, JobStoreError>;
    async fn start(&self, job_id: Uuid, total: u64) -> std::result::Result<(), JobStoreError>;
    async fn update_counter(
        &self,
        job_id: Uuid,
        counter: u64,
    ) -> std::result::Result<(), JobStoreError>;
    async fn end_with_success(&self, job_id: Uuid) -> std::result::Result<(), JobStoreError>;
    async fn end_with_error(
        &self,
        job_id: Uuid,
        message: &str,
    ) -> std::result::Result<(), JobStoreError>;
}

/// Runs reindex jobs.
pub struct JobRunner {
    graph: Arc<dyn GraphStore>,
    resolver: Arc<ConfigResolver>,
    jobs: Arc<dyn JobStore>,
    builder: Arc<DocBuilder>,
    index: Arc<IndexManager>,
    store: Arc<dyn DocStore>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl JobRunner {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        resolver: Arc<ConfigResolver>,
        jobs: Arc<dyn JobStore>,
        builder: Arc<DocBuilder>,
        index: Arc<IndexManager>,
        store: Arc<dyn DocStore>,
    ) -> Self {
        Self {
            graph,
            resolver,
            jobs,
            builder,
            index,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds the search index of one entity type. Returns the job id.
    pub async fn reindex(&self, project: &str, entity_type: &str) -> Result<Uuid> {
        let (_keep_open, cancel) = watch::channel(false);
        self.reindex_with_cancel(project, entity_type, cancel).await
    }

    /// Reindex that aborts between batches when `cancel` flips to true. A
    /// cancelled job ends in the error state and the live alias is untouched.
    pub async fn reindex_with_cancel(
        &self,
        project: &str,
        entity_type: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<Uuid> {
        let lock = self.entity_type_lock(project, entity_type).await;
        let _guard = lock.lock().await;

        let project_id = self.resolver.project_id_by_name(project).await?;
        let entity_type_id = self
            .resolver
            .entity_type_id_by_name(project, entity_type)
            .await?;

        let job_id = self.jobs.create(project_id, entity_type_id).await?;
        info!(project, entity_type, %job_id, "reindex created");

        let entity_ids = self
            .graph
            .entity_ids(project_id, entity_type_id)
            .await
            .map_err(CoreError::from)?;
        self.jobs.start(job_id, entity_ids.len() as u64).await?;

        match self
            .run(job_id, project, entity_type, entity_type_id, &entity_ids, &cancel)
            .await
        {
            Ok(()) => {
                self.jobs.end_with_success(job_id).await?;
                info!(project, entity_type, %job_id, total = entity_ids.len(), "reindex done");
                Ok(job_id)
            }
            Err(cause) => {
                error!(project, entity_type, %job_id, %cause, "reindex failed");
                // Job records carry the bare reason, not the error envelope.
                let reason = match &cause {
                    SearchError::Invalid(message) => message.clone(),
                    other => other.to_string(),
                };
                self.jobs.end_with_error(job_id, &reason).await?;
                Err(cause)
            }
        }
    }

    async fn run(
        &self,
        job_id: Uuid,
        project: &str,
        entity_type: &str,
        entity_type_id: Uuid,
        entity_ids: &[i64],
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let config = self
            .resolver
            .entity_type_config(project, entity_type)
            .await?;
        let index_name = self.index.create(&config.es_data).await?;

        let mut processed = 0u64;
        for batch in entity_ids.chunks(BATCH_SIZE) {
            if *cancel.borrow() {
                return Err(SearchError::Invalid("reindex cancelled".to_string()));
            }
            let documents = self.builder.build(project, entity_type, batch).await?;
            let docs: Vec<BulkDoc> = documents
                .into_iter()
                .map(|(id, body)| BulkDoc {
                    id: id.to_string(),
                    body,
                })
                .collect();
            with_retries("bulk_index", || self.store.bulk_index(&index_name, &docs)).await?;
            processed += batch.len() as u64;
            self.jobs.update_counter(job_id, processed).await?;
        }

        self.index.switch(&index_name, entity_type_id).await
    }

    async fn entity_type_lock(&self, project: &str, entity_type: &str) -> Arc<Mutex<()>> {
        let key = (project.to_string(), entity_type.to_string());
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{catalog_project, JobEvent, SearchFixture, StubDocStore, StubJobStore};

    fn runner(fixture: &SearchFixture, store: &StubDocStore, jobs: &StubJobStore) -> JobRunner {
        let builder = Arc::new(DocBuilder::new(
            Arc::clone(&fixture.gateway),
            Arc::clone(&fixture.resolver),
        ));
        let index = Arc::new(IndexManager::new(Arc::new(store.clone()), "tessella"));
        JobRunner::new(
            Arc::new(fixture.graph.clone()),
            Arc::clone(&fixture.resolver),
            Arc::new(jobs.clone()),
            builder,
            index,
            Arc::new(store.clone()),
        )
    }

    fn seed_films(fixture: &SearchFixture, count: i64) {
        for id in 1..=count {
            fixture.graph.insert_entity(
                fixture.film_type_id,
                id,
                fixture.props("film", id, &[("title", json!(format!("Film {id}")))]),
            );
        }
    }

    #[tokio::test]
    async fn reindex_streams_documents_and_flips_the_alias() {
        let fixture = catalog_project();
        seed_films(&fixture, 3);
        let store = StubDocStore::default();
        let jobs = StubJobStore::default();
        let runner = runner(&fixture, &store, &jobs);

        let job_id = runner.reindex("cinecos", "film").await.unwrap();
        assert_eq!(job_id, jobs.job_id());
        assert_eq!(
            jobs.events(),
            vec![
                JobEvent::Created,
                JobEvent::Started { total: 3 },
                JobEvent::Counter(3),
                JobEvent::Success,
            ]
        );

        let indices = store.created_indices();
        assert_eq!(indices.len(), 1);
        let alias = format!("tessella_{}", tessella_config::keys::dtu(&fixture.film_type_id.to_string()));
        assert_eq!(store.members(&alias), indices);

        let batches = store.bulk_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, indices[0]);
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(batches[0].1[0].id, "1");
    }

    #[tokio::test]
    async fn documents_stream_in_batches_of_five_hundred() {
        let fixture = catalog_project();
        seed_films(&fixture, 501);
        let store = StubDocStore::default();
        let jobs = StubJobStore::default();
        let runner = runner(&fixture, &store, &jobs);

        runner.reindex("cinecos", "film").await.unwrap();
        assert_eq!(
            jobs.events(),
            vec![
                JobEvent::Created,
                JobEvent::Started { total: 501 },
                JobEvent::Counter(500),
                JobEvent::Counter(501),
                JobEvent::Success,
            ]
        );
        let batches = store.bulk_batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1.len(), 500);
        assert_eq!(batches[1].1.len(), 1);
    }

    #[tokio::test]
    async fn failed_bulk_leaves_the_live_alias_untouched() {
        let fixture = catalog_project();
        seed_films(&fixture, 2);
        let store = StubDocStore::default();
        let jobs = StubJobStore::default();
        let runner = runner(&fixture, &store, &jobs);

        runner.reindex("cinecos", "film").await.unwrap();
        let alias = format!("tessella_{}", tessella_config::keys::dtu(&fixture.film_type_id.to_string()));
        let live = store.members(&alias);
        assert_eq!(live.len(), 1);

        store.fail_bulk_after(1);
        let err = runner.reindex("cinecos", "film").await;
        assert!(err.is_err());
        assert!(matches!(jobs.events().last(), Some(JobEvent::Error(_))));
        assert_eq!(store.members(&alias), live);

        // Once the store recovers, the next reindex flips the alias cleanly.
        store.fail_bulk_after(usize::MAX);
        runner.reindex("cinecos", "film").await.unwrap();
        let flipped = store.members(&alias);
        assert_eq!(flipped.len(), 1);
        assert_ne!(flipped, live);
    }

    #[tokio::test]
    async fn cancellation_ends_the_job_in_error() {
        let fixture = catalog_project();
        seed_films(&fixture, 1);
        let store = StubDocStore::default();
        let jobs = StubJobStore::default();
        let runner = runner(&fixture, &store, &jobs);

        let (tx, rx) = watch::channel(true);
        let err = runner
            .reindex_with_cancel("cinecos", "film", rx)
            .await
            .unwrap_err();
        drop(tx);
        assert!(matches!(err, SearchError::Invalid(_)));
        assert_eq!(
            jobs.events().last(),
            Some(&JobEvent::Error("reindex cancelled".to_string()))
        );
        assert!(store.bulk_batches().is_empty());

        let alias = format!("tessella_{}", tessella_config::keys::dtu(&fixture.film_type_id.to_string()));
        assert!(store.members(&alias).is_empty());
    }

    #[tokio::test]
    async fn reindexes_of_one_entity_type_run_serially() {
        let fixture = catalog_project();
        seed_films(&fixture, 2);
        let store = StubDocStore::default();
        let jobs = StubJobStore::default();
        let runner = Arc::new(runner(&fixture, &store, &jobs));

        let (first, second) = tokio::join!(
            runner.reindex("cinecos", "film"),
            runner.reindex("cinecos", "film"),
        );
        first.unwrap();
        second.unwrap();

        let run = vec![
            JobEvent::Created,
            JobEvent::Started { total: 2 },
            JobEvent::Counter(2),
            JobEvent::Success,
        ];
        let expected: Vec<JobEvent> = run.iter().cloned().chain(run.iter().cloned()).collect();
        assert_eq!(jobs.events(), expected);
    }
}
