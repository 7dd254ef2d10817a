//! Asynchronous batch classification jobs.
//!
//! A bounded pool of long-lived workers (default two) drains a queue of
//! persisted jobs. Each worker owns its database connections — one for
//! pipeline reads, one for job-row writes — so no connection ever crosses a
//! thread boundary. Progress persists after every question; per-question
//! failures are recorded in the payload and counted, while an unhandled
//! worker error marks the whole job `failed` with its partial results
//! preserved.

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::core::{
    ClassificationDecision, Question, QuestionResult, RequestMeta, ResultPayload,
};
use crate::embedding::Embedder;
use crate::error::{Error, JobError, Result, StorageError};
use crate::llm::LlmProvider;
use crate::pipeline::{ClassificationPipeline, resolve_scope};
use crate::search::{EmbeddingIndex, Retriever};
use crate::storage::{SqliteStorage, Storage};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Default number of worker slots.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// One queued unit of work.
#[derive(Debug, Clone)]
struct JobRequest {
    job_id: i64,
    question_ids: Vec<i64>,
}

/// Services shared by all workers.
struct WorkerShared {
    db_path: PathBuf,
    config: EngineConfig,
    embedder: Option<Box<dyn Embedder>>,
    llm: Box<dyn LlmProvider>,
    index: EmbeddingIndex,
    cache: ResultCache,
}

/// Batch job processor with a bounded worker pool.
///
/// Dropping the processor closes the queue and joins the workers; queued
/// jobs finish first.
pub struct BatchProcessor {
    shared: Arc<WorkerShared>,
    sender: Option<mpsc::Sender<JobRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchProcessor {
    /// Creates a processor with the default worker count.
    #[must_use]
    pub fn new(
        db_path: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Option<Box<dyn Embedder>>,
        llm: Box<dyn LlmProvider>,
    ) -> Self {
        Self::with_workers(db_path, config, embedder, llm, DEFAULT_WORKER_COUNT)
    }

    /// Creates a processor with an explicit worker count.
    #[must_use]
    pub fn with_workers(
        db_path: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Option<Box<dyn Embedder>>,
        llm: Box<dyn LlmProvider>,
        worker_count: usize,
    ) -> Self {
        let cache = ResultCache::new(config.cache_path.clone());
        let shared = Arc::new(WorkerShared {
            db_path: db_path.into(),
            config,
            embedder,
            llm,
            index: EmbeddingIndex::new(),
            cache,
        });

        let (sender, receiver) = mpsc::channel::<JobRequest>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                std::thread::spawn(move || {
                    loop {
                        let request = {
                            let guard = receiver
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            guard.recv()
                        };
                        let Ok(request) = request else {
                            // Queue closed; worker retires.
                            break;
                        };
                        tracing::debug!(worker_id, job_id = request.job_id, "worker picked up job");
                        run_job(&shared, &request);
                    }
                })
            })
            .collect();

        Self {
            shared,
            sender: Some(sender),
            workers,
        }
    }

    /// The shared result cache.
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.shared.cache
    }

    /// Persists a new `pending` job and submits it to the worker pool.
    ///
    /// Unknown question ids are filtered out before the job is created;
    /// order of the survivors is preserved.
    ///
    /// # Errors
    ///
    /// Fails when no given question exists or the pool has shut down.
    pub fn start_classification_job(
        &self,
        question_ids: &[i64],
        request_meta: RequestMeta,
    ) -> Result<i64> {
        let mut storage = SqliteStorage::open(&self.shared.db_path)?;
        let valid_ids = storage.filter_existing_questions(question_ids)?;
        if valid_ids.is_empty() {
            return Err(Error::Job(JobError::InvalidPayload(
                "no valid questions to classify".to_string(),
            )));
        }

        #[allow(clippy::cast_possible_wrap)]
        let total = valid_ids.len() as i64;
        let payload = ResultPayload {
            request_meta,
            results: Vec::new(),
        };
        let job_id = storage.create_job(total, &payload)?;

        let request = JobRequest {
            job_id,
            question_ids: valid_ids,
        };
        let Some(sender) = &self.sender else {
            return Err(Error::Job(JobError::PoolUnavailable));
        };
        if sender.send(request).is_err() {
            return Err(Error::Job(JobError::PoolUnavailable));
        }
        tracing::info!(job_id, total, "classification job queued");
        Ok(job_id)
    }

    /// Processes a job synchronously on the calling thread.
    ///
    /// Same code path the workers run; useful for CLI `--wait` mode and
    /// deterministic tests.
    pub fn run_job_now(&self, job_id: i64, question_ids: &[i64]) {
        run_job(
            &self.shared,
            &JobRequest {
                job_id,
                question_ids: question_ids.to_vec(),
            },
        );
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        // Closing the channel lets blocked workers observe disconnection.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Runs one job, downgrading an unhandled error to a `failed` job row.
fn run_job(shared: &WorkerShared, request: &JobRequest) {
    if let Err(error) = execute_job(shared, request) {
        tracing::error!(job_id = request.job_id, %error, "job worker failed");
        match SqliteStorage::open(&shared.db_path) {
            Ok(mut storage) => {
                // Preserve whatever partial payload the job row already has.
                let payload = storage
                    .get_job(request.job_id)
                    .ok()
                    .flatten()
                    .map(|job| job.payload)
                    .unwrap_or_default();
                if let Err(persist_error) =
                    storage.fail_job(request.job_id, &error.to_string(), &payload)
                {
                    tracing::error!(job_id = request.job_id, %persist_error, "failed to mark job failed");
                }
            }
            Err(open_error) => {
                tracing::error!(job_id = request.job_id, %open_error, "failed to reopen storage");
            }
        }
    }
}

fn execute_job(shared: &WorkerShared, request: &JobRequest) -> Result<()> {
    // Two connections: the read side feeds the pipeline, the write side owns
    // the job row. Neither crosses a thread.
    let read_store = SqliteStorage::open(&shared.db_path)?;
    let mut job_store = SqliteStorage::open(&shared.db_path)?;

    let job = job_store
        .get_job(request.job_id)?
        .ok_or(Error::Storage(StorageError::JobNotFound {
            id: request.job_id,
        }))?;
    job_store.mark_job_processing(request.job_id)?;

    let request_meta = job.payload.request_meta;
    let lecture_ids = resolve_scope(&read_store, &request_meta)?;

    let pipeline = ClassificationPipeline::new(
        shared.embedder.as_deref(),
        shared.llm.as_ref(),
        &shared.index,
        &shared.config,
        Some(&shared.cache),
    );
    let retriever = pipeline.retriever(&read_store)?;

    let mut payload = ResultPayload {
        request_meta,
        results: Vec::new(),
    };
    let (mut processed, mut success, mut failed) = (0i64, 0i64, 0i64);

    for &question_id in &request.question_ids {
        let result = classify_for_job(
            &pipeline,
            &retriever,
            &read_store,
            &shared.config,
            question_id,
            lecture_ids.as_deref(),
        );
        match &result.error {
            None => success += 1,
            Some(error) => {
                tracing::warn!(question_id, %error, "question classification failed");
                failed += 1;
            }
        }
        payload.results.push(result);
        processed += 1;
        job_store.update_job_progress(request.job_id, processed, success, failed, &payload)?;
    }

    job_store.complete_job(request.job_id, &payload)?;
    if let Err(error) = shared.cache.save() {
        tracing::warn!(%error, "result cache save failed");
    }
    tracing::info!(job_id = request.job_id, processed, success, failed, "job completed");
    Ok(())
}

/// Classifies one question and wraps the outcome as a payload entry.
fn classify_for_job(
    pipeline: &ClassificationPipeline<'_>,
    retriever: &Retriever<'_>,
    storage: &dyn Storage,
    config: &EngineConfig,
    question_id: i64,
    lecture_ids: Option<&[i64]>,
) -> QuestionResult {
    let question = match storage.get_question(question_id) {
        Ok(Some(question)) => question,
        Ok(None) => {
            return error_result(
                question_id,
                None,
                &config.judge.model_name,
                "question no longer exists",
            );
        }
        Err(error) => {
            return error_result(
                question_id,
                None,
                &config.judge.model_name,
                &error.to_string(),
            );
        }
    };

    match pipeline.classify_one(retriever, &question, lecture_ids) {
        Ok(decision) => build_result(retriever, &question, decision),
        Err(error) => error_result(
            question_id,
            Some(&question),
            &config.judge.model_name,
            &error.to_string(),
        ),
    }
}

fn build_result(
    retriever: &Retriever<'_>,
    question: &Question,
    decision: ClassificationDecision,
) -> QuestionResult {
    let lecture_info = decision
        .lecture_id
        .and_then(|id| retriever.catalog().get(&id));
    let would_change_lecture = !decision.no_match
        && decision.lecture_id.is_some()
        && decision.lecture_id != question.lecture_id;
    QuestionResult {
        question_id: question.id,
        question_number: question.question_number,
        exam_title: question.exam_title.clone(),
        current_lecture_id: question.lecture_id,
        would_change_lecture,
        lecture_title: lecture_info.map(|info| info.title.clone()),
        block_name: lecture_info.map(|info| info.block_name.clone()),
        error: None,
        decision,
    }
}

fn error_result(
    question_id: i64,
    question: Option<&Question>,
    model_name: &str,
    message: &str,
) -> QuestionResult {
    QuestionResult {
        question_id,
        question_number: question.and_then(|q| q.question_number),
        exam_title: question.and_then(|q| q.exam_title.clone()),
        current_lecture_id: question.and_then(|q| q.lecture_id),
        would_change_lecture: false,
        lecture_title: None,
        block_name: None,
        error: Some(message.to_string()),
        decision: ClassificationDecision::no_match(
            format!("classification failed: {message}"),
            model_name.to_string(),
            Vec::new(),
        ),
    }
}
