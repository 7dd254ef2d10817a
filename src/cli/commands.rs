//! CLI command implementations.
//!
//! Each command wires the engine services (storage, embedder, LLM provider,
//! dense index, cache) together, runs, and returns its printable output.
//! Configuration and credentials come from the environment; a missing API
//! key is fatal only for commands that can reach the LLM.

use crate::apply::{ApplyMode, apply_classification_results};
use crate::cli::parser::{Cli, Commands};
use crate::config::EngineConfig;
use crate::core::ClassificationJob;
use crate::embedding::{Embedder, create_embedder, prepare_input};
use crate::error::Result;
use crate::job::BatchProcessor;
use crate::llm::GeminiProvider;
use crate::pipeline::ClassificationPipeline;
use crate::search::EmbeddingIndex;
use crate::storage::{SqliteStorage, Storage};
use std::time::Duration;

/// Executes the parsed command and returns its output.
///
/// # Errors
///
/// Returns an error when the command fails; `main` formats it.
pub fn execute(cli: &Cli) -> Result<String> {
    let db_path = cli.get_db_path();
    let config = EngineConfig::from_env()?;

    match &cli.command {
        Commands::Init => {
            let mut storage = SqliteStorage::open(&db_path)?;
            storage.init()?;
            Ok(format!("initialized {}\n", db_path.display()))
        }

        Commands::Status => {
            let storage = open_initialized(&db_path)?;
            let stats = storage.stats()?;
            Ok(format!("{}\n", serde_json::to_string_pretty(&stats)?))
        }

        Commands::EmbedPassages => {
            let mut storage = open_initialized(&db_path)?;
            let count = embed_passages(&mut storage, &config)?;
            Ok(format!(
                "embedded {count} chunks with {}\n",
                config.retrieval.embedding_model_name
            ))
        }

        Commands::Classify { question_id, scope } => {
            let storage = open_initialized(&db_path)?;
            let question = storage.get_question(*question_id)?.ok_or(
                crate::error::StorageError::QuestionNotFound { id: *question_id },
            )?;

            let embedder = try_embedder(&config);
            let llm = GeminiProvider::from_env()?;
            let index = EmbeddingIndex::new();
            let cache = crate::cache::ResultCache::new(config.cache_path.clone());
            let pipeline = ClassificationPipeline::new(
                embedder.as_deref(),
                &llm,
                &index,
                &config,
                Some(&cache),
            );

            let decision =
                pipeline.classify_question(&storage, &question, &scope.to_request_meta())?;
            if let Err(error) = cache.save() {
                tracing::warn!(%error, "result cache save failed");
            }
            Ok(format!("{}\n", serde_json::to_string_pretty(&decision)?))
        }

        Commands::Batch {
            question_ids,
            scope,
            wait,
        } => {
            let llm = GeminiProvider::from_env()?;
            let processor = BatchProcessor::new(
                db_path.clone(),
                config.clone(),
                try_embedder(&config),
                Box::new(llm),
            );
            let job_id =
                processor.start_classification_job(question_ids, scope.to_request_meta())?;
            if !*wait {
                return Ok(format!("job {job_id} queued\n"));
            }

            let storage = SqliteStorage::open(&db_path)?;
            let job = loop {
                let job = storage
                    .get_job(job_id)?
                    .ok_or(crate::error::StorageError::JobNotFound { id: job_id })?;
                if job.is_complete() {
                    break job;
                }
                std::thread::sleep(Duration::from_millis(500));
            };
            Ok(format_job(&job))
        }

        Commands::JobStatus { job_id } => {
            let storage = open_initialized(&db_path)?;
            let job = storage
                .get_job(*job_id)?
                .ok_or(crate::error::StorageError::JobNotFound { id: *job_id })?;
            Ok(format_job(&job))
        }

        Commands::Jobs { limit } => {
            let storage = open_initialized(&db_path)?;
            let jobs = storage.recent_jobs(*limit)?;
            let mut output = String::new();
            for job in &jobs {
                output.push_str(&format_job_line(job));
            }
            if output.is_empty() {
                output.push_str("no jobs\n");
            }
            Ok(output)
        }

        Commands::Apply {
            job_id,
            question_ids,
            mode,
        } => {
            let mode: ApplyMode = mode.parse()?;
            let mut storage = open_initialized(&db_path)?;
            let applied =
                apply_classification_results(&mut storage, question_ids, *job_id, mode)?;
            Ok(format!("applied {applied} of {}\n", question_ids.len()))
        }

        Commands::HydeInvalidate {
            question_id,
            prompt_version,
        } => {
            let storage = open_initialized(&db_path)?;
            let version = prompt_version
                .as_deref()
                .unwrap_or(&config.hyde.prompt_version);
            storage.delete_question_query(*question_id, version)?;
            Ok(format!(
                "invalidated HyDE artifact for question {question_id} ({version})\n"
            ))
        }
    }
}

fn open_initialized(db_path: &std::path::Path) -> Result<SqliteStorage> {
    let storage = SqliteStorage::open(db_path)?;
    if !storage.is_initialized()? {
        return Err(crate::error::StorageError::NotInitialized.into());
    }
    Ok(storage)
}

/// Builds the in-process embedder when the configured model is hosted.
fn try_embedder(config: &EngineConfig) -> Option<Box<dyn Embedder>> {
    match create_embedder(
        &config.retrieval.embedding_model_name,
        config.retrieval.embedding_dim,
    ) {
        Ok(embedder) => Some(embedder),
        Err(error) => {
            tracing::warn!(%error, "dense retrieval will degrade to BM25-only");
            None
        }
    }
}

/// Encodes every chunk and upserts its passage vector.
fn embed_passages(storage: &mut SqliteStorage, config: &EngineConfig) -> Result<usize> {
    let embedder = create_embedder(
        &config.retrieval.embedding_model_name,
        config.retrieval.embedding_dim,
    )?;
    let model = &config.retrieval.embedding_model_name;
    let chunks = storage.list_chunks()?;
    let prepared: Vec<String> = chunks
        .iter()
        .map(|chunk| prepare_input(model, &chunk.content, false))
        .collect();
    let texts: Vec<&str> = prepared.iter().map(String::as_str).collect();
    let vectors = embedder.embed_batch(&texts)?;

    let mut count = 0;
    for (chunk, vector) in chunks.iter().zip(vectors) {
        let Some(chunk_id) = chunk.id else { continue };
        storage.upsert_embedding(chunk_id, chunk.lecture_id, model, &vector)?;
        count += 1;
    }
    Ok(count)
}

fn format_job(job: &ClassificationJob) -> String {
    format!(
        "job {} [{}] {}/{} processed ({} ok, {} failed, {}%){}\n",
        job.id,
        job.status.as_str(),
        job.processed_count,
        job.total_count,
        job.success_count,
        job.failed_count,
        job.progress_percent(),
        job.error_message
            .as_deref()
            .map(|message| format!(" error: {message}"))
            .unwrap_or_default(),
    )
}

fn format_job_line(job: &ClassificationJob) -> String {
    let created = chrono::DateTime::from_timestamp(job.created_at, 0)
        .map(|dt| dt.format("%m/%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{}  {}  {}  {}/{}\n",
        job.id,
        created,
        job.status.as_str(),
        job.processed_count,
        job.total_count,
    )
}
