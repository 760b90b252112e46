//! Pipeline integration tests: stage routing, requeues, job control

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{
    build_container, memory_repositories, nomenclature, registration, seed, test_config,
    ScriptedProvider,
};
use nsi_ai::gateway::ProviderRegistration;
use nsi_ai::models::{
    JobStatus, NewBenchmark, PipelineStage, QualityLevel, RawItem, RecordCategory, ReferenceEntry,
    ReferenceTable, ResolutionMethod, SourceSelector,
};
use nsi_ai::pipeline::PipelineError;
use nsi_common::events::NsiEvent;

fn reference(table: ReferenceTable, code: &str, name: &str) -> ReferenceEntry {
    ReferenceEntry {
        table,
        code: code.to_string(),
        name: name.to_string(),
        parent_code: None,
    }
}

#[tokio::test]
async fn test_exact_code_resolves_at_reference_stage_without_ai() {
    let provider = Arc::new(ScriptedProvider::new("Alpha"));
    let container = build_container(
        test_config(),
        memory_repositories().await,
        vec![registration(provider.clone(), 1)],
    )
    .await;
    container
        .repositories
        .references
        .upsert_reference_entries(&[reference(
            ReferenceTable::Okpd2,
            "25.94.11.110",
            "Болты из черных металлов",
        )])
        .await
        .unwrap();
    let ids = seed(&container, &[nomenclature("Болт оцинк. М10 (склад 3)", Some(" 25.94.11.110 "))]).await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.job.status, JobStatus::Completed);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.record_id, ids[0]);
    assert_eq!(result.method, ResolutionMethod::Reference);
    assert_eq!(result.stage_reached, PipelineStage::ReferenceLookup);
    assert_eq!(result.confidence, Some(1.0));
    assert_eq!(result.reference_table, Some(ReferenceTable::Okpd2));
    assert_eq!(result.quality_level, QualityLevel::Basic);
    assert!(!result.manual_review);
    assert_eq!(provider.call_count(), 0);

    container.shutdown().await;
}

#[tokio::test]
async fn test_mixed_job_routes_each_record_to_its_stage() {
    let provider = Arc::new(
        ScriptedProvider::new("Alpha").answer("кабель", "27.32.13", "Кабели силовые", 0.92),
    );
    let container = build_container(
        test_config(),
        memory_repositories().await,
        vec![registration(provider.clone(), 1)],
    )
    .await;
    let mut events = container.event_bus.subscribe();

    container
        .repositories
        .references
        .upsert_reference_entries(&[reference(ReferenceTable::Tnved, "7318155900", "Болты прочие")])
        .await
        .unwrap();
    container
        .repositories
        .benchmarks
        .upsert_benchmarks(&[NewBenchmark {
            category: RecordCategory::Nomenclature,
            name: "Перчатки нитриловые неопудренные".to_string(),
            code: "22.19.60.119".to_string(),
            label: "Перчатки резиновые".to_string(),
            approved: true,
        }])
        .await
        .unwrap();

    seed(
        &container,
        &[
            nomenclature("Болт М12", Some("7318155900")),
            nomenclature("перчатки  нитриловые НЕОПУДРЕННЫЕ", None),
            nomenclature("Кабель ВВГнг-LS 3х2.5", None),
            nomenclature("Сломанная\u{0007}строка", None),
        ],
    )
    .await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    let job = outcome.job;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_count, 4);
    assert_eq!(job.total_count, 4);
    assert_eq!(job.failed_count, 1);
    assert_eq!(job.manual_review_count, 0);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    let methods: Vec<ResolutionMethod> = results.iter().map(|r| r.method).collect();
    assert_eq!(
        methods,
        vec![
            ResolutionMethod::Reference,
            ResolutionMethod::Benchmark,
            ResolutionMethod::Ai,
            ResolutionMethod::None,
        ]
    );
    assert_eq!(results[1].quality_level, QualityLevel::Benchmark);
    assert_eq!(results[1].category_code.as_deref(), Some("22.19.60.119"));
    assert_eq!(results[2].quality_level, QualityLevel::AiEnhanced);
    assert_eq!(results[2].category_code.as_deref(), Some("27.32.13"));
    assert_eq!(results[2].provider_used.as_deref(), Some("Alpha"));
    assert!(results[3].is_input_error());
    assert!(results[3].manual_review);
    assert!(results[3].confidence.is_none());

    // Only the cable needed a provider call
    assert_eq!(provider.seen_names(), vec!["Кабель ВВГнг-LS 3х2.5"]);

    let stages = container.pipeline.stage_summaries(job_id).await.unwrap();
    assert_eq!(stages.len(), 6);
    assert_eq!(stages[0].total, 4);
    assert_eq!(stages[0].errors, 1);
    assert_eq!(stages[3].total, 1);
    assert_eq!(stages[5].completed, 4);

    let mut saw_started = false;
    let mut saw_completed = false;
    let mut flagged = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            NsiEvent::JobStarted { job_id: id, .. } if id == job_id => saw_started = true,
            NsiEvent::JobCompleted { job_id: id, processed_count, .. } if id == job_id => {
                assert_eq!(processed_count, 4);
                saw_completed = true;
            }
            NsiEvent::RecordFlaggedForReview { .. } => flagged += 1,
            _ => {}
        }
    }
    assert!(saw_started && saw_completed);
    assert_eq!(flagged, 1);

    container.shutdown().await;
}

#[tokio::test]
async fn test_rate_limited_records_are_requeued_then_sent_to_review() {
    let provider = Arc::new(ScriptedProvider::new("Throttled"));
    let mut config = test_config();
    config.pipeline.workers = 1;
    config.pipeline.max_requeues = 2;
    config.gateway.rate_limit_wait_ms = 20;
    // One request per gateway call, so each record needs its own token
    config.batch.max_batch_size = 1;

    let container = build_container(
        config,
        memory_repositories().await,
        vec![ProviderRegistration {
            provider: provider.clone(),
            priority: 1,
            requests_per_minute: 1,
            burst: 1,
        }],
    )
    .await;
    seed(
        &container,
        &[
            nomenclature("Гайка М8", None),
            nomenclature("Шайба 8", None),
            nomenclature("Шпилька М8", None),
        ],
    )
    .await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert_eq!(outcome.job.status, JobStatus::Completed);
    assert_eq!(outcome.job.processed_count, 3);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].method, ResolutionMethod::Ai);
    for throttled in &results[1..] {
        assert_eq!(throttled.method, ResolutionMethod::None);
        assert_eq!(throttled.stage_reached, PipelineStage::AiClassification);
        assert!(throttled.manual_review);
        assert!(throttled.error.as_deref().unwrap().contains("Rate limit"));
    }
    // The single token was spent on the first record
    assert_eq!(provider.call_count(), 1);
    assert_eq!(outcome.job.failed_count, 2);

    container.shutdown().await;
}

#[tokio::test]
async fn test_workers_fill_ai_batches() {
    let provider = Arc::new(ScriptedProvider::new("Batched"));
    let mut config = test_config();
    config.pipeline.workers = 2;
    config.pipeline.checkpoint_batch_size = 20;
    config.batch.max_batch_size = 10;
    config.batch.max_wait_ms = 500;

    let container = build_container(
        config,
        memory_repositories().await,
        vec![registration(provider.clone(), 1)],
    )
    .await;
    let records: Vec<_> = (1..=20)
        .map(|n| nomenclature(&format!("Изделие номер {}", n), None))
        .collect();
    seed(&container, &records).await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert_eq!(outcome.job.status, JobStatus::Completed);
    assert_eq!(outcome.job.processed_count, 20);

    // Two workers each hand a full batch to the processor
    assert_eq!(provider.call_count(), 2);
    assert!(provider.calls().iter().all(|names| names.len() == 10));
    let stats = container.batch_processor.stats();
    assert_eq!(stats.total_batches, 2);
    assert_eq!(stats.total_items, 20);
    assert_eq!(stats.api_calls_saved, 18);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|r| r.method == ResolutionMethod::Ai));

    container.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_providers_fail_job_when_fallback_disabled() {
    let provider = Arc::new(ScriptedProvider::new("Down").failing());
    let mut config = test_config();
    config.pipeline.fallback_to_manual_review = false;
    config.circuit_breaker.failure_threshold = 1;

    let container = build_container(
        config,
        memory_repositories().await,
        vec![registration(provider.clone(), 1)],
    )
    .await;
    seed(&container, &[nomenclature("Труба 57х3.5", None)]).await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert!(matches!(outcome.error, Some(PipelineError::ProviderExhausted(_))));
    assert_eq!(outcome.job.status, JobStatus::Failed);

    let stored = container.repositories.jobs.load_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.error.unwrap().contains("Provider exhausted"));
    let checkpoint = container.checkpoints.status(job_id).await.unwrap().unwrap();
    assert!(!checkpoint.active);

    container.shutdown().await;
}

#[tokio::test]
async fn test_low_ai_confidence_is_flagged_for_review() {
    let provider = Arc::new(ScriptedProvider::new("Unsure").default_confidence(0.6));
    let container = build_container(
        test_config(),
        memory_repositories().await,
        vec![registration(provider, 1)],
    )
    .await;
    seed(&container, &[nomenclature("Изделие неизвестное", None)]).await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    let outcome = container.jobs.wait(job_id).await.unwrap();
    assert_eq!(outcome.job.manual_review_count, 1);
    assert_eq!(outcome.job.failed_count, 0);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    assert_eq!(results[0].method, ResolutionMethod::Ai);
    assert_eq!(results[0].confidence, Some(0.6));
    assert!(results[0].manual_review);

    container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_then_resume_completes_every_record_once() {
    let provider = Arc::new(ScriptedProvider::new("Slow").hang_on("зависание"));
    let mut config = test_config();
    config.pipeline.workers = 1;
    config.pipeline.checkpoint_batch_size = 2;
    config.gateway.call_timeout_ms = 300;

    let container = build_container(
        config,
        memory_repositories().await,
        vec![registration(provider.clone(), 1)],
    )
    .await;
    seed(
        &container,
        &[
            nomenclature("Позиция 1", None),
            nomenclature("Позиция 2", None),
            nomenclature("Позиция 3 зависание", None),
            nomenclature("Позиция 4", None),
            nomenclature("Позиция 5", None),
            nomenclature("Позиция 6", None),
        ],
    )
    .await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), provider.hung.notified())
        .await
        .unwrap();
    container.jobs.cancel_job(job_id).await.unwrap();

    let cancelled = container.jobs.wait(job_id).await.unwrap();
    assert_eq!(cancelled.job.status, JobStatus::Cancelled);
    assert_eq!(cancelled.job.processed_count, 2);
    let checkpoint = container.jobs.checkpoint(job_id).await.unwrap();
    assert!(!checkpoint.active);
    assert_eq!(checkpoint.current_batch_id, 1);

    let status = container.jobs.job_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Cancelled);
    assert!(!status.active);

    container.jobs.resume_job(job_id).await.unwrap();
    let resumed = container.jobs.wait(job_id).await.unwrap();
    assert_eq!(resumed.job.status, JobStatus::Completed);
    assert_eq!(resumed.job.processed_count, 6);

    let results = container.repositories.results.load_job_results(job_id).await.unwrap();
    assert_eq!(results.len(), 6);
    let mut record_ids: Vec<i64> = results.iter().map(|r| r.record_id).collect();
    record_ids.dedup();
    assert_eq!(record_ids.len(), 6);

    // The first checkpointed batch was not sent again
    let seen = provider.seen_names();
    assert_eq!(seen.iter().filter(|n| n.as_str() == "Позиция 1").count(), 1);

    container.shutdown().await;
}

#[tokio::test]
async fn test_completed_job_cannot_be_resumed_or_cancelled() {
    let container = build_container(test_config(), memory_repositories().await, Vec::new()).await;
    seed(&container, &[nomenclature("Что-то", None)]).await;

    let job_id = container.jobs.start_job(SourceSelector::default()).await.unwrap();
    container.jobs.wait(job_id).await.unwrap();

    assert!(matches!(
        container.jobs.resume_job(job_id).await,
        Err(PipelineError::JobNotRunnable { .. })
    ));
    assert!(matches!(
        container.jobs.cancel_job(job_id).await,
        Err(PipelineError::JobNotRunnable { .. })
    ));
    assert!(matches!(
        container.jobs.job_status(uuid::Uuid::new_v4()).await,
        Err(PipelineError::JobNotFound(_))
    ));

    container.shutdown().await;
}

#[tokio::test]
async fn test_classify_item_without_providers_goes_to_review() {
    let container = build_container(test_config(), memory_repositories().await, Vec::new()).await;

    let resolution = container
        .pipeline
        .classify_item(&RawItem {
            name: "Саморез 4.2х19".to_string(),
            code: None,
            category: RecordCategory::Nomenclature,
        })
        .await
        .unwrap();
    assert_eq!(resolution.method, ResolutionMethod::None);
    assert!(resolution.manual_review);
    assert!(resolution.error.unwrap().contains("No AI providers"));

    let err = container
        .pipeline
        .classify_item(&RawItem {
            name: "   ".to_string(),
            code: None,
            category: RecordCategory::Nomenclature,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Input { record_id: None, .. }));

    container.shutdown().await;
}

#[tokio::test]
async fn test_weak_reference_match_falls_back_to_parent_code() {
    let container = build_container(test_config(), memory_repositories().await, Vec::new()).await;
    container
        .repositories
        .references
        .upsert_reference_entries(&[
            reference(ReferenceTable::Okpd2, "27.32", "Кабели прочие"),
            reference(ReferenceTable::Okpd2, "27.32.11", "Провода обмоточные изолированные"),
        ])
        .await
        .unwrap();

    let resolution = container
        .pipeline
        .classify_item(&RawItem {
            name: "Провода обмоточные медные".to_string(),
            code: None,
            category: RecordCategory::Nomenclature,
        })
        .await
        .unwrap();
    assert_eq!(resolution.method, ResolutionMethod::Fallback);
    assert_eq!(resolution.category_code.as_deref(), Some("27.32"));
    assert_eq!(resolution.matched_reference_id.as_deref(), Some("27.32"));
    assert_eq!(resolution.reference_table, Some(ReferenceTable::Okpd2));
    assert!(resolution.confidence.unwrap() <= 0.55);
    assert!(resolution.manual_review);
    assert!(resolution.error.unwrap().contains("27.32.11"));

    container.shutdown().await;
}
