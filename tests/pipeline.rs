//! Job lifecycle tests: upload → process → review → edits → render, with a
//! blank rasterizer and a canned classifier so no pdfium or network is needed.

mod common;

use common::*;
use offer_anonymizer::{
    Action, AnonError, AuditRecord, Block, JobStatus, JobStore, JobWorker, Mode, NormBox,
    Replacement, Storage, WorkerConfig, WorkerEvent,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn reviewed(h: &Harness, mode: Mode) -> uuid::Uuid {
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), mode).await);
    let job = assert_ok!(h.pipeline.process(job.id).await);
    assert_eq!(job.status, JobStatus::Review, "{:?}", job.error_message);
    job.id
}

// ── Upload ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_queues_job_and_stores_bytes() {
    let h = harness(dealer_findings());
    let bytes = dealer_offer();
    let job = assert_ok!(h.pipeline.create_job("../../oferta.pdf", &bytes, Mode::Unify).await);

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, 0);
    assert_eq!(job.filename, "oferta.pdf");
    assert_eq!(job.current_input_path, format!("uploads/{}/oferta.pdf", job.id));
    let stored = h.pipeline.storage().load(&job.current_input_path).await.unwrap();
    assert_eq!(stored, bytes);
    assert_eq!(h.classifier.calls(), 0);
}

#[tokio::test]
async fn upload_rejects_non_pdf_bytes() {
    let h = harness(vec![]);
    let err = assert_err!(
        h.pipeline
            .create_job("offer.pdf", b"PK\x03\x04 zip archive", Mode::Unify)
            .await
    );
    match err {
        AnonError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.pipeline.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_rejects_oversized_file_before_analysis() {
    let h = harness_with(vec![], |b| b.max_file_size_mb(1));
    let mut bytes = b"%PDF-1.5\n".to_vec();
    bytes.resize(2 * 1024 * 1024, b' ');
    let err = assert_err!(h.pipeline.create_job("big.pdf", &bytes, Mode::Unify).await);
    assert!(matches!(err, AnonError::FileTooLarge { limit_mb: 1, .. }));
    assert_eq!(h.classifier.calls(), 0);
}

// ── Processing ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn process_reaches_review_with_monotonic_progress() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;
    let job = h.pipeline.job(id).await.unwrap();

    assert_eq!(job.progress, 100);
    assert_eq!(job.page_count, 3);
    assert_eq!(job.thumbnails.len(), 3);
    assert_eq!(job.thumbnails[0], format!("thumbnails/{id}/page_0.png"));
    assert_eq!(job.findings.len(), 3);
    assert_eq!(job.sections.len(), 1);
    assert_eq!(job.document_type.as_deref(), Some("dealer_offer"));
    assert_eq!(h.classifier.calls(), 3);

    let twin = job.twin.as_ref().expect("unify mode keeps a twin");
    assert_eq!(twin.source_file, "oferta.pdf");
    assert_eq!(twin.vehicle.brand.as_deref(), Some("Toyota"));
    assert!(twin.pricing.discounts_removed);
    assert!((job.confidence - 0.9).abs() < 1e-9);

    let statuses = h.observer.statuses.lock().unwrap().clone();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Analyzing,
            JobStatus::Review
        ]
    );
    let progress = h.observer.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    for checkpoint in [10, 20, 30, 40, 55, 70, 85, 100] {
        assert!(progress.contains(&checkpoint), "missing {checkpoint} in {progress:?}");
    }
}

#[tokio::test]
async fn layout_mode_skips_extraction() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;
    let job = h.pipeline.job(id).await.unwrap();

    assert!(job.twin.is_none());
    assert_eq!(h.classifier.calls(), 2);

    let job = assert_ok!(h.pipeline.render(id).await);
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.output_json_path.is_none());
    assert!(!h
        .pipeline
        .storage()
        .exists(&format!("outputs/{id}/digital_twin.json"))
        .await
        .unwrap());
}

#[tokio::test]
async fn page_cap_limits_classifier_input() {
    let h = harness_with(dealer_findings(), |b| b.max_analysis_pages(2));
    let id = reviewed(&h, Mode::Layout).await;
    let job = h.pipeline.job(id).await.unwrap();

    assert_eq!(job.page_count, 3);
    assert_eq!(job.thumbnails.len(), 3);
    assert!(job.advisories.iter().any(|a| a.contains('2') && a.contains('3')));
    assert!(h
        .pipeline
        .storage()
        .exists(&format!("pages/{id}/page_1.png"))
        .await
        .unwrap());
    assert!(!h
        .pipeline
        .storage()
        .exists(&format!("pages/{id}/page_2.png"))
        .await
        .unwrap());
}

#[tokio::test]
async fn findings_on_missing_pages_are_dropped() {
    let mut findings = dealer_findings();
    findings.push(finding(
        "finding_099",
        "personal",
        9,
        NormBox::new(0.0, 0.0, 5.0, 5.0),
        Action::Remove,
    ));
    let h = harness(findings);
    let id = reviewed(&h, Mode::Layout).await;
    let job = h.pipeline.job(id).await.unwrap();
    assert_eq!(job.findings.len(), 3);
    assert!(job.findings.iter().all(|f| f.id != "finding_099"));
}

#[tokio::test]
async fn unreachable_classifier_fails_job_and_retry_recovers() {
    let h = harness(dealer_findings());
    h.classifier.unreachable.store(true, Ordering::SeqCst);

    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Unify).await);
    let failed = assert_ok!(h.pipeline.process(job.id).await);
    assert_eq!(failed.status, JobStatus::Failed);
    let message = failed.error_message.clone().unwrap();
    assert!(message.contains("connection refused"), "{message}");
    assert_eq!(h.observer.failures.lock().unwrap().len(), 1);
    assert_eq!(h.pipeline.job(job.id).await.unwrap().status, JobStatus::Failed);

    h.classifier.unreachable.store(false, Ordering::SeqCst);
    let queued = assert_ok!(h.pipeline.retry(job.id).await);
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.progress, 0);
    assert!(queued.error_message.is_none());

    let done = assert_ok!(h.pipeline.process(job.id).await);
    assert_eq!(done.status, JobStatus::Review);
    assert_eq!(done.findings.len(), 3);
}

#[tokio::test]
async fn retry_requeues_review_but_not_queued_or_done() {
    let h = harness(dealer_findings());
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Layout).await);
    assert!(matches!(
        h.pipeline.retry(job.id).await,
        Err(AnonError::RetryRejected { status: JobStatus::Queued })
    ));

    assert_ok!(h.pipeline.process(job.id).await);
    let queued = assert_ok!(h.pipeline.retry(job.id).await);
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.progress, 0);

    let reviewed = assert_ok!(h.pipeline.process(job.id).await);
    assert_eq!(reviewed.status, JobStatus::Review);
    let done = assert_ok!(h.pipeline.render(job.id).await);
    assert_eq!(done.status, JobStatus::Done);
    assert!(matches!(
        h.pipeline.retry(job.id).await,
        Err(AnonError::RetryRejected { status: JobStatus::Done })
    ));
    assert_eq!(h.pipeline.job(job.id).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn unknown_job_is_reported() {
    let h = harness(vec![]);
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        h.pipeline.process(id).await,
        Err(AnonError::JobNotFound { .. })
    ));
    assert!(matches!(
        h.pipeline.render(id).await,
        Err(AnonError::JobNotFound { .. })
    ));
}

// ── Review & render ──────────────────────────────────────────────────────────

#[tokio::test]
async fn render_before_review_is_an_invalid_transition() {
    let h = harness(dealer_findings());
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Unify).await);
    let err = assert_err!(h.pipeline.render(job.id).await);
    assert!(matches!(err, AnonError::InvalidTransition { action: "render", .. }));
    assert_eq!(h.pipeline.job(job.id).await.unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn decisions_must_name_known_findings() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;

    let bad = BTreeMap::from([("finding_404".to_string(), Action::Keep)]);
    let err = assert_err!(h.pipeline.submit_decisions(id, bad).await);
    assert!(matches!(err, AnonError::InvalidInstruction { .. }));

    let good = BTreeMap::from([("finding_001".to_string(), Action::Keep)]);
    let job = assert_ok!(h.pipeline.submit_decisions(id, good).await);
    assert_eq!(job.status, JobStatus::Review);
    assert_eq!(job.decisions.get("finding_001"), Some(&Action::Keep));
}

#[tokio::test]
async fn render_removes_content_and_writes_outputs() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;

    let job = assert_ok!(h.pipeline.render(id).await);
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_some());

    let pdf_path = job.output_pdf_path.clone().unwrap();
    assert_eq!(pdf_path, format!("outputs/{id}/anonymized_oferta.pdf"));
    let out = h.pipeline.storage().load(&pdf_path).await.unwrap();
    assert_eq!(page_count(&out), 3);
    let first = page_text(&out, 0);
    assert!(!first.contains("Kowalski"), "{first}");
    assert!(first.contains("Oferta nr 2024/118"));
    // Masked, not purged.
    assert!(page_text(&out, 1).contains("Rabat"));
    assert!(!page_text(&out, 2).contains("Nowak"));

    let audit: AuditRecord = serde_json::from_slice(
        &h.pipeline
            .storage()
            .load(job.audit_path.as_deref().unwrap())
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(audit.job_id, id);
    assert_eq!(audit.findings_count, 3);
    assert_eq!(audit.redactions_applied, 3);

    let twin_json = h
        .pipeline
        .storage()
        .load(job.output_json_path.as_deref().unwrap())
        .await
        .unwrap();
    let twin: serde_json::Value = serde_json::from_slice(&twin_json).unwrap();
    assert_eq!(twin["source_file"], "oferta.pdf");
    assert_eq!(twin["audit"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn keep_decision_is_honoured_and_rerender_replaces_audit() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;
    assert_ok!(h.pipeline.render(id).await);

    let keep = BTreeMap::from([("finding_001".to_string(), Action::Keep)]);
    let job = assert_ok!(h.pipeline.submit_decisions(id, keep).await);
    assert_eq!(job.status, JobStatus::Done);

    let job = assert_ok!(h.pipeline.render(id).await);
    assert_eq!(job.status, JobStatus::Done);
    let out = h
        .pipeline
        .storage()
        .load(job.output_pdf_path.as_deref().unwrap())
        .await
        .unwrap();
    assert!(page_text(&out, 0).contains("Kowalski"));

    let twin = job.twin.unwrap();
    let redactions: Vec<_> = twin
        .audit
        .iter()
        .filter(|a| a.action_type == "mask" || a.action_type == "remove")
        .collect();
    assert_eq!(redactions.len(), 2);
}

// ── Mutations ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_pages_versions_artifact_and_remaps_findings() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;
    let upload = h.pipeline.job(id).await.unwrap().current_input_path;

    let (job, deleted) = assert_ok!(h.pipeline.delete_pages(id, vec![1]).await);
    assert_eq!(deleted.deleted_pages, vec![1]);
    assert_eq!(deleted.new_page_count, 2);
    assert_eq!(job.page_count, 2);
    assert_eq!(job.status, JobStatus::Review);
    assert_eq!(job.current_input_path, format!("artifacts/{id}/v1_pages_oferta.pdf"));
    assert_eq!(job.artifact_history.len(), 1);
    assert_eq!(job.artifact_history[0].path, upload);
    assert_eq!(job.thumbnails.len(), 2);
    let storage = h.pipeline.storage();
    assert!(assert_ok!(storage.exists(&format!("thumbnails/{id}/page_1.png")).await));
    assert!(!assert_ok!(storage.exists(&format!("thumbnails/{id}/page_2.png")).await));

    let pages: Vec<(&str, usize)> = job.findings.iter().map(|f| (f.id.as_str(), f.page)).collect();
    assert_eq!(pages, vec![("finding_001", 1), ("finding_003", 2)]);
    assert!(job.advisories.iter().any(|a| a.contains("deleted pages")));
    assert!(job
        .twin
        .as_ref()
        .unwrap()
        .audit
        .iter()
        .any(|a| a.action_type == "remove_page"));

    let current = h.pipeline.storage().load(&job.current_input_path).await.unwrap();
    assert_eq!(page_count(&current), 2);
    assert!(page_text(&current, 1).contains("Salon Auto Nowak"));
    // The original upload is untouched.
    let original = h.pipeline.storage().load(&upload).await.unwrap();
    assert_eq!(page_count(&original), 3);
}

#[tokio::test]
async fn failed_thumbnail_refresh_keeps_stored_job_consistent() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;
    let before = h.pipeline.job(id).await.unwrap();
    assert_eq!(before.thumbnails.len(), 3);

    h.rasterizer.fail_thumbnails.store(true, Ordering::SeqCst);
    assert_err!(h.pipeline.delete_pages(id, vec![0]).await);

    let after = h.pipeline.job(id).await.unwrap();
    assert_eq!(after.current_input_path, before.current_input_path);
    assert_eq!(after.thumbnails, before.thumbnails);
    for path in &after.thumbnails {
        assert!(assert_ok!(h.pipeline.storage().exists(path).await), "{path} missing");
    }

    h.rasterizer.fail_thumbnails.store(false, Ordering::SeqCst);
    let (job, _) = assert_ok!(h.pipeline.delete_pages(id, vec![0]).await);
    assert_eq!(job.thumbnails.len(), 2);
}

#[tokio::test]
async fn text_blocks_describe_the_current_artifact() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;

    let pages = assert_ok!(h.pipeline.text_blocks(id, None).await);
    assert_eq!(pages.len(), 3);
    let first: Vec<&str> = pages[0].blocks.iter().map(|b| b.text.as_str()).collect();
    assert_eq!(first[0], "Oferta nr 2024/118 dla klienta");
    assert!(pages[0].blocks.iter().all(|b| b.bbox.x > 11.0 && b.bbox.x < 12.0));

    assert_ok!(h.pipeline.delete_pages(id, vec![0]).await);
    let pages = assert_ok!(h.pipeline.text_blocks(id, Some(0)).await);
    assert_eq!(pages.len(), 1);
    assert!(pages[0].blocks[0].text.starts_with("Cena katalogowa"));
    assert!(matches!(
        h.pipeline.text_blocks(id, Some(2)).await,
        Err(AnonError::InvalidPages { page_count: 2, .. })
    ));
}

#[tokio::test]
async fn invalid_page_request_changes_nothing() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;
    let before = h.pipeline.job(id).await.unwrap();

    let err = assert_err!(h.pipeline.delete_pages(id, vec![0, 7]).await);
    match err {
        AnonError::InvalidPages { invalid, page_count } => {
            assert_eq!(invalid, vec![7]);
            assert_eq!(page_count, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        h.pipeline.delete_pages(id, vec![0, 1, 2]).await,
        Err(AnonError::InvalidPages { .. })
    ));
    assert!(matches!(
        h.pipeline.delete_pages(id, vec![]).await,
        Err(AnonError::EmptyPageSelection)
    ));

    let after = h.pipeline.job(id).await.unwrap();
    assert_eq!(after.current_input_path, before.current_input_path);
    assert!(after.artifact_history.is_empty());
}

#[tokio::test]
async fn edits_chain_versioned_artifacts() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;

    let (job, changes) = assert_ok!(
        h.pipeline
            .text_replace(
                id,
                vec![Replacement {
                    find: "Salon Auto Nowak".into(),
                    replace: "Dealer".into(),
                    page: None,
                }],
            )
            .await
    );
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].page, 2);
    assert_eq!(job.current_input_path, format!("artifacts/{id}/v1_replace_oferta.pdf"));
    assert!(job
        .twin
        .as_ref()
        .unwrap()
        .audit
        .iter()
        .any(|a| a.action_type == "edit_text" && a.before.as_deref() == Some("Salon Auto Nowak")));

    let job = assert_ok!(
        h.pipeline
            .delete_blocks(
                id,
                vec![Block {
                    page: 1,
                    bbox: NormBox::new(0.0, 10.0, 100.0, 4.0),
                }],
            )
            .await
    );
    assert_eq!(job.current_input_path, format!("artifacts/{id}/v2_blocks_oferta.pdf"));
    assert_eq!(job.artifact_history.len(), 2);

    let current = h.pipeline.storage().load(&job.current_input_path).await.unwrap();
    assert!(page_text(&current, 2).contains("Dealer"));
    assert!(!page_text(&current, 2).contains("Nowak"));
    assert!(!page_text(&current, 1).contains("Rabat"));
    assert!(page_text(&current, 1).contains("Cena katalogowa"));

    // Rendering reads the latest artifact.
    let job = assert_ok!(h.pipeline.render(id).await);
    let out = h
        .pipeline
        .storage()
        .load(job.output_pdf_path.as_deref().unwrap())
        .await
        .unwrap();
    assert!(!page_text(&out, 2).contains("Nowak"));
    assert!(!page_text(&out, 1).contains("Rabat"));
    assert!(page_text(&out, 1).contains("Cena katalogowa"));
}

#[tokio::test]
async fn edits_require_review_or_done() {
    let h = harness(dealer_findings());
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Unify).await);
    let err = assert_err!(h.pipeline.delete_pages(job.id, vec![0]).await);
    assert!(matches!(err, AnonError::InvalidTransition { .. }));
}

#[tokio::test]
async fn pinned_document_refuses_destructive_edits() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Layout).await;
    assert_ok!(h.pipeline.pin(id, true).await);

    assert!(matches!(
        h.pipeline.delete_pages(id, vec![0]).await,
        Err(AnonError::DocumentPinned { .. })
    ));
    assert!(matches!(
        h.pipeline.delete_job(id).await,
        Err(AnonError::DocumentPinned { .. })
    ));
    // Rendering is not destructive to the current artifact.
    assert_ok!(h.pipeline.render(id).await);

    assert_ok!(h.pipeline.pin(id, false).await);
    assert_ok!(h.pipeline.delete_pages(id, vec![0]).await);
}

#[tokio::test]
async fn delete_job_removes_all_artifacts() {
    let h = harness(dealer_findings());
    let id = reviewed(&h, Mode::Unify).await;
    assert_ok!(h.pipeline.delete_pages(id, vec![2]).await);
    assert_ok!(h.pipeline.render(id).await);

    assert_ok!(h.pipeline.delete_job(id).await);
    for dir in ["uploads", "thumbnails", "pages", "artifacts", "outputs"] {
        assert!(
            !h.dir.path().join(dir).join(id.to_string()).exists(),
            "{dir} left behind"
        );
    }
    assert!(matches!(
        h.pipeline.job(id).await,
        Err(AnonError::JobNotFound { .. })
    ));
}

#[tokio::test]
async fn jobs_process_concurrently() {
    let h = harness(dealer_findings());
    let a = assert_ok!(h.pipeline.create_job("a.pdf", &dealer_offer(), Mode::Layout).await);
    let b = assert_ok!(h.pipeline.create_job("b.pdf", &dealer_offer(), Mode::Layout).await);

    let (ra, rb) = tokio::join!(h.pipeline.process(a.id), h.pipeline.process(b.id));
    assert_eq!(ra.unwrap().status, JobStatus::Review);
    assert_eq!(rb.unwrap().status, JobStatus::Review);
}

// ── Worker ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_processes_queued_jobs() {
    let h = harness(dealer_findings());
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Layout).await);

    let config = WorkerConfig::default().with_poll_interval(10);
    let handle = JobWorker::new(Arc::clone(&h.pipeline), config).start();
    let mut events = handle.events();

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobCompleted { job_id, .. }) => break job_id,
                Ok(WorkerEvent::JobFailed { error, .. }) => panic!("job failed: {error}"),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("worker finished in time");

    assert_eq!(completed, job.id);
    assert_eq!(h.pipeline.job(job.id).await.unwrap().status, JobStatus::Review);
    handle.shutdown().await;
}

#[tokio::test]
async fn disabled_worker_leaves_queue_alone() {
    let h = harness(dealer_findings());
    let job = assert_ok!(h.pipeline.create_job("oferta.pdf", &dealer_offer(), Mode::Layout).await);

    let config = WorkerConfig::default()
        .with_poll_interval(10)
        .with_enabled(false);
    let handle = JobWorker::new(Arc::clone(&h.pipeline), config).start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    assert_eq!(h.pipeline.job(job.id).await.unwrap().status, JobStatus::Queued);
    assert_eq!(h.classifier.calls(), 0);
}
