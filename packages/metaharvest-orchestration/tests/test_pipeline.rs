//! Pipeline construction and submission against a stubbed remote service.

mod common;

use common::{context_with_compute, spawn_stub, StubResponse};
use metaharvest_orchestration::{
    refresh_job_status, start, AnalysisJob, AnalysisKind, ArtifactKind, ArtifactRegistry, Config,
    HarvestJob, JobContext, JobStatus, JobType, JobTypeRegistry, MergeJob, OaiEndpoint,
    PipelineError, PipelineJob, PublishJob, RecordGroupRef, TransformJob,
};

fn endpoint() -> OaiEndpoint {
    OaiEndpoint {
        name: "state library".to_string(),
        endpoint: "http://repo.example.org/oai".to_string(),
        verb: "ListRecords".to_string(),
        metadata_prefix: "mods".to_string(),
        scope_type: "setList".to_string(),
        scope_value: "maps".to_string(),
    }
}

fn group() -> RecordGroupRef {
    RecordGroupRef::new(1, 4, "set-a")
}

/// Stub that accepts session creation and statement submission, then reports
/// every statement as running.
fn live_session_stub(method: &str, path: &str) -> StubResponse {
    match (method, path) {
        ("POST", "/sessions") => {
            StubResponse::json(201, r#"{"id": 0, "state": "starting"}"#).with_location("/sessions/0")
        }
        ("GET", "/sessions/0") => StubResponse::json(200, r#"{"id": 0, "state": "idle"}"#),
        ("POST", "/sessions/0/statements") => {
            StubResponse::json(201, r#"{"id": 0, "state": "waiting"}"#)
                .with_location("/sessions/0/statements/0")
        }
        ("GET", "/sessions/0/statements/0") => {
            StubResponse::json(200, r#"{"id": 0, "state": "running"}"#)
        }
        _ => StubResponse::not_found(),
    }
}

async fn harvest(ctx: &JobContext) -> HarvestJob {
    HarvestJob::create(ctx, group(), None, endpoint(), None, "GenericMapper")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_harvest_create_and_submit() {
    let url = spawn_stub(live_session_stub).await;
    let ctx = context_with_compute(&url, Config::default()).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let mut job = harvest(&ctx).await;
    assert_eq!(job.job().status, JobStatus::Initializing);
    assert_eq!(
        job.job().output_location,
        format!(
            "file:///var/lib/metaharvest/data/organizations/1/record_group/4/jobs/harvest/{}",
            job.job().id
        )
    );

    start(&ctx, &mut job).await.unwrap();

    let stored = ctx.store.get_job(job.job().id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Waiting);
    assert_eq!(stored.statement_id, Some(0));
    assert!(stored
        .statement_url
        .as_deref()
        .unwrap()
        .ends_with("/sessions/0/statements/0"));
    let code = stored.remote_code.unwrap();
    assert!(code.starts_with("from jobs import HarvestSpark"));
    assert!(code.contains("endpoint=\"http://repo.example.org/oai\""));
    assert!(code.contains(&format!("job_id=\"{}\"", stored.id)));
}

#[tokio::test]
async fn test_start_without_session_leaves_job_unstarted() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;

    let mut job = harvest(&ctx).await;
    let err = start(&ctx, &mut job).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoActiveSession));

    // not started, not crashed
    let stored = ctx.store.get_job(job.job().id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Initializing);
    assert_eq!(stored.statement_url, None);
}

#[tokio::test]
async fn test_transform_requires_exactly_one_input() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;
    let h1 = harvest(&ctx).await;
    let h2 = harvest(&ctx).await;

    let artifacts = ArtifactRegistry::new(ctx.store.clone(), ctx.config.clone()).unwrap();
    let artifact = artifacts
        .ingest_payload("identity", ArtifactKind::Python, "def transform(r): return r")
        .await
        .unwrap();

    let before = ctx.store.jobs_for_record_group(4).await.unwrap().len();

    for inputs in [vec![], vec![h1.job().id, h2.job().id]] {
        let err = TransformJob::create(&ctx, group(), None, &inputs, artifact.id, "GenericMapper")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DependencyMissing {
                job_type: "transform",
                ..
            }
        ));
    }

    // nothing was persisted by the failed constructions
    assert_eq!(ctx.store.jobs_for_record_group(4).await.unwrap().len(), before);
}

#[tokio::test]
async fn test_publish_requires_exactly_one_input() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;

    let err = PublishJob::create(&ctx, group(), None, &[], "GenericMapper")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DependencyMissing {
            job_type: "publish",
            expected: "exactly 1",
            actual: 0,
        }
    ));
    assert!(ctx.store.jobs_for_record_group(4).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_merge_submits_all_input_locations() {
    let url = spawn_stub(live_session_stub).await;
    let ctx = context_with_compute(&url, Config::default()).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let h1 = harvest(&ctx).await;
    let h2 = harvest(&ctx).await;
    let mut merge = MergeJob::create(
        &ctx,
        group(),
        Some("merge harvests".to_string()),
        &[h1.job().id, h2.job().id],
        "GenericMapper",
    )
    .await
    .unwrap();

    assert!(MergeJob::create(&ctx, group(), None, &[], "GenericMapper")
        .await
        .is_err());

    start(&ctx, &mut merge).await.unwrap();

    let stored = ctx.store.get_job(merge.job().id).await.unwrap();
    let code = stored.remote_code.unwrap();
    assert!(code.starts_with("from jobs import MergeSpark"));
    assert!(code.contains(&h1.job().output_location));
    assert!(code.contains(&h2.job().output_location));
}

#[tokio::test]
async fn test_transform_submits_artifact_filepath() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage_root = format!("file://{}", tmp.path().display());

    let url = spawn_stub(live_session_stub).await;
    let ctx = context_with_compute(&url, config).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let artifacts = ArtifactRegistry::new(ctx.store.clone(), ctx.config.clone()).unwrap();
    let artifact = artifacts
        .ingest_payload("mods-to-dc", ArtifactKind::Xslt, "<xsl:stylesheet/>")
        .await
        .unwrap();

    let h = harvest(&ctx).await;
    let mut transform = TransformJob::create(
        &ctx,
        group(),
        None,
        &[h.job().id],
        artifact.id,
        "GenericMapper",
    )
    .await
    .unwrap();

    start(&ctx, &mut transform).await.unwrap();

    let stored = ctx.store.get_job(transform.job().id).await.unwrap();
    let code = stored.remote_code.unwrap();
    assert!(code.starts_with("from jobs import TransformSpark"));
    assert!(code.contains(artifact.filepath.as_deref().unwrap()));
    assert!(code.contains(&h.job().output_location));
    assert_eq!(stored.job_details["transformation"]["name"], "mods-to-dc");
}

#[tokio::test]
async fn test_publish_links_record_group() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;

    let h = harvest(&ctx).await;
    let publish = PublishJob::create(&ctx, group(), None, &[h.job().id], "GenericMapper")
        .await
        .unwrap();

    assert_eq!(
        ctx.store.published_job_id(4).await.unwrap(),
        Some(publish.job().id)
    );
}

#[tokio::test]
async fn test_analysis_files_under_reserved_hierarchy() {
    let url = spawn_stub(live_session_stub).await;
    let ctx = context_with_compute(&url, Config::default()).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let h1 = harvest(&ctx).await;
    let h2 = harvest(&ctx).await;
    let mut analysis = AnalysisJob::create(
        &ctx,
        None,
        AnalysisKind::Merge {
            input_job_ids: vec![h1.job().id, h2.job().id],
        },
        "GenericMapper",
    )
    .await
    .unwrap();

    let job = analysis.job();
    assert_eq!(job.record_group.organization_id, ctx.config.analysis.organization_id);
    assert_eq!(
        job.record_group.record_group_id,
        ctx.config.analysis.record_group_id
    );
    // filed outside the user-created hierarchy
    assert_ne!(job.record_group.record_group_id, group().record_group_id);

    start(&ctx, &mut analysis).await.unwrap();
    let stored = ctx.store.get_job(analysis.job().id).await.unwrap();
    assert!(stored.remote_code.unwrap().starts_with("from jobs import MergeSpark"));
}

#[tokio::test]
async fn test_refresh_vanished_statement_marks_gone() {
    let url = spawn_stub(|method, path| match (method, path) {
        ("POST", "/sessions") => {
            StubResponse::json(201, r#"{"id": 0, "state": "starting"}"#).with_location("/sessions/0")
        }
        ("POST", "/sessions/0/statements") => {
            StubResponse::json(201, r#"{"id": 0, "state": "waiting"}"#)
                .with_location("/sessions/0/statements/0")
        }
        // the session was reaped between submission and the next poll
        ("GET", "/sessions/0/statements/0") => StubResponse::not_found(),
        _ => StubResponse::not_found(),
    })
    .await;
    let ctx = context_with_compute(&url, Config::default()).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let mut builder = harvest(&ctx).await;
    start(&ctx, &mut builder).await.unwrap();

    let mut job = ctx.store.get_job(builder.job().id).await.unwrap();
    refresh_job_status(&ctx, &mut job).await.unwrap();

    assert_eq!(job.status, JobStatus::Gone);
    assert!(!job.finished);
    let stored = ctx.store.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Gone);
}

#[tokio::test]
async fn test_refresh_available_statement_finishes_job() {
    let url = spawn_stub(|method, path| match (method, path) {
        ("POST", "/sessions") => {
            StubResponse::json(201, r#"{"id": 0, "state": "starting"}"#).with_location("/sessions/0")
        }
        ("POST", "/sessions/0/statements") => {
            StubResponse::json(201, r#"{"id": 0, "state": "waiting"}"#)
                .with_location("/sessions/0/statements/0")
        }
        ("GET", "/sessions/0/statements/0") => {
            StubResponse::json(200, r#"{"id": 0, "state": "available"}"#)
        }
        _ => StubResponse::not_found(),
    })
    .await;
    let ctx = context_with_compute(&url, Config::default()).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let mut builder = harvest(&ctx).await;
    start(&ctx, &mut builder).await.unwrap();

    let mut job = ctx.store.get_job(builder.job().id).await.unwrap();
    refresh_job_status(&ctx, &mut job).await.unwrap();

    assert_eq!(job.status, JobStatus::Available);
    assert!(job.finished);
}

#[tokio::test]
async fn test_registry_rehydrates_variant_from_type_tag() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;

    let h = harvest(&ctx).await;
    let publish = PublishJob::create(&ctx, group(), None, &[h.job().id], "GenericMapper")
        .await
        .unwrap();

    let registry = JobTypeRegistry::builtin();
    let rehydrated = registry.rehydrate(&ctx, publish.job().id).await.unwrap();
    assert_eq!(rehydrated.job_type(), JobType::Publish);
    assert_eq!(rehydrated.job().id, publish.job().id);

    let err = registry.rehydrate(&ctx, 9999).await.unwrap_err();
    assert!(matches!(err, PipelineError::JobNotFound(9999)));
}

#[tokio::test]
async fn test_error_records_per_variant() {
    let url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let ctx = context_with_compute(&url, Config::default()).await;

    let h = harvest(&ctx).await;
    let artifacts = ArtifactRegistry::new(ctx.store.clone(), ctx.config.clone()).unwrap();
    let artifact = artifacts
        .ingest_payload("identity", ArtifactKind::Python, "def transform(r): return r")
        .await
        .unwrap();
    let transform = TransformJob::create(
        &ctx,
        group(),
        None,
        &[h.job().id],
        artifact.id,
        "GenericMapper",
    )
    .await
    .unwrap();

    ctx.store
        .insert_record(h.job().id, "r1", Some(0), "<doc/>", "")
        .await
        .unwrap();
    ctx.store
        .insert_record(transform.job().id, "r1", Some(0), "", "stylesheet blew up")
        .await
        .unwrap();

    // harvest reports no errors at this layer; the transform surfaces its
    // flagged records
    assert!(h.job_errors(&ctx).await.unwrap().is_empty());
    let errors = transform.job_errors(&ctx).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, "stylesheet blew up");
}
