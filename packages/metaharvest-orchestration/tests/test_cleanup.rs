//! Cascading cleanup on job deletion.

mod common;

use common::{context_with_compute, spawn_stub, unreachable_search_client, StubResponse};
use metaharvest_orchestration::{
    CleanupCoordinator, Config, HarvestJob, JobContext, OaiEndpoint, PipelineJob, PublishJob,
    RecordGroupRef, SearchIndexClient,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

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

async fn publish_fixture(ctx: &JobContext) -> (i64, PathBuf, PathBuf, PathBuf) {
    let harvest = HarvestJob::create(ctx, group(), None, endpoint(), None, "GenericMapper")
        .await
        .unwrap();
    let publish = PublishJob::create(ctx, group(), None, &[harvest.job().id], "GenericMapper")
        .await
        .unwrap();
    let job = ctx.store.get_job(publish.job().id).await.unwrap();

    // job output with a hashed part file
    let output_dir = job.output_as_filesystem().unwrap();
    fs::create_dir_all(&output_dir).unwrap();
    fs::write(output_dir.join("part-r-00000-hash42.avro"), b"records").unwrap();

    // indexing results alongside
    let root = ctx.config.storage_root.strip_prefix("file://").unwrap();
    let indexing_dir = PathBuf::from(format!(
        "{root}/organizations/1/record_group/4/jobs/indexing/{}",
        job.id
    ));
    fs::create_dir_all(&indexing_dir).unwrap();
    fs::write(indexing_dir.join("part-r-00000-idx.avro"), b"mapped").unwrap();

    // published symlink directory with this job's artifact and another job's
    let published_dir = ctx.config.published_dir().unwrap();
    fs::create_dir_all(&published_dir).unwrap();
    fs::write(published_dir.join("part-r-00000-hash42.avro"), b"link").unwrap();
    fs::write(published_dir.join("part-r-00000-other.avro"), b"link").unwrap();

    (job.id, output_dir, indexing_dir, published_dir)
}

fn tmp_config(tmp: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage_root = format!("file://{}", tmp.path().display());
    config
}

#[tokio::test]
async fn test_delete_publish_job_reclaims_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let compute_url = spawn_stub(|_, _| StubResponse::not_found()).await;
    // the index service knows both collections
    let search_url = spawn_stub(|method, path| match (method, path) {
        ("HEAD", _) => StubResponse::json(200, ""),
        ("POST", "/published/_delete_by_query") => StubResponse::json(200, r#"{"deleted": 12}"#),
        ("DELETE", _) => StubResponse::json(200, r#"{"acknowledged": true}"#),
        _ => StubResponse::not_found(),
    })
    .await;

    let ctx = context_with_compute(&compute_url, tmp_config(&tmp)).await;
    let search = Arc::new(SearchIndexClient::from_base_url(search_url).unwrap());
    let coordinator = CleanupCoordinator::new(
        ctx.store.clone(),
        ctx.client.clone(),
        search,
        ctx.config.clone(),
    );

    let (job_id, output_dir, indexing_dir, published_dir) = publish_fixture(&ctx).await;

    let report = coordinator.delete_job(job_id).await.unwrap();
    assert!(report.is_clean(), "failures: {:?}", report.failures);

    assert!(!output_dir.exists());
    assert!(!indexing_dir.exists());
    assert!(!published_dir.join("part-r-00000-hash42.avro").exists());
    // another job's published artifact is untouched
    assert!(published_dir.join("part-r-00000-other.avro").exists());

    assert!(ctx.store.get_job(job_id).await.is_err());
    assert_eq!(ctx.store.published_job_id(4).await.unwrap(), None);
}

#[tokio::test]
async fn test_cleanup_tolerates_absent_search_index() {
    let tmp = tempfile::tempdir().unwrap();
    let compute_url = spawn_stub(|_, _| StubResponse::not_found()).await;
    // the index service has neither the published collection nor j{id}
    let search_url = spawn_stub(|_, _| StubResponse::not_found()).await;

    let ctx = context_with_compute(&compute_url, tmp_config(&tmp)).await;
    let search = Arc::new(SearchIndexClient::from_base_url(search_url).unwrap());
    let coordinator = CleanupCoordinator::new(
        ctx.store.clone(),
        ctx.client.clone(),
        search,
        ctx.config.clone(),
    );

    let (job_id, output_dir, _, _) = publish_fixture(&ctx).await;

    let report = coordinator.delete_job(job_id).await.unwrap();
    assert!(report.is_clean(), "failures: {:?}", report.failures);
    assert!(!output_dir.exists());
    assert!(ctx.store.get_job(job_id).await.is_err());
}

#[tokio::test]
async fn test_cleanup_run_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let compute_url = spawn_stub(|_, _| StubResponse::not_found()).await;
    let search_url = spawn_stub(|_, _| StubResponse::not_found()).await;

    let ctx = context_with_compute(&compute_url, tmp_config(&tmp)).await;
    let search = Arc::new(SearchIndexClient::from_base_url(search_url).unwrap());
    let coordinator = CleanupCoordinator::new(
        ctx.store.clone(),
        ctx.client.clone(),
        search,
        ctx.config.clone(),
    );

    let (job_id, output_dir, _, published_dir) = publish_fixture(&ctx).await;
    let job = ctx.store.get_job(job_id).await.unwrap();

    let first = coordinator.run(&job).await;
    assert!(first.is_clean(), "failures: {:?}", first.failures);
    assert!(!output_dir.exists());

    // already reclaimed: nothing more to do, nothing to fail on
    let second = coordinator.run(&job).await;
    assert!(second.is_clean(), "failures: {:?}", second.failures);
    assert!(published_dir.join("part-r-00000-other.avro").exists());
}

#[tokio::test]
async fn test_cleanup_swallows_unreachable_search_service() {
    let tmp = tempfile::tempdir().unwrap();
    let compute_url = spawn_stub(|_, _| StubResponse::not_found()).await;

    let ctx = context_with_compute(&compute_url, tmp_config(&tmp)).await;
    let coordinator = CleanupCoordinator::new(
        ctx.store.clone(),
        ctx.client.clone(),
        unreachable_search_client(),
        ctx.config.clone(),
    );

    let (job_id, output_dir, _, _) = publish_fixture(&ctx).await;

    let report = coordinator.delete_job(job_id).await.unwrap();
    // index steps failed, everything else still ran and the row is gone
    assert!(!report.is_clean());
    assert!(!output_dir.exists());
    assert!(ctx.store.get_job(job_id).await.is_err());
}

#[tokio::test]
async fn test_cleanup_cancels_running_statement() {
    let tmp = tempfile::tempdir().unwrap();
    let compute_url = spawn_stub(|method, path| match (method, path) {
        ("POST", "/sessions") => {
            StubResponse::json(201, r#"{"id": 0, "state": "starting"}"#).with_location("/sessions/0")
        }
        ("POST", "/sessions/0/statements") => {
            StubResponse::json(201, r#"{"id": 0, "state": "waiting"}"#)
                .with_location("/sessions/0/statements/0")
        }
        ("GET", "/sessions/0/statements/0") => {
            StubResponse::json(200, r#"{"id": 0, "state": "running"}"#)
        }
        ("POST", "/sessions/0/statements/0/cancel") => StubResponse::json(200, r#"{"msg": "canceled"}"#),
        _ => StubResponse::not_found(),
    })
    .await;
    let search_url = spawn_stub(|_, _| StubResponse::not_found()).await;

    let ctx = context_with_compute(&compute_url, tmp_config(&tmp)).await;
    ctx.sessions.ensure_active(None).await.unwrap();

    let mut builder = HarvestJob::create(&ctx, group(), None, endpoint(), None, "GenericMapper")
        .await
        .unwrap();
    metaharvest_orchestration::start(&ctx, &mut builder).await.unwrap();

    let search = Arc::new(SearchIndexClient::from_base_url(search_url).unwrap());
    let coordinator = CleanupCoordinator::new(
        ctx.store.clone(),
        ctx.client.clone(),
        search,
        ctx.config.clone(),
    );

    let report = coordinator.delete_job(builder.job().id).await.unwrap();
    assert!(report.is_clean(), "failures: {:?}", report.failures);
    assert!(ctx.store.get_job(builder.job().id).await.is_err());
}
