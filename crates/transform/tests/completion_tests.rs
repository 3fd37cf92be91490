//! Integration tests for the submit-and-wait helper.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use geoflip_transform::api::JobStatus;
use geoflip_transform::completion::{
    await_geojson, await_output, Completed, CompletionConfig, CompletionError,
};

use common::{server_error, shp_request, ScriptedService};

#[tokio::test(start_paused = true)]
async fn returns_link_once_job_succeeds() {
    let service = ScriptedService::new();
    service.accept("job-1");
    service.script(
        "job-1",
        vec![
            Ok(JobStatus::processing(None)),
            Ok(JobStatus::success("https://files/job-1.geojson")),
        ],
    );

    let completed = await_output(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap();

    assert_eq!(
        completed,
        Completed {
            task_id: "job-1".into(),
            output_url: "https://files/job-1.geojson".into(),
        }
    );
    assert_eq!(service.status_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failure_carries_server_message() {
    let service = ScriptedService::new();
    service.accept("job-2");
    service.script(
        "job-2",
        vec![Ok(JobStatus {
            status: "failed".into(),
            output_url: None,
            message: Some("invalid geometry".into()),
        })],
    );

    let err = await_output(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap_err();

    assert_matches!(
        err,
        CompletionError::Failed { ref task_id, ref message }
            if task_id == "job-2" && message == "invalid geometry"
    );
}

#[tokio::test(start_paused = true)]
async fn times_out_while_processing() {
    let service = ScriptedService::new();
    service.accept("job-3");

    let config = CompletionConfig {
        poll_interval: Duration::from_millis(200),
        timeout: Duration::from_secs(2),
    };
    let err = await_output(service.as_ref(), &shp_request(), &config)
        .await
        .unwrap_err();

    assert_matches!(
        err,
        CompletionError::TimedOut { task_id: Some(ref id), after }
            if id == "job-3" && after == Duration::from_secs(2)
    );
    assert!(service.status_calls() >= 9);
}

#[tokio::test(start_paused = true)]
async fn deadline_includes_submission() {
    let service = ScriptedService::new();
    service.accept("job-7");
    service.delay_submissions(Duration::from_millis(1500));

    let config = CompletionConfig {
        poll_interval: Duration::from_millis(200),
        timeout: Duration::from_secs(2),
    };
    let start = tokio::time::Instant::now();
    let err = await_output(service.as_ref(), &shp_request(), &config)
        .await
        .unwrap_err();

    assert_matches!(err, CompletionError::TimedOut { task_id: Some(ref id), .. } if id == "job-7");
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert!(service.status_calls() <= 2, "calls {}", service.status_calls());
}

#[tokio::test(start_paused = true)]
async fn slow_submission_times_out_without_task() {
    let service = ScriptedService::new();
    service.accept("job-8");
    service.delay_submissions(Duration::from_secs(30));

    let err = await_output(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap_err();

    assert_matches!(err, CompletionError::TimedOut { task_id: None, .. });
    assert_eq!(service.status_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn poll_errors_are_not_retried() {
    let service = ScriptedService::new();
    service.accept("job-4");
    service.script("job-4", vec![server_error()]);

    let err = await_output(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap_err();
    assert_matches!(err, CompletionError::Api(_));
}

#[tokio::test(start_paused = true)]
async fn geojson_output_is_parsed() {
    let service = ScriptedService::new();
    service.accept("job-5");
    service.script("job-5", vec![Ok(JobStatus::success("https://files/job-5.geojson"))]);
    service.serve(
        "https://files/job-5.geojson",
        br#"{"type":"FeatureCollection","features":[]}"#,
    );

    let geojson = await_geojson(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap();
    assert_eq!(geojson["type"], "FeatureCollection");

    service.accept("job-6");
    service.script("job-6", vec![Ok(JobStatus::success("https://files/job-6.bin"))]);
    service.serve("https://files/job-6.bin", b"\x00\x01");
    let err = await_geojson(service.as_ref(), &shp_request(), &CompletionConfig::default())
        .await
        .unwrap_err();
    assert_matches!(err, CompletionError::InvalidOutput(_));
}
