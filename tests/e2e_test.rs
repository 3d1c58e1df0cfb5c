//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL database running (with migrations applied)
//! 2. Redis running
//! 3. API server running on configured port
//! 4. Worker pool process running
//! 5. Object storage and inference backend configured
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

use std::io::Cursor;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use uuid::Uuid;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn test_photo_png() -> Vec<u8> {
    let img = image::GrayImage::from_fn(64, 64, |x, y| image::Luma([((x + y) % 256) as u8]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: String,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[tokio::test]
#[ignore] // Requires running API server, worker pool, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore] // Requires running API server, worker pool, and all infrastructure
async fn test_e2e_photo_submission_reaches_terminal_state() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    // 1. Submit a photo
    let form = reqwest::multipart::Form::new()
        .part(
            "image",
            reqwest::multipart::Part::bytes(test_photo_png())
                .file_name("pod_test.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .text("delivery_id", "e2e-delivery-1")
        .text("priority", "express");

    let response = client
        .post(format!("{}/api/v1/photos", base_url))
        .multipart(form)
        .send()
        .await
        .expect("Failed to submit photo");

    assert_eq!(response.status(), 202, "expected 202 Accepted");
    let submit: SubmitResponse = response.json().await.expect("Invalid submit response");
    assert_eq!(submit.status, "queued");
    println!("✓ Photo accepted as job {}", submit.job_id);

    // 2. Poll until the job leaves the queue (completed or dead-lettered)
    let mut last_status = submit.status;
    for _ in 0..60 {
        sleep(Duration::from_secs(2)).await;
        let response = client
            .get(format!("{}/api/v1/photos/{}", base_url, submit.job_id))
            .send()
            .await
            .expect("Failed to poll job");
        assert!(response.status().is_success());

        let status: JobStatusResponse = response.json().await.expect("Invalid status response");
        last_status = status.status.clone();
        if last_status == "completed" || last_status == "dead_lettered" {
            println!(
                "✓ Job reached terminal state: {} (failure_reason: {:?})",
                last_status, status.failure_reason
            );
            return;
        }
    }
    panic!("Job did not reach a terminal state, last status: {last_status}");
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_rejects_oversized_and_malformed_uploads() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    // Not an image at all
    let form = reqwest::multipart::Form::new().part(
        "image",
        reqwest::multipart::Part::bytes(b"not an image".to_vec()).file_name("junk.bin"),
    );
    let response = client
        .post(format!("{}/api/v1/photos", base_url))
        .multipart(form)
        .send()
        .await
        .expect("Failed to submit junk");
    assert_eq!(response.status(), 415);

    // Missing image field
    let form = reqwest::multipart::Form::new().text("delivery_id", "e2e-delivery-2");
    let response = client
        .post(format!("{}/api/v1/photos", base_url))
        .multipart(form)
        .send()
        .await
        .expect("Failed to submit without image");
    assert_eq!(response.status(), 400);

    println!("✓ Validation rejections behave as expected");
}
