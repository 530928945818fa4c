use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

/// Kills the service even when an assertion fails
struct Service(Child);

impl Drop for Service {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

fn write_scene(path: &Path, seed: u32) {
    let s = seed as f64;
    RgbImage::from_fn(80, 60, |x, y| {
        let wave = (x as f64 / 80.0 * (2.0 + s) + s).sin() * (y as f64 / 60.0 * 2.5 + s).cos();
        let v = (128.0 + 110.0 * wave) as u8;
        Rgb([v, v, v])
    })
    .save(path)
    .unwrap();
}

/// Tracked photo directory with two distinct images and one undecodable file
fn create_photo_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_scene(&dir.path().join("one.png"), 1);
    write_scene(&dir.path().join("two.png"), 4);
    std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
    dir
}

/// Helper to find a free port
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Helper to wait for the service to be ready
fn wait_for_service(base_url: &str, timeout: Duration) -> bool {
    let client = reqwest::blocking::Client::new();
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if client.get(format!("{}/status", base_url)).send().is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

fn start_service(data_dir: &Path) -> (Service, String) {
    let port = free_port();
    let base_url = format!("http://127.0.0.1:{}", port);
    let child = Command::new(env!("CARGO_BIN_EXE_lookalike-service"))
        .args(["--port", &port.to_string()])
        .arg("--data-dir")
        .arg(data_dir)
        .spawn()
        .expect("Failed to start lookalike-service");
    let service = Service(child);
    assert!(
        wait_for_service(&base_url, Duration::from_secs(10)),
        "Service failed to start"
    );
    (service, base_url)
}

fn wait_for_job(client: &reqwest::blocking::Client, base_url: &str, id: i64) -> serde_json::Value {
    for _ in 0..100 {
        let job: serde_json::Value = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .unwrap()
            .json()
            .unwrap();
        if matches!(job["state"].as_str(), Some("completed" | "failed" | "cancelled")) {
            return job;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("job {id} never finished");
}

#[test]
fn test_service_lifecycle() {
    let photos = create_photo_dir();
    let data = TempDir::new().unwrap();
    let (_service, base_url) = start_service(data.path());
    let client = reqwest::blocking::Client::new();

    // 1. Track the directory
    let resp = client
        .post(format!("{}/directories", base_url))
        .json(&serde_json::json!({ "path": photos.path(), "prefix_bits": 12 }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let dir: serde_json::Value = resp.json().unwrap();
    let dir_id = dir["id"].as_i64().unwrap();
    assert_eq!(dir["prefix_bits"].as_u64(), Some(12));

    // 2. Index it in the background
    let job: serde_json::Value = client
        .post(format!("{}/jobs", base_url))
        .json(&serde_json::json!({ "kind": "index", "directory_id": dir_id }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let job_id = job["id"].as_i64().unwrap();

    let job = wait_for_job(&client, &base_url, job_id);
    assert_eq!(job["state"].as_str(), Some("completed"), "job: {job}");
    assert_eq!(job["progress"].as_f64(), Some(1.0));

    let dirs: serde_json::Value = client
        .get(format!("{}/directories", base_url))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let tracked = &dirs.as_array().unwrap()[0];
    assert_eq!(tracked["file_count"].as_u64(), Some(3));
    assert_eq!(tracked["status"].as_str(), Some("idle"));
    assert!(tracked["last_indexed_at"].as_i64().is_some());

    // 3. Match a copy against the tracked images
    let work = TempDir::new().unwrap();
    std::fs::copy(photos.path().join("one.png"), work.path().join("copy.png")).unwrap();
    write_scene(&work.path().join("new.png"), 9);
    let reference: Vec<PathBuf> = ["one.png", "two.png", "broken.jpg"]
        .iter()
        .map(|n| photos.path().join(n))
        .collect();
    let outcome: serde_json::Value = client
        .post(format!("{}/matches", base_url))
        .json(&serde_json::json!({
            "reference": reference,
            "work": [work.path().join("copy.png"), work.path().join("new.png")],
            "criteria": { "mode": "hash", "hash_size": 16, "similarity_percent": 90.0 }
        }))
        .send()
        .unwrap()
        .json()
        .unwrap();

    let matches = outcome["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1, "outcome: {outcome}");
    assert_eq!(matches[0]["tag"]["kind"].as_str(), Some("dhash"));
    assert_eq!(matches[0]["tag"]["distance"].as_u64(), Some(0));
    assert_eq!(outcome["unique_ref"].as_array().unwrap().len(), 2);
    assert_eq!(outcome["unique_work"].as_array().unwrap().len(), 1);
    // Reference hashes come from the index, the broken file is not reopened
    assert_eq!(outcome["stats"]["cached"].as_u64(), Some(2));
    assert_eq!(outcome["stats"]["unreadable"].as_u64(), Some(1));

    // Same copy looked up through the directory's index
    let found: serde_json::Value = client
        .post(format!("{}/directories/{}/lookup", base_url, dir_id))
        .json(&serde_json::json!({ "path": work.path().join("copy.png") }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let found = found.as_array().unwrap();
    assert_eq!(found.len(), 1, "found: {found:?}");
    assert!(found[0]["reference"].as_str().unwrap().ends_with("one.png"));
    assert_eq!(found[0]["tag"]["distance"].as_u64(), Some(0));

    // 4. Finished jobs cannot be cancelled
    let resp = client
        .post(format!("{}/jobs/{}/cancel", base_url, job_id))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["code"].as_str(), Some("invalid_transition"));

    // 5. Remove the directory
    let resp = client
        .delete(format!("{}/directories/{}", base_url, dir_id))
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let status: serde_json::Value = client
        .get(format!("{}/status", base_url))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(status["directories"].as_u64(), Some(0));
    assert_eq!(status["jobs"]["completed"].as_u64(), Some(1));
}

#[test]
fn test_error_envelopes() {
    let data = TempDir::new().unwrap();
    let (_service, base_url) = start_service(data.path());
    let client = reqwest::blocking::Client::new();

    let resp = client.get(format!("{}/jobs/999", base_url)).send().unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["code"].as_str(), Some("job_not_found"));
    assert!(!body["hint"].as_str().unwrap().is_empty());

    let resp = client
        .post(format!("{}/directories", base_url))
        .json(&serde_json::json!({ "path": data.path().join("missing") }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client
        .post(format!("{}/jobs", base_url))
        .json(&serde_json::json!({ "kind": "defrag" }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(format!("{}/matches", base_url))
        .json(&serde_json::json!({
            "reference": [], "work": [],
            "criteria": { "mode": "hash", "hash_size": 1, "similarity_percent": 90.0 }
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["code"].as_str(), Some("invalid_request"));

    // An index job for an unknown directory is accepted, then fails
    let job: serde_json::Value = client
        .post(format!("{}/jobs", base_url))
        .json(&serde_json::json!({ "kind": "index", "directory_id": 42 }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let job = wait_for_job(&client, &base_url, job["id"].as_i64().unwrap());
    assert_eq!(job["state"].as_str(), Some("failed"));
    assert!(job["last_error"].as_str().is_some());
}
