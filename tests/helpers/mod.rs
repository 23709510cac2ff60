//! Test helper utilities for orchestrator and HTTP testing
#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::multipart;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use uuid::Uuid;

use manuscript_convert::{
    app_state::AppState,
    models::job::{BlobRef, ConversionJob, JobStatus, JobView},
    models::progress::ProgressEvent,
    models::submission::SubmitRequest,
    routes,
    services::{
        converter::ConverterRunner,
        notify::{JobNotifier, JobOutcome, NotifyError},
        orchestrator::{Orchestrator, OrchestratorConfig},
        relay::{ProgressRelay, ProgressTransport},
        state_machine::{InMemoryJobRepository, JobRepository, JobStateMachine},
        storage::{BlobStore, FsBlobStore},
    },
};

pub const OWNER: &str = "owner-42";
pub const OWNER_HEADER: &str = "x-owner-id";

/// Remembers every outcome it is told about.
#[derive(Default)]
pub struct RecordingNotifier {
    pub outcomes: Mutex<Vec<JobOutcome>>,
    pub fail: bool,
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn notify(&self, outcome: &JobOutcome) -> Result<(), NotifyError> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        if self.fail {
            return Err(NotifyError::Delivery("mail server down".to_string()));
        }
        Ok(())
    }
}

/// Sees every published event, in publish order.
#[derive(Default)]
pub struct RecordingTransport {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressTransport for RecordingTransport {
    fn forward(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl RecordingTransport {
    pub fn for_job(&self, job_id: Uuid) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

/// An orchestrator over temporary directories and an in-memory job store.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub blobs: Arc<dyn BlobStore>,
    pub jobs: JobStateMachine,
    pub notifier: Arc<RecordingNotifier>,
    pub transport: Arc<RecordingTransport>,
    pub workspace_root: TempDir,
    pub blob_root: TempDir,
    pub relay_capacity: usize,
}

pub struct HarnessOptions {
    pub timeout: Duration,
    pub max_concurrent_runs: usize,
    pub failing_notifier: bool,
    pub relay_capacity: usize,
    /// Wraps the local blob store, e.g. to inject failures.
    pub wrap_blobs: Option<fn(Arc<dyn BlobStore>) -> Arc<dyn BlobStore>>,
    /// Wraps the in-memory job repository.
    pub wrap_repository: Option<fn(Arc<dyn JobRepository>) -> Arc<dyn JobRepository>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrent_runs: 4,
            failing_notifier: false,
            relay_capacity: 16,
            wrap_blobs: None,
            wrap_repository: None,
        }
    }
}

pub fn sh_converter(script: &str) -> ConverterRunner {
    ConverterRunner::new("sh", vec!["-c".to_string(), script.to_string(), "converter".to_string()])
}

pub async fn harness(script: &str) -> Harness {
    harness_with(sh_converter(script), HarnessOptions::default()).await
}

pub async fn harness_with(runner: ConverterRunner, options: HarnessOptions) -> Harness {
    let workspace_root = tempfile::tempdir().unwrap();
    let blob_root = tempfile::tempdir().unwrap();

    let mut blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blob_root.path()).await.unwrap());
    if let Some(wrap) = options.wrap_blobs {
        blobs = wrap(blobs);
    }
    let mut repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    if let Some(wrap) = options.wrap_repository {
        repository = wrap(repository);
    }
    let jobs = JobStateMachine::new(repository);
    let transport = Arc::new(RecordingTransport::default());
    let relay = Arc::new(ProgressRelay::with_transport(transport.clone()));
    let notifier = Arc::new(RecordingNotifier {
        fail: options.failing_notifier,
        ..RecordingNotifier::default()
    });

    let orchestrator = Orchestrator::new(
        blobs.clone(),
        jobs.clone(),
        runner,
        relay,
        notifier.clone(),
        OrchestratorConfig {
            workspace_root: workspace_root.path().to_path_buf(),
            max_concurrent_runs: options.max_concurrent_runs,
            conversion_timeout: options.timeout,
        },
    );

    Harness {
        orchestrator,
        blobs,
        jobs,
        notifier,
        transport,
        workspace_root,
        blob_root,
        relay_capacity: options.relay_capacity,
    }
}

impl Harness {
    pub async fn submit(&self, name: &str, content: &[u8]) -> ConversionJob {
        let request = SubmitRequest {
            original_name: name.to_string(),
            owner_ref: OWNER.to_string(),
        };
        let mut reader = content;
        self.orchestrator.submit(request, &mut reader).await.unwrap()
    }

    /// Submit, wait for all background work and return the final record.
    pub async fn run(&self, name: &str, content: &[u8]) -> ConversionJob {
        let job = self.submit(name, content).await;
        self.orchestrator.drain().await;
        self.jobs.get(job.id).await.unwrap()
    }

    pub async fn wait_for_status(&self, job_id: Uuid, status: JobStatus) {
        for _ in 0..200 {
            if self.jobs.get(job_id).await.unwrap().status == status {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    pub fn workspace_entries(&self) -> usize {
        count_entries(self.workspace_root.path())
    }

    pub fn object_count(&self) -> usize {
        count_entries(&self.blob_root.path().join("objects"))
    }

    pub async fn read_blob(&self, blob: &BlobRef) -> Vec<u8> {
        let mut reader = self.blobs.get(blob).await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        content
    }

    /// Serve the full router on an ephemeral local port.
    pub async fn spawn_server(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(self.orchestrator.clone(), self.relay_capacity);
        let app = routes::router(state, None, 200 * 1024 * 1024);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

pub fn count_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// Upload a manuscript to the submit endpoint
pub async fn upload_manuscript(
    client: &reqwest::Client,
    base_url: &str,
    file_name: &str,
    content: Vec<u8>,
    owner: Option<&str>,
) -> Result<reqwest::Response, reqwest::Error> {
    let form = multipart::Form::new().part("file", multipart::Part::bytes(content).file_name(file_name.to_string()));

    let mut request = client.post(format!("{base_url}/api/v1/jobs")).multipart(form);
    if let Some(owner) = owner {
        request = request.header(OWNER_HEADER, owner);
    }
    request.send().await
}

/// Poll job status until completed or failed (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobView, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 10; // Poll every 100ms

    for _ in 0..max_attempts {
        let response = client
            .get(format!("{base_url}/api/v1/jobs/{job_id}"))
            .header(OWNER_HEADER, OWNER)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {error_text}").into());
        }

        let view = response.json::<JobView>().await?;
        if view.status.is_terminal() {
            return Ok(view);
        }
        sleep(Duration::from_millis(100)).await;
    }

    Err(format!("Job did not finish within {timeout_secs} seconds").into())
}
