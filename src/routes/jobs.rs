use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::Response;
use axum::Json;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::ApiError;
use crate::app_state::AppState;
use crate::models::job::{ConversionJob, JobView};
use crate::models::submission::{
    CancelResponse, DeleteResponse, JobListResponse, SubmitRequest, SubmitResponse,
};

const OWNER_HEADER: &str = "x-owner-id";

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;

/// Identity of the caller, supplied by the auth layer in front of the service.
fn owner_of(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing owner identity"))
}

/// Load a job on behalf of `headers`' owner. Jobs of other owners are 403.
async fn owned_job(state: &AppState, headers: &HeaderMap, job_id: Uuid) -> Result<ConversionJob, ApiError> {
    let owner = owner_of(headers)?;
    let job = state.orchestrator.jobs().get(job_id).await?;
    if job.owner_ref != owner {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Access denied"));
    }
    Ok(job)
}

fn status_event(job: &ConversionJob) -> Result<Event, axum::Error> {
    Event::default().event("status").json_data(JobView::from(job))
}

/// POST /api/v1/jobs — Upload a manuscript for conversion.
///
/// The `file` part is streamed straight into the blob store; the response is
/// sent once the job is recorded, before conversion starts.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let owner_ref = owner_of(&headers)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_string();
        let request = SubmitRequest {
            original_name,
            owner_ref,
        };

        let mut reader = Box::pin(StreamReader::new(field.map_err(std::io::Error::other)));
        let job = state.orchestrator.submit(request, &mut reader).await?;

        return Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                job_id: job.id,
                status: job.status,
                message: "Manuscript uploaded, conversion scheduled".to_string(),
            }),
        ));
    }

    Err(ApiError::new(StatusCode::BAD_REQUEST, "no file uploaded"))
}

/// GET /api/v1/jobs — The caller's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JobListResponse>, ApiError> {
    let owner = owner_of(&headers)?;
    let jobs: Vec<JobView> = state
        .orchestrator
        .jobs()
        .list_by_owner(&owner)
        .await?
        .iter()
        .map(JobView::from)
        .collect();

    Ok(Json(JobListResponse {
        total: jobs.len(),
        jobs,
    }))
}

/// GET /api/v1/jobs/{id} — Current job state.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = owned_job(&state, &headers, job_id).await?;
    Ok(Json(JobView::from(&job)))
}

/// GET /api/v1/jobs/{id}/events — Server-sent progress events.
///
/// Opens with a `status` event carrying the current job view. For unfinished
/// jobs the stream then follows the relay and ends right after the terminal
/// event. A client that falls too far behind is resubscribed and sent a fresh
/// `status` event read from the job store; the stream ends there if the job
/// has finished in the meantime.
pub async fn job_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    // Subscribe before reading so no terminal event falls in between.
    let (subscription, rx) = state
        .orchestrator
        .relay()
        .subscribe_channel(job_id, state.relay_capacity);
    let job = owned_job(&state, &headers, job_id).await?;

    let snapshot = stream::once(future::ready(status_event(&job)));
    if job.status.is_terminal() {
        return Ok(Sse::new(snapshot.boxed()).keep_alive(KeepAlive::default()));
    }

    let orchestrator = state.orchestrator.clone();
    let capacity = state.relay_capacity;
    let live = stream::unfold(Some((subscription, rx)), move |feed| {
        let orchestrator = orchestrator.clone();
        async move {
            let Some((subscription, mut rx)) = feed else {
                return None;
            };
            match rx.recv().await {
                Some(event) => {
                    let kind = event.kind();
                    let sse = Event::default().event(kind.to_string()).json_data(&event);
                    let next = (!kind.is_terminal()).then_some((subscription, rx));
                    Some((sse, next))
                }
                None => {
                    // Closed on lag: resubscribe, then resync from the store.
                    drop(subscription);
                    let resubscribed = orchestrator.relay().subscribe_channel(job_id, capacity);
                    let Ok(job) = orchestrator.jobs().get(job_id).await else {
                        return None;
                    };
                    let next = (!job.status.is_terminal()).then_some(resubscribed);
                    Some((status_event(&job), next))
                }
            }
        }
    });

    Ok(Sse::new(snapshot.chain(live).boxed()).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/jobs/{id}/outputs/{name} — Stream one converted artifact.
pub async fn download_output(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((job_id, name)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    owned_job(&state, &headers, job_id).await?;
    let (artifact, reader) = state.orchestrator.open_output(job_id, &name).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &artifact.content_type)
        .header(header::CONTENT_LENGTH, artifact.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", attachment_name(&artifact.name)),
        )
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// DELETE /api/v1/jobs/{id} — Remove a job and release its blobs.
pub async fn delete_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, ApiError> {
    owned_job(&state, &headers, job_id).await?;
    let releases = state.orchestrator.delete_job(job_id).await?;
    Ok(Json(DeleteResponse { job_id, releases }))
}

/// POST /api/v1/jobs/{id}/cancel — Stop a queued or running conversion.
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let job = owned_job(&state, &headers, job_id).await?;
    if job.status.is_terminal() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("job is already {}", job.status),
        ));
    }

    let cancellation_requested = state.orchestrator.cancel(job_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id,
            cancellation_requested,
        }),
    ))
}

/// Last path segment of an artifact name, restricted to characters that are
/// safe inside a quoted header parameter.
fn attachment_name(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(owner_of(&headers).err().unwrap().status(), StatusCode::UNAUTHORIZED);

        headers.insert(OWNER_HEADER, "".parse().unwrap());
        assert!(owner_of(&headers).is_err());

        headers.insert(OWNER_HEADER, "owner-42".parse().unwrap());
        assert_eq!(owner_of(&headers).unwrap(), "owner-42");
    }

    #[test]
    fn test_attachment_name() {
        assert_eq!(attachment_name("chapters/ch1.xml"), "ch1.xml");
        assert_eq!(attachment_name("my \"book\".json"), "my _book_.json");
        assert_eq!(attachment_name("résumé.xml"), "r_sum_.xml");
    }
}
