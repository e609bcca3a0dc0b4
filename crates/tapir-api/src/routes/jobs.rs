//! UWS job lifecycle endpoints

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use chrono::{DateTime, SecondsFormat, Utc};
use tapir_core::{Error, JobHandle, JobPhase, PhaseWait};
use tokio_util::io::ReaderStream;

use crate::params::TapRequest;
use crate::response::Dispatch;
use crate::state::AppState;
use crate::uws_xml;

/// Parameter names that steer the request instead of the job
const CONTROL_NAMES: &[&str] = &["PHASE", "ACTION", "WAIT"];

async fn fetch_job(
    state: &AppState,
    headers: &HeaderMap,
    job_list: &str,
    job_id: &str,
) -> Result<Arc<JobHandle>, Error> {
    let caller = state.service.identify(headers);
    state
        .service
        .get_job(job_list, job_id, caller.as_deref())
        .await
}

fn job_url(job_list: &str, job_id: &str) -> String {
    format!("/{}/{}", job_list, job_id)
}

/// GET /{jobList}: jobs visible to the caller
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(job_list): Path<String>,
    headers: HeaderMap,
) -> Dispatch {
    let caller = state.service.identify(&headers);
    let jobs = state.service.list_jobs(&job_list, caller.as_deref()).await;
    Dispatch::xml(uws_xml::job_list_document(&job_list, &jobs))
}

/// POST /{jobList}: create a job, 303 to it
pub async fn create_job(
    State(state): State<AppState>,
    Path(job_list): Path<String>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let caller = state.service.identify(&headers);
    match state.service.create_job(&job_list, caller, &params).await {
        Ok(job) => Dispatch::Redirect(job_url(&job_list, job.id())),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}: full job description
pub async fn get_job(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => Dispatch::xml(uws_xml::job_document(&job.snapshot().await)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// POST /{jobList}/{id}: ACTION=DELETE destroys, PHASE steers
pub async fn post_job(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    if let Some(action) = params.get("ACTION") {
        if action.eq_ignore_ascii_case("DELETE") {
            return destroy(&state, &headers, &job_list, &job_id).await;
        }
        return Dispatch::Fail(Error::validation(format!(
            "Unsupported ACTION value: {}",
            action
        )));
    }
    if params.get("PHASE").is_some() {
        return post_phase(
            State(state),
            Path((job_list, job_id)),
            headers,
            TapRequest(params),
        )
        .await;
    }
    Dispatch::Fail(Error::validation(
        "POST to a job needs ACTION or PHASE".to_string(),
    ))
}

/// DELETE /{jobList}/{id}
pub async fn delete_job(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    destroy(&state, &headers, &job_list, &job_id).await
}

async fn destroy(state: &AppState, headers: &HeaderMap, job_list: &str, job_id: &str) -> Dispatch {
    let caller = state.service.identify(headers);
    match state
        .service
        .destroy_job(job_list, job_id, caller.as_deref())
        .await
    {
        // Destroying an absent job is a no-op; either way, back to the list
        Ok(_) => Dispatch::Redirect(format!("/{}", job_list)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/phase, blocking when WAIT is given
pub async fn get_phase(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };

    if let Some(raw) = params.get("WAIT") {
        let wait: i64 = match raw.trim().parse() {
            Ok(wait) => wait,
            Err(_) => {
                return Dispatch::Fail(Error::validation(format!(
                    "WAIT is not an integer: {}",
                    raw
                )))
            }
        };
        // The client may pin the phase it is waiting to leave
        let from = params
            .get("PHASE")
            .and_then(JobPhase::parse)
            .unwrap_or_else(|| job.phase());

        match state.service.await_phase(&job, from, wait).await {
            PhaseWait::Destroyed => {
                return Dispatch::Fail(Error::not_found(format!(
                    "Job {} was destroyed while waiting",
                    job_id
                )))
            }
            PhaseWait::Changed(_) | PhaseWait::TimedOut(_) => {}
        }
    }

    Dispatch::text(job.phase().as_str().to_string())
}

/// POST /{jobList}/{id}/phase with PHASE=RUN|ABORT
pub async fn post_phase(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };

    let phase = match params.get("PHASE") {
        Some(phase) => phase.to_string(),
        None => return Dispatch::Fail(Error::validation("Missing PHASE value".to_string())),
    };

    let outcome = if phase.eq_ignore_ascii_case("RUN") {
        state.service.run_job(&job).await
    } else if phase.eq_ignore_ascii_case("ABORT") {
        state.service.abort_job(&job).await
    } else {
        Err(Error::validation(format!(
            "PHASE must be RUN or ABORT, got {}",
            phase
        )))
    };

    match outcome {
        Ok(()) => Dispatch::Redirect(job_url(&job_list, &job_id)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/executionduration
pub async fn get_execution_duration(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => Dispatch::text(job.read().await.execution_duration.to_string()),
        Err(e) => Dispatch::Fail(e),
    }
}

/// POST /{jobList}/{id}/executionduration
pub async fn post_execution_duration(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };
    let seconds: u64 = match params.get("EXECUTIONDURATION").map(str::trim) {
        Some(raw) => match raw.parse() {
            Ok(seconds) => seconds,
            Err(_) => {
                return Dispatch::Fail(Error::validation(format!(
                    "EXECUTIONDURATION is not a valid duration: {}",
                    raw
                )))
            }
        },
        None => {
            return Dispatch::Fail(Error::validation(
                "Missing EXECUTIONDURATION value".to_string(),
            ))
        }
    };

    match state.service.set_execution_duration(&job, seconds).await {
        Ok(_) => Dispatch::Redirect(job_url(&job_list, &job_id)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/destruction
pub async fn get_destruction(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => {
            let when = job.read().await.destruction_time;
            Dispatch::text(when.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        Err(e) => Dispatch::Fail(e),
    }
}

/// POST /{jobList}/{id}/destruction
pub async fn post_destruction(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };
    let when = match params.get("DESTRUCTION").map(str::trim) {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(when) => when.with_timezone(&Utc),
            Err(_) => {
                return Dispatch::Fail(Error::validation(format!(
                    "DESTRUCTION is not an ISO-8601 time: {}",
                    raw
                )))
            }
        },
        None => return Dispatch::Fail(Error::validation("Missing DESTRUCTION value".to_string())),
    };

    match state.service.set_destruction_time(&job, when).await {
        Ok(()) => Dispatch::Redirect(job_url(&job_list, &job_id)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/quote
pub async fn get_quote(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => {
            let quote = job.read().await.quote;
            Dispatch::text(
                quote
                    .map(|q| q.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            )
        }
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/owner
pub async fn get_owner(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => Dispatch::text(job.read().await.owner.clone().unwrap_or_default()),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/parameters
pub async fn get_parameters(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => Dispatch::xml(uws_xml::parameters_document(&job.read().await.params)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// POST /{jobList}/{id}/parameters: one write per posted pair
pub async fn post_parameters(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };

    for (name, value) in params.pairs() {
        if CONTROL_NAMES.iter().any(|c| name.eq_ignore_ascii_case(c)) {
            continue;
        }
        if let Err(e) = state.service.update_parameter(&job, name, value).await {
            return Dispatch::Fail(e);
        }
    }
    Dispatch::Redirect(job_url(&job_list, &job_id))
}

/// GET /{jobList}/{id}/parameters/{name}
pub async fn get_parameter(
    State(state): State<AppState>,
    Path((job_list, job_id, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };
    let dispatch = match job.read().await.params.lookup(&name) {
        Some(value) => Dispatch::text(value),
        None => Dispatch::Fail(Error::not_found(format!(
            "Job {} has no parameter {}",
            job_id, name
        ))),
    };
    dispatch
}

/// POST /{jobList}/{id}/parameters/{name} with VALUE=...
pub async fn post_parameter(
    State(state): State<AppState>,
    Path((job_list, job_id, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    TapRequest(params): TapRequest,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };
    let value = match params.get("VALUE").or_else(|| params.get(&name)) {
        Some(value) => value.to_string(),
        None => return Dispatch::Fail(Error::validation("Missing VALUE".to_string())),
    };
    match state.service.update_parameter(&job, &name, &value).await {
        Ok(()) => Dispatch::Redirect(format!("{}/parameters", job_url(&job_list, &job_id))),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/results
pub async fn get_results(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => Dispatch::xml(uws_xml::results_document(&job.snapshot().await)),
        Err(e) => Dispatch::Fail(e),
    }
}

/// GET /{jobList}/{id}/results/{resultId}: stream the persisted file
pub async fn get_result(
    State(state): State<AppState>,
    Path((job_list, job_id, result_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };

    let result = {
        let snapshot = job.snapshot().await;
        snapshot.results.iter().find(|r| r.id == result_id).cloned()
    };
    let result = match result {
        Some(result) => result,
        None => {
            return Dispatch::Fail(Error::not_found(format!(
                "Job {} has no result {}",
                job_id, result_id
            )))
        }
    };
    let path = match &result.file {
        Some(path) => path.clone(),
        None => {
            return Dispatch::Fail(Error::not_found(format!(
                "Result {} has no stored body",
                result_id
            )))
        }
    };

    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let stream = ReaderStream::new(file);
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::OK;
            if let Ok(value) = HeaderValue::from_str(&result.mime_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            Dispatch::Ok(response)
        }
        Err(e) => Dispatch::Fail(Error::not_found(format!(
            "Result body of job {} is gone: {}",
            job_id, e
        ))),
    }
}

/// GET /{jobList}/{id}/error: the error document
pub async fn get_error(
    State(state): State<AppState>,
    Path((job_list, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Dispatch {
    let job = match fetch_job(&state, &headers, &job_list, &job_id).await {
        Ok(job) => job,
        Err(e) => return Dispatch::Fail(e),
    };
    let dispatch = match job.read().await.error_summary.clone() {
        Some(summary) => Dispatch::xml(uws_xml::error_document(&summary.message)),
        None => Dispatch::Fail(Error::not_found(format!(
            "Job {} has no error",
            job_id
        ))),
    };
    dispatch
}
