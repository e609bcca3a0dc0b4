//! Synchronous query endpoint

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::params::TapRequest;
use crate::response::Dispatch;
use crate::state::AppState;

/// GET/POST /sync: run the query inside the request, body is the result
pub async fn sync_query(
    State(state): State<AppState>,
    TapRequest(params): TapRequest,
) -> Dispatch {
    // REQUEST=getCapabilities is answered by the capabilities resource
    if params
        .get("REQUEST")
        .map(|r| r.eq_ignore_ascii_case("getCapabilities"))
        .unwrap_or(false)
    {
        return Dispatch::Redirect("/capabilities".to_string());
    }

    let stream = match state.service.execute_sync(&params).await {
        Ok(stream) => stream,
        Err(e) => return Dispatch::Fail(e),
    };

    let head = futures::stream::iter(
        stream
            .first_chunk
            .into_iter()
            .map(Ok::<Vec<u8>, Infallible>),
    );
    let tail = ReceiverStream::new(stream.rest).map(Ok::<Vec<u8>, Infallible>);
    let body = Body::from_stream(head.chain(tail));

    let mut response = body.into_response();
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&stream.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Dispatch::Ok(response)
}
