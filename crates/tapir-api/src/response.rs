//! Dispatch outcomes
//!
//! Handlers return an explicit outcome instead of signalling redirects
//! through errors: a served response, a 303 to another resource, or a
//! fault mapped to its HTTP status with a VOTable error document.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tapir_core::Error;

use crate::uws_xml;

pub enum Dispatch {
    Ok(Response),
    Redirect(String),
    Fail(Error),
}

impl Dispatch {
    pub fn xml(body: String) -> Self {
        Dispatch::Ok(xml_response(body))
    }

    pub fn text(body: String) -> Self {
        Dispatch::Ok(
            (
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                body,
            )
                .into_response(),
        )
    }
}

impl From<Error> for Dispatch {
    fn from(error: Error) -> Self {
        Dispatch::Fail(error)
    }
}

impl IntoResponse for Dispatch {
    fn into_response(self) -> Response {
        match self {
            Dispatch::Ok(response) => response,
            Dispatch::Redirect(location) => {
                let mut response = StatusCode::SEE_OTHER.into_response();
                if let Ok(value) = HeaderValue::from_str(&location) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
                response
            }
            Dispatch::Fail(error) => fail_response(&error),
        }
    }
}

pub fn xml_response(body: String) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        body,
    )
        .into_response()
}

pub fn fail_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("Request failed ({}): {}", error.category(), error);
    } else {
        tracing::debug!("Request rejected ({}): {}", error.category(), error);
    }
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        uws_xml::error_document(&error.to_string()),
    )
        .into_response()
}

/// Extractor rejections reuse the same error mapping
#[derive(Debug)]
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        fail_response(&self.0)
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}
