//! Request parameter decoding
//!
//! TAP accepts the same parameter set through the query string, an
//! urlencoded body, or a multipart body (which is also how inline table
//! uploads arrive). Everything is folded into one ordered pair list.

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use tapir_core::{Error, RequestParams};

use crate::response::ApiError;

/// Largest accepted urlencoded body
const MAX_FORM_BYTES: usize = 2 * 1024 * 1024;

pub struct TapRequest(pub RequestParams);

#[async_trait]
impl<S> FromRequest<S> for TapRequest
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();

        if let Some(query) = req.uri().query() {
            pairs.extend(
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| bad_body(format!("Malformed multipart body: {}", e)))?;

            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| bad_body(format!("Malformed multipart part: {}", e)))?
            {
                let name = field.name().unwrap_or_default().to_string();
                if field.file_name().is_some() {
                    let body = field
                        .bytes()
                        .await
                        .map_err(|e| bad_body(format!("Broken file part {}: {}", name, e)))?;
                    files.push((name, body.to_vec()));
                } else {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| bad_body(format!("Broken part {}: {}", name, e)))?;
                    pairs.push((name, text));
                }
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let body = to_bytes(req.into_body(), MAX_FORM_BYTES)
                .await
                .map_err(|e| bad_body(format!("Unreadable request body: {}", e)))?;
            pairs.extend(
                url::form_urlencoded::parse(&body).map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }

        Ok(TapRequest(RequestParams::new(pairs, files)))
    }
}

fn bad_body(message: String) -> ApiError {
    ApiError(Error::validation(message))
}
