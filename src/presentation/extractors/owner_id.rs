// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

static HEADER_NAME: &str = "x-owner-id";

/// 请求方身份，取自 `X-Owner-Id` 请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerId(pub String);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(HEADER_NAME)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match owner {
            Some(owner) => Ok(OwnerId(owner.to_string())),
            None => {
                let body = Json(json!({ "error": "Missing or invalid X-Owner-Id header" }));
                Err((StatusCode::BAD_REQUEST, body).into_response())
            }
        }
    }
}
