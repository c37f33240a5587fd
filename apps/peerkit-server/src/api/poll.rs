//! `GET /requestResource`: the REQUEST path for clients without a socket.

use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::AppState;

const MAX_CALLBACK_LEN: usize = 128;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PollParams {
    /// `None` when neither `urls` nor `urls[]` was present.
    pub(crate) urls: Option<Vec<String>>,
    pub(crate) callback: Option<String>,
}

impl PollParams {
    pub(crate) fn parse(query: &str) -> Self {
        let mut params = PollParams::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "urls" | "urls[]" => params
                    .urls
                    .get_or_insert_with(Vec::new)
                    .push(value.into_owned()),
                "callback" if params.callback.is_none() => {
                    params.callback = Some(value.into_owned())
                }
                _ => {}
            }
        }
        params
    }
}

/// Dotted JavaScript identifier path such as `cb` or `jQuery.handlers.cb1`.
pub(crate) fn is_valid_callback(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CALLBACK_LEN {
        return false;
    }
    name.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => chars
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
            _ => false,
        }
    })
}

pub(crate) async fn request_resource(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Response {
    let PollParams { urls, callback } = PollParams::parse(query.as_deref().unwrap_or(""));
    let Some(urls) = urls else {
        return (StatusCode::BAD_REQUEST, "need array").into_response();
    };
    if let Some(name) = &callback {
        if !is_valid_callback(name) {
            debug!(callback = %name, "rejecting poll with invalid callback");
            return (StatusCode::BAD_REQUEST, "invalid callback").into_response();
        }
    }

    let response = match state.hub().poll(urls).await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "poll request failed");
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };

    match callback {
        None => Json(response).into_response(),
        Some(name) => match serde_json::to_string(&response) {
            Ok(body) => (
                [(header::CONTENT_TYPE, "application/javascript")],
                format!("{name}({body});"),
            )
                .into_response(),
            Err(err) => {
                warn!(%err, "failed to encode poll response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}
