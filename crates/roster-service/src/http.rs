//! HTTP API.
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | POST | `/students` | create |
//! | GET | `/students` | list |
//! | DELETE | `/students` | bulk delete |
//! | GET | `/students/{id}` | get |
//! | PUT | `/students/{id}` | update (`If-Match: <version>`) |
//! | DELETE | `/students/{id}` | delete |
//! | GET | `/audits` | audit listing |
//! | GET | `/health` | liveness |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{ETAG, IF_MATCH, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use roster_audit::{AuditEvent, AuditFilter};
use roster_core::{PageRequest, PageToken, StudentId, StudentRecord};
use roster_queue::MessageQueue;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{Result, ServiceError};
use crate::query::AuditQuery;
use crate::service::{RequestContext, StudentService};

/// Correlation header read from requests and echoed on responses.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Record operations.
    pub service: StudentService,
    /// Audit read path.
    pub query: AuditQuery,
    /// Queue, for health reporting.
    pub queue: Arc<dyn MessageQueue<AuditEvent>>,
}

/// Builds the router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/students",
            get(list_students)
                .post(create_student)
                .delete(bulk_delete_students),
        )
        .route(
            "/students/:student_id",
            get(get_student).put(update_student).delete(delete_student),
        )
        .route("/audits", get(list_audit_entries))
        .route("/health", get(health))
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

/// Attaches a [`RequestContext`] and echoes the request id.
async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .map_or_else(|| Uuid::now_v7().to_string(), ToString::to_string);

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    request
        .extensions_mut()
        .insert(RequestContext::new(request_id.clone()));

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ServiceError::invalid("body", e.to_string()))
}

fn parse_id(raw: String) -> Result<StudentId> {
    Ok(StudentId::parse(raw)?)
}

fn query_params<T>(params: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| ServiceError::invalid("query", rejection.body_text()))
}

/// Reads `If-Match`, accepting both `3` and `"3"`.
fn expected_version(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(IF_MATCH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .map(|raw| raw.trim().trim_matches('"'))
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| ServiceError::invalid("If-Match", "must be a record version number"))
}

fn with_etag(record: StudentRecord) -> impl IntoResponse {
    let etag = format!("\"{}\"", record.version);
    ([(ETAG, etag)], Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    limit: Option<usize>,
    next_token: Option<String>,
}

impl ListParams {
    fn page_request(self) -> Result<PageRequest> {
        Ok(PageRequest::new(
            self.limit,
            self.next_token.map(PageToken::new),
        )?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditParams {
    student_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkDeleteRequest {
    student_ids: Vec<String>,
}

async fn create_student(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Response> {
    let record = state.service.create_student(&ctx, parse_body(&body)?).await?;
    let location = format!("/students/{}", record.student_id);
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location)],
        with_etag(record),
    )
        .into_response())
}

async fn list_students(
    State(state): State<AppState>,
    params: std::result::Result<Query<ListParams>, QueryRejection>,
) -> Result<Response> {
    let request = query_params(params)?.page_request()?;
    let page = state.service.list_students(&request).await?;
    Ok(Json(page).into_response())
}

async fn bulk_delete_students(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<Response> {
    let request: BulkDeleteRequest = parse_body(&body)?;
    let report = state
        .service
        .bulk_delete_students(&ctx, request.student_ids)
        .await?;
    Ok(Json(report).into_response())
}

async fn get_student(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
) -> Result<Response> {
    let record = state.service.get_student(&parse_id(student_id)?).await?;
    Ok(with_etag(record).into_response())
}

async fn update_student(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(student_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let student_id = parse_id(student_id)?;
    let expected = expected_version(&headers)?;
    let record = state
        .service
        .update_student(&ctx, &student_id, parse_body(&body)?, expected)
        .await?;
    Ok(with_etag(record).into_response())
}

async fn delete_student(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(student_id): Path<String>,
) -> Result<StatusCode> {
    state
        .service
        .delete_student(&ctx, &parse_id(student_id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_audit_entries(
    State(state): State<AppState>,
    params: std::result::Result<Query<AuditParams>, QueryRejection>,
) -> Result<Response> {
    let params = query_params(params)?;
    let filter = AuditFilter {
        student_id: params.student_id.map(parse_id).transpose()?,
        from_time: params.from,
        to_time: params.to,
    };
    let request = PageRequest::new(params.limit, params.next_token.map(PageToken::new))?;
    let page = state.query.list_audit_entries(&filter, &request).await?;
    Ok(Json(page).into_response())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let emitter = state.service.emitter().stats();
    let queue = match state.queue.depth().await {
        Ok(depth) => json!({
            "visible": depth.visible,
            "inFlight": depth.in_flight,
            "deadLettered": depth.dead_lettered,
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "queue": queue,
        "emitter": emitter,
        "pendingEmissions": state.service.emitter().pending(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_if_match_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(expected_version(&headers).unwrap(), None);

        headers.insert(IF_MATCH, HeaderValue::from_static("3"));
        assert_eq!(expected_version(&headers).unwrap(), Some(3));

        headers.insert(IF_MATCH, HeaderValue::from_static("\"7\""));
        assert_eq!(expected_version(&headers).unwrap(), Some(7));

        headers.insert(IF_MATCH, HeaderValue::from_static("*"));
        assert!(expected_version(&headers).is_err());
    }

    #[test]
    fn test_list_params_bounds() {
        let params = ListParams {
            limit: Some(500),
            next_token: None,
        };
        assert!(matches!(
            params.page_request(),
            Err(ServiceError::Validation(_))
        ));
    }
}
