//! HTTP service for the report chat pipeline.
//!
//! # Endpoints
//!
//! | Method  | Path         | Description |
//! |---------|--------------|-------------|
//! | `POST`  | `/chat`      | Stream an answer as newline-delimited JSON |
//! | `POST`  | `/feedback`  | Record feedback for a run |
//! | `PATCH` | `/feedback`  | Update previously recorded feedback |
//! | `GET`   | `/ping`      | Liveness probe |
//! | `POST`  | `/get_trace` | Shareable URL for a run's trace |
//!
//! Each `/chat` response line is one of:
//!
//! ```json
//! {"sources": [{"source": "...", "file": "...", "name": "...", "author": "...", "date_published": "..."}]}
//! {"tok": "..."}
//! {"run_id": "..."}
//! ```
//!
//! # Error Contract
//!
//! A missing required field is a 400 with the same envelope as successful
//! feedback calls:
//!
//! ```json
//! { "result": "No LangSmith run ID provided", "code": 400 }
//! ```
//!
//! Other failures carry a machine-readable code:
//!
//! ```json
//! { "error": { "code": "internal", "message": "retrieval failed: ..." } }
//! ```
//!
//! Codes: `not_found` (404), `upstream_error` (502), `tracing_disabled` (503),
//! `internal` (500). Failures before a chat stream has started are 5xx; a
//! failure after the first line ends the stream after the last complete line.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted, and all headers are
//! exposed, so browser front-ends can call the service directly.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use report_chat_core::models::{ChatHistory, ConversationTurn};

use crate::chain::{ChatPipeline, PipelineError};
use crate::config::Config;
use crate::tracer::{self, RetryPolicy, TraceClient, TraceError};

const DEFAULT_FEEDBACK_KEY: &str = "user_score";

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub tracer: Arc<dyn TraceClient>,
    pub trace_retry: RetryPolicy,
}

impl AppState {
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pipeline = ChatPipeline::from_config(config).await?;
        let tracer = pipeline.tracer();
        Ok(Self {
            pipeline: Arc::new(pipeline),
            tracer,
            trace_retry: RetryPolicy::from_config(&config.tracing),
        })
    }
}

/// All routes with CORS applied.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/feedback", post(handle_send_feedback).patch(handle_update_feedback))
        .route("/ping", get(handle_ping))
        .route("/get_trace", post(handle_get_trace))
        .layer(cors)
        .with_state(state)
}

/// `report-chat serve`: bind to `[server].bind` and serve until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "report chat server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// `{result, code}` body used for feedback results and missing-field errors.
#[derive(Serialize)]
struct ResultBody {
    result: String,
    code: u16,
}

/// JSON error body for failures of the service or its collaborators.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

enum AppError {
    /// A required request field is absent. Answered with a `{result, code}` body.
    MissingField(&'static str),
    Failed {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::MissingField(_) => StatusCode::BAD_REQUEST,
            AppError::Failed { status, .. } => *status,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::MissingField(message) => {
                let body = ResultBody {
                    result: message.to_string(),
                    code: status.as_u16(),
                };
                (status, Json(body)).into_response()
            }
            AppError::Failed { code, message, .. } => {
                let body = ErrorBody {
                    error: ErrorDetail {
                        code: code.to_string(),
                        message,
                    },
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

impl From<TraceError> for AppError {
    fn from(e: TraceError) -> Self {
        let (status, code) = match &e {
            TraceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            TraceError::Disabled => (StatusCode::SERVICE_UNAVAILABLE, "tracing_disabled"),
            TraceError::Transient(_) | TraceError::Api { .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
        };
        tracing::warn!(error = %e, "tracing request failed");
        AppError::Failed {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        AppError::Failed {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: e.to_string(),
        }
    }
}

fn ok(message: &str) -> Json<ResultBody> {
    Json(ResultBody {
        result: message.to_string(),
        code: 200,
    })
}

/// A present, non-null field of a JSON object body.
fn field<'a>(body: &'a Value, name: &str) -> Option<&'a Value> {
    body.get(name).filter(|v| !v.is_null())
}

// ============ POST /chat ============

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// One exchange as sent by the front-end; either side may be absent.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub human: Option<String>,
    #[serde(default)]
    pub ai: Option<String>,
}

/// Flatten exchanges into turns, human before ai within an exchange.
pub fn history_turns(entries: Vec<HistoryEntry>) -> ChatHistory {
    let mut turns = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        if let Some(h) = entry.human {
            turns.push(ConversationTurn::Human(h));
        }
        if let Some(a) = entry.ai {
            turns.push(ConversationTurn::Ai(a));
        }
    }
    turns
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let history = history_turns(req.history.unwrap_or_default());
    let stream = state
        .pipeline
        .stream_chat(&req.message, history, req.conversation_id)
        .await?;
    tracing::info!(run_id = %stream.run_id, "chat stream started");

    let lines = ReceiverStream::new(stream.events).filter_map(|event| {
        match serde_json::to_string(&event) {
            Ok(mut line) => {
                line.push('\n');
                Some(Ok::<_, Infallible>(line))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode chat event");
                None
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

// ============ /feedback ============

async fn handle_send_feedback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ResultBody>, AppError> {
    if field(&body, "run_id").is_none() {
        return Err(AppError::MissingField("No LangSmith run ID provided"));
    }

    let mut feedback = match body {
        Value::Object(map) => map,
        _ => return Err(AppError::MissingField("No LangSmith run ID provided")),
    };
    if !feedback.get("key").is_some_and(|k| !k.is_null()) {
        feedback.insert("key".into(), json!(DEFAULT_FEEDBACK_KEY));
    }

    state.tracer.create_feedback(&Value::Object(feedback)).await?;
    Ok(ok("posted feedback successfully"))
}

async fn handle_update_feedback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ResultBody>, AppError> {
    let feedback_id = match field(&body, "feedback_id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => return Err(AppError::MissingField("No feedback ID provided")),
    };
    let score = field(&body, "score").cloned();
    let comment = field(&body, "comment").map(|c| match c {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    state
        .tracer
        .update_feedback(&feedback_id, score, comment)
        .await?;
    Ok(ok("patched feedback successfully"))
}

// ============ GET /ping ============

async fn handle_ping() -> Json<Value> {
    Json(json!({ "ping": "pong!" }))
}

// ============ POST /get_trace ============

async fn handle_get_trace(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<String>, AppError> {
    let run_id = match field(&body, "run_id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => return Err(AppError::MissingField("No LangSmith run ID provided")),
    };

    let url = tracer::get_trace_url(state.tracer.as_ref(), &run_id, &state.trace_retry).await?;
    Ok(Json(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_turns_keeps_exchange_order() {
        let entries: Vec<HistoryEntry> = serde_json::from_value(json!([
            {"human": "q1", "ai": "a1"},
            {"human": "q2"},
            {"ai": "orphan"}
        ]))
        .unwrap();
        assert_eq!(
            history_turns(entries),
            vec![
                ConversationTurn::Human("q1".into()),
                ConversationTurn::Ai("a1".into()),
                ConversationTurn::Human("q2".into()),
                ConversationTurn::Ai("orphan".into()),
            ]
        );
    }

    #[test]
    fn test_chat_request_optional_fields() {
        let req: ChatRequest = serde_json::from_value(json!({"message": "hi", "history": null})).unwrap();
        assert!(req.history.is_none());
        assert!(req.conversation_id.is_none());
    }

    #[test]
    fn test_trace_error_status_mapping() {
        assert_eq!(AppError::from(TraceError::Disabled).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            AppError::from(TraceError::Api {
                status: 403,
                message: "forbidden".into()
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(AppError::MissingField("x").status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_status_matches_variant() {
        let missing = AppError::MissingField("No feedback ID provided").into_response();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let not_found = AppError::from(TraceError::NotFound("r1".into())).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    }
}
