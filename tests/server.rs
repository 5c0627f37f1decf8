//! HTTP service tests against a live server with in-process collaborators.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use report_chat::chain::ChatPipeline;
use report_chat::llm::{ChatModel, TokenStream};
use report_chat::retriever::Retriever;
use report_chat::server::{build_router, AppState};
use report_chat::tracer::{RetryPolicy, RunStart, TraceClient, TraceError};
use report_chat_core::chunk::chunk_segment;
use report_chat_core::citation::ReportCatalog;
use report_chat_core::models::{ReportMetadata, RetrievedDocument, Segment};
use report_chat_core::prompt::ChatMessage;

struct EchoModel;

#[async_trait]
impl ChatModel for EchoModel {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
        Ok(stream::iter(vec![Ok("Rents ".to_string()), Ok("rose.".to_string())]).boxed())
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok("standalone question".into())
    }
}

struct FixedRetriever {
    fail: bool,
}

#[async_trait]
impl Retriever for FixedRetriever {
    async fn retrieve(&self, _question: &str) -> Result<Vec<RetrievedDocument>> {
        if self.fail {
            anyhow::bail!("vector store unavailable");
        }
        let docs = [("reports/outlook.pdf", 2, "Rents rose"), ("reports/outlook.pdf", 2, "again")]
            .iter()
            .enumerate()
            .map(|(rank, (file, page, text))| RetrievedDocument {
                chunk: chunk_segment(&Segment::new(*file, *page, *text), 1000, 50).remove(0),
                rank,
                score: 0.9,
            })
            .collect();
        Ok(docs)
    }
}

/// Run is never readable; share link creation always works.
#[derive(Default)]
struct MockTracer {
    reads: AtomicUsize,
    shares: AtomicUsize,
    feedback: Mutex<Vec<Value>>,
    updates: Mutex<Vec<(String, Option<Value>, Option<String>)>>,
}

#[async_trait]
impl TraceClient for MockTracer {
    async fn create_run(&self, _run: &RunStart) -> Result<(), TraceError> {
        Ok(())
    }
    async fn end_run(&self, _: Uuid, _: Option<Value>, _: Option<String>) -> Result<(), TraceError> {
        Ok(())
    }
    async fn create_feedback(&self, feedback: &Value) -> Result<Value, TraceError> {
        self.feedback.lock().unwrap().push(feedback.clone());
        Ok(json!({"id": "fb-1"}))
    }
    async fn update_feedback(
        &self,
        feedback_id: &str,
        score: Option<Value>,
        comment: Option<String>,
    ) -> Result<(), TraceError> {
        self.updates
            .lock()
            .unwrap()
            .push((feedback_id.to_string(), score, comment));
        Ok(())
    }
    async fn read_run(&self, run_id: &str) -> Result<Value, TraceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(TraceError::NotFound(run_id.to_string()))
    }
    async fn read_shared_link(&self, _run_id: &str) -> Result<Option<String>, TraceError> {
        Ok(None)
    }
    async fn share_run(&self, run_id: &str) -> Result<String, TraceError> {
        self.shares.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://smith.example/public/{}/r", run_id))
    }
}

struct TestServer {
    base: String,
    tracer: Arc<MockTracer>,
    client: reqwest::Client,
}

async fn start(retrieval_fails: bool) -> TestServer {
    let tracer = Arc::new(MockTracer::default());
    let catalog = ReportCatalog::from_entries(
        vec![ReportMetadata {
            file: "outlook.pdf".into(),
            name: Some("Housing Outlook".into()),
            author: Some("CMHC".into()),
            date_published: Some("2023-05-01".into()),
        }],
        "reports/",
    );
    let pipeline = ChatPipeline::new(
        Arc::new(EchoModel),
        Arc::new(FixedRetriever { fail: retrieval_fails }),
        Arc::new(catalog),
        tracer.clone(),
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
        tracer: tracer.clone(),
        trace_retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        tracer,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn test_ping() {
    let srv = start(false).await;
    let resp = srv
        .client
        .get(format!("{}/ping", srv.base))
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"ping": "pong!"}));
}

#[tokio::test]
async fn test_chat_streams_ndjson() {
    let srv = start(false).await;
    let resp = srv
        .client
        .post(format!("{}/chat", srv.base))
        .json(&json!({
            "message": "And rents?",
            "history": [{"human": "How is supply?", "ai": "Growing."}],
            "conversation_id": "conv-1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );

    let text = resp.text().await.unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);

    let sources = lines[0]["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0]["source"], "reports/outlook.pdf_2");
    assert_eq!(sources[0]["name"], "Housing Outlook");
    assert_eq!(sources[0]["date_published"], "2023-05-01");

    assert_eq!(lines[1], json!({"tok": "Rents "}));
    assert_eq!(lines[2], json!({"tok": "rose."}));
    let run_id = lines[3]["run_id"].as_str().unwrap();
    assert!(Uuid::parse_str(run_id).is_ok());
}

#[tokio::test]
async fn test_chat_failure_before_stream_is_5xx() {
    let srv = start(true).await;
    let resp = srv
        .client
        .post(format!("{}/chat", srv.base))
        .json(&json!({"message": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "internal");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("retrieval failed"));
}

#[tokio::test]
async fn test_feedback_requires_run_id() {
    let srv = start(false).await;
    let resp = srv
        .client
        .post(format!("{}/feedback", srv.base))
        .json(&json!({"score": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"result": "No LangSmith run ID provided", "code": 400}));
    assert!(srv.tracer.feedback.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_feedback_defaults_key() {
    let srv = start(false).await;
    let resp = srv
        .client
        .post(format!("{}/feedback", srv.base))
        .json(&json!({"run_id": "run-1", "score": 1, "feedback_id": "fb-9"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"result": "posted feedback successfully", "code": 200}));

    let sent = srv.tracer.feedback.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["key"], "user_score");
    assert_eq!(sent[0]["run_id"], "run-1");
}

#[tokio::test]
async fn test_patch_feedback() {
    let srv = start(false).await;
    let resp = srv
        .client
        .patch(format!("{}/feedback", srv.base))
        .json(&json!({"score": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "No feedback ID provided");
    assert!(srv.tracer.updates.lock().unwrap().is_empty());

    let resp = srv
        .client
        .patch(format!("{}/feedback", srv.base))
        .json(&json!({"feedback_id": "fb-1", "score": 0, "comment": "wrong year"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "patched feedback successfully");
    assert_eq!(
        *srv.tracer.updates.lock().unwrap(),
        vec![("fb-1".to_string(), Some(json!(0)), Some("wrong year".to_string()))]
    );
}

#[tokio::test]
async fn test_get_trace_bounded_retry_then_shares() {
    let srv = start(false).await;
    let resp = srv
        .client
        .post(format!("{}/get_trace", srv.base))
        .json(&json!({"run_id": "run-42"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let url: String = resp.json().await.unwrap();
    assert_eq!(url, "https://smith.example/public/run-42/r");
    assert_eq!(srv.tracer.reads.load(Ordering::SeqCst), 5);
    assert_eq!(srv.tracer.shares.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_trace_requires_run_id() {
    let srv = start(false).await;
    let resp = srv
        .client
        .post(format!("{}/get_trace", srv.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 400);
    assert_eq!(srv.tracer.reads.load(Ordering::SeqCst), 0);
}
