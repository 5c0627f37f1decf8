//! The conversational pipeline: rewrite → retrieve → synthesize → stream.
//!
//! [`ChatPipeline::stream_chat`] runs every stage that can fail before any
//! output exists (rewrite, retrieval, opening the model stream) and returns
//! a receiver of [`ChatEvent`]s. A spawned producer then forwards the sources
//! and the model's tokens, and finishes with the run id. Dropping the
//! receiver stops the producer, which drops the model stream with it.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use report_chat_core::citation::{collect_sources, ReportCatalog};
use report_chat_core::models::{ChatHistory, ConversationTurn, RetrievedDocument, SourceInfo};
use report_chat_core::prompt::{answer_messages, rephrase_messages, ABSTENTION_PHRASE};
use report_chat_core::run::{Run, RunState};

use crate::config::Config;
use crate::llm::{self, ChatModel, TokenStream};
use crate::retriever::{Retriever, VectorRetriever};
use crate::tracer::{self, RunStart, TraceClient};
use crate::{embedding, reports, stores};

const EVENT_BUFFER: usize = 64;
const RUN_NAME: &str = "ChatPipeline";

/// One line of the chat response stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChatEvent {
    #[serde(rename = "sources")]
    Sources(Vec<SourceInfo>),
    #[serde(rename = "tok")]
    Token(String),
    #[serde(rename = "run_id")]
    RunId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("query rewrite failed: {0:#}")]
    Rewrite(anyhow::Error),
    #[error("retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),
    #[error("answer synthesis failed: {0:#}")]
    Synthesis(anyhow::Error),
}

/// Output of a fully collected run.
#[derive(Debug, Clone)]
pub struct Answer {
    pub run_id: Uuid,
    pub answer: String,
    pub sources: Vec<SourceInfo>,
}

/// A started run: its id and the stream of events to forward.
pub struct ChatStream {
    pub run_id: Uuid,
    pub events: mpsc::Receiver<ChatEvent>,
}

pub struct ChatPipeline {
    llm: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    catalog: Arc<ReportCatalog>,
    tracer: Arc<dyn TraceClient>,
}

impl ChatPipeline {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        catalog: Arc<ReportCatalog>,
        tracer: Arc<dyn TraceClient>,
    ) -> Self {
        Self {
            llm,
            retriever,
            catalog,
            tracer,
        }
    }

    /// Wire the configured store, embedder, model, catalog, and tracer.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let vectors = stores::open_vector_store(config).await?;
        let embedder = embedding::create_provider(&config.embedding)?;
        let retriever = Arc::new(VectorRetriever::new(embedder, vectors, config.retrieval.k));
        let llm = llm::create_chat_model(&config.llm)?;
        let catalog = Arc::new(reports::load_catalog(&config.reports)?);
        let tracer = tracer::create_trace_client(&config.tracing)?;
        Ok(Self::new(llm, retriever, catalog, tracer))
    }

    pub fn tracer(&self) -> Arc<dyn TraceClient> {
        Arc::clone(&self.tracer)
    }

    /// Condense a follow-up into a standalone question. With no history the
    /// question is returned as is and the model is not called.
    pub async fn rewrite(&self, question: &str, history: &[ConversationTurn]) -> anyhow::Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }
        self.llm.complete(&rephrase_messages(question, history)).await
    }

    pub async fn retrieve(&self, question: &str) -> anyhow::Result<Vec<RetrievedDocument>> {
        self.retriever.retrieve(question).await
    }

    /// Start a run. Errors returned here happen before any event is produced.
    pub async fn stream_chat(
        &self,
        question: &str,
        history: ChatHistory,
        conversation_id: Option<String>,
    ) -> Result<ChatStream, PipelineError> {
        let mut run = Run::new(conversation_id);
        self.record_start(&run, question, &history).await;

        let standalone = if history.is_empty() {
            question.to_string()
        } else {
            step(&mut run, RunState::Rewriting);
            match self.rewrite(question, &history).await {
                Ok(q) => q,
                Err(e) => return Err(self.abort(run, PipelineError::Rewrite(e)).await),
            }
        };
        tracing::debug!(run_id = %run.id, question = %standalone, "standalone question");

        step(&mut run, RunState::Retrieving);
        let docs = match self.retrieve(&standalone).await {
            Ok(docs) => docs,
            Err(e) => return Err(self.abort(run, PipelineError::Retrieval(e)).await),
        };

        step(&mut run, RunState::Synthesizing);
        let collected = collect_sources(&docs, &self.catalog);
        for file in &collected.missing {
            tracing::warn!(run_id = %run.id, file = %file, "no metadata for retrieved report; citation skipped");
        }

        let tokens: TokenStream = if docs.is_empty() {
            tracing::info!(run_id = %run.id, "no documents retrieved; abstaining");
            stream::once(async { Ok(ABSTENTION_PHRASE.to_string()) }).boxed()
        } else {
            let messages = answer_messages(&standalone, &docs, &history);
            match self.llm.stream(&messages).await {
                Ok(tokens) => tokens,
                Err(e) => return Err(self.abort(run, PipelineError::Synthesis(e)).await),
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let run_id = run.id;
        let tracer = Arc::clone(&self.tracer);
        tokio::spawn(produce(run, collected.sources, tokens, tx, tracer));

        Ok(ChatStream { run_id, events: rx })
    }

    /// Run to completion and collect the answer. Used by the CLI.
    pub async fn answer(&self, question: &str, history: ChatHistory) -> Result<Answer, PipelineError> {
        let ChatStream { run_id, mut events } = self.stream_chat(question, history, None).await?;

        let mut answer = String::new();
        let mut sources = Vec::new();
        let mut finished = false;
        while let Some(event) = events.recv().await {
            match event {
                ChatEvent::Sources(s) => sources = s,
                ChatEvent::Token(t) => answer.push_str(&t),
                ChatEvent::RunId(_) => finished = true,
            }
        }
        if !finished {
            return Err(PipelineError::Synthesis(anyhow::anyhow!(
                "answer stream ended before completion"
            )));
        }
        Ok(Answer {
            run_id,
            answer,
            sources,
        })
    }

    async fn record_start(&self, run: &Run, question: &str, history: &[ConversationTurn]) {
        let start = RunStart {
            id: run.id,
            name: RUN_NAME.to_string(),
            inputs: json!({ "question": question, "chat_history": history }),
            conversation_id: run.conversation_id.clone(),
            start_time: chrono::Utc::now(),
        };
        if let Err(e) = self.tracer.create_run(&start).await {
            tracing::warn!(run_id = %run.id, error = %e, "failed to record run start");
        }
    }

    async fn abort(&self, mut run: Run, err: PipelineError) -> PipelineError {
        tracing::error!(run_id = %run.id, error = %err, "run failed");
        run.fail(err.to_string());
        record_end(self.tracer.as_ref(), &run, None).await;
        err
    }
}

async fn produce(
    mut run: Run,
    sources: Vec<SourceInfo>,
    mut tokens: TokenStream,
    tx: mpsc::Sender<ChatEvent>,
    tracer: Arc<dyn TraceClient>,
) {
    step(&mut run, RunState::Streaming);
    let mut answer = String::new();

    if !sources.is_empty() && tx.send(ChatEvent::Sources(sources.clone())).await.is_err() {
        run.fail("client disconnected");
    }

    while !run.state().is_terminal() {
        tokio::select! {
            _ = tx.closed() => run.fail("client disconnected"),
            next = tokens.next() => match next {
                Some(Ok(tok)) => {
                    answer.push_str(&tok);
                    if tx.send(ChatEvent::Token(tok)).await.is_err() {
                        run.fail("client disconnected");
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(run_id = %run.id, error = %format!("{:#}", e), "model stream failed");
                    run.fail(format!("{:#}", e));
                }
                None => {
                    let _ = tx.send(ChatEvent::RunId(run.id.to_string())).await;
                    step(&mut run, RunState::Done);
                }
            },
        }
    }
    drop(tokens);

    match run.state() {
        RunState::Done => tracing::info!(run_id = %run.id, chars = answer.len(), "run finished"),
        _ => tracing::info!(run_id = %run.id, reason = run.error().unwrap_or(""), "run ended early"),
    }
    let outputs = json!({ "output": answer, "sources": sources });
    record_end(tracer.as_ref(), &run, Some(outputs)).await;
}

async fn record_end(tracer: &dyn TraceClient, run: &Run, outputs: Option<serde_json::Value>) {
    let error = run.error().map(str::to_string);
    let outputs = if error.is_some() { None } else { outputs };
    if let Err(e) = tracer.end_run(run.id, outputs, error).await {
        tracing::warn!(run_id = %run.id, error = %e, "failed to record run end");
    }
}

fn step(run: &mut Run, next: RunState) {
    if let Err(e) = run.advance(next) {
        tracing::error!(run_id = %run.id, error = %e, "run state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::TraceError;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use report_chat_core::chunk::chunk_segment;
    use report_chat_core::models::{ReportMetadata, Segment};
    use report_chat_core::prompt::ChatMessage;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedModel {
        tokens: Vec<&'static str>,
        fail_after: Option<usize>,
        endless: bool,
        completion: String,
        stream_calls: AtomicUsize,
        complete_calls: AtomicUsize,
        last_messages: Mutex<Vec<ChatMessage>>,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            let flag = DropFlag(Arc::clone(&self.dropped));
            if self.endless {
                return Ok(stream::unfold(flag, |flag| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok("x".to_string()), flag))
                })
                .boxed());
            }
            let mut items: Vec<Result<String>> =
                self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(anyhow::anyhow!("connection reset")));
            }
            Ok(stream::iter(items)
                .map(move |item| {
                    let _keep = &flag;
                    item
                })
                .boxed())
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            Ok(self.completion.clone())
        }
    }

    struct FixedRetriever {
        docs: Vec<RetrievedDocument>,
        fail: bool,
        queries: Mutex<Vec<String>>,
    }

    impl FixedRetriever {
        fn new(docs: Vec<RetrievedDocument>) -> Self {
            Self {
                docs,
                fail: false,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedDocument>> {
            self.queries.lock().unwrap().push(question.to_string());
            if self.fail {
                bail!("vector store unavailable");
            }
            Ok(self.docs.clone())
        }
    }

    #[derive(Default)]
    struct RecordingTracer {
        started: AtomicUsize,
        ended: Mutex<Vec<(Uuid, Option<String>)>>,
    }

    #[async_trait]
    impl TraceClient for RecordingTracer {
        async fn create_run(&self, _run: &RunStart) -> Result<(), TraceError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn end_run(&self, id: Uuid, _: Option<Value>, error: Option<String>) -> Result<(), TraceError> {
            self.ended.lock().unwrap().push((id, error));
            Ok(())
        }
        async fn create_feedback(&self, _: &Value) -> Result<Value, TraceError> {
            Err(TraceError::Disabled)
        }
        async fn update_feedback(&self, _: &str, _: Option<Value>, _: Option<String>) -> Result<(), TraceError> {
            Err(TraceError::Disabled)
        }
        async fn read_run(&self, _: &str) -> Result<Value, TraceError> {
            Err(TraceError::Disabled)
        }
        async fn read_shared_link(&self, _: &str) -> Result<Option<String>, TraceError> {
            Err(TraceError::Disabled)
        }
        async fn share_run(&self, _: &str) -> Result<String, TraceError> {
            Err(TraceError::Disabled)
        }
    }

    fn doc(file: &str, page: i64, text: &str, rank: usize) -> RetrievedDocument {
        RetrievedDocument {
            chunk: chunk_segment(&Segment::new(file, page, text), 1000, 50).remove(0),
            rank,
            score: 1.0 - rank as f64 * 0.1,
        }
    }

    fn catalog() -> Arc<ReportCatalog> {
        Arc::new(ReportCatalog::from_entries(
            vec![ReportMetadata {
                file: "outlook.pdf".into(),
                name: Some("Housing Outlook".into()),
                author: Some("CMHC".into()),
                date_published: Some("2023".into()),
            }],
            "reports/",
        ))
    }

    fn pipeline(
        model: Arc<ScriptedModel>,
        retriever: Arc<FixedRetriever>,
        tracer: Arc<RecordingTracer>,
    ) -> ChatPipeline {
        ChatPipeline::new(model, retriever, catalog(), tracer)
    }

    async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_event_serialization() {
        assert_eq!(
            serde_json::to_string(&ChatEvent::Token("Hi".into())).unwrap(),
            r#"{"tok":"Hi"}"#
        );
        assert_eq!(
            serde_json::to_string(&ChatEvent::RunId("abc".into())).unwrap(),
            r#"{"run_id":"abc"}"#
        );
        let sources = ChatEvent::Sources(vec![SourceInfo {
            source: "outlook.pdf_0".into(),
            file: "reports/outlook.pdf".into(),
            name: Some("Housing Outlook".into()),
            author: None,
            date_published: None,
        }]);
        let v: Value = serde_json::to_value(&sources).unwrap();
        assert_eq!(v["sources"][0]["file"], "reports/outlook.pdf");
        assert!(v["sources"][0]["author"].is_null());
    }

    #[tokio::test]
    async fn test_rewrite_without_history_is_identity() {
        let model = Arc::new(ScriptedModel::default());
        let p = pipeline(
            Arc::clone(&model),
            Arc::new(FixedRetriever::new(vec![])),
            Arc::new(RecordingTracer::default()),
        );
        let q = "What is the vacancy rate in Toronto?";
        assert_eq!(p.rewrite(q, &[]).await.unwrap(), q);
        assert_eq!(model.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rewrite_with_history_calls_model_once() {
        let model = Arc::new(ScriptedModel {
            completion: "What is the vacancy rate in Montreal?".into(),
            ..Default::default()
        });
        let p = pipeline(
            Arc::clone(&model),
            Arc::new(FixedRetriever::new(vec![])),
            Arc::new(RecordingTracer::default()),
        );
        let history = vec![
            ConversationTurn::Human("What is the vacancy rate in Toronto?".into()),
            ConversationTurn::Ai("It was 1.4%.".into()),
        ];
        let out = p.rewrite("And in Montreal?", &history).await.unwrap();
        assert_eq!(out, "What is the vacancy rate in Montreal?");
        assert_eq!(model.complete_calls.load(Ordering::SeqCst), 1);

        let prompt = model.last_messages.lock().unwrap()[0].content.clone();
        assert!(prompt.contains("Human: What is the vacancy rate in Toronto?"));
        assert!(prompt.contains("AI: It was 1.4%."));
        assert!(prompt.contains("And in Montreal?"));
    }

    #[tokio::test]
    async fn test_stream_order_sources_tokens_run_id() {
        let model = Arc::new(ScriptedModel {
            tokens: vec!["Rents ", "rose ", "5%."],
            ..Default::default()
        });
        let docs = vec![
            doc("reports/outlook.pdf", 3, "Rents rose 5%", 0),
            doc("reports/outlook.pdf", 3, "more on rents", 1),
            doc("reports/unknown.pdf", 1, "stray", 2),
        ];
        let tracer = Arc::new(RecordingTracer::default());
        let p = pipeline(
            Arc::clone(&model),
            Arc::new(FixedRetriever::new(docs)),
            Arc::clone(&tracer),
        );

        let stream = p.stream_chat("How did rents change?", vec![], None).await.unwrap();
        let run_id = stream.run_id;
        let events = drain(stream.events).await;

        assert_eq!(events.len(), 5);
        match &events[0] {
            ChatEvent::Sources(s) => {
                assert_eq!(s.len(), 1);
                assert_eq!(s[0].source, "reports/outlook.pdf_3");
                assert_eq!(s[0].name.as_deref(), Some("Housing Outlook"));
            }
            other => panic!("expected sources first, got {:?}", other),
        }
        assert_eq!(events[1], ChatEvent::Token("Rents ".into()));
        assert_eq!(events[3], ChatEvent::Token("5%.".into()));
        assert_eq!(events[4], ChatEvent::RunId(run_id.to_string()));

        let system = model.last_messages.lock().unwrap()[0].content.clone();
        assert!(system.contains("<doc id='0'>Rents rose 5%</doc>"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracer.started.load(Ordering::SeqCst), 1);
        assert_eq!(*tracer.ended.lock().unwrap(), vec![(run_id, None)]);
    }

    #[tokio::test]
    async fn test_no_documents_abstains_without_model_call() {
        let model = Arc::new(ScriptedModel::default());
        let p = pipeline(
            Arc::clone(&model),
            Arc::new(FixedRetriever::new(vec![])),
            Arc::new(RecordingTracer::default()),
        );
        let stream = p.stream_chat("Anything?", vec![], None).await.unwrap();
        let events = drain(stream.events).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ChatEvent::Token(ABSTENTION_PHRASE.into()));
        assert!(matches!(events[1], ChatEvent::RunId(_)));
        assert_eq!(model.stream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_follow_up_retrieves_with_rewritten_question() {
        let model = Arc::new(ScriptedModel {
            tokens: vec!["ok"],
            completion: "standalone?".into(),
            ..Default::default()
        });
        let retriever = Arc::new(FixedRetriever::new(vec![doc("reports/outlook.pdf", 0, "x", 0)]));
        let p = pipeline(
            Arc::clone(&model),
            Arc::clone(&retriever),
            Arc::new(RecordingTracer::default()),
        );
        let history = vec![ConversationTurn::Human("first".into())];
        let answer = p.answer("follow up", history).await.unwrap();

        assert_eq!(answer.answer, "ok");
        assert_eq!(*retriever.queries.lock().unwrap(), vec!["standalone?".to_string()]);
        let messages = model.last_messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "first");
        assert_eq!(messages[2].content, "standalone?");
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_reported_before_streaming() {
        let mut retriever = FixedRetriever::new(vec![]);
        retriever.fail = true;
        let tracer = Arc::new(RecordingTracer::default());
        let p = pipeline(
            Arc::new(ScriptedModel::default()),
            Arc::new(retriever),
            Arc::clone(&tracer),
        );
        let err = p.stream_chat("q", vec![], None).await.err().unwrap();
        assert!(matches!(err, PipelineError::Retrieval(_)));

        let ended = tracer.ended.lock().unwrap();
        assert_eq!(ended.len(), 1);
        assert!(ended[0].1.as_deref().unwrap().contains("vector store unavailable"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_stream_without_run_id() {
        let model = Arc::new(ScriptedModel {
            tokens: vec!["a", "b", "c"],
            fail_after: Some(1),
            ..Default::default()
        });
        let p = pipeline(
            model,
            Arc::new(FixedRetriever::new(vec![doc("reports/outlook.pdf", 0, "x", 0)])),
            Arc::new(RecordingTracer::default()),
        );
        let stream = p.stream_chat("q", vec![], None).await.unwrap();
        let events = drain(stream.events).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ChatEvent::Token("a".into()));

        let p2 = pipeline(
            Arc::new(ScriptedModel {
                tokens: vec!["a"],
                fail_after: Some(0),
                ..Default::default()
            }),
            Arc::new(FixedRetriever::new(vec![doc("reports/outlook.pdf", 0, "x", 0)])),
            Arc::new(RecordingTracer::default()),
        );
        assert!(matches!(
            p2.answer("q", vec![]).await,
            Err(PipelineError::Synthesis(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_model_stream() {
        let model = Arc::new(ScriptedModel {
            endless: true,
            ..Default::default()
        });
        let tracer = Arc::new(RecordingTracer::default());
        let p = pipeline(
            Arc::clone(&model),
            Arc::new(FixedRetriever::new(vec![doc("reports/outlook.pdf", 0, "x", 0)])),
            Arc::clone(&tracer),
        );
        let mut stream = p.stream_chat("q", vec![], None).await.unwrap();
        let _ = stream.events.recv().await;
        let _ = stream.events.recv().await;
        drop(stream);

        let released = tokio::time::timeout(Duration::from_secs(2), async {
            while !model.dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "model stream was not dropped");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let ended = tracer.ended.lock().unwrap();
        assert_eq!(ended[0].1.as_deref(), Some("client disconnected"));
    }
}
