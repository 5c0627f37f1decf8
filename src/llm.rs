//! Chat model abstraction and implementations.
//!
//! [`ChatModel`] is the seam between the conversational pipeline and a
//! language model. [`OpenAIChatModel`] calls `POST {base_url}/chat/completions`;
//! streaming responses arrive as server-sent events and are decoded
//! incrementally by [`SseDecoder`], so tokens reach the caller as soon as
//! the model produces them. Dropping a [`TokenStream`] drops the underlying
//! HTTP body and releases the connection.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;

use report_chat_core::prompt::ChatMessage;

use crate::config::LlmConfig;
use crate::openai;

/// Ordered token fragments produced by a model.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Open a token stream. Errors returned here happen before any token.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// Full completion text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut tokens = self.stream(messages).await?;
        let mut out = String::new();
        while let Some(tok) = tokens.next().await {
            out.push_str(&tok?);
        }
        Ok(out)
    }
}

/// A model that refuses every call.
pub struct DisabledChatModel;

#[async_trait]
impl ChatModel for DisabledChatModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn stream(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
        bail!("LLM provider is disabled")
    }
}

pub struct OpenAIChatModel {
    model: String,
    temperature: f32,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    streaming_client: reqwest::Client,
}

impl OpenAIChatModel {
    /// Create a model client using `OPENAI_API_KEY` from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Self::with_api_key(config, openai::api_key_from_env()?)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: openai::build_client(config.timeout_secs)?,
            streaming_client: openai::build_streaming_client(config.timeout_secs)?,
        })
    }

    fn body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        })
    }
}

const MAX_RETRIES: u32 = 2;

#[async_trait]
impl ChatModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = openai::post_with_retry(
            &self.streaming_client,
            &url,
            &self.api_key,
            &self.body(messages, true),
            MAX_RETRIES,
        )
        .await?;
        Ok(sse_token_stream(response.bytes_stream()))
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = openai::post_with_retry(
            &self.client,
            &url,
            &self.api_key,
            &self.body(messages, false),
            MAX_RETRIES,
        )
        .await?;
        let json: serde_json::Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))
    }
}

/// Create the [`ChatModel`] named by `config.provider`.
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatModel)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Incremental decoder for OpenAI chat-completion server-sent events.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so
/// only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed bytes; returns the content fragments of every complete event.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(bytes);
        let mut tokens = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.decode_line(&line, &mut tokens)?;
        }
        Ok(tokens)
    }

    /// Decode a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.decode_line(&line, &mut tokens)?;
        }
        Ok(tokens)
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, raw: &[u8], tokens: &mut Vec<String>) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let line = std::str::from_utf8(raw)?.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let json: serde_json::Value = serde_json::from_str(data)?;
        if let Some(err) = json.get("error") {
            bail!("OpenAI stream error: {}", err);
        }
        if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
            if !content.is_empty() {
                tokens.push(content.to_string());
            }
        }
        Ok(())
    }
}

struct SseState<S> {
    body: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn an SSE byte stream into a [`TokenStream`].
///
/// The stream ends after `[DONE]`, at end of body, or after yielding the
/// first error.
pub fn sse_token_stream<S, B, E>(body: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(tok) = st.pending.pop_front() {
                return Some((Ok(tok), st));
            }
            if st.finished {
                return None;
            }

            let decoded = match st.body.next().await {
                Some(Ok(bytes)) => st.decoder.push(bytes.as_ref()),
                Some(Err(e)) => Err(anyhow::Error::new(e)),
                None => {
                    st.finished = true;
                    st.decoder.finish()
                }
            };

            match decoded {
                Ok(tokens) => {
                    st.pending.extend(tokens);
                    if st.decoder.is_done() {
                        st.finished = true;
                    }
                }
                Err(e) => {
                    st.finished = true;
                    st.pending.clear();
                    return Some((Err(e), st));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    fn body_of(parts: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        stream::iter(parts.into_iter().map(Ok))
    }

    async fn collect(s: TokenStream) -> Vec<Result<String>> {
        s.collect().await
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut dec = SseDecoder::default();
        let full = format!("{}{}data: [DONE]\n\n", event("Hel"), event("lo"));
        let (a, b) = full.as_bytes().split_at(17);
        let mut tokens = dec.push(a).unwrap();
        tokens.extend(dec.push(b).unwrap());
        assert_eq!(tokens, vec!["Hel", "lo"]);
        assert!(dec.is_done());
    }

    #[test]
    fn test_decoder_handles_split_utf8() {
        let mut dec = SseDecoder::default();
        let full = event("café");
        let bytes = full.as_bytes();
        let cut = full.find('é').unwrap() + 1;
        assert!(dec.push(&bytes[..cut]).unwrap().is_empty());
        assert_eq!(dec.push(&bytes[cut..]).unwrap(), vec!["café"]);
    }

    #[test]
    fn test_decoder_ignores_role_only_deltas_and_comments() {
        let mut dec = SseDecoder::default();
        let role = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n: keep-alive\n\n";
        assert!(dec.push(role.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_decoder_surfaces_stream_errors() {
        let mut dec = SseDecoder::default();
        let err = "data: {\"error\":{\"message\":\"overloaded\"}}\n";
        assert!(dec.push(err.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_token_stream_in_order_and_stops_at_done() {
        let parts = vec![
            event("The").into_bytes(),
            event(" rate").into_bytes(),
            b"data: [DONE]\n\n".to_vec(),
            event("ignored").into_bytes(),
        ];
        let toks: Vec<String> = collect(sse_token_stream(body_of(parts)))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(toks, vec!["The", " rate"]);
    }

    #[tokio::test]
    async fn test_token_stream_flushes_unterminated_tail() {
        let tail = event("end");
        let parts = vec![tail.trim_end().as_bytes().to_vec()];
        let toks = collect(sse_token_stream(body_of(parts))).await;
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].as_ref().unwrap(), "end");
    }

    #[tokio::test]
    async fn test_disabled_model_errors_before_streaming() {
        assert!(DisabledChatModel.stream(&[]).await.is_err());
        assert!(DisabledChatModel.complete(&[]).await.is_err());
    }
}
