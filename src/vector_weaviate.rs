//! Weaviate [`VectorStore`] over the REST and GraphQL APIs.
//!
//! Each chunk is one object of the configured class with properties
//! `text`, `source` (the source id), `file`, `page`, `chunk_index` and
//! `hash`, and a client-supplied vector. Object ids are the chunk ids.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | schema | `GET /v1/schema/{class}`, `POST /v1/schema` |
//! | add | `POST /v1/batch/objects` |
//! | delete | `DELETE /v1/batch/objects` with a `where` filter on `source` |
//! | search | `POST /v1/graphql`, `Get` with `nearVector` |
//! | count | `POST /v1/graphql`, `Aggregate { meta { count } }` |
//!
//! `source` and `file` are declared with `field` tokenization, so the
//! `Equal` filter used for deletes matches whole source ids only. Under the
//! default `word` tokenization `reports/market_2.pdf_5` would also match
//! `reports/market_5.pdf_2`. [`WeaviateVectorStore::ensure_schema`] runs
//! before the store is used and refuses a class declared otherwise.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use report_chat_core::models::{Chunk, RetrievedDocument};
use report_chat_core::store::VectorStore;

use crate::config::VectorStoreConfig;

pub struct WeaviateVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    class: String,
}

impl WeaviateVectorStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("vector_store.url required for Weaviate"))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("vector_store.api_key required for Weaviate"))?;
        let class = config.index_name.clone();
        if class.is_empty() || !class.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!(
                "vector_store.index_name '{}' is not a valid Weaviate class name",
                class
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            class,
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("Weaviate {} request failed", what))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Weaviate {} error {}: {}", what, status, body);
        }
        Ok(response.json().await?)
    }

    /// Create the class if it does not exist, or check an existing one.
    pub async fn ensure_schema(&self) -> Result<()> {
        let url = format!("{}/v1/schema/{}", self.base_url, self.class);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Weaviate schema request failed")?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                let url = format!("{}/v1/schema", self.base_url);
                self.send(self.client.post(url).json(&class_schema(&self.class)), "create class")
                    .await?;
                tracing::info!(class = %self.class, "created Weaviate class");
                Ok(())
            }
            status if status.is_success() => {
                let existing: Value = response.json().await?;
                let missing = missing_exact_properties(&existing, &self.class)?;
                for property in missing {
                    let url = format!("{}/v1/schema/{}/properties", self.base_url, self.class);
                    self.send(self.client.post(url).json(&property), "add property")
                        .await?;
                    tracing::info!(class = %self.class, property = %property["name"], "added Weaviate property");
                }
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Weaviate schema error {}: {}", status, body)
            }
        }
    }

    async fn graphql(&self, query: String) -> Result<Value> {
        let url = format!("{}/v1/graphql", self.base_url);
        let value = self
            .send(self.client.post(url).json(&json!({ "query": query })), "graphql")
            .await?;
        if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                bail!("Weaviate graphql error: {}", Value::Array(errors.clone()));
            }
        }
        Ok(value)
    }
}

#[async_trait]
impl VectorStore for WeaviateVectorStore {
    async fn add_chunks(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        if chunks.is_empty() {
            return Ok(());
        }

        let objects: Vec<Value> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, v)| {
                json!({
                    "class": self.class,
                    "id": c.id,
                    "properties": {
                        "text": c.content,
                        "source": c.source_id,
                        "file": c.file,
                        "page": c.page,
                        "chunk_index": c.chunk_index,
                        "hash": c.hash,
                    },
                    "vector": v,
                })
            })
            .collect();

        let url = format!("{}/v1/batch/objects", self.base_url);
        let value = self
            .send(
                self.client.post(url).json(&json!({ "objects": objects })),
                "batch insert",
            )
            .await?;
        check_batch_errors(&value)
    }

    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let operands: Vec<Value> = source_ids
            .iter()
            .map(|sid| json!({ "path": ["source"], "operator": "Equal", "valueText": sid }))
            .collect();
        let filter = if operands.len() == 1 {
            operands.into_iter().next().unwrap_or(Value::Null)
        } else {
            json!({ "operator": "Or", "operands": operands })
        };

        let url = format!("{}/v1/batch/objects", self.base_url);
        let body = json!({
            "match": { "class": self.class, "where": filter },
            "output": "minimal",
        });
        let value = self
            .send(self.client.delete(url).json(&body), "batch delete")
            .await?;
        Ok(value["results"]["successful"]
            .as_u64()
            .or_else(|| value["results"]["matches"].as_u64())
            .unwrap_or(0))
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let vector = serde_json::to_string(query_vec)?;
        let query = format!(
            "{{ Get {{ {class}(nearVector: {{vector: {vector}}}, limit: {k}) {{ text source file page chunk_index hash _additional {{ id distance }} }} }} }}",
            class = self.class,
            vector = vector,
            k = k,
        );
        let value = self.graphql(query).await?;
        parse_search_response(&value, &self.class)
    }

    async fn count(&self) -> Result<u64> {
        let query = format!(
            "{{ Aggregate {{ {class} {{ meta {{ count }} }} }} }}",
            class = self.class
        );
        let value = self.graphql(query).await?;
        Ok(value["data"]["Aggregate"][self.class.as_str()][0]["meta"]["count"]
            .as_u64()
            .unwrap_or(0))
    }
}

const EXACT_PROPERTIES: [&str; 2] = ["source", "file"];

fn text_property(name: &str, tokenization: &str) -> Value {
    json!({ "name": name, "dataType": ["text"], "tokenization": tokenization })
}

fn class_schema(class: &str) -> Value {
    let mut properties: Vec<Value> = EXACT_PROPERTIES
        .iter()
        .map(|name| text_property(name, "field"))
        .collect();
    properties.push(text_property("text", "word"));
    properties.push(text_property("hash", "field"));
    properties.push(json!({ "name": "page", "dataType": ["int"] }));
    properties.push(json!({ "name": "chunk_index", "dataType": ["int"] }));

    json!({
        "class": class,
        "vectorizer": "none",
        "properties": properties,
    })
}

/// Exact-match properties an existing class lacks. Fails when one is
/// declared with a tokenization other than `field`.
fn missing_exact_properties(existing: &Value, class: &str) -> Result<Vec<Value>> {
    let declared = existing["properties"].as_array().cloned().unwrap_or_default();
    let mut missing = Vec::new();
    for name in EXACT_PROPERTIES {
        match declared.iter().find(|p| p["name"].as_str() == Some(name)) {
            None => missing.push(text_property(name, "field")),
            Some(p) => {
                let tokenization = p["tokenization"].as_str().unwrap_or("word");
                if tokenization != "field" {
                    bail!(
                        "Weaviate class {} declares `{}` with {} tokenization; deletes by source id need `field`. Drop the class and re-run `report-chat init`",
                        class,
                        name,
                        tokenization
                    );
                }
            }
        }
    }
    Ok(missing)
}

fn check_batch_errors(value: &Value) -> Result<()> {
    let Some(items) = value.as_array() else {
        return Ok(());
    };
    let errors: Vec<String> = items
        .iter()
        .filter_map(|item| item["result"]["errors"]["error"].as_array())
        .flatten()
        .filter_map(|e| e["message"].as_str().map(String::from))
        .collect();
    if !errors.is_empty() {
        bail!("Weaviate rejected {} objects: {}", errors.len(), errors.join("; "));
    }
    Ok(())
}

fn parse_search_response(value: &Value, class: &str) -> Result<Vec<RetrievedDocument>> {
    let hits = match value["data"]["Get"][class].as_array() {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };

    Ok(hits
        .iter()
        .enumerate()
        .map(|(rank, hit)| {
            let text = |key: &str| hit[key].as_str().unwrap_or_default().to_string();
            let distance = hit["_additional"]["distance"].as_f64().unwrap_or(1.0);
            RetrievedDocument {
                chunk: Chunk {
                    id: hit["_additional"]["id"].as_str().unwrap_or_default().to_string(),
                    source_id: text("source"),
                    file: text("file"),
                    page: hit["page"].as_i64().unwrap_or(0),
                    chunk_index: hit["chunk_index"].as_i64().unwrap_or(0),
                    content: text("text"),
                    hash: text("hash"),
                },
                rank,
                score: 1.0 - distance,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_search_response() {
        let value = json!({
            "data": { "Get": { "ReportChunks": [
                { "text": "a", "source": "r.pdf_0", "file": "r.pdf", "page": 0, "chunk_index": 0,
                  "hash": "h", "_additional": { "id": "id-1", "distance": 0.1 } },
                { "text": "b", "source": "r.pdf_3", "file": "r.pdf", "page": 3, "chunk_index": 1,
                  "hash": "h", "_additional": { "id": "id-2", "distance": 0.4 } }
            ]}}
        });
        let docs = parse_search_response(&value, "ReportChunks").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].chunk.source_id, "r.pdf_0");
        assert_eq!(docs[1].chunk.page, 3);
        assert_eq!(docs[1].rank, 1);
        assert!(docs[0].score > docs[1].score);
    }

    #[test]
    fn test_parse_search_empty() {
        let value = json!({ "data": { "Get": { "ReportChunks": [] } } });
        assert!(parse_search_response(&value, "ReportChunks").unwrap().is_empty());
        assert!(parse_search_response(&json!({}), "ReportChunks").unwrap().is_empty());
    }

    #[test]
    fn test_batch_errors_surface() {
        let ok = json!([{ "result": {} }]);
        assert!(check_batch_errors(&ok).is_ok());

        let bad = json!([{ "result": { "errors": { "error": [{ "message": "vector length mismatch" }] } } }]);
        let err = check_batch_errors(&bad).unwrap_err().to_string();
        assert!(err.contains("vector length mismatch"));
    }

    /// Minimal schema endpoint: serves `existing` (or 404) and records writes.
    async fn schema_server(existing: Option<Value>) -> (WeaviateVectorStore, Arc<Mutex<Vec<Value>>>) {
        use axum::{extract::State, routing::{get, post}, Json, Router};

        type Writes = Arc<Mutex<Vec<Value>>>;
        let writes: Writes = Arc::default();

        let app = Router::new()
            .route(
                "/v1/schema/{class}",
                get(move || {
                    let existing = existing.clone();
                    async move {
                        match existing {
                            Some(v) => (axum::http::StatusCode::OK, Json(v)),
                            None => (axum::http::StatusCode::NOT_FOUND, Json(json!({}))),
                        }
                    }
                }),
            )
            .route(
                "/v1/schema",
                post(|State(w): State<Writes>, Json(body): Json<Value>| async move {
                    w.lock().unwrap().push(body.clone());
                    Json(body)
                }),
            )
            .route(
                "/v1/schema/{class}/properties",
                post(|State(w): State<Writes>, Json(body): Json<Value>| async move {
                    w.lock().unwrap().push(body.clone());
                    Json(body)
                }),
            )
            .with_state(writes.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = VectorStoreConfig {
            provider: "weaviate".into(),
            index_name: "ReportChunks".into(),
            url: Some(format!("http://{}", addr)),
            api_key: Some("k".into()),
            ..VectorStoreConfig::default()
        };
        (WeaviateVectorStore::new(&config).unwrap(), writes)
    }

    fn property<'a>(class: &'a Value, name: &str) -> &'a Value {
        class["properties"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["name"] == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_schema_creates_field_tokenized_source() {
        let (store, writes) = schema_server(None).await;
        store.ensure_schema().await.unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0]["class"], "ReportChunks");
        assert_eq!(writes[0]["vectorizer"], "none");
        assert_eq!(property(&writes[0], "source")["tokenization"], "field");
        assert_eq!(property(&writes[0], "file")["tokenization"], "field");
    }

    #[tokio::test]
    async fn test_ensure_schema_rejects_word_tokenized_source() {
        let existing = json!({
            "class": "ReportChunks",
            "properties": [
                { "name": "source", "dataType": ["text"], "tokenization": "word" },
                { "name": "file", "dataType": ["text"], "tokenization": "field" }
            ]
        });
        let (store, writes) = schema_server(Some(existing)).await;
        let err = store.ensure_schema().await.unwrap_err().to_string();
        assert!(err.contains("`source` with word tokenization"));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_schema_adds_missing_exact_property() {
        let existing = json!({
            "class": "ReportChunks",
            "properties": [{ "name": "source", "dataType": ["text"], "tokenization": "field" }]
        });
        let (store, writes) = schema_server(Some(existing)).await;
        store.ensure_schema().await.unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(*writes, vec![text_property("file", "field")]);
    }

    #[test]
    fn test_rejects_invalid_class_name() {
        let config = VectorStoreConfig {
            provider: "weaviate".into(),
            index_name: "bad name}".into(),
            url: Some("http://localhost:8080".into()),
            api_key: Some("k".into()),
            ..VectorStoreConfig::default()
        };
        assert!(WeaviateVectorStore::new(&config).is_err());
    }
}
