//! Top-k retrieval over the vector store.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use report_chat_core::embedding::EmbeddingProvider;
use report_chat_core::models::RetrievedDocument;
use report_chat_core::store::VectorStore;

#[async_trait]
pub trait Retriever: Send + Sync {
    /// At most `k` documents, most similar first. An empty index yields an
    /// empty list, not an error.
    async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedDocument>>;
}

/// Embeds the question and asks the vector store for its nearest chunks.
pub struct VectorRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    k: usize,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>, k: usize) -> Self {
        Self { embedder, store, k }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedDocument>> {
        let query_vec = self.embedder.embed_query(question).await?;
        let docs = self.store.similarity_search(&query_vec, self.k).await?;
        tracing::debug!(k = self.k, hits = docs.len(), "retrieved documents");
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use report_chat_core::chunk::chunk_segment;
    use report_chat_core::models::Segment;
    use report_chat_core::store::memory::InMemoryVectorStore;

    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keyword"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("rent") { 1.0 } else { 0.0 },
                        if t.contains("starts") { 1.0 } else { 0.0 },
                    ]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_retrieves_top_k_in_similarity_order() {
        let store = Arc::new(InMemoryVectorStore::new());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder);
        for (page, text) in ["Average rent rose", "Housing starts fell", "Rent and starts"]
            .iter()
            .enumerate()
        {
            let chunks = chunk_segment(&Segment::new("reports/r.pdf", page as i64, *text), 1000, 50);
            let vecs = embedder
                .embed(&chunks.iter().map(|c| c.content.clone()).collect::<Vec<_>>())
                .await
                .unwrap();
            store.add_chunks(&chunks, &vecs).await.unwrap();
        }

        let retriever = VectorRetriever::new(embedder, store, 2);
        let docs = retriever.retrieve("what is the rent?").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].chunk.content, "Average rent rose");
        assert!(docs[0].score >= docs[1].score);
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let retriever = VectorRetriever::new(
            Arc::new(KeywordEmbedder),
            Arc::new(InMemoryVectorStore::new()),
            8,
        );
        assert!(retriever.retrieve("anything").await.unwrap().is_empty());
    }
}
