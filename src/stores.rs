//! Backend selection for the vector store and the record store.

use anyhow::{bail, Result};
use std::sync::Arc;

use report_chat_core::store::{RecordManager, VectorStore};

use crate::config::Config;
use crate::record_sqlite::SqliteRecordManager;
use crate::vector_sqlite::SqliteVectorStore;
use crate::vector_weaviate::WeaviateVectorStore;

/// Open the vector store named by `vector_store.provider`.
pub async fn open_vector_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.provider.as_str() {
        "sqlite" => Ok(Arc::new(
            SqliteVectorStore::open(&config.vector_store.path).await?,
        )),
        "weaviate" => {
            let store = WeaviateVectorStore::new(&config.vector_store)?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        other => bail!("Unknown vector store provider: {}", other),
    }
}

pub async fn open_record_manager(config: &Config) -> Result<Arc<dyn RecordManager>> {
    Ok(Arc::new(
        SqliteRecordManager::connect(&config.record_store.url).await?,
    ))
}
