use anyhow::{anyhow, bail};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::Retriever;

/// Nearest-neighbour search over a pgvector table of `(content text, embedding vector)` rows.
pub struct PgVectorRetriever {
    pool: PgPool,
    table: String,
    embedder: Arc<Mutex<TextEmbedding>>,
}

impl PgVectorRetriever {
    pub async fn connect(database_url: &str, table: &str) -> anyhow::Result<Self> {
        if !is_identifier(table) {
            bail!("invalid knowledge table name: {table:?}");
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Model loading touches disk and may download weights
        let embedder = tokio::task::spawn_blocking(|| {
            TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::BGESmallZHV15).with_show_download_progress(false),
            )
        })
        .await??;

        info!(%table, "Knowledge retriever ready");

        Ok(Self {
            pool,
            table: table.to_string(),
            embedder: Arc::new(Mutex::new(embedder)),
        })
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let input = text.to_owned();
        let embedder = Arc::clone(&self.embedder);

        let embedding = tokio::task::spawn_blocking(move || {
            let mut model = embedder
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            let embeddings = model.embed(vec![input], None)?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding model returned no vectors"))
        })
        .await??;

        debug!(dimensions = embedding.len(), "Query embedded");
        Ok(embedding)
    }
}

#[async_trait]
impl Retriever for PgVectorRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> anyhow::Result<Vec<String>> {
        let embedding = self.embed(query).await?;

        let sql = format!(
            "SELECT content FROM {} ORDER BY embedding <-> {}::vector LIMIT $1",
            self.table,
            vector_literal(&embedding)
        );

        let limit = i64::try_from(k)?;
        let rows = sqlx::query_as::<_, (String,)>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!("knowledge query failed: {e}"))?;

        info!(requested = k, returned = rows.len(), "Retrieved knowledge passages");
        Ok(rows.into_iter().map(|(content,)| content).collect())
    }
}

/// pgvector text form, e.g. `'[0.1,0.2]'`
fn vector_literal(embedding: &[f32]) -> String {
    let values = embedding
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("'[{values}]'")
}

fn is_identifier(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    match (parts.next(), parts.next(), parts.next()) {
        (Some(table), None, None) => valid_part(table),
        (Some(schema), Some(table), None) => valid_part(schema) && valid_part(table),
        _ => false,
    }
}
