//! Chunk similarity search over SQLite.
//!
//! Vectors live in `chunk_vectors` as little-endian f32 blobs. Queries load
//! every vector of one PDF and rank them by cosine similarity in Rust; PDFs
//! are small enough that a brute-force scan beats maintaining an ANN index.
//! Keyword search goes through the `chunks_fts` FTS5 table.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{Chunk, SourceDocument};
use crate::traits::{KeywordIndex, VectorIndex};

#[derive(Clone)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>], model: &str) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chunk_vectors (chunk_id, pdf_id, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.pdf_id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, pdf_id: &str, vector: &[f32], k: usize) -> Result<Vec<SourceDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding, c.chunk_index, c.text
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.pdf_id = ?
            "#,
        )
        .bind(pdf_id)
        .fetch_all(&self.pool)
        .await?;

        let mut docs: Vec<SourceDocument> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                SourceDocument {
                    chunk_id: row.get("chunk_id"),
                    pdf_id: pdf_id.to_string(),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        docs.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        docs.truncate(k);
        Ok(docs)
    }
}

#[async_trait]
impl KeywordIndex for SqliteVectorIndex {
    async fn search(&self, pdf_id: &str, query: &str, k: usize) -> Result<Vec<SourceDocument>> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id, chunks_fts.rank, c.chunk_index, c.text
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ? AND chunks_fts.pdf_id = ?
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(pdf_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SourceDocument {
                    chunk_id: row.get("chunk_id"),
                    pdf_id: pdf_id.to_string(),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    // bm25 rank is lower-is-better
                    score: -rank as f32,
                }
            })
            .collect())
    }
}

/// Turns free text into an FTS5 expression matching any of its words.
/// Returns `None` when nothing searchable remains.
fn fts_match_expr(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Little-endian f32 bytes, as stored in `chunk_vectors.embedding`.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, na, nb), (x, y)| {
            (d + x * y, na + x * x, nb + y * y)
        });
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use crate::models::Pdf;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    #[test]
    fn test_blob_preserves_values() {
        let vector = vec![1.0f32, -2.5, 3.125, 0.0];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    async fn setup() -> (SqliteStore, SqliteVectorIndex, Vec<Chunk>, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let store = SqliteStore::new(pool.clone());

        let text = "Rust ownership rules.\n\nTokio runs async tasks.\n\nSQLite stores rows.";
        let chunks = crate::chunk::chunk_text("p1", text, 30, 0);
        store
            .insert_pdf(
                &Pdf {
                    id: "p1".to_string(),
                    name: "notes.pdf".to_string(),
                    created_at: 0,
                },
                &chunks,
            )
            .await
            .unwrap();

        (store, SqliteVectorIndex::new(pool), chunks, dir)
    }

    #[test]
    fn test_fts_match_expr() {
        assert_eq!(
            fts_match_expr("What does Tokio do?").as_deref(),
            Some("\"what\" OR \"does\" OR \"tokio\" OR \"do\"")
        );
        assert_eq!(fts_match_expr("? ! a"), None);
    }

    #[tokio::test]
    async fn test_vector_query_ranks_by_similarity() {
        let (_store, index, chunks, _dir) = setup().await;
        assert_eq!(chunks.len(), 3);

        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]];
        index.add(&chunks, &vectors, "test-model").await.unwrap();

        let hits = index.query("p1", &[0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_index, 1);
        assert_eq!(hits[1].chunk_index, 2);

        assert!(index.query("other", &[0.0, 1.0], 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_mismatched_lengths() {
        let (_store, index, chunks, _dir) = setup().await;
        assert!(index.add(&chunks, &[vec![1.0]], "m").await.is_err());
    }

    #[tokio::test]
    async fn test_keyword_search_filters_by_pdf() {
        let (_store, index, _chunks, _dir) = setup().await;
        let hits = index.search("p1", "how are async tasks run?", 4).await.unwrap();
        assert_eq!(hits[0].text, "Tokio runs async tasks.");
        assert!(index.search("p2", "tokio", 4).await.unwrap().is_empty());
    }
}
