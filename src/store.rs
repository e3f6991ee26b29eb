//! SQLite-backed records: PDFs, conversations, messages and chunks.
//!
//! [`SqliteStore`] is the production implementation of [`MessageStore`] and
//! [`ComponentRegistry`]. It also owns the plain CRUD used by the HTTP
//! handlers and the CLI.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::{Chunk, ComponentType, Conversation, Message, Pdf, Role};
use crate::traits::{ComponentRegistry, MessageStore};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ PDFs ============

    /// Stores a PDF record together with its chunks in one transaction.
    /// Chunks are also added to the keyword index.
    pub async fn insert_pdf(&self, pdf: &Pdf, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO pdfs (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&pdf.id)
            .bind(&pdf.name)
            .bind(pdf.created_at)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, pdf_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.pdf_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, pdf_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.pdf_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::debug!(pdf_id = %pdf.id, chunks = chunks.len(), "stored pdf");
        Ok(())
    }

    /// Removes a PDF with its chunks and vectors. Used to undo a partial upload.
    pub async fn delete_pdf(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM chunk_vectors WHERE pdf_id = ?",
            "DELETE FROM chunks_fts WHERE pdf_id = ?",
            "DELETE FROM chunks WHERE pdf_id = ?",
            "DELETE FROM pdfs WHERE id = ?",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!(pdf_id = %id, "deleted pdf");
        Ok(())
    }

    pub async fn get_pdf(&self, id: &str) -> Result<Option<Pdf>> {
        let row = sqlx::query("SELECT id, name, created_at FROM pdfs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(pdf_from_row))
    }

    pub async fn list_pdfs(&self) -> Result<Vec<Pdf>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM pdfs ORDER BY created_at DESC, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(pdf_from_row).collect())
    }

    pub async fn chunk_count(&self, pdf_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE pdf_id = ?")
            .bind(pdf_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ============ Conversations ============

    /// Opens a new conversation about an existing PDF.
    pub async fn create_conversation(&self, pdf_id: &str) -> Result<Conversation> {
        if self.get_pdf(pdf_id).await?.is_none() {
            bail!("pdf not found: {}", pdf_id);
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            pdf_id: pdf_id.to_string(),
            retriever: None,
            llm: None,
            memory: None,
            created_at: chrono::Utc::now().timestamp(),
        };

        sqlx::query("INSERT INTO conversations (id, pdf_id, created_at) VALUES (?, ?, ?)")
            .bind(&conversation.id)
            .bind(&conversation.pdf_id)
            .bind(conversation.created_at)
            .execute(&self.pool)
            .await?;

        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, pdf_id, retriever, llm, memory, created_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    pub async fn list_conversations(&self, pdf_id: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pdf_id, retriever, llm, memory, created_at
            FROM conversations
            WHERE pdf_id = ?
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(pdf_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(conversation_from_row).collect())
    }
}

fn pdf_from_row(row: &SqliteRow) -> Pdf {
    Pdf {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn conversation_from_row(row: &SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        pdf_id: row.get("pdf_id"),
        retriever: row.get("retriever"),
        llm: row.get("llm"),
        memory: row.get("memory"),
        created_at: row.get("created_at"),
    }
}

impl SqliteStore {
    /// Appends one question and its answer, in that order. Either both are
    /// stored or neither is.
    pub async fn append_exchange(&self, conversation_id: &str, question: &str, answer: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_message(&mut tx, &new_message(conversation_id, Role::Human, question)).await?;
        insert_message(&mut tx, &new_message(conversation_id, Role::Ai, answer)).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn new_message(conversation_id: &str, role: Role, content: &str) -> Message {
    Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        created_at: chrono::Utc::now().timestamp(),
    }
}

async fn insert_message(conn: &mut SqliteConnection, message: &Message) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, conversation_id: &str, role: Role, content: &str) -> Result<Message> {
        let message = new_message(conversation_id, role, content);
        let mut conn = self.pool.acquire().await?;
        insert_message(&mut conn, &message).await?;
        Ok(message)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(Message {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    role: Role::parse(&role)?,
                    content: row.get("content"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ComponentRegistry for SqliteStore {
    async fn get_previous_choice(
        &self,
        conversation_id: &str,
        component: ComponentType,
    ) -> Result<Option<String>> {
        // Column names come from a closed enum, never from input.
        let sql = format!(
            "SELECT {} FROM conversations WHERE id = ?",
            component.as_str()
        );
        let choice = sqlx::query_scalar::<_, Option<String>>(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(choice.flatten())
    }

    async fn set_choice(
        &self,
        conversation_id: &str,
        llm: &str,
        retriever: &str,
        memory: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversations SET llm = ?, retriever = ?, memory = ? WHERE id = ?",
        )
        .bind(llm)
        .bind(retriever)
        .bind(memory)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("conversation not found: {}", conversation_id);
        }
        Ok(())
    }
}
