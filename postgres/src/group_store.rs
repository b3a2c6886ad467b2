//! Message groups in two tables: a group row and one row per buffered message.

use crate::db_error;
use chrono::{DateTime, Utc};
use correlator_core::correlation::CorrelationKey;
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::store::{MessageGroupStore, StoreError, StoreFuture};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

/// `PostgreSQL`-backed [`MessageGroupStore`].
///
/// Every mutation of buffered messages runs in one transaction that first
/// takes the group row with `SELECT ... FOR UPDATE`, so concurrent
/// mutations of one group serialize on that row even without a group lock.
/// Message order is the insertion order of the `position` column.
#[derive(Clone, Debug)]
pub struct PostgresMessageGroupStore {
    pool: PgPool,
}

impl PostgresMessageGroupStore {
    /// Store using `pool`. Run [`migrate`](crate::migrate) first.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn touch(conn: &mut PgConnection, key: &CorrelationKey) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO message_groups (group_key) VALUES ($1)
        ON CONFLICT (group_key) DO UPDATE SET last_modified = now()
        ",
    )
    .bind(key.as_str())
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Lock the group row for the rest of the transaction. Returns `false` if
/// the group has no row.
async fn lock_row(conn: &mut PgConnection, key: &CorrelationKey) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT group_key FROM message_groups WHERE group_key = $1 FOR UPDATE")
        .bind(key.as_str())
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;
    Ok(row.is_some())
}

async fn load(conn: &mut PgConnection, key: &CorrelationKey) -> Result<MessageGroup, StoreError> {
    let header = sqlx::query(
        "SELECT complete, created_at, last_modified FROM message_groups WHERE group_key = $1",
    )
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    let Some(header) = header else {
        return Ok(MessageGroup::new(key.clone(), Utc::now()));
    };

    let rows = sqlx::query("SELECT message FROM group_messages WHERE group_key = $1 ORDER BY position")
        .bind(key.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;

    let messages = rows
        .iter()
        .map(|row| row.try_get::<Json<Message>, _>("message").map(|json| json.0))
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_error)?;

    let complete: bool = header.try_get("complete").map_err(db_error)?;
    let created_at: DateTime<Utc> = header.try_get("created_at").map_err(db_error)?;
    let last_modified: DateTime<Utc> = header.try_get("last_modified").map_err(db_error)?;

    Ok(MessageGroup::from_parts(
        key.clone(),
        messages,
        complete,
        created_at,
        last_modified,
    ))
}

impl MessageGroupStore for PostgresMessageGroupStore {
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_error)?;
            touch(&mut tx, &key).await?;
            lock_row(&mut tx, &key).await?;

            sqlx::query(
                r"
                INSERT INTO group_messages (group_key, message_id, message)
                VALUES ($1, $2, $3)
                ON CONFLICT (group_key, message_id) DO NOTHING
                ",
            )
            .bind(key.as_str())
            .bind(*message.id().as_uuid())
            .bind(Json(&message))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            let group = load(&mut tx, &key).await?;
            tx.commit().await.map_err(db_error)?;
            Ok(group)
        })
    }

    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
        let key = key.clone();
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_error)?;
            if !lock_row(&mut tx, &key).await? {
                tx.rollback().await.map_err(db_error)?;
                return Ok(Vec::new());
            }

            let rows = sqlx::query(
                r"
                DELETE FROM group_messages
                WHERE group_key = $1 AND message_id = ANY($2)
                RETURNING position, message
                ",
            )
            .bind(key.as_str())
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

            let mut removed = rows
                .iter()
                .map(|row| {
                    let position: i64 = row.try_get("position")?;
                    let message: Json<Message> = row.try_get("message")?;
                    Ok((position, message.0))
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(db_error)?;
            removed.sort_by_key(|(position, _)| *position);

            if !removed.is_empty() {
                sqlx::query("UPDATE message_groups SET last_modified = now() WHERE group_key = $1")
                    .bind(key.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }

            tx.commit().await.map_err(db_error)?;
            Ok(removed.into_iter().map(|(_, message)| message).collect())
        })
    }

    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(db_error)?;
            load(&mut conn, &key).await
        })
    }

    fn group_size(&self, key: &CorrelationKey) -> StoreFuture<'_, usize> {
        let key = key.clone();
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_messages WHERE group_key = $1")
                .bind(key.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO message_groups (group_key, complete) VALUES ($1, TRUE)
                ON CONFLICT (group_key) DO UPDATE SET complete = TRUE, last_modified = now()
                ",
            )
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            sqlx::query("DELETE FROM message_groups WHERE group_key = $1")
                .bind(key.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            tracing::debug!(correlation_key = %key, "Removed message group");
            Ok(())
        })
    }
}
