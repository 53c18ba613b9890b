use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::{types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{SessionRecord, SessionStore, UserFilter, UserStore};
use crate::{
    error::StoreError,
    model::{Credentials, ListOp, ListOutcome, PendingVerification, User, UserLists},
};

const USER_COLUMNS: &str = "id, name, username, password_hash, federated_id, is_verified, \
     verification_token_hash, verification_token_expires, lists, created_at";

/// Row shape of the `users` table.
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    name: Option<String>,
    username: Option<String>,
    password_hash: Option<String>,
    federated_id: Option<String>,
    is_verified: bool,
    verification_token_hash: Option<String>,
    verification_token_expires: Option<OffsetDateTime>,
    lists: Json<UserLists>,
    created_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        let credentials = Credentials::from_parts(r.username, r.password_hash, r.federated_id)
            .ok_or_else(|| anyhow!("user {} has no usable credentials", r.id))?;
        let pending_verification = match (r.verification_token_hash, r.verification_token_expires)
        {
            (Some(token_hash), Some(expires_at)) => Some(PendingVerification {
                token_hash,
                expires_at,
            }),
            (None, None) => None,
            _ => return Err(anyhow!("user {} has a half-set verification token", r.id).into()),
        };
        Ok(User {
            id: r.id,
            name: r.name,
            credentials,
            is_verified: r.is_verified,
            pending_verification,
            lists: r.lists.0,
            created_at: r.created_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn write_error(err: sqlx::Error, what: &'static str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict
    } else {
        StoreError::Backend(anyhow::Error::new(err).context(what))
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        row.map(User::try_from).transpose()
    }

    async fn find_one(&self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError> {
        let row = match filter {
            UserFilter::Username(username) => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
                ))
                .bind(username)
                .fetch_optional(&self.db)
                .await
            }
            UserFilter::FederatedId(federated_id) => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE federated_id = $1"
                ))
                .bind(federated_id)
                .fetch_optional(&self.db)
                .await
            }
            UserFilter::LiveVerificationToken { token_hash, now } => {
                sqlx::query_as::<_, UserRow>(&format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE verification_token_hash = $1 AND verification_token_expires > $2"
                ))
                .bind(token_hash)
                .bind(now)
                .fetch_optional(&self.db)
                .await
            }
        }
        .context("find user")?;
        row.map(User::try_from).transpose()
    }

    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        let pending = user.pending_verification.as_ref();
        sqlx::query(
            r#"
            INSERT INTO users (id, name, username, password_hash, federated_id, is_verified,
                               verification_token_hash, verification_token_expires, lists, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.credentials.username())
        .bind(user.credentials.password_hash())
        .bind(user.credentials.federated_id())
        .bind(user.is_verified)
        .bind(pending.map(|p| p.token_hash.as_str()))
        .bind(pending.map(|p| p.expires_at))
        .bind(Json(&user.lists))
        .bind(user.created_at)
        .execute(&self.db)
        .await
        .map_err(|e| write_error(e, "insert user"))?;
        Ok(())
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let pending = user.pending_verification.as_ref();
        sqlx::query(
            r#"
            UPDATE users
            SET name = $2, username = $3, password_hash = $4, federated_id = $5, is_verified = $6,
                verification_token_hash = $7, verification_token_expires = $8, lists = $9
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.credentials.username())
        .bind(user.credentials.password_hash())
        .bind(user.credentials.federated_id())
        .bind(user.is_verified)
        .bind(pending.map(|p| p.token_hash.as_str()))
        .bind(pending.map(|p| p.expires_at))
        .bind(Json(&user.lists))
        .execute(&self.db)
        .await
        .map_err(|e| write_error(e, "save user"))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("delete user")?;
        Ok(())
    }

    async fn update_lists(
        &self,
        id: Uuid,
        op: &ListOp,
    ) -> Result<Option<ListOutcome>, StoreError> {
        let mut tx = self.db.begin().await.context("begin list update")?;
        let current: Option<(Json<UserLists>,)> =
            sqlx::query_as("SELECT lists FROM users WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .context("lock user lists")?;
        let Some((Json(mut lists),)) = current else {
            return Ok(None);
        };

        let outcome = op.apply(&mut lists);
        if outcome == ListOutcome::Changed {
            sqlx::query("UPDATE users SET lists = $2 WHERE id = $1")
                .bind(id)
                .bind(Json(&lists))
                .execute(&mut *tx)
                .await
                .context("write user lists")?;
        }
        tx.commit().await.context("commit list update")?;
        Ok(Some(outcome))
    }

    async fn set_pending_verification(
        &self,
        id: Uuid,
        pending: &PendingVerification,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE users
            SET verification_token_hash = $2, verification_token_expires = $3
            WHERE id = $1 AND is_verified = FALSE
            "#,
        )
        .bind(id)
        .bind(&pending.token_hash)
        .bind(pending.expires_at)
        .execute(&self.db)
        .await
        .context("set verification token")?;
        Ok(done.rows_affected() == 1)
    }

    async fn link_federated(
        &self,
        id: Uuid,
        federated_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
            SET federated_id = $2
            WHERE id = $1 AND federated_id IS NULL AND password_hash IS NOT NULL
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(federated_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| write_error(e, "link federated id"))?;
        row.map(User::try_from).transpose()
    }

    async fn consume_verification(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
            SET is_verified = TRUE, verification_token_hash = NULL, verification_token_expires = NULL
            WHERE verification_token_hash = $1 AND verification_token_expires > $2
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await
        .context("consume verification token")?;
        row.map(User::try_from).transpose()
    }
}

#[derive(Clone)]
pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&record.token_hash)
            .bind(record.user_id)
            .bind(record.expires_at)
            .execute(&self.db)
            .await
            .map_err(|e| write_error(e, "insert session"))?;
        Ok(())
    }

    async fn find_live(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, StoreError> {
        let user_id: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE token_hash = $1 AND expires_at > $2")
                .bind(token_hash)
                .bind(now)
                .fetch_optional(&self.db)
                .await
                .context("lookup session")?;
        Ok(user_id.map(|(id,)| id))
    }

    async fn delete(&self, token_hash: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.db)
            .await
            .context("delete session")?;
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await
            .context("purge expired sessions")?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> UserRow {
        UserRow {
            id: Uuid::new_v4(),
            name: Some("Alice".into()),
            username: Some("alice@example.com".into()),
            password_hash: Some("hash".into()),
            federated_id: None,
            is_verified: false,
            verification_token_hash: None,
            verification_token_expires: None,
            lists: Json(UserLists::default()),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn row_decodes_into_local_user() {
        let user = User::try_from(row()).expect("valid row");
        assert!(matches!(user.credentials, Credentials::Local { .. }));
        assert!(user.pending_verification.is_none());
    }

    #[test]
    fn row_with_half_set_token_is_rejected() {
        let mut r = row();
        r.verification_token_hash = Some("h".into());
        assert!(User::try_from(r).is_err());
    }

    #[test]
    fn row_without_credentials_is_rejected() {
        let mut r = row();
        r.username = None;
        r.password_hash = None;
        assert!(User::try_from(r).is_err());
    }
}
