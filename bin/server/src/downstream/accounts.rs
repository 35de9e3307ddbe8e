//! Direct provisioning of downstream users in the downstream database.
//!
//! A login upserts the user, their personal project and the relation
//! between them in one serializable transaction, and leaves the user with a
//! fresh password that the relay then logs in with.
//!
//! The downstream application signs its session tokens with the user's
//! password hash, so rotating the password also invalidates every session
//! the user holds. Logout relies on that.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use rootcause::prelude::Report;
use sqlx::PgPool;
use sso_relay_coordination::{
    AccountProvisioner, CollaboratorError, DownstreamCredentials, ResolvedIdentity,
};
use tracing::instrument;
use uuid::Uuid;

/// bcrypt cost used by the downstream application.
const BCRYPT_COST: u32 = 10;

/// Length of the password given to a newly created user.
const NEW_USER_PASSWORD_LEN: usize = 24;

/// Length of the password an existing user is rotated to.
const ROTATED_PASSWORD_LEN: usize = 32;

const PROJECT_ID_LEN: usize = 16;

/// Generates a random alphanumeric password.
#[must_use]
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn generate_project_id() -> String {
    generate_password(PROJECT_ID_LEN)
}

async fn hash_password(password: String) -> Result<String, CollaboratorError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, BCRYPT_COST))
        .await
        .map_err(|e| provisioning("password hashing task failed", e))?
        .map_err(|e| provisioning("password hashing failed", e))
}

fn provisioning(context: &str, error: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Provisioning {
        reason: format!("{context}: {error}"),
    }
}

fn revocation(error: CollaboratorError) -> CollaboratorError {
    match error {
        CollaboratorError::Provisioning { reason } => CollaboratorError::Revocation { reason },
        other => other,
    }
}

/// Repository for downstream users and projects.
pub struct AccountRepository {
    pool: PgPool,
    global_role: String,
    project_role: String,
}

impl AccountRepository {
    /// Creates a new account repository.
    pub fn new(pool: PgPool, global_role: String, project_role: String) -> Self {
        Self {
            pool,
            global_role,
            project_role,
        }
    }

    async fn ensure_account(
        &self,
        identity: &ResolvedIdentity,
        now: DateTime<Utc>,
    ) -> Result<DownstreamCredentials, CollaboratorError> {
        let db = |e: sqlx::Error| provisioning("database error", e);

        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM "user"
            WHERE email = $1
            FOR UPDATE
            "#,
        )
        .bind(&identity.email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let (user_id, password) = match existing {
            Some((user_id,)) => {
                let password = generate_password(ROTATED_PASSWORD_LEN);
                let hash = hash_password(password.clone()).await?;
                sqlx::query(
                    r#"
                    UPDATE "user"
                    SET password = $2, "updatedAt" = $3
                    WHERE id = $1
                    "#,
                )
                .bind(user_id)
                .bind(hash)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                tracing::info!(identity = %identity.email, user_id = %user_id, "Rotated downstream password");
                (user_id, password)
            }
            None => {
                let user_id = Uuid::new_v4();
                let password = generate_password(NEW_USER_PASSWORD_LEN);
                let hash = hash_password(password.clone()).await?;
                sqlx::query(
                    r#"
                    INSERT INTO "user" (
                        id, email, "firstName", "lastName", password, role,
                        settings, "personalizationAnswers", "createdAt", "updatedAt"
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7::json, $8::json, $9, $9)
                    "#,
                )
                .bind(user_id)
                .bind(&identity.email)
                .bind(identity.downstream_first_name())
                .bind(identity.last_name.as_deref().unwrap_or_default())
                .bind(hash)
                .bind(&self.global_role)
                .bind(r#"{"userActivated": false}"#)
                .bind(r#"{"version": "v4"}"#)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                tracing::info!(identity = %identity.email, user_id = %user_id, "Created downstream user");
                (user_id, password)
            }
        };

        let project: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM project
            WHERE name = $1
            FOR UPDATE
            "#,
        )
        .bind(&identity.email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db)?;

        let project_id = match project {
            Some((project_id,)) => project_id,
            None => {
                let project_id = generate_project_id();
                sqlx::query(
                    r#"
                    INSERT INTO project (id, name, type, "createdAt", "updatedAt")
                    VALUES ($1, $2, 'personal', $3, $3)
                    "#,
                )
                .bind(&project_id)
                .bind(&identity.email)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                tracing::info!(identity = %identity.email, project_id = %project_id, "Created personal project");
                project_id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO project_relation ("projectId", "userId", role, "createdAt", "updatedAt")
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT ("projectId", "userId") DO NOTHING
            "#,
        )
        .bind(&project_id)
        .bind(user_id)
        .bind(&self.project_role)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;

        Ok(DownstreamCredentials {
            email: identity.email.clone(),
            password,
        })
    }

    /// Rotates the password of the user with `email` to a value nobody
    /// knows. Returns false if there is no such user.
    async fn rotate_password(&self, email: &str, now: DateTime<Utc>) -> Result<bool, CollaboratorError> {
        let hash = hash_password(generate_password(ROTATED_PASSWORD_LEN))
            .await
            .map_err(revocation)?;

        let result = sqlx::query(
            r#"
            UPDATE "user"
            SET password = $2, "updatedAt" = $3
            WHERE email = $1
            "#,
        )
        .bind(email)
        .bind(hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CollaboratorError::Revocation {
            reason: format!("database error: {e}"),
        })?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AccountProvisioner for AccountRepository {
    #[instrument(skip_all, fields(identity = %identity.email))]
    async fn provision(
        &self,
        identity: &ResolvedIdentity,
    ) -> Result<DownstreamCredentials, Report<CollaboratorError>> {
        let credentials = self.ensure_account(identity, Utc::now()).await?;
        tracing::debug!(
            password_length = credentials.password.len(),
            "Downstream account ready"
        );
        Ok(credentials)
    }

    #[instrument(skip(self))]
    async fn invalidate_sessions(&self, identity: &str) -> Result<bool, Report<CollaboratorError>> {
        let found = self.rotate_password(identity, Utc::now()).await?;
        if found {
            tracing::info!("Downstream sessions invalidated via password rotation");
        } else {
            tracing::warn!("No downstream user to invalidate");
        }
        Ok(found)
    }
}
