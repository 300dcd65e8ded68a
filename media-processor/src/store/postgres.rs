//! PostgreSQL job store
//!
//! Records are kept as JSONB documents next to the columns that queries
//! filter on. Tables are created on connect.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use super::{JobStore, MediaFilter, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use cinecore_types::{
    EncodeProfile, EncodingJob, EncodingStatus, JobKey, MediaId, ProfileId, SourceMedia,
    Subtitle, TranscriptionRequest,
};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};
use uuid::Uuid;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS media (
        id TEXT PRIMARY KEY,
        media_type TEXT NOT NULL,
        encoding_status TEXT NOT NULL,
        data JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS encode_profiles (
        id INTEGER PRIMARY KEY,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        data JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS encodings (
        id UUID PRIMARY KEY,
        media_id TEXT NOT NULL,
        profile_id INTEGER NOT NULL,
        chunk_key TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'success', 'fail')),
        task_id TEXT,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_encodings_key ON encodings(media_id, profile_id, chunk_key)",
    "CREATE INDEX IF NOT EXISTS idx_encodings_status ON encodings(status)",
    "CREATE INDEX IF NOT EXISTS idx_encodings_task_id ON encodings(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS transcription_requests (
        id UUID PRIMARY KEY,
        media_id TEXT NOT NULL,
        translate BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE(media_id, translate)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subtitles (
        id UUID PRIMARY KEY,
        media_id TEXT NOT NULL,
        language_code TEXT NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_subtitles_media_id ON subtitles(media_id)",
];

const JOB_COLUMNS: &str = "SELECT data FROM encodings";

/// Lock conflicts between concurrent replacements surface as `Conflict`
fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    match e.code() {
        Some(code)
            if *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::UNIQUE_VIOLATION =>
        {
            StoreError::Conflict(e.to_string())
        }
        _ => StoreError::from(e),
    }
}

fn chunk_key(job: &EncodingJob) -> String {
    job.key().chunk.unwrap_or_default()
}

fn job_from_row(row: &Row) -> StoreResult<EncodingJob> {
    let data: Json<EncodingJob> = row.try_get(0).map_err(map_pg_error)?;
    Ok(data.0)
}

fn jobs_from_rows(rows: &[Row]) -> StoreResult<Vec<EncodingJob>> {
    rows.iter().map(job_from_row).collect()
}

/// Job store backed by PostgreSQL
pub struct PgJobStore {
    client: Client,
}

impl PgJobStore {
    /// Connect and run migrations
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        info!("Connecting to job database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Database connection error");
            }
        });

        Self::run_migrations(&client).await?;

        info!("Job database connected and initialized");
        Ok(Self { client })
    }

    async fn run_migrations(client: &Client) -> StoreResult<()> {
        for statement in MIGRATIONS {
            client
                .execute(*statement, &[])
                .await
                .map_err(|e| StoreError::Database(format!("Migration failed: {}", e)))?;
        }
        Ok(())
    }

    async fn query_jobs(
        &self,
        clause: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> StoreResult<Vec<EncodingJob>> {
        let sql = format!("{} {} ORDER BY created_at, id", JOB_COLUMNS, clause);
        let rows = self
            .client
            .query(sql.as_str(), params)
            .await
            .map_err(map_pg_error)?;
        jobs_from_rows(&rows)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get_media(&self, id: &MediaId) -> StoreResult<Option<SourceMedia>> {
        let row = self
            .client
            .query_opt("SELECT data FROM media WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(map_pg_error)?;
        row.map(|r| {
            r.try_get::<_, Json<SourceMedia>>(0)
                .map(|j| j.0)
                .map_err(map_pg_error)
        })
        .transpose()
    }

    async fn save_media(&self, media: &SourceMedia) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO media (id, media_type, encoding_status, data, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    media_type = EXCLUDED.media_type,
                    encoding_status = EXCLUDED.encoding_status,
                    data = EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &media.id.as_str(),
                    &media.media_type.as_str(),
                    &media.encoding_status.as_str(),
                    &Json(media),
                    &media.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn list_media(&self, filter: &MediaFilter) -> StoreResult<Vec<SourceMedia>> {
        let media_type = filter.media_type.map(|t| t.as_str().to_string());
        let exclude = filter.exclude_status.map(|s| s.as_str().to_string());
        let rows = self
            .client
            .query(
                r#"
                SELECT data FROM media
                WHERE ($1::TEXT IS NULL OR media_type = $1)
                  AND ($2::TEXT IS NULL OR encoding_status <> $2)
                ORDER BY id
                "#,
                &[&media_type, &exclude],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter()
            .map(|r| {
                r.try_get::<_, Json<SourceMedia>>(0)
                    .map(|j| j.0)
                    .map_err(map_pg_error)
            })
            .collect()
    }

    async fn list_profiles(&self, active_only: bool) -> StoreResult<Vec<EncodeProfile>> {
        let rows = self
            .client
            .query(
                "SELECT data FROM encode_profiles WHERE ($1 = FALSE OR active) ORDER BY id",
                &[&active_only],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter()
            .map(|r| {
                r.try_get::<_, Json<EncodeProfile>>(0)
                    .map(|j| j.0)
                    .map_err(map_pg_error)
            })
            .collect()
    }

    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<EncodeProfile>> {
        let row = self
            .client
            .query_opt("SELECT data FROM encode_profiles WHERE id = $1", &[&id])
            .await
            .map_err(map_pg_error)?;
        row.map(|r| {
            r.try_get::<_, Json<EncodeProfile>>(0)
                .map(|j| j.0)
                .map_err(map_pg_error)
        })
        .transpose()
    }

    async fn save_profile(&self, profile: &EncodeProfile) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO encode_profiles (id, active, data) VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE SET active = EXCLUDED.active, data = EXCLUDED.data
                "#,
                &[&profile.id, &profile.active, &Json(profile)],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn create_job(&self, job: &EncodingJob) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO encodings
                    (id, media_id, profile_id, chunk_key, status, task_id, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
                &[
                    &job.id,
                    &job.media_id.as_str(),
                    &job.profile_id,
                    &chunk_key(job),
                    &job.status.as_str(),
                    &job.task_id,
                    &Json(job),
                    &job.created_at,
                    &job.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<EncodingJob>> {
        let row = self
            .client
            .query_opt("SELECT data FROM encodings WHERE id = $1", &[&id])
            .await
            .map_err(map_pg_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, job: &EncodingJob) -> StoreResult<()> {
        let updated = self
            .client
            .execute(
                r#"
                UPDATE encodings
                SET status = $2, task_id = $3, data = $4, updated_at = $5
                WHERE id = $1
                "#,
                &[
                    &job.id,
                    &job.status.as_str(),
                    &job.task_id,
                    &Json(job),
                    &job.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("encoding job {}", job.id)));
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> StoreResult<bool> {
        let deleted = self
            .client
            .execute("DELETE FROM encodings WHERE id = $1", &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(deleted > 0)
    }

    async fn jobs_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<EncodingJob>> {
        self.query_jobs("WHERE media_id = $1", &[&media_id.as_str()])
            .await
    }

    async fn jobs_for_key(&self, key: &JobKey) -> StoreResult<Vec<EncodingJob>> {
        let chunk = key.chunk.clone().unwrap_or_default();
        self.query_jobs(
            "WHERE media_id = $1 AND profile_id = $2 AND chunk_key = $3",
            &[&key.media_id.as_str(), &key.profile_id, &chunk],
        )
        .await
    }

    async fn jobs_with_status(&self, status: EncodingStatus) -> StoreResult<Vec<EncodingJob>> {
        self.query_jobs("WHERE status = $1", &[&status.as_str()])
            .await
    }

    async fn delete_jobs_by_task(&self, task_id: &str) -> StoreResult<Vec<EncodingJob>> {
        let rows = self
            .client
            .query(
                "DELETE FROM encodings WHERE task_id = $1 RETURNING data",
                &[&task_id],
            )
            .await
            .map_err(map_pg_error)?;
        jobs_from_rows(&rows)
    }

    async fn replace_active(&self, job: &EncodingJob) -> StoreResult<usize> {
        let row = self
            .client
            .query_one(
                r#"
                WITH removed AS (
                    DELETE FROM encodings
                    WHERE media_id = $2 AND profile_id = $3 AND chunk_key = $4 AND id <> $1
                    RETURNING id
                ), upserted AS (
                    INSERT INTO encodings
                        (id, media_id, profile_id, chunk_key, status, task_id, data, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (id) DO UPDATE SET
                        status = EXCLUDED.status,
                        task_id = EXCLUDED.task_id,
                        data = EXCLUDED.data,
                        updated_at = EXCLUDED.updated_at
                    RETURNING id
                )
                SELECT (SELECT COUNT(*) FROM removed) AS removed
                "#,
                &[
                    &job.id,
                    &job.media_id.as_str(),
                    &job.profile_id,
                    &chunk_key(job),
                    &job.status.as_str(),
                    &job.task_id,
                    &Json(job),
                    &job.created_at,
                    &job.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        let removed: i64 = row.try_get(0).map_err(map_pg_error)?;
        Ok(removed as usize)
    }

    async fn create_transcription(&self, request: &TranscriptionRequest) -> StoreResult<bool> {
        let inserted = self
            .client
            .execute(
                r#"
                INSERT INTO transcription_requests (id, media_id, translate, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (media_id, translate) DO NOTHING
                "#,
                &[
                    &request.id,
                    &request.media_id.as_str(),
                    &request.translate,
                    &request.created_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(inserted > 0)
    }

    async fn transcription_exists(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM transcription_requests WHERE media_id = $1 AND translate = $2",
                &[&media_id.as_str(), &translate],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(row.is_some())
    }

    async fn delete_transcription(&self, media_id: &MediaId, translate: bool) -> StoreResult<bool> {
        let deleted = self
            .client
            .execute(
                "DELETE FROM transcription_requests WHERE media_id = $1 AND translate = $2",
                &[&media_id.as_str(), &translate],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(deleted > 0)
    }

    async fn save_subtitle(&self, subtitle: &Subtitle) -> StoreResult<()> {
        self.client
            .execute(
                r#"
                INSERT INTO subtitles (id, media_id, language_code, data, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    language_code = EXCLUDED.language_code,
                    data = EXCLUDED.data
                "#,
                &[
                    &subtitle.id,
                    &subtitle.media_id.as_str(),
                    &subtitle.language_code,
                    &Json(subtitle),
                    &subtitle.created_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn delete_subtitle(&self, id: Uuid) -> StoreResult<bool> {
        let deleted = self
            .client
            .execute("DELETE FROM subtitles WHERE id = $1", &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(deleted > 0)
    }

    async fn subtitles_for_media(&self, media_id: &MediaId) -> StoreResult<Vec<Subtitle>> {
        let rows = self
            .client
            .query(
                "SELECT data FROM subtitles WHERE media_id = $1 ORDER BY created_at",
                &[&media_id.as_str()],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter()
            .map(|r| {
                r.try_get::<_, Json<Subtitle>>(0)
                    .map(|j| j.0)
                    .map_err(map_pg_error)
            })
            .collect()
    }
}
