use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::StatusStore;
use crate::db::validate_schema_name;
use crate::error::{ImportError, Result};
use crate::models::{JobKey, JobRecord, JobStatus, StatusUpdate};

const RECORD_COLUMNS: &str = "distribuidora, ano, camada, status, linhas_processadas, \
    observacoes, erro, criado_em, atualizado_em";

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    distribuidora: String,
    ano: i32,
    camada: String,
    status: String,
    linhas_processadas: i64,
    observacoes: Option<String>,
    erro: Option<String>,
    criado_em: DateTime<Utc>,
    atualizado_em: DateTime<Utc>,
}

impl TryFrom<StatusRow> for JobRecord {
    type Error = ImportError;

    fn try_from(row: StatusRow) -> Result<Self> {
        Ok(JobRecord {
            key: JobKey::new(row.distribuidora, row.ano, row.camada),
            status: row.status.parse::<JobStatus>()?,
            rows_processed: row.linhas_processadas,
            note: row.observacoes,
            error: row.erro,
            created_at: row.criado_em,
            updated_at: row.atualizado_em,
        })
    }
}

/// Status records in the `import_status` table
#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
    table: String,
}

impl PgStatusStore {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        validate_schema_name(schema)?;
        Ok(Self {
            pool,
            table: format!("{}.import_status", schema),
        })
    }
}

fn status_error(err: sqlx::Error) -> ImportError {
    ImportError::Status(err.to_string())
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn get_status(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {} FROM {} WHERE distribuidora = $1 AND ano = $2 AND camada = $3",
            RECORD_COLUMNS, self.table
        ))
        .bind(&key.prefix)
        .bind(key.year)
        .bind(&key.layer)
        .fetch_optional(&self.pool)
        .await
        .map_err(status_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn set_status(&self, update: StatusUpdate) -> Result<JobRecord> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            r#"
            INSERT INTO {table} AS st
                (distribuidora, ano, camada, status, linhas_processadas, observacoes, erro)
            VALUES ($1, $2, $3, $4, COALESCE($5, 0), $6, $7)
            ON CONFLICT (distribuidora, ano, camada) DO UPDATE SET
                status = EXCLUDED.status,
                linhas_processadas = COALESCE($5, st.linhas_processadas),
                observacoes = COALESCE($6, st.observacoes),
                erro = $7,
                atualizado_em = NOW()
            RETURNING {columns}
            "#,
            table = self.table,
            columns = RECORD_COLUMNS
        ))
        .bind(&update.key.prefix)
        .bind(update.key.year)
        .bind(&update.key.layer)
        .bind(update.status.as_str())
        .bind(update.rows)
        .bind(&update.note)
        .bind(&update.error)
        .fetch_one(&self.pool)
        .await
        .map_err(status_error)?;

        JobRecord::try_from(row)
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {} FROM {} ORDER BY distribuidora, ano, camada",
            RECORD_COLUMNS, self.table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(status_error)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
