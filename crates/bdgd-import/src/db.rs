//! Connection pool and destination schema

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::ImportConfig;
use crate::error::{ImportError, Result};

/// Schema names are interpolated into SQL, so only plain identifiers are accepted
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && schema.len() <= 63 {
        Ok(())
    } else {
        Err(ImportError::Config(format!("invalid schema name {:?}", schema)))
    }
}

pub async fn create_pool(config: &ImportConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| ImportError::Config("DATABASE_URL not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "Database pool created");
    Ok(pool)
}

fn schema_statements(s: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {s}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.lead (
                id TEXT PRIMARY KEY,
                id_interno TEXT NOT NULL,
                bairro TEXT,
                cep TEXT,
                municipio_ibge TEXT,
                distribuidora TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'raw',
                ultima_atualizacao TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.unidade_consumidora (
                id BIGSERIAL PRIMARY KEY,
                unit_key TEXT NOT NULL UNIQUE,
                cod_id TEXT NOT NULL,
                lead_id TEXT NOT NULL REFERENCES {s}.lead (id),
                origem TEXT NOT NULL,
                ano INTEGER NOT NULL,
                distribuidora TEXT NOT NULL,
                cod_distribuidora TEXT,
                data_conexao DATE,
                tipo_sistema TEXT,
                grupo_tensao TEXT,
                modalidade TEXT,
                situacao TEXT,
                classe TEXT,
                segmento TEXT,
                subestacao TEXT,
                cnae TEXT,
                descricao TEXT,
                potencia DOUBLE PRECISION,
                coordenadas JSONB,
                status TEXT NOT NULL DEFAULT 'raw',
                criado_em TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_uc_distribuidora_ano_cod_id \
             ON {s}.unidade_consumidora (distribuidora, ano, cod_id)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.lead_energia (
                id BIGSERIAL PRIMARY KEY,
                uc_id BIGINT NOT NULL UNIQUE REFERENCES {s}.unidade_consumidora (id) ON DELETE CASCADE,
                ene DOUBLE PRECISION[] NOT NULL,
                potencia DOUBLE PRECISION
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.lead_demanda (
                id BIGSERIAL PRIMARY KEY,
                uc_id BIGINT NOT NULL UNIQUE REFERENCES {s}.unidade_consumidora (id) ON DELETE CASCADE,
                dem_ponta DOUBLE PRECISION[],
                dem_fora_ponta DOUBLE PRECISION[],
                dem_contratada DOUBLE PRECISION[]
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.lead_qualidade (
                id BIGSERIAL PRIMARY KEY,
                uc_id BIGINT NOT NULL UNIQUE REFERENCES {s}.unidade_consumidora (id) ON DELETE CASCADE,
                dic DOUBLE PRECISION[],
                fic DOUBLE PRECISION[]
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.import_status (
                distribuidora TEXT NOT NULL,
                ano INTEGER NOT NULL,
                camada TEXT NOT NULL,
                status TEXT NOT NULL,
                linhas_processadas BIGINT NOT NULL DEFAULT 0,
                observacoes TEXT,
                erro TEXT,
                criado_em TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                atualizado_em TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (distribuidora, ano, camada)
            )
            "#
        ),
    ]
}

/// Create the destination schema and tables if they do not exist yet
pub async fn ensure_schema(pool: &PgPool, schema: &str) -> Result<()> {
    validate_schema_name(schema)?;

    let mut tx = pool.begin().await?;
    for statement in schema_statements(schema) {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!(schema, "Destination schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_schema_name() {
        assert!(validate_schema_name("plead").is_ok());
        assert!(validate_schema_name("_staging_2").is_ok());
        assert!(validate_schema_name("2plead").is_err());
        assert!(validate_schema_name("Plead").is_err());
        assert!(validate_schema_name("plead.lead").is_err());
        assert!(validate_schema_name("").is_err());
    }

    #[test]
    fn test_schema_statements_are_qualified() {
        let statements = schema_statements("staging");
        assert!(statements[0].contains("CREATE SCHEMA IF NOT EXISTS staging"));
        assert!(statements
            .iter()
            .skip(1)
            .all(|s| s.contains("staging.")));
    }
}
