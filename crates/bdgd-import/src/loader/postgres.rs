//! Postgres destination
//!
//! Leads go in through a multi-row `INSERT ... ON CONFLICT DO NOTHING`. Units are streamed
//! with `COPY ... FROM STDIN` into a transaction-scoped staging table and moved over with
//! `INSERT ... SELECT ... ON CONFLICT (unit_key) DO NOTHING`, so a unit stored by a concurrent
//! job is skipped. Series rows are copied only for the units this call inserted. All of it
//! happens inside one transaction per chunk.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

use super::{Destination, LoadBatch, LoadCounts};
use crate::db::validate_schema_name;
use crate::error::{ImportError, Result};
use crate::models::{CoordinateUpdate, JobKey, Lead};

/// Leads per INSERT statement (7 binds each, well under the 65535 bind limit)
const LEAD_BATCH_SIZE: usize = 1000;

/// NULL marker in COPY CSV payloads
const COPY_NULL: &str = "\\N";

/// Temp table units are copied into before the conflict-tolerant insert
const UNIT_STAGING: &str = "unit_staging";

const UNIT_COLUMNS: &str = "unit_key, cod_id, lead_id, origem, ano, distribuidora, \
    cod_distribuidora, data_conexao, tipo_sistema, grupo_tensao, modalidade, situacao, \
    classe, segmento, subestacao, cnae, descricao, potencia, status";

/// CSV payload for one COPY statement
struct CopyBuffer {
    table: &'static str,
    writer: csv::Writer<Vec<u8>>,
    rows: u64,
}

impl CopyBuffer {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new()),
            rows: 0,
        }
    }

    fn push(&mut self, fields: &[String]) -> Result<()> {
        self.writer
            .write_record(fields)
            .map_err(|e| ImportError::bulk_load(self.table, e))?;
        self.rows += 1;
        Ok(())
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        let table = self.table;
        self.writer
            .into_inner()
            .map_err(|e| ImportError::bulk_load(table, e.error()))
    }
}

fn cell(value: Option<&str>) -> String {
    value.unwrap_or(COPY_NULL).to_string()
}

fn num_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| COPY_NULL.to_string())
}

/// Destination writing to the import schema in Postgres
#[derive(Debug, Clone)]
pub struct PgDestination {
    pool: PgPool,
    schema: String,
}

impl PgDestination {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        validate_schema_name(&schema)?;
        Ok(Self { pool, schema })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    async fn insert_leads(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        leads: &[Lead],
    ) -> Result<u64> {
        let mut inserted = 0;
        for chunk in leads.chunks(LEAD_BATCH_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (id, id_interno, bairro, cep, municipio_ibge, distribuidora, status) ",
                self.table("lead")
            ));
            query_builder.push_values(chunk, |mut b, lead| {
                b.push_bind(&lead.id)
                    .push_bind(&lead.id)
                    .push_bind(&lead.neighborhood)
                    .push_bind(&lead.postal_code)
                    .push_bind(&lead.municipality)
                    .push_bind(&lead.distributor)
                    .push_bind("raw");
            });
            query_builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = query_builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| ImportError::bulk_load("lead", e))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// COPY the buffer into `target`, or into the buffer's own table when `target` is `None`
    async fn copy(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: Option<&str>,
        columns: &str,
        buffer: CopyBuffer,
    ) -> Result<u64> {
        if buffer.rows == 0 {
            return Ok(0);
        }
        let table = buffer.table;
        let target = target.map_or_else(|| self.table(table), str::to_string);
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, NULL '{}')",
            target, columns, COPY_NULL
        );
        let payload = buffer.into_bytes()?;

        let mut copy = tx
            .copy_in_raw(&statement)
            .await
            .map_err(|e| ImportError::bulk_load(table, e))?;
        copy.send(payload)
            .await
            .map_err(|e| ImportError::bulk_load(table, e))?;
        let rows = copy
            .finish()
            .await
            .map_err(|e| ImportError::bulk_load(table, e))?;

        debug!(table, rows, "COPY finished");
        Ok(rows)
    }

    /// Stage the units and insert those whose `unit_key` is new. Returns the generated id of
    /// every inserted unit.
    async fn insert_units(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        units: CopyBuffer,
    ) -> Result<HashMap<String, i64>> {
        if units.rows == 0 {
            return Ok(HashMap::new());
        }
        let target = self.table("unidade_consumidora");

        sqlx::query(&format!(
            "CREATE TEMP TABLE {} ON COMMIT DROP AS SELECT {} FROM {} WITH NO DATA",
            UNIT_STAGING, UNIT_COLUMNS, target
        ))
        .execute(&mut **tx)
        .await
        .map_err(|e| ImportError::bulk_load("unidade_consumidora", e))?;

        let staged = self.copy(tx, Some(UNIT_STAGING), UNIT_COLUMNS, units).await?;

        let inserted: HashMap<String, i64> = sqlx::query_as::<_, (String, i64)>(&format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM {staging} \
             ON CONFLICT (unit_key) DO NOTHING RETURNING unit_key, id",
            target = target,
            cols = UNIT_COLUMNS,
            staging = UNIT_STAGING
        ))
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| ImportError::bulk_load("unidade_consumidora", e))?
        .into_iter()
        .collect();

        debug!(staged, inserted = inserted.len(), "Units moved from staging");
        Ok(inserted)
    }

    async fn write_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: &LoadBatch,
    ) -> Result<LoadCounts> {
        let mut counts = LoadCounts {
            leads: self.insert_leads(tx, &batch.leads).await?,
            ..Default::default()
        };

        let key = &batch.key;
        let year = key.year.to_string();
        let mut units = CopyBuffer::new("unidade_consumidora");
        for u in &batch.units {
            let unit = &u.unit;
            let connection_date = unit.connection_date.map(|d| d.format("%Y-%m-%d").to_string());
            units.push(&[
                u.unit_id.clone(),
                unit.natural_code.clone(),
                u.lead_id.clone(),
                key.layer.clone(),
                year.clone(),
                key.prefix.clone(),
                cell(unit.distributor_code.as_deref()),
                cell(connection_date.as_deref()),
                cell(unit.system_type.as_deref()),
                cell(unit.voltage_group.as_deref()),
                cell(unit.tariff_modality.as_deref()),
                cell(unit.status.as_deref()),
                cell(unit.class.as_deref()),
                cell(unit.segment.as_deref()),
                cell(unit.substation.as_deref()),
                cell(unit.cnae.as_deref()),
                cell(unit.description.as_deref()),
                num_cell(unit.installed_power),
                "raw".to_string(),
            ])?;
        }
        let generated = self.insert_units(tx, units).await?;
        counts.units = generated.len() as u64;

        let mut energy = CopyBuffer::new("lead_energia");
        let mut demand = CopyBuffer::new("lead_demanda");
        let mut quality = CopyBuffer::new("lead_qualidade");
        // Units skipped as already stored keep the series rows written with them
        for u in &batch.units {
            let Some(id) = generated.get(&u.unit_id) else {
                continue;
            };
            let id = id.to_string();
            let series = &u.unit.series;

            energy.push(&[
                id.clone(),
                series.energy.to_pg_array(),
                num_cell(u.unit.installed_power),
            ])?;
            if series.has_demand() {
                demand.push(&[
                    id.clone(),
                    series.demand_peak.to_pg_array(),
                    series.demand_off_peak.to_pg_array(),
                    series.demand_contracted.to_pg_array(),
                ])?;
            }
            if series.has_quality() {
                quality.push(&[id, series.dic.to_pg_array(), series.fic.to_pg_array()])?;
            }
        }

        counts.energy_rows = self.copy(tx, None, "uc_id, ene, potencia", energy).await?;
        counts.demand_rows = self
            .copy(tx, None, "uc_id, dem_ponta, dem_fora_ponta, dem_contratada", demand)
            .await?;
        counts.quality_rows = self.copy(tx, None, "uc_id, dic, fic", quality).await?;
        Ok(counts)
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn existing_units(&self, unit_ids: &[String]) -> Result<HashSet<String>> {
        if unit_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT unit_key FROM {} WHERE unit_key = ANY($1)",
            self.table("unidade_consumidora")
        ))
        .bind(unit_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip_all, fields(job = %batch.key, units = batch.units.len()))]
    async fn load(&self, batch: &LoadBatch) -> Result<LoadCounts> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ImportError::bulk_load("transaction", e))?;

        // Dropping `tx` on error rolls the whole chunk back
        let counts = self.write_batch(&mut tx, batch).await?;

        tx.commit()
            .await
            .map_err(|e| ImportError::bulk_load("transaction", e))?;
        Ok(counts)
    }

    async fn apply_coordinates(&self, key: &JobKey, updates: &[CoordinateUpdate]) -> Result<u64> {
        let codes: Vec<String> = updates.iter().map(|u| u.natural_code.clone()).collect();
        let lats: Vec<f64> = updates.iter().map(|u| u.lat).collect();
        let lngs: Vec<f64> = updates.iter().map(|u| u.lng).collect();

        let sql = format!(
            r#"
            UPDATE {} AS uc
            SET coordenadas = jsonb_build_object('lat', c.lat, 'lng', c.lng)
            FROM UNNEST($1::text[], $2::float8[], $3::float8[]) AS c(cod_id, lat, lng)
            WHERE uc.cod_id = c.cod_id
              AND uc.ano = $4
              AND uc.distribuidora = $5
              AND (uc.coordenadas IS NULL OR uc.coordenadas = '{{}}'::jsonb)
            "#,
            self.table("unidade_consumidora")
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ImportError::bulk_load("transaction", e))?;
        let result = sqlx::query(&sql)
            .bind(&codes)
            .bind(&lats)
            .bind(&lngs)
            .bind(key.year)
            .bind(&key.prefix)
            .execute(&mut *tx)
            .await
            .map_err(|e| ImportError::bulk_load("unidade_consumidora", e))?;
        tx.commit()
            .await
            .map_err(|e| ImportError::bulk_load("transaction", e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_buffer_writes_nulls_unquoted() {
        let mut buffer = CopyBuffer::new("lead_energia");
        buffer
            .push(&["1".to_string(), "{1,0}".to_string(), num_cell(None)])
            .unwrap();
        let text = String::from_utf8(buffer.into_bytes().unwrap()).unwrap();
        assert_eq!(text, "1,\"{1,0}\",\\N\n");
    }

    #[test]
    fn test_cells() {
        assert_eq!(cell(Some("AT")), "AT");
        assert_eq!(cell(None), "\\N");
        assert_eq!(num_cell(Some(2.5)), "2.5");
    }
}
