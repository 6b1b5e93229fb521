//! Postgres destination and status store tests
//!
//! Need a docker daemon; run with `cargo test -- --ignored`.

use anyhow::Result;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

use bdgd_import::identity::resolve;
use bdgd_import::loader::{collect_leads, LoadBatch};
use bdgd_import::models::{CanonicalUnit, CoordinateUpdate, MonthlySeries};
use bdgd_import::{
    db, Destination, FanOutLoader, JobKey, JobStatus, PgDestination, PgStatusStore, StatusStore,
    StatusTracker, StatusUpdate,
};

const SCHEMA: &str = "plead_test";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bdgd_import=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn setup() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    db::ensure_schema(&pool, SCHEMA).await?;
    info!(%url, "Test database ready");
    Ok((container, pool))
}

fn units(key: &JobKey, codes: &[&str]) -> Vec<bdgd_import::models::IdentifiedUnit> {
    let canonical = codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let mut unit = CanonicalUnit {
                natural_code: code.to_string(),
                municipality: Some("3509502".into()),
                neighborhood: Some("Centro".into()),
                postal_code: "13010100".into(),
                installed_power: Some(75.0),
                ..Default::default()
            };
            unit.series.energy = MonthlySeries::zeros();
            if i == 0 {
                let mut demand = [None; 12];
                demand[0] = Some(40.0);
                unit.series.demand_peak = MonthlySeries(demand);
            }
            unit
        })
        .collect();
    resolve(key, canonical)
}

async fn count(pool: &PgPool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}.{}", SCHEMA, table);
    Ok(sqlx::query_scalar(&sql).fetch_one(pool).await?)
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_ensure_schema_is_repeatable() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;

    db::ensure_schema(&pool, SCHEMA).await?;
    assert_eq!(count(&pool, "unidade_consumidora").await?, 0);
    assert_eq!(count(&pool, "import_status").await?, 0);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_load_writes_every_table_once() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;
    let destination = PgDestination::new(pool.clone(), SCHEMA)?;
    let key = JobKey::new("CPFL_PAULISTA", 2023, "UCAT");

    let identified = units(&key, &["AT-1", "AT-2"]);
    let batch = LoadBatch {
        key: key.clone(),
        leads: collect_leads(&key, &identified),
        units: identified,
    };
    let counts = destination.load(&batch).await?;
    assert_eq!(counts.units, 2);
    assert_eq!(counts.leads, 1);
    assert_eq!(counts.energy_rows, 2);
    assert_eq!(counts.demand_rows, 1);
    assert_eq!(counts.quality_rows, 0);

    assert_eq!(count(&pool, "unidade_consumidora").await?, 2);
    assert_eq!(count(&pool, "lead").await?, 1);
    assert_eq!(count(&pool, "lead_energia").await?, 2);
    assert_eq!(count(&pool, "lead_demanda").await?, 1);

    let ids: Vec<String> = batch.units.iter().map(|u| u.unit_id.clone()).collect();
    assert_eq!(destination.existing_units(&ids).await?.len(), 2);

    // A second load of the same keys skips them and writes no series rows
    let again = destination.load(&batch).await?;
    assert_eq!(again.units, 0);
    assert_eq!(again.energy_rows, 0);
    assert_eq!(count(&pool, "unidade_consumidora").await?, 2);
    assert_eq!(count(&pool, "lead_energia").await?, 2);
    assert_eq!(count(&pool, "lead_demanda").await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
#[ignore = "requires docker"]
async fn test_concurrent_loads_of_same_units() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;
    let destination = Arc::new(PgDestination::new(pool.clone(), SCHEMA)?);
    let key = JobKey::new("CPFL_PAULISTA", 2023, "UCBT");

    let codes: Vec<String> = (0..200).map(|i| format!("BT-{}", i)).collect();
    let codes: Vec<&str> = codes.iter().map(String::as_str).collect();
    let identified = units(&key, &codes);
    let batch = LoadBatch {
        key: key.clone(),
        leads: collect_leads(&key, &identified),
        units: identified,
    };

    let (a, b) = tokio::join!(
        {
            let destination = destination.clone();
            let batch = batch.clone();
            tokio::spawn(async move { destination.load(&batch).await })
        },
        {
            let destination = destination.clone();
            let batch = batch.clone();
            tokio::spawn(async move { destination.load(&batch).await })
        }
    );
    let (a, b) = (a??, b??);

    assert_eq!(a.units + b.units, 200);
    assert_eq!(a.energy_rows + b.energy_rows, 200);
    assert_eq!(count(&pool, "unidade_consumidora").await?, 200);
    assert_eq!(count(&pool, "lead_energia").await?, 200);
    assert_eq!(count(&pool, "lead_demanda").await?, 1);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_fan_out_loader_is_idempotent() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;
    let loader = FanOutLoader::new(Arc::new(PgDestination::new(pool.clone(), SCHEMA)?));
    let key = JobKey::new("CPFL_PAULISTA", 2023, "UCMT");

    let first = loader.load_chunk(&key, units(&key, &["X1", "X1", "X2"])).await?;
    assert_eq!(first.duplicates, 1);
    assert_eq!(first.counts.units, 2);

    let second = loader.load_chunk(&key, units(&key, &["X1", "X2", "X3"])).await?;
    assert_eq!(second.already_present, 2);
    assert_eq!(second.counts.units, 1);
    assert_eq!(second.counts.leads, 0);

    assert_eq!(count(&pool, "unidade_consumidora").await?, 3);
    assert_eq!(count(&pool, "lead").await?, 1);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_coordinates_fill_only_empty_units() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;
    let destination = PgDestination::new(pool.clone(), SCHEMA)?;
    let key = JobKey::new("CPFL_PAULISTA", 2023, "UCBT");
    let identified = units(&key, &["BT-1"]);
    let batch = LoadBatch {
        key: key.clone(),
        leads: collect_leads(&key, &identified),
        units: identified,
    };
    destination.load(&batch).await?;

    let points_key = JobKey::new("CPFL_PAULISTA", 2023, "PONNOT");
    let update = |lat: f64| CoordinateUpdate {
        natural_code: "BT-1".to_string(),
        lat,
        lng: -47.06,
    };
    assert_eq!(destination.apply_coordinates(&points_key, &[update(-22.9)]).await?, 1);
    assert_eq!(destination.apply_coordinates(&points_key, &[update(-10.0)]).await?, 0);

    // Another year of the same distributor is untouched
    let other_year = JobKey::new("CPFL_PAULISTA", 2022, "PONNOT");
    assert_eq!(destination.apply_coordinates(&other_year, &[update(-22.9)]).await?, 0);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_status_store_upsert() -> Result<()> {
    init_tracing();
    let (_container, pool) = setup().await?;
    let store = Arc::new(PgStatusStore::new(pool.clone(), SCHEMA)?);
    let key = JobKey::new("CPFL_PAULISTA", 2023, "UCAT");

    let queued = store
        .set_status(StatusUpdate::new(key.clone(), JobStatus::Queued).with_rows(0))
        .await?;
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.rows_processed, 0);

    let tracker = StatusTracker::new(store.clone());
    let mut handle = tracker.begin(&key, "starting").await?;
    handle.progress(5000, "importing chunk 1").await?;
    let running = store.get_status(&key).await?.expect("record");
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.rows_processed, 5000);
    assert_eq!(running.note.as_deref(), Some("importing chunk 1"));

    let failed = tracker.record_failure(&key, "connection reset").await?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.rows_processed, 5000);
    assert_eq!(failed.error.as_deref(), Some("connection reset"));
    assert!(failed.updated_at >= failed.created_at);

    let done = tracker.begin(&key, "retry").await?.complete("done").await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.rows_processed, 0);
    assert!(done.error.is_none());

    assert_eq!(store.list().await?.len(), 1);
    Ok(())
}
