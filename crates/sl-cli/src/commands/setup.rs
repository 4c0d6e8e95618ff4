//! Setup command implementation

use anyhow::{Context, Result};
use sl_core::{ddl, SchemaCatalog};
use sl_db::{DuckDbBackend, Warehouse};

use crate::cli::{GlobalArgs, SetupArgs};
use crate::commands::common::{load_catalog, load_config};

/// Execute the setup command
pub async fn execute(args: &SetupArgs, global: &GlobalArgs) -> Result<()> {
    let config = load_config(global)?;
    let catalog = load_catalog()?;
    let db = DuckDbBackend::new(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path))?;

    if args.drop {
        drop_tables(&db, &catalog).await?;
    }
    create_tables(&db, &catalog).await?;

    println!(
        "Created {} tables in {}",
        catalog.len(),
        config.database.path
    );
    Ok(())
}

/// Create every catalog table that does not exist yet, referenced tables first
pub(crate) async fn create_tables<W>(db: &W, catalog: &SchemaCatalog) -> Result<()>
where
    W: Warehouse + ?Sized,
{
    for spec in catalog.dependency_order() {
        db.execute_batch(&ddl::create_table_sql(spec))
            .await
            .with_context(|| format!("Failed to create table {}", spec.name))?;
        log::debug!("Created {} table {}", spec.kind, spec.name);
    }
    Ok(())
}

/// Drop every catalog table, referencing tables first
async fn drop_tables<W>(db: &W, catalog: &SchemaCatalog) -> Result<()>
where
    W: Warehouse + ?Sized,
{
    for spec in catalog.dependency_order().into_iter().rev() {
        db.execute_batch(&ddl::drop_table_sql(spec))
            .await
            .with_context(|| format!("Failed to drop table {}", spec.name))?;
        log::info!("Dropped {}", spec.name);
    }
    Ok(())
}

#[cfg(test)]
#[path = "setup_test.rs"]
mod tests;
