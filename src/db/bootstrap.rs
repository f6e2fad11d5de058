use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use log::info;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// Create the sensors, readings and recipes tables (and their indexes) when
/// they do not exist yet. Safe to run on every startup.
pub fn ensure_schema(conn: &mut PgConnection) -> Result<(), String> {
    conn.batch_execute(SCHEMA_SQL)
        .map_err(|e| format!("Creating database schema failed: {}", e))?;
    info!("Database schema present (sensors, readings, recipes)");
    Ok(())
}
