use crate::db::models::{NewTagReading, NormalizedBatch};
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;

/// Write one batch into `tag_reading` atomically.
///
/// Every row goes through the same INSERT text, so diesel's prepared statement
/// cache reuses one statement for the whole batch. Any failing row rolls the
/// whole batch back. An empty batch returns without opening a transaction.
pub fn persist_batch(conn: &mut PgConnection, batch: &NormalizedBatch) -> Result<usize, String> {
    if batch.is_empty() {
        return Ok(0);
    }

    use schema::tag_reading::dsl as R;

    let rows = batch
        .readings
        .iter()
        .map(|r| NewTagReading::from_reading(batch.time, r))
        .collect::<Vec<_>>();

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let mut inserted = 0;
        for row in &rows {
            inserted += diesel::insert_into(R::tag_reading).values(row).execute(conn)?;
        }
        Ok(inserted)
    })
    .map_err(|e| format!("insert tag readings failed ({} row(s) rolled back): {}", rows.len(), e))
}
