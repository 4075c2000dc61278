//! Helpers for tests that need a real TimescaleDB.
//!
//! Set `TEST_DATABASE_URL` to enable them; without it those tests return early.
//! `test_connection` runs inside a test transaction that is never committed;
//! `committed_connection` is for tests that need several sessions to see each
//! other's writes and must clean up with `remove_gateway`.

use crate::MIGRATIONS;
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::MigrationHarness;

pub fn test_connection() -> Option<PgConnection> {
    let mut conn = committed_connection()?;
    conn.begin_test_transaction().expect("begin test transaction");
    Some(conn)
}

pub fn committed_connection() -> Option<PgConnection> {
    let url = std::env::var("TEST_DATABASE_URL").ok().filter(|s| !s.trim().is_empty())?;
    let mut conn = PgConnection::establish(&url).expect("connect to TEST_DATABASE_URL");
    conn.run_pending_migrations(MIGRATIONS).expect("apply migrations");
    Some(conn)
}

pub fn insert_gateway(conn: &mut PgConnection, name: &str) -> i32 {
    use schema::gateway::dsl as G;
    diesel::insert_into(G::gateway)
        .values(G::name.eq(name))
        .returning(G::id)
        .get_result(conn)
        .expect("insert gateway")
}

/// Delete a gateway with its devices and tags. Readings must already be gone.
pub fn remove_gateway(conn: &mut PgConnection, gateway_id: i32) {
    use schema::device::dsl as D;
    use schema::gateway::dsl as G;
    use schema::tag::dsl as T;

    let devices = D::device.filter(D::gateway_id.eq(gateway_id)).select(D::id);
    diesel::delete(T::tag.filter(T::device_id.eq_any(devices)))
        .execute(conn)
        .expect("delete tags");
    diesel::delete(D::device.filter(D::gateway_id.eq(gateway_id)))
        .execute(conn)
        .expect("delete devices");
    diesel::delete(G::gateway.find(gateway_id))
        .execute(conn)
        .expect("delete gateway");
}
