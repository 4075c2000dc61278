//! Gateway/device/tag lookups used by the payload processor.
//!
//! Devices and tags are keyed by UNIQUE (gateway_id, code) and (device_id, code).
//! Creation always goes through `INSERT ... ON CONFLICT`, so two workers racing on
//! the same key converge on one row instead of failing or duplicating it.

use crate::db::models::{DataType, Device, Gateway, NewDevice, NewTag, Tag};
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;

/// What `sync_tags` did to a single tag row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagChange {
    Created,
    /// Stored type was overwritten; `from` is the previous `data_type` text.
    Retyped { from: String },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagSync {
    pub tag: Tag,
    pub change: TagChange,
}

pub fn find_gateway(conn: &mut PgConnection, gateway_id: i32) -> Result<Option<Gateway>, String> {
    use schema::gateway::dsl as G;

    G::gateway
        .find(gateway_id)
        .select(Gateway::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch gateway {} failed: {}", gateway_id, e))
}

/// Returns the device and whether this call created it.
pub fn find_or_create_device(conn: &mut PgConnection, gateway_id: i32, code: &str) -> Result<(Device, bool), String> {
    use schema::device::dsl as D;

    let existing = D::device
        .filter(D::gateway_id.eq(gateway_id).and(D::code.eq(code)))
        .select(Device::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch device failed: {}", e))?;
    if let Some(device) = existing {
        return Ok((device, false));
    }

    let inserted = diesel::insert_into(D::device)
        .values(&NewDevice { gateway_id, code })
        .on_conflict((D::gateway_id, D::code))
        .do_nothing()
        .execute(conn)
        .map_err(|e| format!("insert device failed: {}", e))?;

    // a concurrent insert may have won; either way exactly one row exists now
    let device = D::device
        .filter(D::gateway_id.eq(gateway_id).and(D::code.eq(code)))
        .select(Device::as_select())
        .first(conn)
        .map_err(|e| format!("fetch device failed: {}", e))?;
    Ok((device, inserted > 0))
}

/// Creates missing tags and overwrites changed types for one device, all in one
/// transaction. `tags` must not repeat a code.
///
/// Rows are written in code order so concurrent syncs of the same device take
/// their row locks in the same order and cannot deadlock. The result follows
/// that order too.
pub fn sync_tags(conn: &mut PgConnection, device_id: i32, tags: &[(String, DataType)]) -> Result<Vec<TagSync>, String> {
    use schema::tag::dsl as T;

    if tags.is_empty() {
        return Ok(Vec::new());
    }

    let mut ordered = tags.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let mut synced = Vec::with_capacity(ordered.len());
        for (code, data_type) in ordered {
            let existing = T::tag
                .filter(T::device_id.eq(device_id).and(T::code.eq(code)))
                .select(Tag::as_select())
                .first(conn)
                .optional()?;

            let previous = match existing {
                Some(tag) if tag.data_type == data_type.as_str() => {
                    synced.push(TagSync {
                        tag,
                        change: TagChange::Unchanged,
                    });
                    continue;
                }
                other => other.map(|t| t.data_type),
            };

            let tag = diesel::insert_into(T::tag)
                .values(&NewTag {
                    device_id,
                    code: code.as_str(),
                    data_type: data_type.as_str(),
                })
                .on_conflict((T::device_id, T::code))
                .do_update()
                .set(T::data_type.eq(excluded(T::data_type)))
                .returning(Tag::as_returning())
                .get_result(conn)?;

            let change = match previous {
                Some(from) => TagChange::Retyped { from },
                None => TagChange::Created,
            };
            synced.push(TagSync { tag, change });
        }
        Ok(synced)
    })
    .map_err(|e| format!("upsert tags for device {} failed: {}", device_id, e))
}
