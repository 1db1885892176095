//! Redis helpers shared by the tracker, the hook agent and the reaper.

use redis::aio::ConnectionLike;
use std::collections::HashMap;

use super::keys::FIELD_UPDATE_TIME;
use super::scripts;
use crate::common::utils::now_unix;
use crate::error::{JobServiceError, Result};

const SCAN_COUNT: usize = 100;

/// Pop the lowest-scored member of a sorted set.
///
/// Runs `MULTI; ZRANGE key 0 0 WITHSCORES; ZREMRANGEBYRANK key 0 0; EXEC`. An empty set
/// yields a [`JobServiceError::no_elements`] error, distinct from transport failures.
pub async fn zpop_min<C>(conn: &mut C, key: &str) -> Result<(String, f64)>
where
    C: ConnectionLike + Send,
{
    let (range, _removed): (Vec<String>, i64) = redis::pipe()
        .atomic()
        .cmd("ZRANGE")
        .arg(key)
        .arg(0)
        .arg(0)
        .arg("WITHSCORES")
        .cmd("ZREMRANGEBYRANK")
        .arg(key)
        .arg(0)
        .arg(0)
        .query_async(conn)
        .await?;

    let mut it = range.into_iter();
    match (it.next(), it.next()) {
        (Some(member), Some(score)) => {
            let score = score.parse::<f64>().map_err(|e| {
                JobServiceError::internal(format!("Bad score {} in {}: {}", score, key, e))
            })?;
            Ok((member, score))
        }
        _ => Err(JobServiceError::no_elements(key)),
    }
}

/// `HSET` the given fields plus `update_time = now`.
pub async fn hm_set<C>(conn: &mut C, key: &str, fields: &[(&str, String)]) -> Result<()>
where
    C: ConnectionLike + Send,
{
    let mut cmd = redis::cmd("HSET");
    cmd.arg(key);
    for (field, value) in fields {
        if *field == FIELD_UPDATE_TIME {
            continue;
        }
        cmd.arg(*field).arg(value);
    }
    cmd.arg(FIELD_UPDATE_TIME).arg(now_unix());
    cmd.query_async::<_, i64>(conn).await?;
    Ok(())
}

/// `HMGET` the given fields in order.
pub async fn hm_get<C>(conn: &mut C, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>
where
    C: ConnectionLike + Send,
{
    let values: Vec<Option<String>> = redis::cmd("HMGET")
        .arg(key)
        .arg(fields)
        .query_async(conn)
        .await?;
    Ok(values)
}

/// Read a whole hash; an absent key yields an empty map.
pub async fn hget_all<C>(conn: &mut C, key: &str) -> Result<HashMap<String, String>>
where
    C: ConnectionLike + Send,
{
    let values: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(key)
        .query_async(conn)
        .await?;
    Ok(values)
}

/// All keys matching `pattern`, walked with a 64-bit SCAN cursor.
pub async fn scan_keys<C>(conn: &mut C, pattern: &str) -> Result<Vec<String>>
where
    C: ConnectionLike + Send,
{
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}

/// All field/value pairs of a hash, walked with a 64-bit HSCAN cursor.
pub async fn hscan_all<C>(conn: &mut C, key: &str) -> Result<Vec<(String, String)>>
where
    C: ConnectionLike + Send,
{
    let mut cursor: u64 = 0;
    let mut pairs = Vec::new();
    loop {
        let (next, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        let mut it = flat.into_iter();
        while let (Some(field), Some(value)) = (it.next(), it.next()) {
            pairs.push((field, value));
        }
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(pairs)
}

/// `SET key token NX PX ttl_ms`; true when the lock was taken.
pub async fn acquire_lock<C>(conn: &mut C, key: &str, token: &str, ttl_ms: u64) -> Result<bool>
where
    C: ConnectionLike + Send,
{
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("PX")
        .arg(ttl_ms)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Delete the lock only if `token` still owns it.
pub async fn release_lock<C>(conn: &mut C, key: &str, token: &str) -> Result<bool>
where
    C: ConnectionLike + Send,
{
    let deleted: i64 = scripts::release_lock()
        .key(key)
        .arg(token)
        .invoke_async(conn)
        .await?;
    Ok(deleted > 0)
}
