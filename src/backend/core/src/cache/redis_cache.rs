//! Redis aggregate cache.
//!
//! Each entity is a hash at `{prefix}:{entity_id}` with the fields
//! `averageRating`, `reviewCount` and `version`, all stored as strings.
//! Entries written before versioning (no `version` field) read as version 0.

use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{info, warn};

use super::key::{KeySpace, FIELD_COUNT, FIELD_MEAN, FIELD_VERSION};
use super::{AggregateCache, CacheLookup, CachedAggregate, CasOutcome};
use crate::aggregate::{AggregateRecord, EntityId};
use crate::config::redact_url;
use crate::error::{ErrorCode, Result, RollupError};

/// Compare-and-set in one round trip.
///
/// ARGV: expected version ('' = expect no usable entry, '*' = write
/// unconditionally), mean, count. Returns the new version, or -1 on conflict.
///
/// The field checks mirror [`parse_mean`], [`parse_count`] and the version
/// rule in [`RedisAggregateCache::parse_entry`]; the two must accept exactly
/// the same entries.
const CAS_SCRIPT: &str = r#"
local function trim(s)
    return (string.gsub(s, '^%s*(.-)%s*$', '%1'))
end

local function parse_count(s)
    local digits = string.match(trim(s), '^0*(%d+)$')
    if not digits or #digits > 20 or (#digits == 20 and digits > '18446744073709551615') then
        return nil
    end
    return digits
end

local function parse_mean(s)
    s = trim(s)
    local mantissa = string.match(s, '^[+-]?([%d%.]+)[eE][+-]?%d+$') or string.match(s, '^[+-]?([%d%.]+)$')
    if not mantissa or not string.find(mantissa, '%d') then
        return nil
    end
    if select(2, string.gsub(mantissa, '%.', '')) > 1 then
        return nil
    end
    local n = tonumber(s)
    if not n or n ~= n or n == math.huge or n == -math.huge then
        return nil
    end
    return n
end

local avg = redis.call('HGET', KEYS[1], 'averageRating')
local cnt = redis.call('HGET', KEYS[1], 'reviewCount')
local raw_ver = redis.call('HGET', KEYS[1], 'version')

local ver = '0'
if raw_ver then
    ver = parse_count(raw_ver)
end
local usable = avg and cnt and ver and parse_mean(avg) ~= nil and parse_count(cnt) ~= nil

if ARGV[1] == '' then
    if usable then
        return -1
    end
elseif ARGV[1] ~= '*' then
    if not usable or ver ~= ARGV[1] then
        return -1
    end
end

local new_version = 1
if usable then
    new_version = tonumber(ver) + 1
end
redis.call('HSET', KEYS[1], 'averageRating', ARGV[2], 'reviewCount', ARGV[3], 'version', new_version)
return new_version
"#;

fn is_field_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
}

/// A count or version field: decimal digits within `u64`, surrounding
/// whitespace allowed.
fn parse_count(raw: &str) -> Option<u64> {
    let digits = raw.trim_matches(is_field_space);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A mean field: a finite decimal number with optional sign and exponent,
/// surrounding whitespace allowed. `nan`, `inf` and hex forms are rejected.
fn parse_mean(raw: &str) -> Option<f64> {
    let number = raw.trim_matches(is_field_space);
    let unsigned = number.strip_prefix(&['+', '-'][..]).unwrap_or(number);
    let (mantissa, exponent) = match unsigned.find(&['e', 'E'][..]) {
        Some(i) => (&unsigned[..i], Some(&unsigned[i + 1..])),
        None => (unsigned, None),
    };

    let mantissa_ok = mantissa.bytes().any(|b| b.is_ascii_digit())
        && mantissa.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        && mantissa.matches('.').count() <= 1;
    let exponent_ok = exponent.map_or(true, |e| {
        let digits = e.strip_prefix(&['+', '-'][..]).unwrap_or(e);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    });
    if !mantissa_ok || !exponent_ok {
        return None;
    }

    number.parse::<f64>().ok().filter(|m| m.is_finite())
}

/// Open a Redis connection manager and check it with a PING.
pub async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).map_err(|e| {
        RollupError::with_internal(
            ErrorCode::CacheConnectionFailed,
            "Failed to create Redis client",
            e.to_string(),
        )
    })?;

    let mut conn = ConnectionManager::new(client).await.map_err(|e| {
        RollupError::with_internal(
            ErrorCode::CacheConnectionFailed,
            "Failed to connect to Redis",
            e.to_string(),
        )
    })?;

    let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
        RollupError::with_internal(ErrorCode::CacheConnectionFailed, "Redis ping failed", e.to_string())
    })?;

    info!("Connected to Redis at {}", redact_url(url));
    Ok(conn)
}

/// Aggregate cache stored in Redis hashes.
#[derive(Clone)]
pub struct RedisAggregateCache {
    conn: ConnectionManager,
    keys: KeySpace,
    cas: redis::Script,
}

impl RedisAggregateCache {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            cas: redis::Script::new(CAS_SCRIPT),
        }
    }

    pub(crate) fn parse_entry(entity: EntityId, fields: &HashMap<String, String>) -> CacheLookup {
        let (Some(mean), Some(count)) = (fields.get(FIELD_MEAN), fields.get(FIELD_COUNT)) else {
            return CacheLookup::Miss;
        };

        let mean = parse_mean(mean);
        let count = parse_count(count);
        let version = match fields.get(FIELD_VERSION) {
            Some(v) => parse_count(v),
            None => Some(0),
        };

        match (mean, count, version) {
            (Some(mean), Some(count), Some(version)) => CacheLookup::Hit(CachedAggregate {
                record: AggregateRecord::new(mean, count),
                version,
            }),
            _ => {
                warn!(
                    entity_id = %entity,
                    fields = ?fields,
                    "Unparseable cache entry, treating as a miss"
                );
                counter!("rollup_cache_corrupt_entries_total").increment(1);
                CacheLookup::Miss
            }
        }
    }
}

#[async_trait]
impl AggregateCache for RedisAggregateCache {
    async fn get(&self, entity: EntityId) -> Result<CacheLookup> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.keys.entity(entity))
            .await
            .map_err(RollupError::from)?;

        let lookup = Self::parse_entry(entity, &fields);
        let result = if lookup.is_hit() { "hit" } else { "miss" };
        counter!("rollup_cache_lookups_total", "backend" => "redis", "result" => result).increment(1);
        Ok(lookup)
    }

    async fn set(&self, entity: EntityId, record: AggregateRecord) -> Result<u64> {
        let mut conn = self.conn.clone();
        let version: i64 = self
            .cas
            .key(self.keys.entity(entity))
            .arg("*")
            .arg(record.mean.to_string())
            .arg(record.count)
            .invoke_async(&mut conn)
            .await
            .map_err(RollupError::from)?;
        Ok(version.max(0) as u64)
    }

    async fn compare_and_set(
        &self,
        entity: EntityId,
        expected: Option<u64>,
        record: AggregateRecord,
    ) -> Result<CasOutcome> {
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let version: i64 = self
            .cas
            .key(self.keys.entity(entity))
            .arg(expected)
            .arg(record.mean.to_string())
            .arg(record.count)
            .invoke_async(&mut conn)
            .await
            .map_err(RollupError::from)?;

        if version < 0 {
            Ok(CasOutcome::Conflict)
        } else {
            Ok(CasOutcome::Applied {
                version: version as u64,
            })
        }
    }
}
