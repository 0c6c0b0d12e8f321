use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::{CommandQueueEntry, CommandQueueStore, QueueEntryState};
use crate::error::AppResult;
use crate::models::CommandEnvelope;

const KEY_PREFIX: &str = "ledlink:cmdq";

/// Replaces the entry holding `kind` (if any) and appends the new one.
const ENQUEUE_SCRIPT: &str = r#"
local order_key = KEYS[1]
local entries_key = KEYS[2]
local kinds_key = KEYS[3]
local inflight_key = KEYS[4]
local terminals_key = KEYS[5]
local kind = ARGV[1]
local member = ARGV[2]
local score = ARGV[3]
local entry = ARGV[4]
local terminal_id = ARGV[5]

local superseded = false
local old_member = redis.call('HGET', kinds_key, kind)
if old_member then
    superseded = redis.call('HGET', entries_key, old_member)
    redis.call('HDEL', entries_key, old_member)
    redis.call('ZREM', order_key, old_member)
    redis.call('ZREM', inflight_key, terminal_id .. '|' .. old_member)
end

redis.call('HSET', kinds_key, kind, member)
redis.call('HSET', entries_key, member, entry)
redis.call('ZADD', order_key, score, member)
redis.call('SADD', terminals_key, terminal_id)
return superseded
"#;

/// Removes an entry and releases its kind slot only if it still owns it.
const REMOVE_SCRIPT: &str = r#"
local order_key = KEYS[1]
local entries_key = KEYS[2]
local kinds_key = KEYS[3]
local inflight_key = KEYS[4]
local terminals_key = KEYS[5]
local member = ARGV[1]
local terminal_id = ARGV[2]

local entry = redis.call('HGET', entries_key, member)
if not entry then
    return false
end

local kind = cjson.decode(entry)['kind']
if redis.call('HGET', kinds_key, kind) == member then
    redis.call('HDEL', kinds_key, kind)
end
redis.call('HDEL', entries_key, member)
redis.call('ZREM', order_key, member)
redis.call('ZREM', inflight_key, terminal_id .. '|' .. member)
if redis.call('ZCARD', order_key) == 0 then
    redis.call('SREM', terminals_key, terminal_id)
end
return entry
"#;

/// Writes a new entry state if the stored JSON is unchanged since it was read.
const SET_STATE_SCRIPT: &str = r#"
local entries_key = KEYS[1]
local inflight_key = KEYS[2]
local member = ARGV[1]
local expected = ARGV[2]
local entry = ARGV[3]
local in_flight_member = ARGV[4]
local deadline_ms = ARGV[5]

if redis.call('HGET', entries_key, member) ~= expected then
    return 0
end

redis.call('HSET', entries_key, member, entry)
if deadline_ms == '' then
    redis.call('ZREM', inflight_key, in_flight_member)
else
    redis.call('ZADD', inflight_key, deadline_ms, in_flight_member)
end
return 1
"#;

/// Read-compare-write rounds before a contended state change gives up.
const STATE_WRITE_ATTEMPTS: usize = 3;

/// Queue store shared by every server instance through Redis.
///
/// Per terminal: `{prefix}:{terminal}:order` (zset scored by issue time),
/// `:entries` (hash of id to entry JSON) and `:kinds` (hash of kind to id).
/// In-flight deadlines live in one global zset so the sweep avoids a scan.
pub struct RedisCommandQueueStore {
    connection_manager: Arc<redis::aio::ConnectionManager>,
    enqueue_script: Script,
    remove_script: Script,
    set_state_script: Script,
}

impl RedisCommandQueueStore {
    pub fn new(connection_manager: Arc<redis::aio::ConnectionManager>) -> Self {
        Self {
            connection_manager,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
            set_state_script: Script::new(SET_STATE_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection_manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(Arc::new(connection_manager)))
    }

    fn connection(&self) -> redis::aio::ConnectionManager {
        self.connection_manager.as_ref().clone()
    }

    /// Replace the stored entry JSON only if it still equals `expected`.
    ///
    /// A supersede or removal by another instance between the read and this
    /// write makes it a no-op, so a replaced command can never be written back.
    async fn compare_and_set(
        &self,
        expected: &str,
        entry: &CommandQueueEntry,
    ) -> AppResult<bool> {
        let keys = TerminalKeys::new(&entry.terminal_id);
        let deadline_ms = match entry.state {
            QueueEntryState::InFlight { deadline } => deadline.timestamp_millis().to_string(),
            QueueEntryState::Queued => String::new(),
        };

        let mut conn = self.connection();
        let applied: i64 = self
            .set_state_script
            .key(&keys.entries)
            .key(in_flight_key())
            .arg(member(entry.command_id))
            .arg(expected)
            .arg(serde_json::to_string(entry)?)
            .arg(in_flight_member(&entry.terminal_id, entry.command_id))
            .arg(deadline_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn transition<F>(&self, terminal_id: &str, command_id: i32, apply: F) -> AppResult<bool>
    where
        F: Fn(&mut CommandQueueEntry) + Send + Sync,
    {
        let keys = TerminalKeys::new(terminal_id);
        for _ in 0..STATE_WRITE_ATTEMPTS {
            let mut conn = self.connection();
            let raw: Option<String> = conn.hget(&keys.entries, member(command_id)).await?;
            let Some(raw) = raw else {
                return Ok(false);
            };
            let mut entry: CommandQueueEntry = serde_json::from_str(&raw)?;
            apply(&mut entry);
            if self.compare_and_set(&raw, &entry).await? {
                return Ok(true);
            }
            debug!(terminal_id = %terminal_id, command_id, "command_queue_state_write_raced");
        }
        Ok(false)
    }
}

struct TerminalKeys {
    order: String,
    entries: String,
    kinds: String,
}

impl TerminalKeys {
    fn new(terminal_id: &str) -> Self {
        Self {
            order: format!("{}:{}:order", KEY_PREFIX, terminal_id),
            entries: format!("{}:{}:entries", KEY_PREFIX, terminal_id),
            kinds: format!("{}:{}:kinds", KEY_PREFIX, terminal_id),
        }
    }
}

fn in_flight_key() -> String {
    format!("{}:inflight", KEY_PREFIX)
}

fn terminals_key() -> String {
    format!("{}:terminals", KEY_PREFIX)
}

/// Zero-padded so members sharing a score sort by numeric id.
fn member(command_id: i32) -> String {
    format!("{:010}", command_id)
}

fn in_flight_member(terminal_id: &str, command_id: i32) -> String {
    format!("{}|{}", terminal_id, member(command_id))
}

fn parse_in_flight_member(raw: &str) -> Option<(&str, i32)> {
    let (terminal_id, id) = raw.rsplit_once('|')?;
    Some((terminal_id, id.parse().ok()?))
}

fn decode(raw: Option<String>) -> AppResult<Option<CommandQueueEntry>> {
    raw.map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(Into::into)
}

#[async_trait]
impl CommandQueueStore for RedisCommandQueueStore {
    async fn enqueue(&self, envelope: &CommandEnvelope) -> AppResult<Option<CommandQueueEntry>> {
        let entry = CommandQueueEntry::queued(envelope, Utc::now());
        let keys = TerminalKeys::new(&entry.terminal_id);
        let mut conn = self.connection();

        let superseded: Option<String> = self
            .enqueue_script
            .key(&keys.order)
            .key(&keys.entries)
            .key(&keys.kinds)
            .key(in_flight_key())
            .key(terminals_key())
            .arg(&entry.kind)
            .arg(member(entry.command_id))
            .arg(envelope.issued_at.timestamp_millis())
            .arg(serde_json::to_string(&entry)?)
            .arg(&entry.terminal_id)
            .invoke_async(&mut conn)
            .await?;

        debug!(
            terminal_id = %entry.terminal_id,
            command_id = entry.command_id,
            kind = %entry.kind,
            replaced = superseded.is_some(),
            "command_queue_enqueued"
        );

        decode(superseded)
    }

    async fn get(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>> {
        let keys = TerminalKeys::new(terminal_id);
        let mut conn = self.connection();
        let raw: Option<String> = conn.hget(&keys.entries, member(command_id)).await?;
        decode(raw)
    }

    async fn mark_in_flight(
        &self,
        terminal_id: &str,
        command_id: i32,
        deadline: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.transition(terminal_id, command_id, |entry| {
            entry.state = QueueEntryState::InFlight { deadline };
            entry.attempts += 1;
        })
        .await
    }

    async fn mark_queued(&self, terminal_id: &str, command_id: i32) -> AppResult<bool> {
        self.transition(terminal_id, command_id, |entry| {
            entry.state = QueueEntryState::Queued;
        })
        .await
    }

    async fn remove(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>> {
        let keys = TerminalKeys::new(terminal_id);
        let mut conn = self.connection();

        let removed: Option<String> = self
            .remove_script
            .key(&keys.order)
            .key(&keys.entries)
            .key(&keys.kinds)
            .key(in_flight_key())
            .key(terminals_key())
            .arg(member(command_id))
            .arg(terminal_id)
            .invoke_async(&mut conn)
            .await?;

        decode(removed)
    }

    async fn pending(&self, terminal_id: &str) -> AppResult<Vec<CommandQueueEntry>> {
        let keys = TerminalKeys::new(terminal_id);
        let mut conn = self.connection();

        let members: Vec<String> = conn.zrange(&keys.order, 0, -1).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.entries)
            .arg(&members)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            entries.push(serde_json::from_str::<CommandQueueEntry>(&json)?);
        }
        // Score ties break on the padded member, which already matches sequence order.
        entries.sort_by_key(|e| e.sequence());
        Ok(entries)
    }

    async fn is_current(&self, terminal_id: &str, kind: &str, command_id: i32) -> AppResult<bool> {
        let keys = TerminalKeys::new(terminal_id);
        let mut conn = self.connection();
        let current: Option<String> = conn.hget(&keys.kinds, kind).await?;
        Ok(current.as_deref() == Some(member(command_id).as_str()))
    }

    async fn expired_in_flight(&self, now: DateTime<Utc>) -> AppResult<Vec<CommandQueueEntry>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn
            .zrangebyscore(in_flight_key(), "-inf", now.timestamp_millis())
            .await?;

        let mut expired = Vec::with_capacity(members.len());
        for raw in &members {
            let Some((terminal_id, command_id)) = parse_in_flight_member(raw) else {
                let _: () = conn.zrem(in_flight_key(), raw).await?;
                continue;
            };
            match self.get(terminal_id, command_id).await? {
                Some(entry) if entry.in_flight_expired(now) => expired.push(entry),
                Some(_) => {}
                None => {
                    // Entry was removed without clearing its deadline.
                    let _: () = conn.zrem(in_flight_key(), raw).await?;
                }
            }
        }
        Ok(expired)
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut conn = self.connection();
        let terminals: Vec<String> = conn.smembers(terminals_key()).await?;

        let mut removed = 0;
        for terminal_id in terminals {
            for entry in self.pending(&terminal_id).await? {
                if entry.enqueued_at < cutoff
                    && self.remove(&terminal_id, entry.command_id).await?.is_some()
                {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandIntent, ExecutionMode};

    #[test]
    fn test_members_sort_numerically() {
        let mut members = vec![member(1_234_567), member(100_000), member(99_999_999)];
        members.sort();
        assert_eq!(
            members,
            vec![member(100_000), member(1_234_567), member(99_999_999)]
        );
    }

    #[test]
    fn test_in_flight_member_round_trip_with_pipe_in_terminal_id() {
        let raw = in_flight_member("site|A", 100_123);
        assert_eq!(parse_in_flight_member(&raw), Some(("site|A", 100_123)));
        assert_eq!(parse_in_flight_member("garbage"), None);
    }

    #[test]
    fn test_entry_json_carries_state_tag() {
        let envelope = CommandEnvelope::from_intent(
            100_001,
            CommandIntent {
                terminal_id: "T1".into(),
                organization_id: "org".into(),
                kind: "brightness".into(),
                execution_mode: ExecutionMode::Put,
                payload: serde_json::json!({"value": 80}),
                expires_at: None,
            },
            Utc::now(),
        );
        let mut entry = CommandQueueEntry::queued(&envelope, Utc::now());
        entry.state = QueueEntryState::InFlight { deadline: Utc::now() };

        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"], "in_flight");
        assert_eq!(json["kind"], "brightness");
        assert!(json["deadline"].is_string());

        let back: CommandQueueEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    /// Runs against a live server when `REDIS_URL` is set.
    #[tokio::test]
    async fn test_redis_supersede_and_remove() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let store = RedisCommandQueueStore::connect(&url).await.unwrap();
        let terminal_id = format!("test-{}", uuid::Uuid::new_v4());

        let make = |id: i32, kind: &str, offset: i64| {
            CommandEnvelope::from_intent(
                id,
                CommandIntent {
                    terminal_id: terminal_id.clone(),
                    organization_id: "org".into(),
                    kind: kind.into(),
                    execution_mode: ExecutionMode::Put,
                    payload: serde_json::Value::Null,
                    expires_at: None,
                },
                Utc::now() + chrono::Duration::milliseconds(offset),
            )
        };

        assert!(store.enqueue(&make(100_001, "brightness", 0)).await.unwrap().is_none());
        let old = store.enqueue(&make(100_002, "brightness", 1)).await.unwrap();
        assert_eq!(old.map(|e| e.command_id), Some(100_001));
        assert!(store.is_current(&terminal_id, "brightness", 100_002).await.unwrap());

        // A state write prepared before the supersede must not resurrect the old entry.
        let mut stale = CommandQueueEntry::queued(&make(100_001, "brightness", 0), Utc::now());
        let stale_raw = serde_json::to_string(&stale).unwrap();
        stale.state = QueueEntryState::InFlight {
            deadline: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(!store.compare_and_set(&stale_raw, &stale).await.unwrap());
        assert!(store.get(&terminal_id, 100_001).await.unwrap().is_none());
        assert!(store
            .expired_in_flight(Utc::now())
            .await
            .unwrap()
            .iter()
            .all(|e| e.terminal_id != terminal_id));

        assert!(store
            .mark_in_flight(&terminal_id, 100_002, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap());
        let current = store.get(&terminal_id, 100_002).await.unwrap().unwrap();
        assert!(current.is_in_flight());
        assert_eq!(current.attempts, 1);
        assert!(!store.mark_queued(&terminal_id, 100_001).await.unwrap());

        let removed = store.remove(&terminal_id, 100_002).await.unwrap();
        assert_eq!(removed.map(|e| e.command_id), Some(100_002));
        assert!(store.pending(&terminal_id).await.unwrap().is_empty());
    }
}
