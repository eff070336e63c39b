//! Store backend for Redis-compatible servers.

use super::resp::{self, Parsed, RespValue};
use super::{ClaimOutcome, Store, StoreError, TickCommit};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

const DEFAULT_PORT: u16 = 6379;
const READ_CHUNK: usize = 4096;
const MAX_READ_AHEAD: usize = 1024 * 1024;

/// Picks the oldest schedule entries and leases the first free one.
///
/// KEYS[1] schedule, ARGV[1] lease prefix, ARGV[2] ttl in ms, ARGV[3] window.
/// Replies nil for an empty schedule, `{1, id}` on success and `{0, head}`
/// when every candidate is leased.
const CLAIM_SCRIPT: &str = r#"
local window = tonumber(ARGV[3])
local candidates = redis.call('ZRANGE', KEYS[1], 0, window - 1)
if #candidates == 0 then
    return nil
end
for _, id in ipairs(candidates) do
    if redis.call('SET', ARGV[1] .. id, 'locked', 'NX', 'PX', ARGV[2]) then
        return {1, id}
    end
end
return {0, candidates[1]}
"#;

/// Writes a tick's result only while the record exists.
///
/// KEYS[1] record, KEYS[2] pending queue, KEYS[3] quarantine list.
/// ARGV[1] consumed count, ARGV[2] number of field/value pairs, then the
/// pairs, then the quarantined messages. Replies 1 when applied and 0 when
/// the record is gone, in which case nothing is written.
const COMMIT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local field_count = tonumber(ARGV[2])
local pos = 3
if field_count > 0 then
    local fields = {}
    for i = pos, pos + field_count * 2 - 1 do
        fields[#fields + 1] = ARGV[i]
    end
    redis.call('HSET', KEYS[1], unpack(fields))
end
pos = pos + field_count * 2
local consumed = tonumber(ARGV[1])
if consumed > 0 then
    redis.call('LTRIM', KEYS[2], consumed, -1)
end
for i = pos, #ARGV do
    redis.call('RPUSH', KEYS[3], ARGV[i])
end
return 1
"#;

/// Where to reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: Option<u32>,
}

impl RedisConfig {
    /// Accepts `redis://host[:port][/db]` or a bare `host[:port]`.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let rest = url.strip_prefix("redis://").unwrap_or(url);
        let (authority, database) = match rest.split_once('/') {
            Some((authority, "")) => (authority, None),
            Some((authority, db)) => {
                let db = db
                    .parse::<u32>()
                    .map_err(|_| StoreError::InvalidUrl(url.to_string()))?;
                (authority, Some(db))
            }
            None => (rest, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| StoreError::InvalidUrl(url.to_string()))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            database,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One TCP connection with a read buffer for partial replies.
struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl Connection {
    async fn open(config: &RedisConfig) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(config.address()).await?;
        stream.set_nodelay(true)?;
        let mut connection = Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        };

        if let Some(db) = config.database {
            let db = db.to_string();
            let mut replies = connection.send(&[vec![b"SELECT".to_vec(), db.into_bytes()]]).await?;
            if let Some(reply) = replies.pop() {
                reply.expect_ok()?;
            }
        }

        info!("Connected to store at {}", config.address());
        Ok(connection)
    }

    /// Writes all commands in one batch, then reads one reply per command.
    async fn send(&mut self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<RespValue>, StoreError> {
        let mut out = Vec::new();
        for command in commands {
            resp::encode_command(command, &mut out);
        }
        self.stream.write_all(&out).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_value().await?);
        }
        Ok(replies)
    }

    /// Reads until one whole reply is buffered. The buffer is only parsed
    /// again once it holds as much as the last attempt said was missing.
    async fn read_value(&mut self) -> Result<RespValue, StoreError> {
        let mut needed = 0;
        loop {
            if self.buffer.len() >= needed {
                match resp::parse_frame(&self.buffer)? {
                    Parsed::Complete(value, used) => {
                        self.buffer.drain(..used);
                        return Ok(value);
                    }
                    Parsed::Incomplete(more) => needed = more,
                }
            }

            let missing = needed.saturating_sub(self.buffer.len());
            self.buffer.reserve(missing.clamp(READ_CHUNK, MAX_READ_AHEAD));
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "store closed the connection",
                )));
            }
        }
    }
}

/// Store backed by a Redis-compatible server.
///
/// A single connection serves all calls, one round trip at a time. Each
/// round trip is bounded by `round_trip_timeout`; on timeout or I/O failure
/// the connection is discarded and reopened by the next call.
pub struct RedisStore {
    config: RedisConfig,
    round_trip_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Connects eagerly so that a wrong address fails at startup.
    pub async fn connect(url: &str, round_trip_timeout: Duration) -> Result<Self, StoreError> {
        let config = RedisConfig::from_url(url)?;
        let connection = timeout(round_trip_timeout, Connection::open(&config))
            .await
            .map_err(|_| StoreError::Timeout(round_trip_timeout))??;

        Ok(Self {
            config,
            round_trip_timeout,
            connection: Mutex::new(Some(connection)),
        })
    }

    async fn pipeline(&self, commands: Vec<Vec<Vec<u8>>>) -> Result<Vec<RespValue>, StoreError> {
        let mut slot = self.connection.lock().await;
        let outcome = timeout(
            self.round_trip_timeout,
            Self::round_trip(&self.config, &mut slot, &commands),
        )
        .await;

        match outcome {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(err)) => {
                if err.is_unavailable() {
                    warn!("Dropping store connection after error: {}", err);
                    *slot = None;
                }
                Err(err)
            }
            Err(_) => {
                warn!(
                    "Store round trip exceeded {:?}, dropping connection",
                    self.round_trip_timeout
                );
                *slot = None;
                Err(StoreError::Timeout(self.round_trip_timeout))
            }
        }
    }

    async fn round_trip(
        config: &RedisConfig,
        slot: &mut Option<Connection>,
        commands: &[Vec<Vec<u8>>],
    ) -> Result<Vec<RespValue>, StoreError> {
        if slot.is_none() {
            debug!("Reconnecting to store at {}", config.address());
            *slot = Some(Connection::open(config).await?);
        }
        match slot.as_mut() {
            Some(connection) => connection.send(commands).await,
            None => Err(StoreError::Protocol("no store connection".to_string())),
        }
    }

    async fn execute(&self, command: Vec<Vec<u8>>) -> Result<RespValue, StoreError> {
        self.pipeline(vec![command])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Protocol("missing reply".to_string()))
    }
}

fn command<const N: usize>(parts: [&[u8]; N]) -> Vec<Vec<u8>> {
    parts.iter().map(|part| part.to_vec()).collect()
}

fn commit_command(commit: &TickCommit) -> Vec<Vec<u8>> {
    let consumed = commit.consumed.to_string();
    let pairs = commit.fields.len().to_string();
    let mut cmd = command([
        b"EVAL",
        COMMIT_SCRIPT.as_bytes(),
        b"3",
        commit.record_key.as_bytes(),
        commit.queue_key.as_bytes(),
        commit.quarantine_key.as_bytes(),
        consumed.as_bytes(),
        pairs.as_bytes(),
    ]);
    for (field, value) in &commit.fields {
        cmd.push(field.as_bytes().to_vec());
        cmd.push(value.clone());
    }
    cmd.extend(commit.quarantined.iter().cloned());
    cmd
}

fn parse_score(bytes: &[u8]) -> Result<i64, StoreError> {
    let text = String::from_utf8_lossy(bytes);
    text.parse::<f64>()
        .map(|score| score as i64)
        .map_err(|_| StoreError::Protocol(format!("invalid score {:?}", text)))
}

fn decode_claim(reply: RespValue) -> Result<ClaimOutcome, StoreError> {
    let reply = reply.into_result()?;
    if reply.is_null() {
        return Ok(ClaimOutcome::Empty);
    }

    let mut items = reply.into_array()?.into_iter();
    let status = items
        .next()
        .ok_or_else(|| StoreError::Protocol("claim reply without status".to_string()))?
        .into_integer()?;
    let id = items
        .next()
        .ok_or_else(|| StoreError::Protocol("claim reply without id".to_string()))?
        .into_bytes()?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or_else(|| StoreError::Protocol("claim reply with null id".to_string()))?;

    Ok(if status == 1 {
        ClaimOutcome::Claimed(id)
    } else {
        ClaimOutcome::Leased(id)
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn claim_oldest(
        &self,
        schedule_key: &str,
        lease_prefix: &str,
        ttl: Duration,
        window: usize,
    ) -> Result<ClaimOutcome, StoreError> {
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let window = window.max(1).to_string();
        let reply = self
            .execute(command([
                b"EVAL",
                CLAIM_SCRIPT.as_bytes(),
                b"1",
                schedule_key.as_bytes(),
                lease_prefix.as_bytes(),
                ttl_ms.as_bytes(),
                window.as_bytes(),
            ]))
            .await?;
        decode_claim(reply)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let score = score.to_string();
        self.execute(command([
            b"ZADD",
            key.as_bytes(),
            score.as_bytes(),
            member.as_bytes(),
        ]))
        .await?
        .into_integer()?;
        Ok(())
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = self
            .execute(command([b"ZREM", key.as_bytes(), member.as_bytes()]))
            .await?
            .into_integer()?;
        Ok(removed > 0)
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        self.execute(command([b"ZSCORE", key.as_bytes(), member.as_bytes()]))
            .await?
            .into_bytes()?
            .map(|bytes| parse_score(&bytes))
            .transpose()
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        let len = self
            .execute(command([b"ZCARD", key.as_bytes()]))
            .await?
            .into_integer()?;
        Ok(len.max(0) as usize)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let items = self
            .execute(command([b"HGETALL", key.as_bytes()]))
            .await?
            .into_array()?;

        let mut fields = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            let field = field.into_bytes()?.unwrap_or_default();
            let value = value.into_bytes()?.unwrap_or_default();
            fields.push((String::from_utf8_lossy(&field).into_owned(), value));
        }
        Ok(fields)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = command([b"HSET", key.as_bytes()]);
        for (field, value) in fields {
            cmd.push(field.as_bytes().to_vec());
            cmd.push(value.clone());
        }
        self.execute(cmd).await?.into_integer()?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.execute(command([b"LRANGE", key.as_bytes(), b"0", b"-1"]))
            .await?
            .into_array()?
            .into_iter()
            .map(|item| Ok(item.into_bytes()?.unwrap_or_default()))
            .collect()
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let len = self
            .execute(command([b"RPUSH", key.as_bytes(), value]))
            .await?
            .into_integer()?;
        Ok(len.max(0) as usize)
    }

    async fn commit(&self, commit: &TickCommit) -> Result<bool, StoreError> {
        let reply = self.execute(commit_command(commit)).await?.into_integer()?;
        Ok(reply == 1)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = command([b"MGET"]);
        cmd.extend(keys.iter().map(|key| key.as_bytes().to_vec()));

        self.execute(cmd)
            .await?
            .into_array()?
            .into_iter()
            .map(RespValue::into_bytes)
            .collect()
    }

    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.execute(command([b"SET", key.as_bytes(), value]))
            .await?
            .expect_ok()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        let receivers = self
            .execute(command([b"PUBLISH", channel.as_bytes(), payload]))
            .await?
            .into_integer()?;
        Ok(receivers.max(0) as usize)
    }
}
