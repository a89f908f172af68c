//! Redis-backed fixed-window rate counters, for deployments running more than
//! one replica. Each `user:action` window is one key with an explicit TTL; the
//! Lua script makes increment-and-check a single round trip.

use thiserror::Error;

use crate::error::LexamError;

const DEFAULT_WINDOW_TTL_SECS: u64 = 3 * 60;

const FIXED_WINDOW_SCRIPT: &str = r#"
local cap = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

-- return codes:
--   1 = allowed
--   2 = blocked
if cap == 0 then
  return 2
end

local count = tonumber(redis.call("INCR", KEYS[1]))
if count == 1 then
  redis.call("EXPIRE", KEYS[1], ttl)
end
if count > cap then
  return 2
end
return 1
"#;

#[derive(Clone, Debug)]
pub struct RedisLimitStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisLimitStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisLimitError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "lexam".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key_window(&self, user_id: &str, action: &str, minute: u64) -> String {
        format!("{}:rate_limit:{user_id}:{action}:{minute}", self.prefix)
    }

    pub async fn check_and_consume(
        &self,
        user_id: &str,
        action: &str,
        per_minute: Option<u32>,
        minute: u64,
    ) -> Result<(), LexamError> {
        let Some(per_minute) = per_minute else {
            return Ok(());
        };

        let mut conn = self.connection().await.map_err(|err| LexamError::Internal {
            message: format!("redis error: {err}"),
        })?;

        let script = redis::Script::new(FIXED_WINDOW_SCRIPT);
        let code: i64 = script
            .key(self.key_window(user_id, action, minute))
            .arg(i64::from(per_minute))
            .arg(DEFAULT_WINDOW_TTL_SECS as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| LexamError::Internal {
                message: format!("redis error: {err}"),
            })?;

        match code {
            1 => Ok(()),
            2 => Err(LexamError::RateLimited {
                limit: format!("{action}>{per_minute}/min"),
            }),
            _ => Err(LexamError::Internal {
                message: format!("unexpected rate limit script response: {code}"),
            }),
        }
    }
}
