//! Server-side atomic scripts.
//!
//! Every multi-key mutation of queue state runs as a single Lua script so no
//! partial transition is ever observable. Scripts execute via EVALSHA with an
//! automatic EVAL fallback on NOSCRIPT (the `redis::Script` contract), and are
//! eagerly SCRIPT LOADed at queue construction so a ready queue implies cached
//! scripts.

use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;
use crate::redis_keys::Keys;

/// INCR the id counter, store the job record, push the id onto waiting.
///
/// KEYS: id, jobs, waiting. ARGV: record JSON. Returns the new id.
const ADD_JOB_LUA: &str = r#"
local id = redis.call("incr", KEYS[1])
redis.call("hset", KEYS[2], id, ARGV[1])
redis.call("lpush", KEYS[3], id)
return id
"#;

/// Remove a job from active/stalling and apply its terminal or retry
/// disposition in one step.
///
/// KEYS: active, stalling, jobs, succeeded, failed, waiting.
/// ARGV: id, mode (succeeded|purge|retry|failed), updated record (retry only).
const FINISH_JOB_LUA: &str = r#"
redis.call("lrem", KEYS[1], 0, ARGV[1])
redis.call("srem", KEYS[2], ARGV[1])
local mode = ARGV[2]
if mode == "succeeded" then
    redis.call("sadd", KEYS[4], ARGV[1])
elseif mode == "purge" then
    redis.call("hdel", KEYS[3], ARGV[1])
elseif mode == "retry" then
    redis.call("hset", KEYS[3], ARGV[1], ARGV[3])
    redis.call("lpush", KEYS[6], ARGV[1])
else
    redis.call("sadd", KEYS[5], ARGV[1])
end
return redis.status_reply("OK")
"#;

/// Re-enqueue every id left in the stalling set, then snapshot the active
/// list into a fresh stalling set for the next window.
///
/// KEYS: stalling, active, waiting. Returns the count of re-enqueued ids.
const CHECK_STALLED_LUA: &str = r#"
local stalled = redis.call("smembers", KEYS[1])
local recovered = 0
for _, id in ipairs(stalled) do
    if redis.call("lrem", KEYS[2], 0, id) > 0 then
        redis.call("lpush", KEYS[3], id)
        recovered = recovered + 1
    end
end
redis.call("del", KEYS[1])
local active = redis.call("lrange", KEYS[2], 0, -1)
if #active > 0 then
    redis.call("sadd", KEYS[1], unpack(active))
end
return recovered
"#;

/// Disposition applied by the finish_job script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishMode {
    /// Record the id in the succeeded set.
    Succeeded,
    /// Drop the payload instead of recording success (`remove_on_success`).
    Purge,
    /// Store the updated record and push the id back onto waiting.
    Retry,
    /// Record the id in the failed set.
    Failed,
}

impl FinishMode {
    fn as_str(self) -> &'static str {
        match self {
            FinishMode::Succeeded => "succeeded",
            FinishMode::Purge => "purge",
            FinishMode::Retry => "retry",
            FinishMode::Failed => "failed",
        }
    }
}

/// The queue's script handles.
pub(crate) struct Scripts {
    add_job: Script,
    finish_job: Script,
    check_stalled: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            add_job: Script::new(ADD_JOB_LUA),
            finish_job: Script::new(FINISH_JOB_LUA),
            check_stalled: Script::new(CHECK_STALLED_LUA),
        }
    }

    /// SCRIPT LOAD every script on the given connection.
    ///
    /// Invoked during queue construction; `Queue::new` returning Ok is the
    /// readiness signal that all scripts are cached.
    pub(crate) async fn load(&self, conn: &mut ConnectionManager) -> Result<()> {
        for lua in [ADD_JOB_LUA, FINISH_JOB_LUA, CHECK_STALLED_LUA] {
            let _sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(lua)
                .query_async(conn)
                .await?;
        }
        Ok(())
    }

    /// Persist a new job record and return its assigned id.
    pub(crate) async fn add_job(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        record: &str,
    ) -> Result<u64> {
        let id: u64 = self
            .add_job
            .key(keys.id())
            .key(keys.jobs())
            .key(keys.waiting())
            .arg(record)
            .invoke_async(conn)
            .await?;
        Ok(id)
    }

    /// Apply a job's disposition atomically with its removal from active.
    pub(crate) async fn finish_job(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
        id: u64,
        mode: FinishMode,
        record: Option<&str>,
    ) -> Result<()> {
        let _: () = self
            .finish_job
            .key(keys.active())
            .key(keys.stalling())
            .key(keys.jobs())
            .key(keys.succeeded())
            .key(keys.failed())
            .key(keys.waiting())
            .arg(id)
            .arg(mode.as_str())
            .arg(record.unwrap_or(""))
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Recover stalled jobs and open a new stall window.
    pub(crate) async fn check_stalled(
        &self,
        conn: &mut ConnectionManager,
        keys: &Keys,
    ) -> Result<u64> {
        let recovered: u64 = self
            .check_stalled
            .key(keys.stalling())
            .key(keys.active())
            .key(keys.waiting())
            .invoke_async(conn)
            .await?;
        Ok(recovered)
    }
}
