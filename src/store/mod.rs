pub mod barrier;
pub mod dict;
pub mod entity;
pub mod lock;

use crate::command::{AofBatch, CommandSpec, CommandTable, pexpireat_command};
use crate::error::KvError;
use crate::persistence::aof::Aof;
use crate::resp::{CmdLine, RespValue};
use crate::timewheel::TimeWheel;
use barrier::StopWorld;
use dict::ConcurrentDict;
pub use entity::{Entity, now_millis};
use lock::{KeyGuards, LockMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, error};

const DATA_SHARDS: usize = 1 << 10;
const TTL_SHARDS: usize = 1 << 8;

pub(crate) fn expire_task_key(key: &str) -> String {
    format!("expire:{key}")
}

/// The local key space: entities, their expiration instants, the stripe
/// locks guarding them and the command table that mutates them.
pub struct Db {
    data: ConcurrentDict<Entity>,
    /// key -> absolute expiry in unix milliseconds
    ttl: ConcurrentDict<u64>,
    locker: LockMap,
    stop_world: StopWorld,
    scheduler: Option<Arc<TimeWheel>>,
    aof: OnceLock<Aof>,
    commands: Arc<CommandTable>,
    this: Weak<Db>,
}

impl Db {
    pub fn new(commands: Arc<CommandTable>, scheduler: Option<Arc<TimeWheel>>) -> Arc<Db> {
        Arc::new_cyclic(|this| Db {
            data: ConcurrentDict::new(DATA_SHARDS),
            ttl: ConcurrentDict::new(TTL_SHARDS),
            locker: LockMap::default(),
            stop_world: StopWorld::new(),
            scheduler,
            aof: OnceLock::new(),
            commands,
            this: this.clone(),
        })
    }

    /// A table with no scheduler and no log, used to replay a log into
    /// memory. Expired keys are dropped on read instead of by timer.
    pub fn scratch(commands: Arc<CommandTable>) -> Arc<Db> {
        Self::new(commands, None)
    }

    pub fn arc(&self) -> Option<Arc<Db>> {
        self.this.upgrade()
    }

    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    pub fn locker(&self) -> &LockMap {
        &self.locker
    }

    pub fn scheduler(&self) -> Option<&Arc<TimeWheel>> {
        self.scheduler.as_ref()
    }

    /// Attach the persistence log. Returns false if one is already attached.
    pub fn attach_aof(&self, aof: Aof) -> bool {
        self.aof.set(aof).is_ok()
    }

    pub fn aof(&self) -> Option<&Aof> {
        self.aof.get()
    }

    // ---- command execution ----

    /// Execute one command line: resolve, lock its keys in canonical order,
    /// run it, and log its effect before the locks are released.
    pub async fn exec(&self, cmdline: &[Vec<u8>]) -> RespValue {
        let spec = match self.commands.lookup(cmdline) {
            Ok(spec) => spec,
            Err(e) => return RespValue::error(e.to_string()),
        };
        let args = &cmdline[1..];
        let (write, read) = (spec.keys)(args);
        let guards = self.locker.rw_locks(&write, &read).await;
        let reply = self.run(spec, args).await;
        drop(guards);
        reply
    }

    /// Execute with the keys' locks already held by the caller.
    pub async fn exec_locked(&self, cmdline: &[Vec<u8>]) -> RespValue {
        match self.commands.lookup(cmdline) {
            Ok(spec) => self.run(spec, &cmdline[1..]).await,
            Err(e) => RespValue::error(e.to_string()),
        }
    }

    async fn run(&self, spec: &CommandSpec, args: &[Vec<u8>]) -> RespValue {
        let mut batch = AofBatch::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| (spec.exec)(self, args, &mut batch)));
        match outcome {
            Ok(Ok(reply)) => {
                if let Some(aof) = self.aof.get() {
                    for record in batch.into_records() {
                        aof.append(record).await;
                    }
                }
                reply
            }
            Ok(Err(e)) => RespValue::error(e.to_string()),
            Err(_) => {
                error!(command = spec.name, "Command executor panicked");
                RespValue::error(KvError::Internal.to_string())
            }
        }
    }

    /// Lock `keys` for writing. Used by transactions, which hold the locks
    /// between prepare and commit.
    pub async fn lock_keys(&self, keys: &[String]) -> KeyGuards {
        self.locker.locks(keys).await
    }

    // ---- entity access ----

    fn is_expired(&self, key: &str) -> bool {
        self.ttl.get(key).is_some_and(|at| at <= now_millis())
    }

    fn evict_if_expired(&self, key: &str) {
        if self.is_expired(key) {
            self.remove_unguarded(key);
        }
    }

    fn remove_unguarded(&self, key: &str) -> usize {
        if self.ttl.remove(key) == 1
            && let Some(wheel) = &self.scheduler
        {
            wheel.cancel(&expire_task_key(key));
        }
        self.data.remove(key)
    }

    pub fn get_entity(&self, key: &str) -> Option<Entity> {
        self.with_entity(key, |e| e.cloned())
    }

    pub fn with_entity<R>(&self, key: &str, f: impl FnOnce(Option<&Entity>) -> R) -> R {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.data.with(key, f)
    }

    /// `f` must not call back into the table.
    pub fn with_entity_mut<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entity>) -> R) -> R {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.data.with_mut(key, f)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.with_entity(key, |e| e.is_some())
    }

    /// Store `entity`. Returns 1 for a new key, 0 when it replaced one.
    pub fn put_entity(&self, key: &str, entity: Entity) -> usize {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.data.put(key, entity)
    }

    pub fn put_if_absent(&self, key: &str, entity: Entity) -> usize {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.data.put_if_absent(key, entity)
    }

    pub fn put_if_exists(&self, key: &str, entity: Entity) -> usize {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.data.put_if_exists(key, entity)
    }

    /// Remove `key` and its TTL. Returns 1 if a live key was removed.
    pub fn remove(&self, key: &str) -> usize {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.remove_unguarded(key)
    }

    pub fn removes<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        keys.iter().map(|k| self.remove(k.as_ref())).sum()
    }

    /// Remove and return the entity together with its expiry instant.
    pub fn take(&self, key: &str) -> Option<(Entity, Option<u64>)> {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        let entity = self.data.take(key)?;
        let ttl = self.ttl.take(key);
        if ttl.is_some()
            && let Some(wheel) = &self.scheduler
        {
            wheel.cancel(&expire_task_key(key));
        }
        Some((entity, ttl))
    }

    /// Drop every key. Waits for in-flight table operations and blocks new
    /// ones until the table is empty.
    pub fn flush(&self) {
        let _raised = self.stop_world.raise();
        if let Some(wheel) = &self.scheduler {
            self.ttl.for_each(|key, _| {
                wheel.cancel(&expire_task_key(key));
                true
            });
        }
        self.data.clear();
        self.ttl.clear();
    }

    /// Visit every live entity. Not a consistent snapshot across shards.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Entity, Option<u64>) -> bool) {
        let _pass = self.stop_world.enter();
        let now = now_millis();
        self.data.for_each(|key, entity| {
            let ttl = self.ttl.get(key);
            if ttl.is_some_and(|at| at <= now) {
                return true;
            }
            f(key, entity, ttl)
        });
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.for_each(|key, _, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    pub fn random_key(&self) -> Option<String> {
        let _pass = self.stop_world.enter();
        self.data
            .random_distinct_keys(8)
            .into_iter()
            .find(|key| !self.is_expired(key))
    }

    // ---- expiration ----

    /// Expire `key` at `at_ms` (unix milliseconds). An instant in the past
    /// removes the key immediately.
    pub fn expire(&self, key: &str, at_ms: u64) {
        let _pass = self.stop_world.enter();
        if at_ms <= now_millis() {
            self.remove_unguarded(key);
            return;
        }
        self.ttl.put(key, at_ms);
        self.schedule_eviction(key, at_ms);
    }

    fn schedule_eviction(&self, key: &str, at_ms: u64) {
        let Some(wheel) = &self.scheduler else {
            return;
        };
        let this = self.this.clone();
        let owned = key.to_string();
        let when = UNIX_EPOCH + Duration::from_millis(at_ms);
        wheel.at(
            when,
            expire_task_key(key),
            Box::new(move || {
                let Some(db) = this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let _guards = db.locker.lock(&owned).await;
                    // a later write may have extended or cleared the TTL
                    if db.is_expired(&owned) {
                        db.remove(&owned);
                        debug!(key = %owned, "Key expired");
                    }
                });
            }),
        );
    }

    /// Clear the TTL. Returns true if the key had one.
    pub fn persist(&self, key: &str) -> bool {
        let _pass = self.stop_world.enter();
        if self.ttl.remove(key) == 0 {
            return false;
        }
        if let Some(wheel) = &self.scheduler {
            wheel.cancel(&expire_task_key(key));
        }
        true
    }

    /// Expiry instant of a live key, in unix milliseconds.
    pub fn expire_at(&self, key: &str) -> Option<u64> {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        self.ttl.get(key)
    }

    /// Commands that recreate `key` exactly as it is now (value plus absolute
    /// expiry), or `None` if the key does not exist.
    pub fn reconstruction(&self, key: &str) -> Option<Vec<CmdLine>> {
        let _pass = self.stop_world.enter();
        self.evict_if_expired(key);
        let command = self.data.with(key, |e| e.map(|e| e.to_command(key)))?;
        let mut commands = vec![command];
        if let Some(at) = self.ttl.get(key) {
            commands.push(pexpireat_command(key, at));
        }
        Some(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> CmdLine {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    fn new_db() -> Arc<Db> {
        Db::new(Arc::new(CommandTable::new()), None)
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let db = new_db();
        assert_eq!(db.exec(&cmd(&["SET", "k", "v"])).await, RespValue::ok());
        assert_eq!(
            db.exec(&cmd(&["GET", "k"])).await,
            RespValue::bulk_string(b"v".to_vec())
        );
        assert_eq!(db.exec(&cmd(&["DEL", "k", "missing"])).await, RespValue::integer(1));
        assert_eq!(db.exec(&cmd(&["GET", "k"])).await, RespValue::null_bulk_string());
    }

    #[tokio::test]
    async fn test_unknown_and_arity_errors() {
        let db = new_db();
        assert_eq!(
            db.exec(&cmd(&["FOO"])).await,
            RespValue::error("ERR unknown command 'foo'")
        );
        assert_eq!(
            db.exec(&cmd(&["GET"])).await,
            RespValue::error("ERR wrong number of arguments for 'get' command")
        );
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let db = new_db();
        db.put_entity("k", Entity::String(b"v".to_vec()));
        db.ttl.put("k", now_millis() - 1);
        assert!(db.get_entity("k").is_none());
        assert_eq!(db.len(), 0);
    }

    #[tokio::test]
    async fn test_past_expiry_removes_immediately() {
        let db = new_db();
        db.put_entity("k", Entity::String(b"v".to_vec()));
        db.expire("k", now_millis().saturating_sub(1000));
        assert!(!db.exists("k"));
    }

    #[tokio::test]
    async fn test_reconstruction_includes_ttl() {
        let db = new_db();
        db.put_entity("k", Entity::String(b"v".to_vec()));
        let at = now_millis() + 60_000;
        db.expire("k", at);
        let commands = db.reconstruction("k").unwrap();
        assert_eq!(commands[0], cmd(&["SET", "k", "v"]));
        assert_eq!(commands[1], pexpireat_command("k", at));
        assert!(db.reconstruction("nope").is_none());
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let db = new_db();
        for i in 0..50 {
            db.put_entity(&format!("k{i}"), Entity::String(vec![i]));
        }
        db.expire("k1", now_millis() + 60_000);
        db.flush();
        assert!(db.is_empty());
        assert!(db.expire_at("k1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_eviction() {
        let wheel = TimeWheel::start(Duration::from_millis(10), 64);
        let db = Db::new(Arc::new(CommandTable::new()), Some(wheel.clone()));
        db.put_entity("k", Entity::String(b"v".to_vec()));
        db.expire("k", now_millis() + 60_000);
        assert!(wheel.contains(&expire_task_key("k")));
        assert!(db.persist("k"));
        assert!(!wheel.contains(&expire_task_key("k")));
        db.expire("k", now_millis() + 60_000);
        db.remove("k");
        assert!(wheel.is_empty());
    }

    #[tokio::test]
    async fn test_executor_panic_is_contained() {
        fn boom(_: &Db, _: &[Vec<u8>], _: &mut AofBatch) -> crate::error::KvResult<RespValue> {
            panic!("boom")
        }
        let db = new_db();
        let spec = CommandSpec {
            name: "boom",
            arity: 1,
            write: true,
            keys: |_| (Vec::new(), Vec::new()),
            exec: boom,
        };
        assert_eq!(db.run(&spec, &[]).await, RespValue::error("ERR internal error"));
        // the table is still usable afterwards
        assert_eq!(db.exec(&cmd(&["SET", "k", "v"])).await, RespValue::ok());
    }
}
