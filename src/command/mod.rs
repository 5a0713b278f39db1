pub mod hash;
pub mod key;
pub mod list;
pub mod server_cmd;
pub mod set;
pub mod string;

use crate::error::{KvError, KvResult};
use crate::resp::{CmdLine, RespValue};
use crate::store::Db;
use std::collections::HashMap;

/// Runs one command against the table. Receives the arguments without the
/// command name. The caller holds the locks for the command's keys.
pub type ExecFn = fn(&Db, &[Vec<u8>], &mut AofBatch) -> KvResult<RespValue>;

/// Returns `(write_keys, read_keys)` for the arguments (name excluded).
pub type KeysFn = fn(&[Vec<u8>]) -> (Vec<String>, Vec<String>);

pub struct CommandSpec {
    pub name: &'static str,
    /// Redis convention: positive is the exact argument count including the
    /// name, negative is the minimum.
    pub arity: i32,
    pub write: bool,
    pub keys: KeysFn,
    pub exec: ExecFn,
}

impl CommandSpec {
    pub fn check_arity(&self, argc: usize) -> KvResult<()> {
        let argc = argc as i32;
        let ok = if self.arity >= 0 {
            argc == self.arity
        } else {
            argc >= -self.arity
        };
        if ok {
            Ok(())
        } else {
            Err(KvError::WrongArgCount(self.name.to_string()))
        }
    }
}

/// Log records produced by one command execution, appended to the log in
/// order once the executor returns successfully.
#[derive(Debug, Default)]
pub struct AofBatch {
    records: Vec<CmdLine>,
}

impl AofBatch {
    /// Record `name args...`.
    pub fn record(&mut self, name: &str, args: &[Vec<u8>]) {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(name.as_bytes().to_vec());
        cmd.extend(args.iter().cloned());
        self.records.push(cmd);
    }

    pub fn push(&mut self, cmd: CmdLine) {
        self.records.push(cmd);
    }

    /// Relative expirations are always logged as an absolute instant so a
    /// replay at a later time does not extend the key's life.
    pub fn record_expire_at(&mut self, key: &str, at_ms: u64) {
        self.records.push(pexpireat_command(key, at_ms));
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<CmdLine> {
        self.records
    }
}

pub fn pexpireat_command(key: &str, at_ms: u64) -> CmdLine {
    vec![
        b"PEXPIREAT".to_vec(),
        key.as_bytes().to_vec(),
        at_ms.to_string().into_bytes(),
    ]
}

/// Immutable name -> command mapping, built once at startup.
pub struct CommandTable {
    commands: HashMap<&'static str, CommandSpec>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! cmd {
    ($table:ident, $name:literal, $arity:expr, $write:expr, $keys:expr, $exec:expr) => {
        $table.insert(
            $name,
            CommandSpec {
                name: $name,
                arity: $arity,
                write: $write,
                keys: $keys,
                exec: $exec,
            },
        );
    };
}

impl CommandTable {
    pub fn new() -> Self {
        let mut t = HashMap::new();
        const W: bool = true;
        const R: bool = false;

        // Connection / server
        cmd!(t, "ping", -1, R, no_keys, server_cmd::cmd_ping);
        cmd!(t, "echo", 2, R, no_keys, server_cmd::cmd_echo);
        cmd!(t, "dbsize", 1, R, no_keys, server_cmd::cmd_dbsize);
        cmd!(t, "flushdb", 1, W, no_keys, server_cmd::cmd_flushdb);
        cmd!(t, "flushall", 1, W, no_keys, server_cmd::cmd_flushdb);
        cmd!(t, "bgrewriteaof", 1, R, no_keys, server_cmd::cmd_bgrewriteaof);
        cmd!(t, "keys", 2, R, no_keys, key::cmd_keys);
        cmd!(t, "randomkey", 1, R, no_keys, key::cmd_randomkey);

        // Keys
        cmd!(t, "del", -2, W, write_all_keys, key::cmd_del);
        cmd!(t, "exists", -2, R, read_all_keys, key::cmd_exists);
        cmd!(t, "type", 2, R, read_first_key, key::cmd_type);
        cmd!(t, "expire", 3, W, write_first_key, key::cmd_expire);
        cmd!(t, "pexpire", 3, W, write_first_key, key::cmd_pexpire);
        cmd!(t, "expireat", 3, W, write_first_key, key::cmd_expireat);
        cmd!(t, "pexpireat", 3, W, write_first_key, key::cmd_pexpireat);
        cmd!(t, "ttl", 2, R, read_first_key, key::cmd_ttl);
        cmd!(t, "pttl", 2, R, read_first_key, key::cmd_pttl);
        cmd!(t, "persist", 2, W, write_first_key, key::cmd_persist);
        cmd!(t, "rename", 3, W, write_all_keys, key::cmd_rename);
        cmd!(t, "renamenx", 3, W, write_all_keys, key::cmd_renamenx);

        // Strings
        cmd!(t, "get", 2, R, read_first_key, string::cmd_get);
        cmd!(t, "set", -3, W, write_first_key, string::cmd_set);
        cmd!(t, "setnx", 3, W, write_first_key, string::cmd_setnx);
        cmd!(t, "setex", 4, W, write_first_key, string::cmd_setex);
        cmd!(t, "getset", 3, W, write_first_key, string::cmd_getset);
        cmd!(t, "mset", -3, W, write_pair_keys, string::cmd_mset);
        cmd!(t, "msetnx", -3, W, write_pair_keys, string::cmd_msetnx);
        cmd!(t, "mget", -2, R, read_all_keys, string::cmd_mget);
        cmd!(t, "incr", 2, W, write_first_key, string::cmd_incr);
        cmd!(t, "incrby", 3, W, write_first_key, string::cmd_incrby);
        cmd!(t, "decr", 2, W, write_first_key, string::cmd_decr);
        cmd!(t, "decrby", 3, W, write_first_key, string::cmd_decrby);
        cmd!(t, "append", 3, W, write_first_key, string::cmd_append);
        cmd!(t, "strlen", 2, R, read_first_key, string::cmd_strlen);

        // Lists
        cmd!(t, "lpush", -3, W, write_first_key, list::cmd_lpush);
        cmd!(t, "rpush", -3, W, write_first_key, list::cmd_rpush);
        cmd!(t, "lpop", 2, W, write_first_key, list::cmd_lpop);
        cmd!(t, "rpop", 2, W, write_first_key, list::cmd_rpop);
        cmd!(t, "llen", 2, R, read_first_key, list::cmd_llen);
        cmd!(t, "lindex", 3, R, read_first_key, list::cmd_lindex);
        cmd!(t, "lrange", 4, R, read_first_key, list::cmd_lrange);

        // Hashes
        cmd!(t, "hset", -4, W, write_first_key, hash::cmd_hset);
        cmd!(t, "hmset", -4, W, write_first_key, hash::cmd_hmset);
        cmd!(t, "hsetnx", 4, W, write_first_key, hash::cmd_hsetnx);
        cmd!(t, "hget", 3, R, read_first_key, hash::cmd_hget);
        cmd!(t, "hdel", -3, W, write_first_key, hash::cmd_hdel);
        cmd!(t, "hexists", 3, R, read_first_key, hash::cmd_hexists);
        cmd!(t, "hlen", 2, R, read_first_key, hash::cmd_hlen);
        cmd!(t, "hgetall", 2, R, read_first_key, hash::cmd_hgetall);
        cmd!(t, "hkeys", 2, R, read_first_key, hash::cmd_hkeys);
        cmd!(t, "hvals", 2, R, read_first_key, hash::cmd_hvals);
        cmd!(t, "hincrby", 4, W, write_first_key, hash::cmd_hincrby);

        // Sets
        cmd!(t, "sadd", -3, W, write_first_key, set::cmd_sadd);
        cmd!(t, "srem", -3, W, write_first_key, set::cmd_srem);
        cmd!(t, "sismember", 3, R, read_first_key, set::cmd_sismember);
        cmd!(t, "smembers", 2, R, read_first_key, set::cmd_smembers);
        cmd!(t, "scard", 2, R, read_first_key, set::cmd_scard);

        CommandTable { commands: t }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// Resolve the command named by `cmdline[0]` and check its arity.
    pub fn lookup(&self, cmdline: &[Vec<u8>]) -> KvResult<&CommandSpec> {
        let Some(raw) = cmdline.first() else {
            return Err(KvError::Generic("empty command".into()));
        };
        let name = String::from_utf8_lossy(raw).to_lowercase();
        let spec = self
            .commands
            .get(name.as_str())
            .ok_or_else(|| KvError::UnknownCommand(name.clone()))?;
        spec.check_arity(cmdline.len())?;
        Ok(spec)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// Key extraction

pub fn key_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn no_keys(_args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

fn write_first_key(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (args.first().map(|k| key_string(k)).into_iter().collect(), Vec::new())
}

fn read_first_key(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.first().map(|k| key_string(k)).into_iter().collect())
}

fn write_all_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(|k| key_string(k)).collect(), Vec::new())
}

fn read_all_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(|k| key_string(k)).collect())
}

fn write_pair_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (args.iter().step_by(2).map(|k| key_string(k)).collect(), Vec::new())
}

// Argument helpers

pub fn arg_to_i64(arg: &[u8]) -> KvResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(KvError::NotInteger)
}

pub fn arg_upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_uppercase()
}

pub fn bulk_or_null(value: Option<Vec<u8>>) -> RespValue {
    match value {
        Some(v) => RespValue::bulk_string(v),
        None => RespValue::null_bulk_string(),
    }
}

pub fn bulk_array<I: IntoIterator<Item = Vec<u8>>>(items: I) -> RespValue {
    RespValue::array(items.into_iter().map(RespValue::bulk_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(parts: &[&str]) -> CmdLine {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_lookup_and_arity() {
        let table = CommandTable::new();
        assert_eq!(table.lookup(&line(&["GET", "k"])).unwrap().name, "get");
        assert!(matches!(
            table.lookup(&line(&["GET"])),
            Err(KvError::WrongArgCount(n)) if n == "get"
        ));
        assert!(table.lookup(&line(&["SET", "k", "v", "EX", "10"])).is_ok());
        assert!(matches!(
            table.lookup(&line(&["NOPE"])),
            Err(KvError::UnknownCommand(n)) if n == "nope"
        ));
    }

    #[test]
    fn test_key_extraction() {
        let table = CommandTable::new();
        let mset = table.get("mset").unwrap();
        let (write, read) = (mset.keys)(&line(&["a", "1", "b", "2"]));
        assert_eq!(write, vec!["a", "b"]);
        assert!(read.is_empty());

        let mget = table.get("mget").unwrap();
        let (write, read) = (mget.keys)(&line(&["a", "b"]));
        assert!(write.is_empty());
        assert_eq!(read, vec!["a", "b"]);
        assert!(!mget.write);
    }

    #[test]
    fn test_batch_expire_record() {
        let mut batch = AofBatch::default();
        batch.record("SET", &line(&["k", "v"]));
        batch.record_expire_at("k", 1234);
        let records = batch.into_records();
        assert_eq!(records[0], line(&["SET", "k", "v"]));
        assert_eq!(records[1], line(&["PEXPIREAT", "k", "1234"]));
    }
}
