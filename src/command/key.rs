use crate::command::{AofBatch, arg_to_i64, bulk_array, bulk_or_null, key_string};
use crate::error::{KvError, KvResult};
use crate::glob::glob_match;
use crate::resp::RespValue;
use crate::store::{Db, now_millis};

pub fn cmd_del(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let keys: Vec<String> = args.iter().map(|k| key_string(k)).collect();
    let removed = db.removes(&keys);
    if removed > 0 {
        aof.record("DEL", args);
    }
    Ok(RespValue::integer(removed as i64))
}

pub fn cmd_exists(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let count = args.iter().filter(|k| db.exists(&key_string(k))).count();
    Ok(RespValue::integer(count as i64))
}

pub fn cmd_type(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let name = db.with_entity(&key_string(&args[0]), |e| e.map_or("none", |e| e.type_name()));
    Ok(RespValue::simple_string(name))
}

/// Shared body of the EXPIRE family. `to_unix_ms` turns the parsed argument
/// into an absolute instant.
fn expire_generic(
    db: &Db,
    args: &[Vec<u8>],
    aof: &mut AofBatch,
    to_unix_ms: impl FnOnce(i64) -> Option<i64>,
    name: &str,
) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let n = arg_to_i64(&args[1])?;
    let at = to_unix_ms(n).ok_or_else(|| KvError::InvalidExpire(name.into()))?;
    if !db.exists(&key) {
        return Ok(RespValue::integer(0));
    }
    let at = at.max(0) as u64;
    db.expire(&key, at);
    if at <= now_millis() {
        aof.record("DEL", &args[..1]);
    } else {
        aof.record_expire_at(&key, at);
    }
    Ok(RespValue::integer(1))
}

fn now_i64() -> i64 {
    now_millis() as i64
}

pub fn cmd_expire(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    expire_generic(db, args, aof, |s| s.checked_mul(1000)?.checked_add(now_i64()), "expire")
}

pub fn cmd_pexpire(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    expire_generic(db, args, aof, |ms| ms.checked_add(now_i64()), "pexpire")
}

pub fn cmd_expireat(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    expire_generic(db, args, aof, |s| s.checked_mul(1000), "expireat")
}

pub fn cmd_pexpireat(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    expire_generic(db, args, aof, Some, "pexpireat")
}

/// -2 for a missing key, -1 for a key without TTL, else remaining ms.
fn remaining_ms(db: &Db, key: &str) -> i64 {
    if !db.exists(key) {
        return -2;
    }
    match db.expire_at(key) {
        Some(at) => at.saturating_sub(now_millis()) as i64,
        None => -1,
    }
}

pub fn cmd_ttl(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let ms = remaining_ms(db, &key_string(&args[0]));
    Ok(RespValue::integer(if ms < 0 { ms } else { (ms + 500) / 1000 }))
}

pub fn cmd_pttl(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    Ok(RespValue::integer(remaining_ms(db, &key_string(&args[0]))))
}

pub fn cmd_persist(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    if !db.exists(&key) || !db.persist(&key) {
        return Ok(RespValue::integer(0));
    }
    aof.record("PERSIST", args);
    Ok(RespValue::integer(1))
}

/// Move `src` to `dst`, carrying its TTL along.
fn rename(db: &Db, src: &str, dst: &str) -> KvResult<()> {
    let (entity, ttl) = db.take(src).ok_or(KvError::NoSuchKey)?;
    db.remove(dst);
    db.put_entity(dst, entity);
    if let Some(at) = ttl {
        db.expire(dst, at);
    }
    Ok(())
}

pub fn cmd_rename(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    rename(db, &key_string(&args[0]), &key_string(&args[1]))?;
    aof.record("RENAME", args);
    Ok(RespValue::ok())
}

pub fn cmd_renamenx(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let (src, dst) = (key_string(&args[0]), key_string(&args[1]));
    if !db.exists(&src) {
        return Err(KvError::NoSuchKey);
    }
    if db.exists(&dst) {
        return Ok(RespValue::integer(0));
    }
    rename(db, &src, &dst)?;
    aof.record("RENAME", args);
    Ok(RespValue::integer(1))
}

pub fn cmd_keys(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let pattern = key_string(&args[0]);
    let keys = db
        .keys()
        .into_iter()
        .filter(|k| glob_match(&pattern, k))
        .map(String::into_bytes);
    Ok(bulk_array(keys))
}

pub fn cmd_randomkey(db: &Db, _args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    Ok(bulk_or_null(db.random_key().map(String::into_bytes)))
}

#[cfg(test)]
mod tests {
    use crate::command::CommandTable;
    use crate::resp::{CmdLine, RespValue};
    use crate::store::Db;
    use std::sync::Arc;

    fn cmd(parts: &[&str]) -> CmdLine {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    async fn run(db: &Db, parts: &[&str]) -> RespValue {
        db.exec(&cmd(parts)).await
    }

    #[tokio::test]
    async fn test_expire_family() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        assert_eq!(run(&db, &["EXPIRE", "missing", "10"]).await, RespValue::integer(0));
        run(&db, &["SET", "k", "v"]).await;
        assert_eq!(run(&db, &["TTL", "k"]).await, RespValue::integer(-1));
        assert_eq!(run(&db, &["PEXPIRE", "k", "50000"]).await, RespValue::integer(1));
        let RespValue::Integer(pttl) = run(&db, &["PTTL", "k"]).await else {
            panic!("expected integer");
        };
        assert!(pttl > 49_000 && pttl <= 50_000);
        assert_eq!(run(&db, &["PERSIST", "k"]).await, RespValue::integer(1));
        assert_eq!(run(&db, &["PERSIST", "k"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["TTL", "k"]).await, RespValue::integer(-1));

        // an instant in the past deletes the key
        assert_eq!(run(&db, &["EXPIREAT", "k", "1"]).await, RespValue::integer(1));
        assert_eq!(run(&db, &["EXISTS", "k"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["TTL", "k"]).await, RespValue::integer(-2));
    }

    #[tokio::test]
    async fn test_rename_carries_ttl() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        run(&db, &["SET", "a", "1"]).await;
        run(&db, &["EXPIRE", "a", "100"]).await;
        run(&db, &["SET", "b", "2"]).await;
        assert_eq!(run(&db, &["RENAMENX", "a", "b"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["RENAME", "a", "b"]).await, RespValue::ok());
        assert_eq!(run(&db, &["GET", "b"]).await, RespValue::bulk_string(b"1".to_vec()));
        assert_eq!(run(&db, &["EXISTS", "a"]).await, RespValue::integer(0));
        let RespValue::Integer(ttl) = run(&db, &["TTL", "b"]).await else {
            panic!("expected integer");
        };
        assert!(ttl > 0);
        assert_eq!(
            run(&db, &["RENAME", "a", "c"]).await,
            RespValue::error("ERR no such key")
        );
    }

    #[tokio::test]
    async fn test_keys_type_randomkey() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        assert_eq!(run(&db, &["RANDOMKEY"]).await, RespValue::null_bulk_string());
        run(&db, &["SET", "user:1", "a"]).await;
        run(&db, &["SET", "user:2", "b"]).await;
        run(&db, &["SADD", "tags", "x"]).await;
        let RespValue::Array(Some(mut keys)) = run(&db, &["KEYS", "user:*"]).await else {
            panic!("expected array");
        };
        keys.sort_by_key(|v| format!("{v:?}"));
        assert_eq!(
            keys,
            vec![
                RespValue::bulk_string(b"user:1".to_vec()),
                RespValue::bulk_string(b"user:2".to_vec()),
            ]
        );
        assert_eq!(run(&db, &["TYPE", "tags"]).await, RespValue::simple_string("set"));
        assert_eq!(run(&db, &["TYPE", "nope"]).await, RespValue::simple_string("none"));
        assert!(matches!(run(&db, &["RANDOMKEY"]).await, RespValue::BulkString(Some(_))));
        assert_eq!(run(&db, &["DEL", "user:1", "user:2", "zzz"]).await, RespValue::integer(2));
    }
}
