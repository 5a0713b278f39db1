use crate::command::{AofBatch, arg_to_i64, bulk_array, bulk_or_null, key_string};
use crate::error::{KvError, KvResult};
use crate::resp::RespValue;
use crate::store::{Db, Entity};
use std::collections::HashMap;

type Fields = HashMap<Vec<u8>, Vec<u8>>;

/// Mutate the hash at `key`, creating it when absent.
fn update_hash<R>(db: &Db, key: &str, f: impl FnOnce(&mut Fields) -> R) -> KvResult<R> {
    let mut f = Some(f);
    let done = db.with_entity_mut(key, |e| match e {
        Some(Entity::Hash(fields)) => Ok(f.take().map(|f| f(fields))),
        Some(_) => Err(KvError::WrongType),
        None => Ok(None),
    })?;
    if let Some(result) = done {
        return Ok(result);
    }
    let mut fields = HashMap::new();
    let result = f.take().map(|f| f(&mut fields)).ok_or(KvError::Internal)?;
    if !fields.is_empty() {
        db.put_entity(key, Entity::Hash(fields));
    }
    Ok(result)
}

fn read_hash<R>(db: &Db, key: &[u8], f: impl FnOnce(Option<&Fields>) -> R) -> KvResult<R> {
    db.with_entity(&key_string(key), |e| match e {
        Some(Entity::Hash(fields)) => Ok(f(Some(fields))),
        Some(_) => Err(KvError::WrongType),
        None => Ok(f(None)),
    })
}

fn set_fields(db: &Db, args: &[Vec<u8>], name: &str) -> KvResult<usize> {
    if args.len() % 2 != 1 {
        return Err(KvError::WrongArgCount(name.into()));
    }
    update_hash(db, &key_string(&args[0]), |fields| {
        args[1..]
            .chunks(2)
            .filter(|pair| fields.insert(pair[0].clone(), pair[1].clone()).is_none())
            .count()
    })
}

pub fn cmd_hset(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let added = set_fields(db, args, "hset")?;
    aof.record("HSET", args);
    Ok(RespValue::integer(added as i64))
}

pub fn cmd_hmset(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    set_fields(db, args, "hmset")?;
    aof.record("HSET", args);
    Ok(RespValue::ok())
}

pub fn cmd_hsetnx(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let added = update_hash(db, &key_string(&args[0]), |fields| {
        if fields.contains_key(&args[1]) {
            return false;
        }
        fields.insert(args[1].clone(), args[2].clone());
        true
    })?;
    if added {
        aof.record("HSET", args);
    }
    Ok(RespValue::integer(added as i64))
}

pub fn cmd_hget(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let value = read_hash(db, &args[0], |h| h.and_then(|h| h.get(&args[1]).cloned()))?;
    Ok(bulk_or_null(value))
}

pub fn cmd_hdel(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let (removed, now_empty) = db.with_entity_mut(&key, |e| match e {
        Some(Entity::Hash(fields)) => {
            let removed = args[1..].iter().filter(|f| fields.remove(*f).is_some()).count();
            Ok((removed, fields.is_empty()))
        }
        Some(_) => Err(KvError::WrongType),
        None => Ok((0, false)),
    })?;
    if now_empty {
        db.remove(&key);
    }
    if removed > 0 {
        aof.record("HDEL", args);
    }
    Ok(RespValue::integer(removed as i64))
}

pub fn cmd_hexists(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let found = read_hash(db, &args[0], |h| h.is_some_and(|h| h.contains_key(&args[1])))?;
    Ok(RespValue::integer(found as i64))
}

pub fn cmd_hlen(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let len = read_hash(db, &args[0], |h| h.map_or(0, |h| h.len()))?;
    Ok(RespValue::integer(len as i64))
}

pub fn cmd_hgetall(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let items = read_hash(db, &args[0], |h| {
        h.into_iter()
            .flatten()
            .flat_map(|(f, v)| [f.clone(), v.clone()])
            .collect::<Vec<_>>()
    })?;
    Ok(bulk_array(items))
}

pub fn cmd_hkeys(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let items = read_hash(db, &args[0], |h| h.into_iter().flat_map(|h| h.keys().cloned()).collect::<Vec<_>>())?;
    Ok(bulk_array(items))
}

pub fn cmd_hvals(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let items = read_hash(db, &args[0], |h| h.into_iter().flat_map(|h| h.values().cloned()).collect::<Vec<_>>())?;
    Ok(bulk_array(items))
}

pub fn cmd_hincrby(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let delta = arg_to_i64(&args[2])?;
    let next = update_hash(db, &key_string(&args[0]), |fields| -> KvResult<i64> {
        let current = match fields.get(&args[1]) {
            Some(v) => arg_to_i64(v).map_err(|_| KvError::Generic("hash value is not an integer".into()))?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| KvError::Generic("increment or decrement would overflow".into()))?;
        fields.insert(args[1].clone(), next.to_string().into_bytes());
        Ok(next)
    })??;
    aof.record("HINCRBY", args);
    Ok(RespValue::integer(next))
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
    async fn test_hash_commands() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        assert_eq!(run(&db, &["HSET", "h", "a", "1", "b", "2"]).await, RespValue::integer(2));
        assert_eq!(run(&db, &["HSET", "h", "a", "9"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["HSETNX", "h", "a", "5"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["HGET", "h", "a"]).await, RespValue::bulk_string(b"9".to_vec()));
        assert_eq!(run(&db, &["HLEN", "h"]).await, RespValue::integer(2));
        assert_eq!(run(&db, &["HEXISTS", "h", "b"]).await, RespValue::integer(1));
        assert_eq!(run(&db, &["HINCRBY", "h", "b", "5"]).await, RespValue::integer(7));
        assert_eq!(run(&db, &["HMSET", "h", "c", "3"]).await, RespValue::ok());

        let RespValue::Array(Some(all)) = run(&db, &["HGETALL", "h"]).await else {
            panic!("expected array");
        };
        assert_eq!(all.len(), 6);

        assert_eq!(run(&db, &["HDEL", "h", "a", "b", "c", "zz"]).await, RespValue::integer(3));
        assert_eq!(run(&db, &["EXISTS", "h"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["HGET", "h", "a"]).await, RespValue::null_bulk_string());
        assert!(run(&db, &["HSET", "h", "a"]).await.is_error());
    }

    #[tokio::test]
    async fn test_hincrby_rejects_non_integer() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        run(&db, &["HSET", "h", "f", "x"]).await;
        assert_eq!(
            run(&db, &["HINCRBY", "h", "f", "1"]).await,
            RespValue::error("ERR hash value is not an integer")
        );
    }
}
