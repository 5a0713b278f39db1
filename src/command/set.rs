use crate::command::{AofBatch, bulk_array, key_string};
use crate::error::{KvError, KvResult};
use crate::resp::RespValue;
use crate::store::{Db, Entity};
use std::collections::HashSet;

pub fn cmd_sadd(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let members = &args[1..];
    let added = db.with_entity_mut(&key, |e| match e {
        Some(Entity::Set(set)) => Ok(Some(members.iter().filter(|m| set.insert((*m).clone())).count())),
        Some(_) => Err(KvError::WrongType),
        None => Ok(None),
    })?;
    let added = match added {
        Some(n) => n,
        None => {
            let set: HashSet<Vec<u8>> = members.iter().cloned().collect();
            let n = set.len();
            db.put_entity(&key, Entity::Set(set));
            n
        }
    };
    if added > 0 {
        aof.record("SADD", args);
    }
    Ok(RespValue::integer(added as i64))
}

pub fn cmd_srem(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let (removed, now_empty) = db.with_entity_mut(&key, |e| match e {
        Some(Entity::Set(set)) => {
            let removed = args[1..].iter().filter(|m| set.remove(*m)).count();
            Ok((removed, set.is_empty()))
        }
        Some(_) => Err(KvError::WrongType),
        None => Ok((0, false)),
    })?;
    if now_empty {
        db.remove(&key);
    }
    if removed > 0 {
        aof.record("SREM", args);
    }
    Ok(RespValue::integer(removed as i64))
}

fn read_set<R>(db: &Db, key: &[u8], f: impl FnOnce(Option<&HashSet<Vec<u8>>>) -> R) -> KvResult<R> {
    db.with_entity(&key_string(key), |e| match e {
        Some(Entity::Set(set)) => Ok(f(Some(set))),
        Some(_) => Err(KvError::WrongType),
        None => Ok(f(None)),
    })
}

pub fn cmd_sismember(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let found = read_set(db, &args[0], |s| s.is_some_and(|s| s.contains(&args[1])))?;
    Ok(RespValue::integer(found as i64))
}

pub fn cmd_smembers(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let members = read_set(db, &args[0], |s| s.into_iter().flatten().cloned().collect::<Vec<_>>())?;
    Ok(bulk_array(members))
}

pub fn cmd_scard(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let len = read_set(db, &args[0], |s| s.map_or(0, |s| s.len()))?;
    Ok(RespValue::integer(len as i64))
}
