use crate::command::{AofBatch, arg_to_i64, bulk_array, bulk_or_null, key_string};
use crate::error::{KvError, KvResult};
use crate::resp::RespValue;
use crate::store::{Db, Entity};
use std::collections::VecDeque;

fn push(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch, left: bool) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let values = &args[1..];
    let push_all = |list: &mut VecDeque<Vec<u8>>| {
        for v in values {
            if left {
                list.push_front(v.clone());
            } else {
                list.push_back(v.clone());
            }
        }
        list.len()
    };

    let len = db.with_entity_mut(&key, |e| match e {
        Some(Entity::List(list)) => Ok(Some(push_all(list))),
        Some(_) => Err(KvError::WrongType),
        None => Ok(None),
    })?;
    let len = match len {
        Some(len) => len,
        None => {
            let mut list = VecDeque::with_capacity(values.len());
            let len = push_all(&mut list);
            db.put_entity(&key, Entity::List(list));
            len
        }
    };
    aof.record(if left { "LPUSH" } else { "RPUSH" }, args);
    Ok(RespValue::integer(len as i64))
}

pub fn cmd_lpush(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    push(db, args, aof, true)
}

pub fn cmd_rpush(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    push(db, args, aof, false)
}

fn pop(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch, left: bool) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let (value, now_empty) = db.with_entity_mut(&key, |e| match e {
        Some(Entity::List(list)) => {
            let v = if left { list.pop_front() } else { list.pop_back() };
            Ok((v, list.is_empty()))
        }
        Some(_) => Err(KvError::WrongType),
        None => Ok((None, false)),
    })?;
    if now_empty {
        db.remove(&key);
    }
    if value.is_some() {
        aof.record(if left { "LPOP" } else { "RPOP" }, args);
    }
    Ok(bulk_or_null(value))
}

pub fn cmd_lpop(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    pop(db, args, aof, true)
}

pub fn cmd_rpop(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    pop(db, args, aof, false)
}

/// Run `f` on the list at `key`; missing keys read as an empty list.
fn read_list<R>(db: &Db, key: &[u8], f: impl FnOnce(&VecDeque<Vec<u8>>) -> R) -> KvResult<R> {
    db.with_entity(&key_string(key), |e| match e {
        Some(Entity::List(list)) => Ok(f(list)),
        Some(_) => Err(KvError::WrongType),
        None => Ok(f(&VecDeque::new())),
    })
}

pub fn cmd_llen(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let len = read_list(db, &args[0], |l| l.len())?;
    Ok(RespValue::integer(len as i64))
}

/// Resolve a possibly negative index against `len`.
fn normalize(index: i64, len: usize) -> i64 {
    if index < 0 { len as i64 + index } else { index }
}

pub fn cmd_lindex(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let index = arg_to_i64(&args[1])?;
    let value = read_list(db, &args[0], |l| {
        let i = normalize(index, l.len());
        usize::try_from(i).ok().and_then(|i| l.get(i).cloned())
    })?;
    Ok(bulk_or_null(value))
}

pub fn cmd_lrange(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let start = arg_to_i64(&args[1])?;
    let stop = arg_to_i64(&args[2])?;
    let items = read_list(db, &args[0], |l| {
        let len = l.len() as i64;
        let start = normalize(start, l.len()).max(0);
        let stop = normalize(stop, l.len()).min(len - 1);
        if start > stop {
            return Vec::new();
        }
        l.range(start as usize..=stop as usize).cloned().collect::<Vec<_>>()
    })?;
    Ok(bulk_array(items))
}
