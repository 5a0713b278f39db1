use crate::command::{AofBatch, arg_to_i64, arg_upper, bulk_or_null, key_string};
use crate::error::{KvError, KvResult};
use crate::resp::RespValue;
use crate::store::{Db, Entity, now_millis};

/// Current string value of `key`, or `WRONGTYPE` for other entity kinds.
fn get_string(db: &Db, key: &str) -> KvResult<Option<Vec<u8>>> {
    db.with_entity(key, |e| match e {
        Some(Entity::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(KvError::WrongType),
        None => Ok(None),
    })
}

/// Store a plain string and drop any TTL, as SET does.
fn set_plain(db: &Db, key: &str, value: Vec<u8>) {
    db.put_entity(key, Entity::String(value));
    db.persist(key);
}

pub fn cmd_get(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    Ok(bulk_or_null(get_string(db, &key_string(&args[0]))?))
}

pub fn cmd_set(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let value = args[1].clone();

    let mut nx = false;
    let mut xx = false;
    let mut ttl_ms: Option<i64> = None;

    let mut i = 2;
    while i < args.len() {
        match arg_upper(&args[i]).as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            opt @ ("EX" | "PX") => {
                if ttl_ms.is_some() {
                    return Err(KvError::SyntaxError);
                }
                i += 1;
                let n = args.get(i).ok_or(KvError::SyntaxError)?;
                let n = arg_to_i64(n)?;
                if n <= 0 {
                    return Err(KvError::InvalidExpire("set".into()));
                }
                let unit = if opt == "EX" { 1000 } else { 1 };
                ttl_ms = Some(n.checked_mul(unit).ok_or(KvError::InvalidExpire("set".into()))?);
            }
            _ => return Err(KvError::SyntaxError),
        }
        i += 1;
    }
    if nx && xx {
        return Err(KvError::SyntaxError);
    }

    let exists = db.exists(&key);
    if (nx && exists) || (xx && !exists) {
        return Ok(RespValue::null_bulk_string());
    }

    set_plain(db, &key, value.clone());
    aof.record("SET", &[args[0].clone(), value]);
    if let Some(ms) = ttl_ms {
        let at = now_millis().saturating_add(ms as u64);
        db.expire(&key, at);
        aof.record_expire_at(&key, at);
    }
    Ok(RespValue::ok())
}

pub fn cmd_setnx(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    if db.put_if_absent(&key, Entity::String(args[1].clone())) == 0 {
        return Ok(RespValue::integer(0));
    }
    aof.record("SET", args);
    Ok(RespValue::integer(1))
}

pub fn cmd_setex(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let seconds = arg_to_i64(&args[1])?;
    if seconds <= 0 {
        return Err(KvError::InvalidExpire("setex".into()));
    }
    let ms = seconds
        .checked_mul(1000)
        .ok_or(KvError::InvalidExpire("setex".into()))?;
    let at = now_millis().saturating_add(ms as u64);

    set_plain(db, &key, args[2].clone());
    db.expire(&key, at);
    aof.record("SET", &[args[0].clone(), args[2].clone()]);
    aof.record_expire_at(&key, at);
    Ok(RespValue::ok())
}

pub fn cmd_getset(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let old = get_string(db, &key)?;
    set_plain(db, &key, args[1].clone());
    aof.record("SET", args);
    Ok(bulk_or_null(old))
}

pub fn cmd_mset(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    if args.len() % 2 != 0 {
        return Err(KvError::WrongArgCount("mset".into()));
    }
    for pair in args.chunks(2) {
        set_plain(db, &key_string(&pair[0]), pair[1].clone());
    }
    aof.record("MSET", args);
    Ok(RespValue::ok())
}

pub fn cmd_msetnx(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    if args.len() % 2 != 0 {
        return Err(KvError::WrongArgCount("msetnx".into()));
    }
    if args.chunks(2).any(|pair| db.exists(&key_string(&pair[0]))) {
        return Ok(RespValue::integer(0));
    }
    for pair in args.chunks(2) {
        set_plain(db, &key_string(&pair[0]), pair[1].clone());
    }
    aof.record("MSET", args);
    Ok(RespValue::integer(1))
}

pub fn cmd_mget(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let values = args
        .iter()
        .map(|k| {
            db.with_entity(&key_string(k), |e| match e {
                Some(Entity::String(v)) => RespValue::bulk_string(v.clone()),
                _ => RespValue::null_bulk_string(),
            })
        })
        .collect();
    Ok(RespValue::array(values))
}

fn incr_by(db: &Db, args: &[Vec<u8>], delta: i64, name: &str, aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let current = match get_string(db, &key)? {
        Some(v) => arg_to_i64(&v)?,
        None => 0,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| KvError::Generic("increment or decrement would overflow".into()))?;
    // TTL is kept
    db.put_entity(&key, Entity::String(next.to_string().into_bytes()));
    aof.record(name, args);
    Ok(RespValue::integer(next))
}

pub fn cmd_incr(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    incr_by(db, args, 1, "INCR", aof)
}

pub fn cmd_decr(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    incr_by(db, args, -1, "DECR", aof)
}

pub fn cmd_incrby(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let delta = arg_to_i64(&args[1])?;
    incr_by(db, args, delta, "INCRBY", aof)
}

pub fn cmd_decrby(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let delta = arg_to_i64(&args[1])?
        .checked_neg()
        .ok_or(KvError::NotInteger)?;
    incr_by(db, &[args[0].clone(), delta.to_string().into_bytes()], delta, "INCRBY", aof)
}

pub fn cmd_append(db: &Db, args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    let key = key_string(&args[0]);
    let mut value = get_string(db, &key)?.unwrap_or_default();
    value.extend_from_slice(&args[1]);
    let len = value.len();
    db.put_entity(&key, Entity::String(value));
    aof.record("APPEND", args);
    Ok(RespValue::integer(len as i64))
}

pub fn cmd_strlen(db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let len = get_string(db, &key_string(&args[0]))?.map_or(0, |v| v.len());
    Ok(RespValue::integer(len as i64))
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

    fn new_db() -> Arc<Db> {
        Db::new(Arc::new(CommandTable::new()), None)
    }

    #[tokio::test]
    async fn test_set_options() {
        let db = new_db();
        assert_eq!(run(&db, &["SET", "k", "v", "XX"]).await, RespValue::null_bulk_string());
        assert_eq!(run(&db, &["SET", "k", "v", "NX"]).await, RespValue::ok());
        assert_eq!(run(&db, &["SET", "k", "w", "NX"]).await, RespValue::null_bulk_string());
        assert_eq!(run(&db, &["SET", "k", "w", "XX", "EX", "100"]).await, RespValue::ok());
        let RespValue::Integer(ttl) = run(&db, &["TTL", "k"]).await else {
            panic!("expected integer");
        };
        assert!((99..=100).contains(&ttl));

        // plain SET drops the TTL
        assert_eq!(run(&db, &["SET", "k", "x"]).await, RespValue::ok());
        assert_eq!(run(&db, &["TTL", "k"]).await, RespValue::integer(-1));

        assert_eq!(
            run(&db, &["SET", "k", "v", "EX", "0"]).await,
            RespValue::error("ERR invalid expire time in 'set' command")
        );
        assert_eq!(
            run(&db, &["SET", "k", "v", "NX", "XX"]).await,
            RespValue::error("ERR syntax error")
        );
    }

    #[tokio::test]
    async fn test_counters() {
        let db = new_db();
        assert_eq!(run(&db, &["INCR", "n"]).await, RespValue::integer(1));
        assert_eq!(run(&db, &["INCRBY", "n", "10"]).await, RespValue::integer(11));
        assert_eq!(run(&db, &["DECRBY", "n", "3"]).await, RespValue::integer(8));
        assert_eq!(run(&db, &["DECR", "n"]).await, RespValue::integer(7));

        run(&db, &["SET", "s", "abc"]).await;
        assert_eq!(
            run(&db, &["INCR", "s"]).await,
            RespValue::error("ERR value is not an integer or out of range")
        );
        run(&db, &["SET", "max", &i64::MAX.to_string()]).await;
        assert!(run(&db, &["INCR", "max"]).await.is_error());
    }

    #[tokio::test]
    async fn test_multi_key_strings() {
        let db = new_db();
        assert_eq!(run(&db, &["MSET", "a", "1", "b", "2"]).await, RespValue::ok());
        assert_eq!(run(&db, &["MSETNX", "b", "9", "c", "3"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["MSETNX", "c", "3", "d", "4"]).await, RespValue::integer(1));
        run(&db, &["LPUSH", "l", "x"]).await;
        assert_eq!(
            run(&db, &["MGET", "a", "missing", "l", "d"]).await,
            RespValue::array(vec![
                RespValue::bulk_string(b"1".to_vec()),
                RespValue::null_bulk_string(),
                RespValue::null_bulk_string(),
                RespValue::bulk_string(b"4".to_vec()),
            ])
        );
        assert!(run(&db, &["MSET", "a", "1", "b"]).await.is_error());
    }

    #[tokio::test]
    async fn test_append_getset_strlen() {
        let db = new_db();
        assert_eq!(run(&db, &["APPEND", "k", "he"]).await, RespValue::integer(2));
        assert_eq!(run(&db, &["APPEND", "k", "llo"]).await, RespValue::integer(5));
        assert_eq!(run(&db, &["STRLEN", "k"]).await, RespValue::integer(5));
        assert_eq!(
            run(&db, &["GETSET", "k", "new"]).await,
            RespValue::bulk_string(b"hello".to_vec())
        );
        assert_eq!(run(&db, &["SETNX", "k", "other"]).await, RespValue::integer(0));
        assert_eq!(run(&db, &["GET", "k"]).await, RespValue::bulk_string(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let db = new_db();
        run(&db, &["RPUSH", "l", "a"]).await;
        assert_eq!(
            run(&db, &["GET", "l"]).await,
            RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
        );
    }
}
