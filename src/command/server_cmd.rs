use crate::command::AofBatch;
use crate::error::{KvError, KvResult};
use crate::resp::RespValue;
use crate::store::Db;
use tracing::{info, warn};

pub fn cmd_ping(_db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    match args {
        [] => Ok(RespValue::simple_string("PONG")),
        [msg] => Ok(RespValue::bulk_string(msg.clone())),
        _ => Err(KvError::WrongArgCount("ping".into())),
    }
}

pub fn cmd_echo(_db: &Db, args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    Ok(RespValue::bulk_string(args[0].clone()))
}

pub fn cmd_dbsize(db: &Db, _args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    Ok(RespValue::integer(db.len() as i64))
}

/// FLUSHDB and FLUSHALL; there is a single key space.
pub fn cmd_flushdb(db: &Db, _args: &[Vec<u8>], aof: &mut AofBatch) -> KvResult<RespValue> {
    db.flush();
    aof.record("FLUSHDB", &[]);
    Ok(RespValue::ok())
}

pub fn cmd_bgrewriteaof(db: &Db, _args: &[Vec<u8>], _aof: &mut AofBatch) -> KvResult<RespValue> {
    let aof = db
        .aof()
        .ok_or_else(|| KvError::Generic("append only file is disabled".into()))?;
    if aof.is_rewriting() {
        return Err(KvError::Generic(
            "Background append only file rewriting already in progress".into(),
        ));
    }
    let db = db.arc().ok_or(KvError::Internal)?;
    tokio::spawn(async move {
        let Some(aof) = db.aof() else {
            return;
        };
        match aof.rewrite(db.commands().clone()).await {
            Ok(()) => info!("Background AOF rewrite finished"),
            Err(e) => warn!(error = %e, "Background AOF rewrite failed"),
        }
    });
    Ok(RespValue::simple_string(
        "Background append only file rewriting started",
    ))
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

    #[tokio::test]
    async fn test_ping_echo_dbsize_flush() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        assert_eq!(db.exec(&cmd(&["PING"])).await, RespValue::simple_string("PONG"));
        assert_eq!(db.exec(&cmd(&["ping", "hi"])).await, RespValue::bulk_string(b"hi".to_vec()));
        assert_eq!(db.exec(&cmd(&["ECHO", "x"])).await, RespValue::bulk_string(b"x".to_vec()));
        db.exec(&cmd(&["SET", "a", "1"])).await;
        db.exec(&cmd(&["SET", "b", "1"])).await;
        assert_eq!(db.exec(&cmd(&["DBSIZE"])).await, RespValue::integer(2));
        assert_eq!(db.exec(&cmd(&["FLUSHALL"])).await, RespValue::ok());
        assert_eq!(db.exec(&cmd(&["DBSIZE"])).await, RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_bgrewriteaof_without_log() {
        let db = Db::new(Arc::new(CommandTable::new()), None);
        assert_eq!(
            db.exec(&cmd(&["BGREWRITEAOF"])).await,
            RespValue::error("ERR append only file is disabled")
        );
    }
}
