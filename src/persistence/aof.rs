use crate::command::CommandTable;
use crate::error::{KvError, KvResult};
use crate::resp::{CmdLine, RespParser, RespValue};
use crate::store::Db;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const AOF_QUEUE_SIZE: usize = 1 << 10;

enum AofMsg {
    Record(CmdLine),
    /// Acknowledged once every record queued before it has been written.
    Sync(oneshot::Sender<()>),
}

struct AofState {
    file: File,
    /// Records written while a rewrite is running, spliced into the new file
    /// before it replaces the old one.
    rewrite_buffer: Option<Vec<CmdLine>>,
}

/// Append-only command log.
///
/// Records are queued on a bounded channel and written by a background task
/// in the order they were appended. A full queue makes `append` wait.
pub struct Aof {
    tx: mpsc::Sender<AofMsg>,
    state: Arc<Mutex<AofState>>,
    path: PathBuf,
    rewriting: AtomicBool,
}

impl Aof {
    /// Open (or create) the log for appending and start its writer task.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Aof> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let state = Arc::new(Mutex::new(AofState {
            file,
            rewrite_buffer: None,
        }));
        let (tx, rx) = mpsc::channel(AOF_QUEUE_SIZE);
        tokio::spawn(write_loop(rx, state.clone()));
        Ok(Aof {
            tx,
            state,
            path,
            rewriting: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: CmdLine) {
        if self.tx.send(AofMsg::Record(record)).await.is_err() {
            warn!("AOF writer has stopped, record dropped");
        }
    }

    /// Wait until everything appended so far is written and synced.
    pub async fn sync(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AofMsg::Sync(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn is_rewriting(&self) -> bool {
        self.rewriting.load(Ordering::SeqCst)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".rewrite.tmp");
        PathBuf::from(tmp)
    }

    /// Compact the log into one reconstruction command per live key.
    ///
    /// On failure the original log is left in place and untouched.
    pub async fn rewrite(&self, commands: Arc<CommandTable>) -> KvResult<()> {
        if self.rewriting.swap(true, Ordering::SeqCst) {
            return Err(KvError::Generic(
                "Background append only file rewriting already in progress".into(),
            ));
        }
        let result = self.rewrite_inner(commands).await;
        if let Err(e) = &result {
            warn!(error = %e, "AOF rewrite aborted");
            self.state.lock().rewrite_buffer = None;
            let _ = std::fs::remove_file(self.tmp_path());
        }
        self.rewriting.store(false, Ordering::SeqCst);
        result
    }

    async fn rewrite_inner(&self, commands: Arc<CommandTable>) -> KvResult<()> {
        info!(path = %self.path.display(), "Starting AOF rewrite");
        let snapshot_size = {
            let mut state = self.state.lock();
            state.file.flush()?;
            state.rewrite_buffer = Some(Vec::new());
            state.file.metadata()?.len()
        };

        let scratch = Db::scratch(commands);
        let replayed = load(&scratch, &self.path, Some(snapshot_size)).await?;

        let tmp = self.tmp_path();
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut keys = 0usize;
        for key in scratch.keys() {
            let Some(cmds) = scratch.reconstruction(&key) else {
                continue;
            };
            for cmd in cmds {
                out.write_all(&RespValue::from_cmdline(&cmd).serialize())?;
            }
            keys += 1;
        }

        let mut state = self.state.lock();
        let pending = state.rewrite_buffer.take().unwrap_or_default();
        for record in &pending {
            out.write_all(&RespValue::from_cmdline(record).serialize())?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        state.file = OpenOptions::new().append(true).open(&self.path)?;
        drop(state);

        info!(
            replayed,
            keys,
            spliced = pending.len(),
            "AOF rewrite finished"
        );
        Ok(())
    }
}

async fn write_loop(mut rx: mpsc::Receiver<AofMsg>, state: Arc<Mutex<AofState>>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            AofMsg::Record(record) => {
                let bytes = RespValue::from_cmdline(&record).serialize();
                let mut state = state.lock();
                if let Err(e) = state.file.write_all(&bytes) {
                    warn!(error = %e, "Failed to write AOF record, skipped");
                    continue;
                }
                if let Some(buffer) = state.rewrite_buffer.as_mut() {
                    buffer.push(record);
                }
            }
            AofMsg::Sync(done) => {
                if let Err(e) = state.lock().file.sync_data() {
                    warn!(error = %e, "Failed to sync AOF");
                }
                let _ = done.send(());
            }
        }
    }
    debug!("AOF writer exiting");
}

/// Replay the log at `path` into `db`, reading at most `max_bytes`.
///
/// Malformed records are skipped and a truncated final record is ignored.
/// A missing file replays nothing. Returns the number of commands executed.
pub async fn load(db: &Db, path: &Path, max_bytes: Option<u64>) -> KvResult<usize> {
    let mut data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if let Some(max) = max_bytes {
        data.truncate(usize::try_from(max).unwrap_or(usize::MAX));
    }

    let mut buf = BytesMut::from(&data[..]);
    let mut count = 0usize;
    loop {
        match RespParser::parse_strict(&mut buf) {
            Ok(Some(value)) => {
                let Some(cmdline) = value.into_cmdline() else {
                    warn!("Skipping AOF entry that is not a command");
                    continue;
                };
                if let RespValue::Error(msg) = db.exec(&cmdline).await {
                    warn!(
                        command = %String::from_utf8_lossy(&cmdline[0]),
                        error = %msg,
                        "AOF record failed on replay"
                    );
                }
                count += 1;
            }
            Ok(None) => {
                if !buf.is_empty() {
                    warn!(bytes = buf.len(), "AOF ends with a truncated record, ignored");
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "Malformed AOF record, skipping");
                skip_to_next_record(&mut buf);
            }
        }
    }
    Ok(count)
}

/// Drop bytes up to the next line that starts an array.
fn skip_to_next_record(buf: &mut BytesMut) {
    match buf[1.min(buf.len())..].windows(3).position(|w| w == b"\r\n*") {
        Some(pos) => buf.advance(1 + pos + 2),
        None => buf.clear(),
    }
}
