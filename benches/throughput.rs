use cairn::command::CommandTable;
use cairn::resp::CmdLine;
use cairn::store::Db;
use std::sync::Arc;
use std::time::Instant;

fn cmd(parts: &[&str]) -> CmdLine {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

async fn bench<F>(db: &Db, iterations: usize, make: F) -> f64
where
    F: Fn(usize) -> CmdLine,
{
    let start = Instant::now();
    for i in 0..iterations {
        let reply = db.exec(&make(i)).await;
        assert!(!reply.is_error(), "{reply:?}");
    }
    iterations as f64 / start.elapsed().as_secs_f64()
}

/// `tasks` clients writing disjoint keys at once.
async fn bench_parallel(db: Arc<Db>, tasks: usize, per_task: usize) -> f64 {
    let start = Instant::now();
    let handles: Vec<_> = (0..tasks)
        .map(|t| {
            let db = db.clone();
            tokio::spawn(async move {
                for i in 0..per_task {
                    let key = format!("par_{t}_{i}");
                    db.exec(&cmd(&["SET", &key, "value"])).await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    (tasks * per_task) as f64 / start.elapsed().as_secs_f64()
}

#[tokio::main]
async fn main() {
    let db = Db::new(Arc::new(CommandTable::new()), None);
    let iterations = 100_000;

    println!("=== Cairn Benchmark ({iterations} operations) ===\n");

    let ops = bench(&db, iterations, |i| cmd(&["SET", &format!("key_{i}"), "value"])).await;
    println!("SET:    {ops:>10.0} ops/sec");
    let ops = bench(&db, iterations, |i| cmd(&["GET", &format!("key_{i}")])).await;
    println!("GET:    {ops:>10.0} ops/sec");
    let ops = bench(&db, iterations, |_| cmd(&["INCR", "counter"])).await;
    println!("INCR:   {ops:>10.0} ops/sec");
    let ops = bench(&db, iterations, |i| cmd(&["LPUSH", "list", &format!("item_{i}")])).await;
    println!("LPUSH:  {ops:>10.0} ops/sec");
    let ops = bench(&db, iterations, |i| {
        cmd(&["HSET", "hash", &format!("field_{i}"), "value"])
    })
    .await;
    println!("HSET:   {ops:>10.0} ops/sec");
    let ops = bench(&db, iterations, |i| cmd(&["SADD", "set", &format!("member_{i}")])).await;
    println!("SADD:   {ops:>10.0} ops/sec");

    let ops = bench_parallel(db.clone(), 8, iterations / 8).await;
    println!("SETx8:  {ops:>10.0} ops/sec (8 concurrent tasks)");

    println!("\n=== Done ===");
}
