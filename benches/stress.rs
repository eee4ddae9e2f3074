use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
// 2026-03-02T09:00:00Z
const SESSION_START: i64 = 1_772_442_000_000;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("exambook")
        .password("exambook");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Approved plan in a fresh tenant. Returns the plan id.
async fn setup_plan(client: &tokio_postgres::Client) -> Ulid {
    let pid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO plans (id, year, name, target_total, period_start, period_end) \
             VALUES ('{pid}', 2026, 'Stress campaign', 100000, 1767225600000, 1798761600000)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE plans SET status = 'approved' WHERE id = '{pid}'"))
        .await
        .unwrap();
    pid
}

async fn add_schedule(client: &tokio_postgres::Client, pid: Ulid, capacity: u32) -> Ulid {
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO schedules (id, plan_id, start, "end", institution, exam_types, capacity)
               VALUES ('{sid}', '{pid}', {SESSION_START}, {}, 'Bench Clinic', 'general', {capacity})"#,
            SESSION_START + 8 * HOUR
        ))
        .await
        .unwrap();
    sid
}

fn book_sql(sid: Ulid, worker: &str) -> String {
    format!(
        "INSERT INTO reservations (id, schedule_id, worker_ref, exam_types) \
         VALUES ('{}', '{sid}', '{worker}', 'general')",
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let client = connect(host, port, &db).await;
    let pid = setup_plan(&client).await;
    let n = 2000;
    let sid = add_schedule(&client, pid, n as u32).await;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&book_sql(sid, &format!("W-{i}")))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many connections race for a small schedule. Exactly `capacity` bookings
/// may succeed; everything else must come back as a capacity error.
async fn phase2_contention(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let pid = setup_plan(&setup).await;
    let capacity = 50u32;
    let sid = add_schedule(&setup, pid, capacity).await;

    let n_tasks = 20;
    let n_per_task = 25;
    let booked = Arc::new(AtomicUsize::new(0));
    let full = Arc::new(AtomicUsize::new(0));
    let other = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let (booked, full, other) = (booked.clone(), full.clone(), other.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(n_per_task);
            for j in 0..n_per_task {
                let t0 = Instant::now();
                match client.batch_execute(&book_sql(sid, &format!("W-{t}-{j}"))).await {
                    Ok(()) => {
                        booked.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::CONFIGURATION_LIMIT_EXCEEDED) => {
                        full.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        eprintln!("unexpected booking error: {e}");
                        other.fetch_add(1, Ordering::Relaxed);
                    }
                }
                latencies.push(t0.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();

    let booked = booked.load(Ordering::Relaxed);
    let full = full.load(Ordering::Relaxed);
    let other = other.load(Ordering::Relaxed);
    println!(
        "  {} attempts on {capacity} slots in {:.2}s: {booked} booked, {full} capacity rejections, {other} other errors",
        n_tasks * n_per_task,
        elapsed.as_secs_f64()
    );

    let reserved = setup
        .simple_query(&format!("SELECT * FROM availability WHERE schedule_id = '{sid}'"))
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("reserved").map(str::to_string),
            _ => None,
        })
        .unwrap_or_default();
    println!("  server reports reserved={reserved}");
    if booked != capacity as usize || reserved != capacity.to_string() {
        println!("  !! capacity invariant violated");
    }
    print_latency("contended booking latency", &mut all_latencies);
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let pid = setup_plan(&setup).await;
    let read_sid = add_schedule(&setup, pid, 500).await;
    for i in 0..200 {
        setup
            .batch_execute(&book_sql(read_sid, &format!("R-{i}")))
            .await
            .unwrap();
    }

    // Writers book and cancel on their own schedules in the same tenant
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        let wsid = add_schedule(&setup, pid, 10).await;
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let rid = Ulid::new();
                let _ = client
                    .batch_execute(&format!(
                        "INSERT INTO reservations (id, schedule_id, worker_ref, exam_types) \
                         VALUES ('{rid}', '{wsid}', 'W-{w}-{i}', 'general')"
                    ))
                    .await;
                let _ = client
                    .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM availability WHERE plan_id = '{pid}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_{}", Ulid::new())).await;
            let pid = setup_plan(&client).await;
            let sid = add_schedule(&client, pid, ops_per_conn as u32).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&book_sql(sid, &format!("W-{i}")))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("EXAMBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("EXAMBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid EXAMBOOK_PORT");

    println!("=== exambook stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] booking contention on one schedule");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
