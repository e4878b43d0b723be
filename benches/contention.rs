use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const T0: i64 = 1_767_225_600_000; // 2026-01-01
const HOUR: i64 = 3_600_000;

async fn connect(host: &str, port: u16, db: &str, user: Ulid) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(user.to_string())
        .password("slotswap");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Register a fresh user and publish one swappable slot at `hour`.
async fn member(host: &str, port: u16, db: &str, hour: i64) -> (Ulid, Client, String) {
    let user = Ulid::new();
    let client = connect(host, port, db, user).await;
    client
        .batch_execute(&format!("INSERT INTO users (id, name) VALUES ('{user}', 'u{hour}')"))
        .await
        .unwrap();
    let (start, end) = (T0 + hour * HOUR, T0 + (hour + 1) * HOUR);
    let messages = client
        .simple_query(&format!(
            r#"INSERT INTO slots (title, start, "end", status) VALUES ('bench', {start}, {end}, 'SWAPPABLE')"#
        ))
        .await
        .unwrap();
    let slot = messages
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("slot row");
    (user, client, slot)
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

/// Many users race to claim the same slot, round after round. Exactly one
/// proposal per round may win; the owner rejects it to reopen the slot.
async fn phase1_hot_slot(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let (_, owner, target) = member(host, port, &db, 0).await;

    let n_contenders = 32;
    let mut contenders = Vec::new();
    for i in 0..n_contenders {
        contenders.push(member(host, port, &db, i + 1).await);
    }
    let contenders: Vec<_> = contenders.into_iter().map(std::sync::Arc::new).collect();

    let rounds = 50;
    let mut latencies = Vec::new();
    let mut anomalies = 0;
    let start = Instant::now();

    for _ in 0..rounds {
        let mut handles = Vec::new();
        for c in &contenders {
            let c = c.clone();
            let sql = format!(
                "INSERT INTO swap_requests (my_slot_id, their_slot_id) VALUES ('{}', '{target}')",
                c.2
            );
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let result = c.1.simple_query(&sql).await;
                (t.elapsed(), result)
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            let (elapsed, result) = h.await.unwrap();
            latencies.push(elapsed);
            if let Ok(messages) = result {
                winners.extend(messages.into_iter().filter_map(|m| match m {
                    SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
                    _ => None,
                }));
            }
        }
        if winners.len() != 1 {
            anomalies += 1;
        }
        for id in winners {
            owner
                .batch_execute(&format!(
                    "UPDATE swap_requests SET status = 'REJECTED' WHERE id = '{id}'"
                ))
                .await
                .unwrap();
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {n_contenders} contenders in {:.2}s, rounds without exactly one winner: {anomalies}",
        elapsed.as_secs_f64()
    );
    print_latency("propose latency", &mut latencies);
}

/// Disjoint pairs swapping in parallel: no shared documents, so throughput
/// should scale with connections.
async fn phase2_disjoint_pairs(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let n_pairs = 16;
    let per_pair = 50;

    let start = Instant::now();
    let mut handles = Vec::new();
    for p in 0..n_pairs {
        let host = host.to_string();
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let (_, left, left_slot) = member(&host, port, &db, p * 2).await;
            let (_, right, right_slot) = member(&host, port, &db, p * 2 + 1).await;
            let mut latencies = Vec::with_capacity(per_pair);
            for _ in 0..per_pair {
                let t = Instant::now();
                let messages = left
                    .simple_query(&format!(
                        "INSERT INTO swap_requests (my_slot_id, their_slot_id) VALUES ('{left_slot}', '{right_slot}')"
                    ))
                    .await
                    .unwrap();
                let id = messages
                    .into_iter()
                    .find_map(|m| match m {
                        SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
                        _ => None,
                    })
                    .unwrap();
                right
                    .batch_execute(&format!(
                        "UPDATE swap_requests SET status = 'REJECTED' WHERE id = '{id}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let total = n_pairs as usize * per_pair;
    println!(
        "  {n_pairs} pairs x {per_pair} propose+reject = {total} in {:.2}s = {:.0} swaps/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("propose+reject latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTSWAP_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTSWAP_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTSWAP_PORT");

    println!("=== slotswap contention benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] hot slot");
    phase1_hot_slot(&host, port).await;

    println!("\n[phase 2] disjoint pairs");
    phase2_disjoint_pairs(&host, port).await;

    println!("\n=== benchmark complete ===");
}
