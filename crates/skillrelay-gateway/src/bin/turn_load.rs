//! Turn load generator: concurrent users posting message activities to a running
//! gateway. Each user owns one conversation, so per-conversation ordering is
//! exercised alongside cross-conversation parallelism.
//!
//! Run with the gateway up (anonymous mode): cargo run --bin turn_load

use reqwest::Client;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3978";
const CONCURRENT_USERS: usize = 10;
const TURNS_PER_USER: usize = 5;

const UTTERANCES: &[&str] = &[
    "turn the lights on",
    "turn the lights off",
    "pause for a second then turn the lights off",
    "are the lights on?",
    "hello there",
];

#[tokio::main]
async fn main() {
    let base_url =
        std::env::var("SKILLRELAY_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    println!(
        "[turn_load] {} users x {} turns = {} requests against {}",
        CONCURRENT_USERS,
        TURNS_PER_USER,
        CONCURRENT_USERS * TURNS_PER_USER,
        base_url
    );

    let success = Arc::new(AtomicU32::new(0));
    let failure = Arc::new(AtomicU32::new(0));
    let latencies: Arc<RwLock<Vec<u64>>> = Arc::new(RwLock::new(Vec::new()));
    let client = Client::new();
    let run_id = uuid::Uuid::new_v4().simple().to_string();

    let mut handles = Vec::new();
    for user in 0..CONCURRENT_USERS {
        let client = client.clone();
        let base_url = base_url.clone();
        let success = Arc::clone(&success);
        let failure = Arc::clone(&failure);
        let latencies = Arc::clone(&latencies);
        let conversation = format!("load-{}-{}", run_id, user);

        handles.push(tokio::spawn(async move {
            for turn in 0..TURNS_PER_USER {
                let activity = json!({
                    "type": "message",
                    "id": format!("{}-{}", conversation, turn),
                    "channelId": "emulator",
                    "serviceUrl": base_url,
                    "from": {"id": format!("user-{}", user)},
                    "recipient": {"id": "bot"},
                    "conversation": {"id": conversation},
                    "deliveryMode": "expectReplies",
                    "text": UTTERANCES[(user + turn) % UTTERANCES.len()],
                });

                let start = Instant::now();
                let res = client
                    .post(format!("{}/api/messages", base_url))
                    .json(&activity)
                    .send()
                    .await;
                let elapsed_ms = start.elapsed().as_millis() as u64;

                match res {
                    Ok(resp) if resp.status().is_success() => {
                        success.fetch_add(1, Ordering::Relaxed);
                        latencies.write().await.push(elapsed_ms);
                    }
                    _ => {
                        failure.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let s = success.load(Ordering::Relaxed);
    let f = failure.load(Ordering::Relaxed);
    let total = s + f;
    let success_rate = if total > 0 {
        (s as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    let mut latencies = latencies.write().await;
    latencies.sort_unstable();
    let avg_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };
    let p95_ms = latencies
        .get((latencies.len() * 95 / 100).min(latencies.len().saturating_sub(1)))
        .copied()
        .unwrap_or(0);

    println!(
        "[turn_load] success {:.1}% | avg {:.0}ms | p95 {}ms",
        success_rate, avg_ms, p95_ms
    );
    println!("[turn_load] total {} | ok {} | failed {}", total, s, f);
}
