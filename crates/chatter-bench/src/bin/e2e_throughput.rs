//! End-to-end throughput benchmark for Chatter.
//!
//! Connects N WebSocket clients to a running server, puts them all in one
//! room and has each of them chat continuously. Every client counts the
//! `chat_message` notifications it receives.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let server_url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("Chatter end-to-end throughput benchmark");
    println!("Make sure the server is running without per-IP rate limiting:");
    println!("  CHATTER__RATE_LIMIT__ENABLED=false cargo run --release --bin chatter");
    println!();

    run_room_benchmark(num_clients, server_url).await;
}

async fn run_room_benchmark(num_clients: usize, server_url: String) {
    println!("Room chat benchmark: {} clients on {}", num_clients, server_url);
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = server_url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();

    println!();
    println!("Clients:         {:>12}", num_clients);
    println!("Duration:        {:>12.2}s", elapsed.as_secs_f64());
    println!("Delivered:       {:>12}", total_messages);
    println!("Throughput:      {:>12.0} msg/s", msgs_per_sec);
    println!("Per client:      {:>12.0} msg/s", msgs_per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    server_url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let url = format!("{server_url}?user_id={client_id}&username=bench-{client_id}");
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    let join = json!({"type": "join_room", "room_id": ROOM});
    sender.send(Message::Text(join.to_string())).await?;

    // Welcome, snapshot and presence notices arrive first.
    while let Some(message) = receiver.next().await {
        if let Message::Text(text) = message? {
            let value: Value = serde_json::from_str(&text)?;
            if value["type"] == "room_joined" {
                break;
            }
        }
    }

    barrier.wait().await;

    let chat = Message::Text(json!({"type": "chat_message", "room_id": ROOM, "content": "x".repeat(64)}).to_string());

    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                if text.contains(r#""type":"chat_message""#) {
                    recv_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(chat.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
