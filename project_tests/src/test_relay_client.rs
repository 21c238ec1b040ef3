use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[command(author, version, about = "Subscribes to a relay and prints what each push carries", long_about = None)]
struct Args {
    /// Relay websocket endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Topic to subscribe to; omit for every topic
    #[arg(short, long)]
    topic: Option<String>,

    /// Record field holding the topic, used for the per-push summary
    #[arg(long, default_value = "topic_id")]
    topic_field: String,

    /// Stop after this many pushes
    #[arg(short, long)]
    count: Option<u64>,
}

fn summarize(records: &[Value], topic_field: &str) -> String {
    let topics: BTreeSet<String> = records
        .iter()
        .filter_map(|r| r.get(topic_field))
        .map(|t| match t {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    let shown: Vec<&str> = topics.iter().take(5).map(String::as_str).collect();
    let more = topics.len().saturating_sub(shown.len());
    if more > 0 {
        format!("{} (+{more} more)", shown.join(", "))
    } else {
        shown.join(", ")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut ws, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    println!("Connected to {}", args.url);

    let request = match &args.topic {
        Some(topic) => json!({ "topic_id": topic }),
        None => json!({ "full_file": true }),
    };
    ws.send(Message::Text(request.to_string().into())).await?;
    println!("Subscribed with {request}");

    let mut received = 0u64;
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => {
                received += 1;
                let now = Local::now().format("%H:%M:%S%.3f");
                match serde_json::from_str::<Vec<Value>>(text.as_str()) {
                    Ok(records) => println!(
                        "[{now}] push #{received}: {} records, topics: {}",
                        records.len(),
                        summarize(&records, &args.topic_field)
                    ),
                    Err(e) => println!("[{now}] push #{received}: not a record array ({e})"),
                }
                if args.count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            Message::Close(frame) => {
                println!("Server closed the connection: {frame:?}");
                break;
            }
            _ => {}
        }
    }

    ws.close(None).await.ok();
    println!("Received {received} pushes");
    Ok(())
}
