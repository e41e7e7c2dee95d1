//! # Chat Relay Live Smoke Test
//!
//! Connects to a running `server_chat` instance over WebSocket, waits for
//! the history handshake, sends one message and asserts it comes back on
//! the broadcast path.

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[clap(about = "WebSocket smoke test for the chat relay server")]
struct Args {
    #[clap(long, env = "CHAT_WS_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    println!("[*] Connecting to {}", args.url);

    let (mut socket, _) = connect_async(&args.url)
        .await
        .context("WebSocket connect failed")?;

    // The server greets every join with message_history.
    let greeting = recv_json(&mut socket).await?;
    if greeting["type"] != "message_history" {
        bail!("expected message_history greeting, got: {}", greeting);
    }
    println!(
        "[*] Received history with {} messages",
        greeting["messages"].as_array().map_or(0, |a| a.len())
    );

    let probe = format!("smoke test {}", std::process::id());
    let outbound = serde_json::json!({
        "type": "send_message",
        "text": probe,
        "senderName": "smoke-test",
    });
    socket.send(Message::text(outbound.to_string())).await?;

    // Drain broadcasts until our own message comes back.
    loop {
        let event = recv_json(&mut socket).await?;
        if event["type"] == "receive_message" && event["message"]["text"] == probe.as_str() {
            println!("[SUCCESS] Message relayed back: {}", event["message"]["id"]);
            break;
        }
    }

    socket.close(None).await.ok();
    Ok(())
}

async fn recv_json<S>(socket: &mut S) -> Result<serde_json::Value>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = socket
            .next()
            .await
            .context("connection closed unexpectedly")??;
        if let Message::Text(text) = msg {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}
