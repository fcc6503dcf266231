// Manual smoke check for the /ws/status stream: connect, wait for a few
// status updates, print them, exit nonzero on silence.

use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws/status".to_string());
    eprintln!("Connecting to {}", url);
    let (ws_stream, _) = connect_async(url).await.expect("WS connect failed");
    let (mut write, mut read) = ws_stream.split();

    let _ = write.send(Message::Ping(vec![])).await;

    // Wait up to 10s for three status updates, then exit
    for n in 1..=3 {
        match timeout(Duration::from_secs(10), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                println!("status update {}: {}", n, text);
            }
            Ok(Some(Ok(other))) => {
                println!("non-text message: {:?}", other);
            }
            Ok(Some(Err(err))) => {
                eprintln!("WS receive error: {}", err);
                std::process::exit(2);
            }
            Ok(None) => {
                eprintln!("WS closed by server");
                std::process::exit(3);
            }
            Err(_) => {
                eprintln!("Timeout waiting for status updates");
                std::process::exit(4);
            }
        }
    }
}
