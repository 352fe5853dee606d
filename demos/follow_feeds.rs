use std::error::Error;

use feedstream_sdk::{ConnectionStatus, Event, RealtimeClient, RealtimeConfig, WILDCARD_EVENT};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::var("FEEDSTREAM_ENDPOINT")
        .unwrap_or_else(|_| "ws://localhost:8888/socket.io/".to_string());
    let username = "REPLACE_WITH_USERNAME".to_string();
    let feed_ids = vec!["REPLACE_WITH_FEED_ID_1", "REPLACE_WITH_FEED_ID_2"];

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut config = RealtimeConfig::new(endpoint);
        if let Ok(cookie) = std::env::var("FEEDSTREAM_SESSION_COOKIE") {
            config = config.with_session_cookie(SecretString::new(cookie));
        }

        let client = RealtimeClient::new(config)?;
        client.subscribe(WILDCARD_EVENT, |event: &Event| {
            println!("{} {}", event.name, event.payload());
        });
        client.connect(username, feed_ids);

        let mut status = client.status_receiver();
        while status.changed().await.is_ok() {
            let current = *status.borrow();
            println!("status={current:?}");
            if let ConnectionStatus::GaveUp { attempts } = current {
                println!("giving up after {attempts} attempts");
                break;
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
