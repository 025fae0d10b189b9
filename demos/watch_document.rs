use std::error::Error;

use doclive_sdk::documents::DocumentSocket;
use doclive_sdk::socket::callbacks::ChannelCallbacks;
use doclive_sdk::socket::client::SocketOptions;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = "ws://localhost:4000/socket".to_string();
    let document_id = "REPLACE_WITH_DOCUMENT_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let socket = DocumentSocket::new(SocketOptions::default().with_endpoint(endpoint));
        socket.connect().await?;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let callbacks = ChannelCallbacks::new()
            .on_join(|response| println!("joined response={response}"))
            .on_error(|payload| eprintln!("channel error payload={payload}"))
            .on_document_update(|payload| println!("document_updated {payload}"))
            .on_status_update(|payload| println!("status_updated {payload}"))
            .on_close(move || {
                let _ = done_tx.send(());
            });

        socket.subscribe_to_document(document_id.as_str(), callbacks)?;
        println!("status={}", socket.get_document_status(document_id.as_str()).await?);
        println!("ping={}", socket.ping(document_id.as_str()).await?);

        tokio::select! {
            _ = done_rx.recv() => println!("channel closed"),
            _ = tokio::signal::ctrl_c() => {
                socket.unsubscribe_from_document(document_id.as_str());
            }
        }

        socket.disconnect().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
