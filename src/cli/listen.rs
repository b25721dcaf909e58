//! Listen command handler.

use color_eyre::Result;
use futures::StreamExt;
use serde_json::json;

use super::convert::msgpack_to_json;
use super::App;
use crate::rpc::{HandlerTable, Notification, Request};

impl App {
    /// Print inbound traffic as JSON lines until Neovim goes away or Ctrl-C.
    ///
    /// Requests are printed and answered with an "unknown method" error so
    /// Neovim does not wait on them.
    pub async fn run_listen(&self, events: &[String]) -> Result<()> {
        let (client, mut task) = self.connect().await?;

        let mut notifications = Box::pin(client.notifications());
        let mut requests = Box::pin(client.requests());
        let _replies = client.install(HandlerTable::new());

        for event in events {
            client.subscribe(event).await?;
            tracing::info!(%event, "Subscribed");
        }

        loop {
            tokio::select! {
                Some(notification) = notifications.next() => {
                    println!("{}", notification_line(&notification));
                }
                Some(request) = requests.next() => {
                    println!("{}", request_line(&request));
                }
                ended = &mut task => {
                    match ended {
                        Ok(Ok(())) => tracing::info!("Neovim closed the connection"),
                        Ok(Err(e)) => tracing::error!(error = %e, "Connection failed"),
                        Err(e) => tracing::error!(error = %e, "Listener task failed"),
                    }
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    break;
                }
            }
        }

        client.close().await?;
        Ok(())
    }
}

fn notification_line(notification: &Notification) -> String {
    json!({
        "type": "notification",
        "method": notification.name,
        "params": notification.args.iter().map(msgpack_to_json).collect::<Vec<_>>(),
    })
    .to_string()
}

fn request_line(request: &Request) -> String {
    json!({
        "type": "request",
        "id": request.id,
        "method": request.method,
        "params": request.args.iter().map(msgpack_to_json).collect::<Vec<_>>(),
    })
    .to_string()
}
