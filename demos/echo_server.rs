//! Example: TCP echo server built on the connection pipeline and dispatcher.
//!
//! Every async message with scheme 1, tag 1 and type 1 is sent back to the
//! connection it arrived on. Configuration comes from `NETCORE_*` variables.
//!
//! Run with: `cargo run --example echo_server`

use netcore::config::CoreConfig;
use netcore::connection::Connection;
use netcore::protocol::dispatcher::{handler, Dispatcher};
use netcore::protocol::queue::MessageQueue;
use netcore::utils::{global_metrics, logging};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> netcore::Result<()> {
    let config = CoreConfig::from_env()?;
    config.validate_strict()?;
    logging::init_logging(&config.logging)?;

    let registry = config.connection.standard_registry();
    let (queue, ingress) = MessageQueue::new(config.dispatch.queue_capacity);

    let dispatcher = Dispatcher::from_config(&config.dispatch);
    dispatcher.register(
        1,
        1,
        1,
        handler(|msg| async move {
            match msg.connection() {
                Some(conn) => conn.send(&[(*msg).clone()]),
                None => Ok(()),
            }
        }),
    )?;
    dispatcher.dispatch(ingress);

    let listener = TcpListener::bind("127.0.0.1:7070").await?;
    info!(addr = %listener.local_addr()?, "Echo server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let started = Connection::builder(stream, registry.clone())
            .config(config.connection.clone())
            .on_receive_shared(queue.receiver())
            .on_stop(|conn| {
                info!(session = %conn.session_id(), "Connection finished");
                global_metrics().log_metrics();
            })
            .start();

        if let Err(e) = started {
            warn!(%peer, error = %e, "Failed to start connection");
        }
    }
}
