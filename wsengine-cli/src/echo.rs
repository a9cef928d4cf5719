use std::time::Duration;

use clap::Args;
use tokio::{runtime, sync::mpsc::unbounded_channel};
use wsengine::{Options, WebSocket, WebSocketServer};

/// Runs a server that sends every message back to whoever sent it.
#[derive(Args)]
#[command(alias = "e")]
pub struct Cmd {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:9001")]
    addr: String,

    /// Idle time after which a connection is pinged.
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "15s")]
    keepalive: Duration,

    /// Maximum accepted payload size in bytes.
    #[arg(long)]
    max_payload: Option<usize>,
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(cmd))
}

async fn serve(cmd: Cmd) -> anyhow::Result<()> {
    let mut options = Options::default().with_timeout(cmd.keepalive);
    if let Some(max_payload) = cmd.max_payload {
        options = options.with_max_payload_read(max_payload);
    }

    let server = WebSocketServer::bind(&cmd.addr)
        .await?
        .with_options(options)
        .on_connection(echo);

    println!("> Listening on ws://{}", server.local_addr()?);

    let handle = server.spawn();
    tokio::signal::ctrl_c().await?;

    log::info!("shutting down {} connections", server.connection_count());
    server.shutdown().await;
    handle.await??;

    Ok(())
}

/// Echoes messages in the order they arrive.
fn echo(ws: &WebSocket) {
    let (tx, mut rx) = unbounded_channel();

    let writer = ws.clone();
    tokio::spawn(async move {
        while let Some((payload, is_binary)) = rx.recv().await {
            if let Err(err) = writer.send(payload, is_binary).await {
                log::debug!("echo to {:?} failed: {err}", writer.peer_addr());
                break;
            }
        }
    });

    ws.on_message(move |payload, is_binary| {
        let _ = tx.send((payload, is_binary));
    });
}
