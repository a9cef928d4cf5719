use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Args;
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver},
        oneshot,
    },
    time::timeout,
};
use wsengine::{Options, Session, WebSocket, WsUrl};

/// Command to connect and interact with a WebSocket server.
///
/// This command establishes a WebSocket client connection to a server and allows sending
/// messages and receiving responses interactively. It supports both plaintext WebSocket (ws://)
/// and secure WebSocket (wss://) connections.
#[derive(Args)]
#[command(alias = "c")]
pub struct Cmd {
    /// Maximum duration to wait when establishing the connection.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    connect_timeout: Duration,

    /// Longest the server may stay silent before the connection is dropped.
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "15s")]
    idle_timeout: Duration,

    /// When enabled, validates and pretty-prints received messages as JSON.
    #[arg(long)]
    input_as_json: bool,

    /// Reject text messages that are not valid UTF-8.
    #[arg(long)]
    utf8: bool,

    /// The WebSocket URL to connect to (ws:// or wss://)
    url: WsUrl,
}

type Printer = Arc<Mutex<dyn ExternalPrinter + Send>>;

fn print(printer: &Printer, msg: String) {
    if let Ok(mut printer) = printer.lock() {
        let _ = printer.print(msg);
    }
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".wsengine_history");

    // Handle user input with history
    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // ignore the error
    let _ = rl.load_history(&history_path);
    let printer: Printer = Arc::new(Mutex::new(rl.create_external_printer()?));

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _guard = runtime.enter();

    let (tx, rx) = unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();

    let mut options = Options::default().with_timeout(cmd.idle_timeout);
    if cmd.utf8 {
        options = options.with_utf8();
    }

    let on_message = {
        let printer = Arc::clone(&printer);
        let input_as_json = cmd.input_as_json;
        move |payload: wsengine::Bytes, is_binary: bool| {
            print(&printer, format_message(&payload, is_binary, input_as_json));
        }
    };

    let session = runtime.block_on(timeout(
        cmd.connect_timeout,
        WebSocket::connect(cmd.url.clone())
            .with_options(options)
            .on_message(on_message)
            .on_close(move || {
                let _ = closed_tx.send(());
            })
            .spawn(),
    ))??;

    println!("> Connected to {}", cmd.url);

    runtime.spawn_blocking(move || loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(mut line) => {
                let _ = rl.add_history_entry(line.as_str());
                // commented line
                if let Some(pos) = line.rfind("//") {
                    let _ = line.split_off(pos);
                }

                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Err(err) = rl.save_history(&history_path) {
                    eprintln!("unable to save history: {err}");
                }
                break;
            }
        }
    });
    runtime.block_on(forward_input(session, rx, closed_rx, printer));

    runtime.shutdown_background();

    Ok(())
}

/// Sends every input line until the input ends or the server goes away.
async fn forward_input(
    session: Session,
    mut rx: UnboundedReceiver<String>,
    mut closed: oneshot::Receiver<()>,
    printer: Printer,
) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else {
                    break;
                };

                if let Err(err) = session.send_text(line).await {
                    print(&printer, format!("unable to write: {}", err));
                }
            }
            _ = &mut closed => {
                print(&printer, "<Disconnected>".to_string());
                return;
            }
        }
    }

    let _ = session.close().await;
}

fn format_message(payload: &[u8], is_binary: bool, input_as_json: bool) -> String {
    if is_binary {
        return format!("<Binary {} bytes>", payload.len());
    }

    let msg = String::from_utf8_lossy(payload);
    if !input_as_json {
        return msg.into_owned();
    }

    match serde_json::from_str::<serde_json::Value>(&msg) {
        Ok(ok) => format!("{:#}", ok),
        Err(err) => format!("parsing json: {}", err),
    }
}
