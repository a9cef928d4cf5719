use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use wsengine::{
    handshake::compute_accept, Bytes, Options, State, WebSocket, WebSocketError,
    WebSocketServer, PING_PAYLOAD,
};

const WAIT: Duration = Duration::from_secs(5);

async fn echo_server(options: Options) -> anyhow::Result<WebSocketServer> {
    let server = WebSocketServer::bind("127.0.0.1:0")
        .await?
        .with_options(options)
        .on_connection(|ws| {
            let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, bool)>();
            let writer = ws.clone();
            tokio::spawn(async move {
                while let Some((payload, is_binary)) = rx.recv().await {
                    if writer.send(payload, is_binary).await.is_err() {
                        break;
                    }
                }
            });
            ws.on_message(move |payload, is_binary| {
                let _ = tx.send((payload, is_binary));
            });
        });
    server.spawn();
    Ok(server)
}

#[tokio::test]
async fn echo_round_trip() -> anyhow::Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Debug);

    let server = echo_server(Options::default()).await?;
    let url = format!("ws://{}/echo?x=1", server.local_addr()?).parse()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);

    let session = WebSocket::connect(url)
        .on_message(move |payload, is_binary| {
            let _ = tx.send((payload, is_binary));
        })
        .on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await?;

    session.send_text("hello").await?;
    session.send_binary(vec![0u8; 70_000]).await?;

    let (payload, is_binary) = tokio::time::timeout(WAIT, rx.recv()).await?.unwrap();
    assert_eq!(payload, "hello");
    assert!(!is_binary);

    let (payload, is_binary) = tokio::time::timeout(WAIT, rx.recv()).await?.unwrap();
    assert_eq!(payload.len(), 70_000);
    assert!(is_binary);

    session.close().await?;
    assert_eq!(session.state(), State::Closed);
    assert!(matches!(
        session.send_text("late").await,
        Err(WebSocketError::ConnectionClosed)
    ));

    session.join().await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_pings_after_each_message() -> anyhow::Result<()> {
    let server = echo_server(Options::default()).await?;
    let mut stream = TcpStream::connect(server.local_addr()?).await?;

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    stream
        .write_all(
            format!(
                "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\n\
                 Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await?;

    let expected = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept(key)
    );
    let mut response = vec![0u8; expected.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut response)).await??;
    assert_eq!(response, expected.as_bytes());

    // masked "hi"
    stream
        .write_all(&[0x81, 0x82, 0, 0, 0, 0, b'h', b'i'])
        .await?;

    // the ping is written before the echo task gets a chance to run or after it,
    // so collect both frames and compare as a set
    let mut frames = Vec::new();
    for _ in 0..2 {
        let mut head = [0u8; 2];
        tokio::time::timeout(WAIT, stream.read_exact(&mut head)).await??;
        assert_eq!(head[1] & 0x80, 0, "server frames are never masked");
        let mut payload = vec![0u8; usize::from(head[1])];
        stream.read_exact(&mut payload).await?;
        frames.push((head[0], payload));
    }
    frames.sort();
    assert_eq!(
        frames,
        vec![(0x81, b"hi".to_vec()), (0x89, PING_PAYLOAD.to_vec())]
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idle_server_connection_is_kept_alive() -> anyhow::Result<()> {
    let server = echo_server(Options::default().with_timeout(Duration::from_millis(200))).await?;
    let url = format!("ws://{}/", server.local_addr()?).parse()?;

    // the client answers keepalive pings on its own and the server accepts the pongs
    let session = WebSocket::connect(url)
        .with_options(Options::default().with_timeout(Duration::from_secs(2)))
        .await?;

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(session.is_open());
    assert_eq!(server.connection_count(), 1);

    server.shutdown().await;
    tokio::time::timeout(WAIT, session.join()).await?;
    Ok(())
}

#[tokio::test]
async fn handshake_errors_are_reported() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    });

    let result = WebSocket::connect(format!("ws://{addr}/missing").parse()?)
        .run()
        .await;
    match result {
        Err(err) => assert!(matches!(err, WebSocketError::InvalidStatusCode(404))),
        Ok(()) => panic!("handshake should fail"),
    }
    Ok(())
}
