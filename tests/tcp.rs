use std::time::{Duration, Instant};

use httpreq::{Error, Interface, Request};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

mod common;

use common::{read_head, Outcome};

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn get_over_loopback() {
    common::init_tracing();
    let (listener, port) = listener().await;
    let (head_tx, head_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = head_tx.send(head);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}/hello?x=1"))
        .header("X-Test", "loopback")
        .build();
    let outcome = Outcome::default();
    let execution = outcome.start(request.call());
    execution.await.unwrap();

    let head = head_rx.await.unwrap();
    assert_eq!(head, request.payload().unwrap());
    assert!(head.starts_with(b"GET /hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1\r\n"));

    assert_eq!(
        outcome.data(),
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
    );
    assert!(outcome.take_errors().is_empty());
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn response_follows_request() {
    common::init_tracing();
    let (listener, port) = listener().await;
    let (head_tx, head_rx) = oneshot::channel();

    // Like any HTTP server: nothing is written until the request head is in.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let answered = head.ends_with(b"\r\n\r\n");
        let _ = head_tx.send(head);
        if answered {
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello").await.unwrap();
        }
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}/"))
        .timeout(Duration::from_secs(3))
        .build();
    let outcome = Outcome::default();

    let started = Instant::now();
    outcome.start(request.call()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(head_rx.await.unwrap(), request.payload().unwrap());
    assert_eq!(outcome.data(), b"HTTP/1.1 200 OK\r\n\r\nhello");
    assert!(elapsed < Duration::from_secs(3), "finished after {elapsed:?}");
    assert!(outcome.take_errors().is_empty());
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn reset_ends_request_before_deadline() {
    common::init_tracing();
    let (listener, port) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}/"))
        .timeout(Duration::from_secs(30))
        .build();
    let outcome = Outcome::default();

    let started = Instant::now();
    outcome.start(request.call()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(10), "finished after {elapsed:?}");
    let errors = outcome.take_errors();
    assert!(
        matches!(errors[..], [Error::Receive(_), Error::Connection(_)]),
        "{errors:?}"
    );
    assert!(outcome.data().is_empty());
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn streams_chunks() {
    common::init_tracing();
    let (listener, port) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        for chunk in ["HTTP/1.1 200 OK\r\n", "\r\n", "one ", "two ", "three"] {
            stream.write_all(chunk.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}")).build();
    let outcome = Outcome::default();
    outcome.start(request.call()).await.unwrap();

    assert_eq!(outcome.data(), b"HTTP/1.1 200 OK\r\n\r\none two three");
    assert!(outcome.chunks() > 1);
    assert!(outcome.take_errors().is_empty());
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn deadline_ends_silent_connection() {
    common::init_tracing();
    let (listener, port) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}"))
        .timeout(Duration::from_millis(200))
        .build();
    let outcome = Outcome::default();

    let started = Instant::now();
    outcome.start(request.call()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(200), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "finished after {elapsed:?}");
    assert!(outcome.data().is_empty());
    assert!(outcome.take_errors().is_empty());
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn caller_cancel() {
    common::init_tracing();
    let (listener, port) = listener().await;
    let (accepted_tx, accepted_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        let _ = accepted_tx.send(());
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}"))
        .timeout(Duration::from_secs(30))
        .build();
    let outcome = Outcome::default();
    let execution = outcome.start(request.call());

    accepted_rx.await.unwrap();
    execution.cancel();
    execution.cancel();

    let started = Instant::now();
    execution.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn refused_connection_waits() {
    common::init_tracing();
    let (listener, port) = listener().await;
    drop(listener);

    let request = Request::builder(format!("http://127.0.0.1:{port}")).build();
    let outcome = Outcome::default();
    outcome.start(request.call()).await.unwrap();

    let errors = outcome.take_errors();
    assert!(matches!(errors[..], [Error::Wait(_)]), "{errors:?}");
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn interface_rules_out_loopback() {
    common::init_tracing();
    let (listener, port) = listener().await;

    let request = Request::builder(format!("http://127.0.0.1:{port}"))
        .interface(Interface::Wifi)
        .build();
    let outcome = Outcome::default();
    outcome.start(request.call()).await.unwrap();

    let errors = outcome.take_errors();
    match &errors[..] {
        [Error::Wait(error)] => assert!(error.to_string().contains("wifi"), "{error}"),
        other => panic!("expected a wait error, got {other:?}"),
    }
    assert_eq!(outcome.completions(), 1);
    drop(listener);
}

#[tokio::test]
async fn loopback_interface_connects() {
    common::init_tracing();
    let (listener, port) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_head(&mut stream).await;
        stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
    });

    let request = Request::builder(format!("http://127.0.0.1:{port}"))
        .interface(Interface::Loopback)
        .build();
    let outcome = Outcome::default();
    outcome.start(request.call()).await.unwrap();

    assert_eq!(outcome.data(), b"HTTP/1.1 204 No Content\r\n\r\n");
    assert_eq!(outcome.completions(), 1);
}

#[tokio::test]
async fn validation_fails_before_connecting() {
    let request = Request::builder("http://127.0.0.1:1")
        .timeout_secs(-1.0)
        .build();
    let result = request.call().on_data(|_| panic!("no data expected")).start();
    assert!(matches!(result, Err(Error::NegativeTimeout)));
}
