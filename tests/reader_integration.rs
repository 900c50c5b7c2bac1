// Drives a loopback TCP listener standing in for a single nsqd broker and
// exercises Reader end to end: magic handshake, IDENTIFY, SUB, a delivered
// MESSAGE frame, and the FIN the consumer sends back.

use bytes::Bytes;
use nsq_client::{IdentifyConfig, Reader, ReaderConfigBuilder};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn framed(frame_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&((4 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn message_payload(id: &[u8; 16], attempts: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0i64.to_be_bytes());
    out.extend_from_slice(&attempts.to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(body);
    out
}

/// Reads and discards one line-terminated command (SUB/RDY/FIN/...), then
/// asserts it carries the given prefix.
async fn expect_command(server: &mut TcpStream, prefix: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let n = server.read(&mut buf).await.unwrap();
    buf.truncate(n);
    assert!(
        buf.starts_with(prefix),
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(prefix),
        String::from_utf8_lossy(&buf)
    );
    buf
}

/// Reads until at least `count` newline-terminated lines have arrived,
/// tolerating the OS coalescing several writes into one `read()` (or
/// splitting one write across several).
async fn read_lines(server: &mut TcpStream, count: usize) -> Vec<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let lines: Vec<Vec<u8>> = buf.split(|&b| b == b'\n').map(|l| l.to_vec()).collect();
        // split() yields a trailing empty slice after the final `\n`; a
        // complete set of `count` lines means at least count+1 elements.
        if lines.len() > count {
            return lines.into_iter().take(count).collect();
        }
        let n = server.read(&mut chunk).await.unwrap();
        assert!(n > 0, "server connection closed before {count} lines arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn subscribes_delivers_a_message_and_acks_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut server, _) = listener.accept().await.unwrap();

        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");

        expect_command(&mut server, b"IDENTIFY\n").await;
        server
            .write_all(&framed(0, b"OK"))
            .await
            .unwrap();

        expect_command(&mut server, b"SUB ").await;
        server.write_all(&framed(0, b"OK")).await.unwrap();

        // RdyControl's initial redistribute, fired from connect() and again
        // from subscribe(); both land before the broker sends the message.
        expect_command(&mut server, b"RDY ").await;
        expect_command(&mut server, b"RDY ").await;

        let id = [b'7'; 16];
        server
            .write_all(&framed(2, &message_payload(&id, 0, b"hello world")))
            .await
            .unwrap();

        let fin = expect_command(&mut server, b"FIN ").await;
        assert_eq!(&fin, b"FIN 7777777777777777\n");

        // Drain whatever RDY refresh follows the delivered message before
        // the test tears the connection down.
        let mut trailer = vec![0u8; 64];
        let _ = tokio::time::timeout(Duration::from_millis(200), server.read(&mut trailer)).await;
    });

    let config = ReaderConfigBuilder::new()
        .nsqd_address(addr.ip().to_string(), addr.port())
        .max_in_flight(10)
        .identify(IdentifyConfig::new())
        .build();

    let reader = Reader::new(config);
    reader.connect().await.unwrap();
    reader.subscribe("events", "tests").await.unwrap();

    let consumer = reader.messages();
    let message = tokio::time::timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("timed out waiting for the message")
        .expect("reader closed before delivering a message");

    assert_eq!(message.body, Bytes::from_static(b"hello world"));
    assert_eq!(message.attempts, 0);
    message.fin().await.unwrap();

    drop(consumer);
    reader.close().await;
    broker.await.unwrap();
}

/// §8 S6: with messages buffered but no consumer draining them, unsubscribe
/// must send `RDY 0` to every Connection and `REQ <id> 0` for each message
/// left sitting in the inbox, releasing their server-side in-flight slots.
#[tokio::test]
async fn unsubscribe_sends_rdy_zero_and_requeues_buffered_messages() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ids: Vec<[u8; 16]> = (0..3u8).map(|n| [b'0' + n; 16]).collect();
    let expected_ids = ids.clone();

    let broker = tokio::spawn(async move {
        let (mut server, _) = listener.accept().await.unwrap();

        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");

        expect_command(&mut server, b"IDENTIFY\n").await;
        server.write_all(&framed(0, b"OK")).await.unwrap();

        expect_command(&mut server, b"SUB ").await;
        server.write_all(&framed(0, b"OK")).await.unwrap();

        // connect()'s and subscribe()'s initial redistributes.
        expect_command(&mut server, b"RDY ").await;
        expect_command(&mut server, b"RDY ").await;

        for id in &expected_ids {
            server
                .write_all(&framed(2, &message_payload(id, 0, b"buffered")))
                .await
                .unwrap();
        }

        // Give the ingress task time to deliver all three into the inbox
        // before unsubscribe() races to drain it.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // `RDY 0` and the three `REQ ... 0` lines may arrive coalesced into
        // fewer TCP reads than commands sent, so collect lines rather than
        // assuming one read() per command.
        let lines = read_lines(&mut server, 1 + expected_ids.len()).await;

        assert_eq!(lines[0], b"RDY 0");
        for id in &expected_ids {
            let expected = format!("REQ {} 0", String::from_utf8_lossy(id));
            assert!(
                lines[1..].iter().any(|line| line == expected.as_bytes()),
                "missing REQ for id {:?} in {:?}",
                String::from_utf8_lossy(id),
                lines[1..]
                    .iter()
                    .map(|l| String::from_utf8_lossy(l).into_owned())
                    .collect::<Vec<_>>(),
            );
        }
    });

    let config = ReaderConfigBuilder::new()
        .nsqd_address(addr.ip().to_string(), addr.port())
        .max_in_flight(10)
        .identify(IdentifyConfig::new())
        .build();

    let reader = Reader::new(config);
    reader.connect().await.unwrap();
    reader.subscribe("events", "tests").await.unwrap();

    // No consumer ever polls `reader.messages()`: all three MESSAGE frames
    // land in the inbox and sit there until unsubscribe drains them.
    tokio::time::sleep(Duration::from_millis(150)).await;
    reader.unsubscribe().await;

    reader.close().await;
    broker.await.unwrap();
}
