use std::io;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};

/// Upper bound for a single read; chunks larger than this are relayed in
/// pieces, in order.
pub const CHUNK_SIZE: usize = 1024;

/// Relay bytes between two established streams in both directions until
/// either side reaches EOF, a read fails, or a write to the peer fails.
///
/// Returns the byte counts relayed `a -> b` and `b -> a`. A clean EOF on
/// either side is `Ok`; only a write failure surfaces as an error, since a
/// failed read is indistinguishable from the peer hanging up.
///
/// Each stream gets its own reader task feeding a bounded channel; the
/// closed channel doubles as the end-of-stream marker. One coordinating loop
/// selects over both channels and writes each chunk whole to the opposite
/// stream, so per-direction ordering is preserved and nothing is dropped
/// mid-relay. On teardown the surviving reader task is aborted: it may be
/// parked in a read with nobody left to drain its channel, and aborting it
/// drops its read half, which closes the underlying stream.
pub async fn pipe<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);

    let (mut from_a, a_reader) = spawn_reader(a_read);
    let (mut from_b, b_reader) = spawn_reader(b_read);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let result = loop {
        tokio::select! {
            chunk = from_a.recv() => match chunk {
                Some(chunk) => {
                    if let Err(err) = b_write.write_all(&chunk).await {
                        break Err(err);
                    }
                    a_to_b += chunk.len() as u64;
                }
                None => break Ok(()),
            },
            chunk = from_b.recv() => match chunk {
                Some(chunk) => {
                    if let Err(err) = a_write.write_all(&chunk).await {
                        break Err(err);
                    }
                    b_to_a += chunk.len() as u64;
                }
                None => break Ok(()),
            },
        }
    };

    a_reader.abort();
    b_reader.abort();
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(|()| (a_to_b, b_to_a))
}

fn spawn_reader<R>(mut r: R) -> (mpsc::Receiver<Vec<u8>>, JoinHandle<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // The buffer is reused next iteration; hand out a copy.
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (rx, task)
}
