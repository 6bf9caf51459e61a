//! A serialized, exact-length reader layered over a duplex stream's read half.
//!
//! Requests to fill a buffer to a given length are serviced strictly in the
//! order they were submitted, one at a time: the next request is not
//! dequeued until the caller acknowledges it has finished with the previous
//! completion via [`ReadPumpHandle::end_read`]. This rules out overlapping
//! completions without needing a lock held across an `.await`.

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum PumpResult {
    Filled(Vec<u8>),
    Disconnected,
}

struct ReadRequest {
    length: usize,
    completion: oneshot::Sender<PumpResult>,
}

/// A handle to a running read pump worker.
///
/// Dropping every clone of the request sender causes the worker to exit once
/// its current request (if any) finishes; [`ReadPumpHandle::dispose`] waits
/// for that exit explicitly.
pub struct ReadPumpHandle {
    requests: mpsc::UnboundedSender<ReadRequest>,
    acks: mpsc::UnboundedSender<()>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl ReadPumpHandle {
    /// Spawns the pump worker over `reader`.
    pub fn spawn(reader: ReadHalf<TcpStream>) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_pump(reader, req_rx, ack_rx));

        Self { requests: req_tx, acks: ack_tx, worker: Some(worker) }
    }

    /// Enqueues a request to fill exactly `length` bytes and returns a
    /// completion the caller can await. Fails if the worker has already exited.
    pub fn begin_read(&self, length: usize) -> oneshot::Receiver<PumpResult> {
        let (tx, rx) = oneshot::channel();
        // If the worker is gone the receiver is simply dropped without a value,
        // which resolves the awaiting `rx.await` to a RecvError the caller maps
        // to a disconnect - there is no separate "already disposed" variant here.
        let _ = self.requests.send(ReadRequest { length, completion: tx });
        rx
    }

    /// Signals that the previous completion has been fully handled and the
    /// next queued request (if any) may now be serviced.
    pub fn end_read(&self) {
        let _ = self.acks.send(());
    }

    /// Drops the request queue and waits for the worker to exit.
    pub async fn dispose(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }
}

async fn run_pump(
    mut reader: ReadHalf<TcpStream>,
    mut requests: mpsc::UnboundedReceiver<ReadRequest>,
    mut acks: mpsc::UnboundedReceiver<()>,
) {
    while let Some(request) = requests.recv().await {
        let mut buf = vec![0u8; request.length];
        let mut filled = 0usize;
        let result = loop {
            if filled == buf.len() {
                break PumpResult::Filled(buf);
            }
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => {
                    tracing::debug!("read pump observed EOF after {filled} of {} bytes", request.length);
                    break PumpResult::Disconnected;
                }
                Ok(n) => filled += n,
                Err(error) => {
                    tracing::debug!(%error, "read pump observed an I/O error");
                    break PumpResult::Disconnected;
                }
            }
        };

        let disconnected = matches!(result, PumpResult::Disconnected);
        let _ = request.completion.send(result);
        if disconnected {
            return;
        }

        // Gate: don't dequeue the next request until this completion has been
        // fully handled by whoever is awaiting it.
        if acks.recv().await.is_none() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn fills_exact_length_across_partial_writes() {
        let (mut server, client) = loopback_pair().await;
        let (read_half, _write_half) = tokio::io::split(client);
        let pump = ReadPumpHandle::spawn(read_half);

        tokio::spawn(async move {
            server.write_all(b"ab").await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(b"cde").await.unwrap();
        });

        let rx = pump.begin_read(5);
        match rx.await.unwrap() {
            PumpResult::Filled(buf) => assert_eq!(buf, b"abcde"),
            other => panic!("unexpected {other:?}"),
        }
        pump.end_read();
    }

    #[tokio::test]
    async fn reports_disconnect_on_eof() {
        let (server, client) = loopback_pair().await;
        drop(server);
        let (read_half, _write_half) = tokio::io::split(client);
        let pump = ReadPumpHandle::spawn(read_half);

        let rx = pump.begin_read(4);
        match rx.await.unwrap() {
            PumpResult::Disconnected => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_are_serviced_in_order() {
        let (mut server, client) = loopback_pair().await;
        let (read_half, _write_half) = tokio::io::split(client);
        let pump = ReadPumpHandle::spawn(read_half);

        tokio::spawn(async move {
            server.write_all(b"AAAABBBB").await.unwrap();
        });

        let first = pump.begin_read(4);
        let second = pump.begin_read(4);

        match first.await.unwrap() {
            PumpResult::Filled(buf) => assert_eq!(buf, b"AAAA"),
            other => panic!("unexpected {other:?}"),
        }
        pump.end_read();

        match second.await.unwrap() {
            PumpResult::Filled(buf) => assert_eq!(buf, b"BBBB"),
            other => panic!("unexpected {other:?}"),
        }
        pump.end_read();
    }
}
