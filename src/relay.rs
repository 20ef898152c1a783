use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::handler::ConnectionId;

/// Fixed per-read buffer size, shared by the preamble read and both pump
/// directions.
pub const BUF_LEN: usize = 64 * 1024;

/// What the pump hands back when a tunnel ends.
///
/// The write halves are returned unclosed: the connection handler owns
/// closing, the pump never does.
pub struct RelayOutcome {
    pub from_client: u64,
    pub from_target: u64,
    pub client_wr: OwnedWriteHalf,
    pub target_wr: OwnedWriteHalf,
}

/// Copy bytes between two live streams until either side dies.
///
/// One reader task per direction pushes chunks of exactly the bytes read
/// into a bounded channel; a single dispatch loop drains both channels and
/// writes each chunk to the opposite stream. Capacity-1 channels give
/// natural backpressure: a reader blocks until the dispatcher has drained
/// its previous chunk, and the dispatcher blocks on the destination's write
/// buffer, so a slow consumer throttles a fast producer without unbounded
/// buffering.
///
/// Returns as soon as one direction hits EOF or an I/O error, a write to
/// the opposite stream fails, or `cancel` fires.
pub async fn pump(
    conn: ConnectionId,
    client: TcpStream,
    target: TcpStream,
    cancel: CancellationToken,
) -> RelayOutcome {
    let (client_rd, mut client_wr) = client.into_split();
    let (target_rd, mut target_wr) = target.into_split();

    let (client_tx, mut client_rx) = mpsc::channel::<Bytes>(1);
    let (target_tx, mut target_rx) = mpsc::channel::<Bytes>(1);

    let client_reader = tokio::spawn(read_into(client_rd, client_tx));
    let target_reader = tokio::spawn(read_into(target_rd, target_tx));

    let mut from_client = 0u64;
    let mut from_target = 0u64;

    loop {
        tokio::select! {
            chunk = client_rx.recv() => match chunk {
                Some(data) => {
                    if let Err(e) = target_wr.write_all(&data).await {
                        warn!("Connection #{} target write error: {}", conn, e);
                        break;
                    }
                    from_client += data.len() as u64;
                }
                // Client reader hit EOF or an error; this direction is dead.
                None => break,
            },
            chunk = target_rx.recv() => match chunk {
                Some(data) => {
                    if let Err(e) = client_wr.write_all(&data).await {
                        warn!("Connection #{} client write error: {}", conn, e);
                        break;
                    }
                    from_target += data.len() as u64;
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Readers may be parked in read() or blocked on a full channel; abort
    // them and wait for their read halves to drop before handing the write
    // halves back.
    client_reader.abort();
    target_reader.abort();
    let _ = tokio::join!(client_reader, target_reader);

    RelayOutcome {
        from_client,
        from_target,
        client_wr,
        target_wr,
    }
}

/// Read fixed-size chunks from one half and push them into the channel.
/// Returning closes the channel, which the dispatcher treats as this
/// direction going dead.
async fn read_into(mut rd: OwnedReadHalf, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; BUF_LEN];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return;
                }
            }
        }
    }
}
