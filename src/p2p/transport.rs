//! TCP transport: a full mesh between the participants of a room
//!
//! The lower index of every pair dials the higher one and both sides exchange
//! a handshake carrying their index. Each connection is split; a reader task
//! per peer routes contributions to the broadcast channel and everything else
//! to that peer's inbox. A closed connection is reported on the broadcast
//! channel as `Disconnected`. Frames are a 4-byte big-endian length followed by a
//! bincode payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{CommandTag, DcNetMessage, ParticipantIndex, RoundContribution};
use super::traits::{BroadcastSource, RoomTransport, TransportError, TransportResult};
use crate::room::Room;

/// Maximum frame payload (1MB)
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Pause between dial attempts while a peer is not listening yet
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handshake message sent at connection establishment
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct Handshake {
    index: ParticipantIndex,
    room_size: usize,
}

pub struct TcpRoomTransport {
    self_index: ParticipantIndex,
    room_size: usize,
    writers: HashMap<ParticipantIndex, Mutex<OwnedWriteHalf>>,
    inboxes: HashMap<ParticipantIndex, Mutex<mpsc::UnboundedReceiver<DcNetMessage>>>,
    /// Delivers our own broadcasts to our receive task
    loopback: mpsc::UnboundedSender<TransportResult<RoundContribution>>,
    readers: Vec<JoinHandle<()>>,
}

impl TcpRoomTransport {
    /// Listens on this participant's room address and connects to every peer.
    ///
    /// Dialing is retried until `connect_timeout` elapses, so participants may
    /// start in any order.
    pub async fn connect(
        room: &Room,
        self_index: ParticipantIndex,
        connect_timeout: Duration,
    ) -> TransportResult<(Self, TcpBroadcastSource)> {
        let room_size = room.size();
        let listen_addr = room
            .address(self_index)
            .ok_or(TransportError::UnknownPeer(self_index))?;
        let listener = TcpListener::bind(listen_addr).await?;
        info!("[{}] listening on {}", self_index, listen_addr);

        let me = Handshake {
            index: self_index,
            room_size,
        };

        let dial_higher = async {
            let mut streams = Vec::new();
            for peer in (self_index + 1)..=room_size {
                let addr = room.address(peer).ok_or(TransportError::UnknownPeer(peer))?;
                let mut stream = dial(addr, peer, connect_timeout).await?;
                send_frame(&mut stream, &me).await?;
                let reply: Handshake = receive_frame(&mut stream).await?;
                if reply.index != peer || reply.room_size != room_size {
                    return Err(TransportError::Handshake(format!(
                        "expected participant {} of {} at {}, got {:?}",
                        peer, room_size, addr, reply
                    )));
                }
                debug!("[{}] connected to {} at {}", self_index, peer, addr);
                streams.push((peer, stream));
            }
            Ok::<_, TransportError>(streams)
        };

        let accept_lower = async {
            let mut streams: Vec<(ParticipantIndex, TcpStream)> = Vec::new();
            while streams.len() + 1 < self_index {
                let (mut stream, addr) = listener.accept().await?;
                let hello: Handshake = match receive_frame(&mut stream).await {
                    Ok(hello) => hello,
                    Err(err) => {
                        warn!(
                            "[{}] dropping connection from {}: bad handshake: {}",
                            self_index, addr, err
                        );
                        continue;
                    }
                };
                let known = streams.iter().any(|(peer, _)| *peer == hello.index);
                if hello.index == 0
                    || hello.index >= self_index
                    || hello.room_size != room_size
                    || known
                {
                    warn!(
                        "[{}] rejecting connection from {}: {:?}",
                        self_index, addr, hello
                    );
                    continue;
                }
                send_frame(&mut stream, &me).await?;
                debug!("[{}] accepted {} from {}", self_index, hello.index, addr);
                streams.push((hello.index, stream));
            }
            Ok::<_, TransportError>(streams)
        };

        let (higher, lower) = tokio::try_join!(dial_higher, accept_lower)?;

        let (loopback, broadcast_rx) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();
        let mut inboxes = HashMap::new();
        let mut readers = Vec::new();

        for (peer, stream) in lower.into_iter().chain(higher) {
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            let (pairwise_tx, pairwise_rx) = mpsc::unbounded_channel();
            readers.push(tokio::spawn(read_loop(
                self_index,
                peer,
                read_half,
                pairwise_tx,
                loopback.clone(),
            )));
            writers.insert(peer, Mutex::new(write_half));
            inboxes.insert(peer, Mutex::new(pairwise_rx));
        }

        info!(
            "[{}] connected to all {} peers",
            self_index,
            writers.len()
        );

        let transport = Self {
            self_index,
            room_size,
            writers,
            inboxes,
            loopback,
            readers,
        };
        Ok((transport, TcpBroadcastSource { rx: broadcast_rx }))
    }
}

impl Drop for TcpRoomTransport {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl RoomTransport for TcpRoomTransport {
    fn self_index(&self) -> ParticipantIndex {
        self.self_index
    }

    fn room_size(&self) -> usize {
        self.room_size
    }

    async fn broadcast(&self, message: DcNetMessage) -> TransportResult<()> {
        let DcNetMessage::Contribution(contribution) = &message else {
            return Err(TransportError::UnexpectedMessage {
                peer: self.self_index,
                expected: CommandTag::Slot,
                got: message.command(),
            });
        };
        self.loopback
            .send(Ok(contribution.clone()))
            .map_err(|_| TransportError::BroadcastClosed)?;

        for (peer, writer) in &self.writers {
            let mut writer = writer.lock().await;
            send_frame(&mut *writer, &message)
                .await
                .map_err(|err| match err {
                    TransportError::Io(_) => TransportError::Disconnected(*peer),
                    other => other,
                })?;
        }
        Ok(())
    }

    async fn send_to(&self, peer: ParticipantIndex, message: DcNetMessage) -> TransportResult<()> {
        let writer = self
            .writers
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let mut writer = writer.lock().await;
        send_frame(&mut *writer, &message)
            .await
            .map_err(|err| match err {
                TransportError::Io(_) => TransportError::Disconnected(peer),
                other => other,
            })
    }

    async fn recv_from(&self, peer: ParticipantIndex) -> TransportResult<DcNetMessage> {
        let inbox = self
            .inboxes
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let mut inbox = inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::Disconnected(peer))
    }
}

pub struct TcpBroadcastSource {
    rx: mpsc::UnboundedReceiver<TransportResult<RoundContribution>>,
}

#[async_trait]
impl BroadcastSource for TcpBroadcastSource {
    async fn next_broadcast(&mut self) -> TransportResult<RoundContribution> {
        self.rx.recv().await.ok_or(TransportError::BroadcastClosed)?
    }
}

async fn dial(
    addr: SocketAddr,
    peer: ParticipantIndex,
    connect_timeout: Duration,
) -> TransportResult<TcpStream> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(TransportError::ConnectTimeout {
                        peer,
                        timeout: connect_timeout,
                    });
                }
                debug!("dial {} ({}) failed: {}, retrying", peer, addr, err);
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
            }
        }
    }
}

async fn read_loop(
    self_index: ParticipantIndex,
    peer: ParticipantIndex,
    mut reader: OwnedReadHalf,
    pairwise: mpsc::UnboundedSender<DcNetMessage>,
    broadcast: mpsc::UnboundedSender<TransportResult<RoundContribution>>,
) {
    loop {
        let message: DcNetMessage = match receive_frame(&mut reader).await {
            Ok(message) => message,
            Err(err) => {
                debug!("[{}] connection to {} closed: {}", self_index, peer, err);
                let _ = broadcast.send(Err(TransportError::Disconnected(peer)));
                return;
            }
        };

        if message.sender() != peer {
            warn!(
                "[{}] dropping {:?} claiming sender {} on the connection of {}",
                self_index,
                message.command(),
                message.sender(),
                peer
            );
            continue;
        }

        let delivered = match message {
            DcNetMessage::Contribution(contribution) => broadcast.send(Ok(contribution)).is_ok(),
            other => pairwise.send(other).is_ok(),
        };
        if !delivered {
            return;
        }
    }
}

async fn send_frame<W, T>(writer: &mut W, message: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)
        .map_err(|e| TransportError::Codec(format!("failed to serialize message: {}", e)))?;

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec(format!(
            "message too large: {} bytes",
            data.len()
        )));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

async fn receive_frame<R, T>(reader: &mut R) -> TransportResult<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec(format!("message too large: {} bytes", len)));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    bincode::deserialize(&data)
        .map_err(|e| TransportError::Codec(format!("failed to deserialize message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::StaticDirectory;

    fn free_addresses(n: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|listener| listener.local_addr().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let message = DcNetMessage::BarrierRequest {
            sender: 2,
            round: 9,
        };
        send_frame(&mut a, &message).await.unwrap();
        let decoded: DcNetMessage = receive_frame(&mut b).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let result: TransportResult<DcNetMessage> = receive_frame(&mut b).await;
        assert!(matches!(result, Err(TransportError::Codec(_))));
    }

    #[tokio::test]
    async fn test_dial_times_out() {
        let addr = free_addresses(1)[0];
        let result = dial(addr, 2, Duration::from_millis(250)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectTimeout { peer: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_three_party_mesh() {
        let room = Room::from_directory(&StaticDirectory::new(free_addresses(3), true)).unwrap();
        let timeout = Duration::from_secs(5);

        let (one, two, three) = tokio::join!(
            TcpRoomTransport::connect(&room, 1, timeout),
            TcpRoomTransport::connect(&room, 2, timeout),
            TcpRoomTransport::connect(&room, 3, timeout),
        );
        let (one, mut source_one) = one.unwrap();
        let (two, mut source_two) = two.unwrap();
        let (three, mut source_three) = three.unwrap();

        let (a, b, c) = tokio::join!(one.barrier(1), two.barrier(1), three.barrier(1));
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let contribution = RoundContribution {
            sender: 2,
            round: 1,
            blinded_slot: vec![1, 2, 3],
            attestation: None,
        };
        two.broadcast(DcNetMessage::Contribution(contribution.clone()))
            .await
            .unwrap();
        assert_eq!(source_one.next_broadcast().await.unwrap(), contribution);
        assert_eq!(source_two.next_broadcast().await.unwrap(), contribution);
        assert_eq!(source_three.next_broadcast().await.unwrap(), contribution);

        three
            .send_to(1, DcNetMessage::BarrierReply { sender: 3, round: 4 })
            .await
            .unwrap();
        assert_eq!(
            one.recv_from(3).await.unwrap(),
            DcNetMessage::BarrierReply { sender: 3, round: 4 }
        );
    }

    #[tokio::test]
    async fn test_pairwise_message_cannot_be_broadcast() {
        let room = Room::from_directory(&StaticDirectory::new(free_addresses(2), true)).unwrap();
        let timeout = Duration::from_secs(5);
        let (one, two) = tokio::join!(
            TcpRoomTransport::connect(&room, 1, timeout),
            TcpRoomTransport::connect(&room, 2, timeout),
        );
        let (one, _source_one) = one.unwrap();
        let (_two, _source_two) = two.unwrap();

        let result = one
            .broadcast(DcNetMessage::BarrierRequest { sender: 1, round: 1 })
            .await;
        assert!(matches!(
            result,
            Err(TransportError::UnexpectedMessage {
                expected: CommandTag::Slot,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported_on_broadcast() {
        let room = Room::from_directory(&StaticDirectory::new(free_addresses(2), true)).unwrap();
        let timeout = Duration::from_secs(5);
        let (one, two) = tokio::join!(
            TcpRoomTransport::connect(&room, 1, timeout),
            TcpRoomTransport::connect(&room, 2, timeout),
        );
        let (_one, mut source_one) = one.unwrap();
        let (two, source_two) = two.unwrap();

        drop(two);
        drop(source_two);

        let next = tokio::time::timeout(Duration::from_secs(5), source_one.next_broadcast())
            .await
            .expect("disconnect was not reported");
        assert!(matches!(next, Err(TransportError::Disconnected(2))));
    }

    #[tokio::test]
    async fn test_garbage_handshake_does_not_abort_bootstrap() {
        let addresses = free_addresses(2);
        let room = Room::from_directory(&StaticDirectory::new(addresses.clone(), true)).unwrap();
        let timeout = Duration::from_secs(5);

        let two = tokio::spawn({
            let room = room.clone();
            async move { TcpRoomTransport::connect(&room, 2, timeout).await }
        });

        // a stranger reaches participant 2 first and sends junk
        let mut stranger = loop {
            match TcpStream::connect(addresses[1]).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        stranger.write_all(&[0xff; 16]).await.unwrap();
        stranger.shutdown().await.unwrap();

        let (one, _source_one) = TcpRoomTransport::connect(&room, 1, timeout).await.unwrap();
        let (two, _source_two) = two.await.unwrap().unwrap();

        one.send_to(2, DcNetMessage::BarrierRequest { sender: 1, round: 1 })
            .await
            .unwrap();
        assert_eq!(
            two.recv_from(1).await.unwrap(),
            DcNetMessage::BarrierRequest { sender: 1, round: 1 }
        );
    }
}
