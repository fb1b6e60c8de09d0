//! Mock BitTorrent Peer for Testing
//!
//! A seeding peer that speaks the plaintext wire protocol with hand-built
//! frames, so sessions can be tested against an implementation that shares
//! no code with the crate.

#![allow(dead_code)]

use bitvec::prelude::*;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Protocol string for BitTorrent handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// Pieces we have (bitfield)
    pub pieces: BitVec<u8, Msb0>,
    /// Piece data to serve
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Pieces served with flipped bytes the first time they are requested
    pub corrupt_once: HashSet<u32>,
    /// Whether to immediately unchoke connecting peers
    pub auto_unchoke: bool,
}

impl MockPeerConfig {
    /// Create a new mock peer config for testing
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MO0001-");
        for byte in &mut peer_id[8..] {
            *byte = rand::random();
        }

        Self {
            info_hash,
            peer_id,
            pieces: bitvec![u8, Msb0; 0; num_pieces],
            piece_data: HashMap::new(),
            corrupt_once: HashSet::new(),
            auto_unchoke: true,
        }
    }

    /// Add piece data
    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self.pieces.set(index as usize, true);
        self
    }

    /// Serve bad data for `index` the first time it is requested
    pub fn corrupt_once(mut self, index: u32) -> Self {
        self.corrupt_once.insert(index);
        self
    }
}

/// What the mock peer saw during a connection
#[derive(Debug, Default)]
pub struct MockPeerLog {
    /// Number of Request messages per piece
    pub requests: HashMap<u32, usize>,
    /// Pieces announced with Have
    pub haves: Vec<u32>,
    /// Whether Interested arrived
    pub interested: bool,
}

/// A mock BitTorrent peer for testing
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
    log: Arc<Mutex<MockPeerLog>>,
}

impl MockPeer {
    /// Create a new mock peer and start listening
    pub async fn new(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            config,
            listener,
            log: Arc::new(Mutex::new(MockPeerLog::default())),
        })
    }

    /// Get the address this peer is listening on
    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Shared view of what the peer has seen
    pub fn log(&self) -> Arc<Mutex<MockPeerLog>> {
        Arc::clone(&self.log)
    }

    /// Accept a single connection and serve it until the other side leaves
    pub async fn accept_one(&self) -> std::io::Result<()> {
        let (stream, _addr) = self.listener.accept().await?;
        match self.handle_connection(stream).await {
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            other => other,
        }
    }

    /// Handle a peer connection
    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.do_handshake(&mut stream).await?;
        self.send_bitfield(&mut stream).await?;

        if self.config.auto_unchoke {
            self.send_unchoke(&mut stream).await?;
        }

        let mut corrupt = self.config.corrupt_once.clone();
        loop {
            let msg = self.read_message(&mut stream).await?;
            match msg {
                MockMessage::Interested => {
                    self.log.lock().await.interested = true;
                    if !self.config.auto_unchoke {
                        self.send_unchoke(&mut stream).await?;
                    }
                }
                MockMessage::Request {
                    index,
                    begin,
                    length,
                } => {
                    *self.log.lock().await.requests.entry(index).or_default() += 1;
                    if let Some(piece_data) = self.config.piece_data.get(&index) {
                        let end = (begin + length) as usize;
                        if end <= piece_data.len() {
                            let mut block = piece_data[begin as usize..end].to_vec();
                            if corrupt.remove(&index) {
                                for byte in &mut block {
                                    *byte ^= 0xFF;
                                }
                            }
                            self.send_piece(&mut stream, index, begin, block).await?;
                        }
                    }
                }
                MockMessage::Have { piece_index } => {
                    self.log.lock().await.haves.push(piece_index);
                }
                MockMessage::Other(_) => {}
            }
        }
    }

    /// Perform BitTorrent handshake
    async fn do_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        // Read peer's handshake
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        // Verify protocol string
        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid protocol string",
            ));
        }

        // Verify info hash
        if handshake[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Info hash mismatch",
            ));
        }

        // Send our handshake; no extension bits
        let mut response = Vec::with_capacity(68);
        response.push(19);
        response.extend_from_slice(PROTOCOL_STRING);
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&self.config.info_hash);
        response.extend_from_slice(&self.config.peer_id);
        stream.write_all(&response).await?;

        Ok(())
    }

    /// Send bitfield message
    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let bitfield = self.config.pieces.as_raw_slice();
        let len = 1 + bitfield.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5); // Bitfield message ID
        msg.extend_from_slice(bitfield);
        stream.write_all(&msg).await
    }

    /// Send unchoke message
    async fn send_unchoke(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        stream.write_all(&[0, 0, 0, 1, 1]).await
    }

    /// Send piece message
    async fn send_piece(
        &self,
        stream: &mut TcpStream,
        index: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> std::io::Result<()> {
        let len = 9 + block.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(7); // Piece message ID
        msg.extend_from_slice(&index.to_be_bytes());
        msg.extend_from_slice(&begin.to_be_bytes());
        msg.extend_from_slice(&block);
        stream.write_all(&msg).await
    }

    /// Read a peer message
    async fn read_message(&self, stream: &mut TcpStream) -> std::io::Result<MockMessage> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(MockMessage::Other(None));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let id = data[0];
        let payload = &data[1..];
        let word = |at: usize| {
            u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };

        Ok(match id {
            2 => MockMessage::Interested,
            4 => MockMessage::Have {
                piece_index: word(0),
            },
            6 => MockMessage::Request {
                index: word(0),
                begin: word(4),
                length: word(8),
            },
            _ => MockMessage::Other(Some(id)),
        })
    }
}

/// The messages the mock peer reacts to
#[derive(Debug)]
enum MockMessage {
    Interested,
    Have { piece_index: u32 },
    Request { index: u32, begin: u32, length: u32 },
    Other(Option<u8>),
}
