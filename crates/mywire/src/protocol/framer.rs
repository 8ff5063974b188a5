//! Incremental packet reassembly.
//!
//! The transport hands over bytes in whatever chunks the network produced.
//! `PacketFramer` buffers them, strips the 4-byte headers and joins
//! continuation chunks back into whole logical packets.

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// A complete logical packet read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
    /// Sequence id of the last chunk that made up this packet
    pub sequence_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a 4-byte chunk header
    Header,
    /// Copying `remaining` bytes of a chunk declared as `chunk_len` long
    Body { remaining: usize, chunk_len: usize },
}

/// Streaming packet decoder.
///
/// Chunk boundaries of the input have no effect on the output: feeding the
/// same bytes all at once or one at a time yields the same packets.
#[derive(Debug)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    phase: Phase,
    payload: Vec<u8>,
    sequence_id: u8,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            phase: Phase::Header,
            payload: Vec::new(),
            sequence_id: 0,
        }
    }

    /// Bytes held for a packet that is not complete yet: partial header
    /// bytes plus the payload assembled so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.payload.len()
    }

    /// Is a packet partially assembled?
    pub fn in_progress(&self) -> bool {
        !self.buffer.is_empty() || !self.payload.is_empty() || self.phase != Phase::Header
    }

    /// Drop all partial state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.payload.clear();
        self.phase = Phase::Header;
        self.sequence_id = 0;
    }

    /// Consume a chunk of bytes and return every packet it completed.
    ///
    /// Empty logical packets are not emitted.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();

        loop {
            match self.phase {
                Phase::Header => {
                    let needed = PacketHeader::SIZE - self.buffer.len();
                    let take = needed.min(chunk.len());
                    self.buffer.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.buffer.len() < PacketHeader::SIZE {
                        break;
                    }

                    let header = PacketHeader::from_bytes(&[
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    self.buffer.clear();
                    self.sequence_id = header.sequence_id;

                    let chunk_len = header.payload_length as usize;
                    self.phase = Phase::Body {
                        remaining: chunk_len,
                        chunk_len,
                    };
                }
                Phase::Body {
                    remaining,
                    chunk_len,
                } => {
                    let take = remaining.min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if take < remaining {
                        self.phase = Phase::Body {
                            remaining: remaining - take,
                            chunk_len,
                        };
                        break;
                    }

                    self.phase = Phase::Header;
                    if chunk_len == MAX_PACKET_SIZE {
                        // Continuation: the next chunk extends this packet.
                        continue;
                    }

                    let payload = std::mem::take(&mut self.payload);
                    if payload.is_empty() {
                        tracing::trace!(seq = self.sequence_id, "dropping empty packet");
                    } else {
                        tracing::trace!(
                            len = payload.len(),
                            seq = self.sequence_id,
                            "packet assembled"
                        );
                        packets.push(Packet {
                            payload,
                            sequence_id: self.sequence_id,
                        });
                    }
                }
            }

            if chunk.is_empty() && self.phase == Phase::Header && self.buffer.is_empty() {
                break;
            }
        }

        packets
    }
}
