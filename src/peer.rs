//! The peer communicator: one full-duplex TCP connection between two nodes, with a locked
//! single-writer dispatch path and a dedicated receive thread per connection.
//!
//! Wire framing, per direction:
//!
//! ```text
//! byte tag ∈ {MESSAGE = 3, FILE = 4, DISCONNECT = 127}
//! MESSAGE:    i32 opcode, u32 payload length, bincode payload bytes
//! FILE:       i32 opcode, u64 content length, raw file bytes
//! DISCONNECT: no body
//! ```
//!
//! File payloads are transferred as raw bytes, never as paths: the receiver materializes a fresh
//! temporary file and hands its own path onward.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use uuid::Uuid;

use crate::message::{Message, Payload};

pub const MESSAGE_HEADER: u8 = 3;
pub const FILE_HEADER: u8 = 4;
pub const DISCONNECT_HEADER: u8 = 127;

/// The faults the transport layer can raise.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure on peer connection")]
    Io(#[from] io::Error),
    #[error("could not encode or decode a message payload")]
    Codec(#[from] bincode::Error),
    #[error("unknown frame header {0:#x}")]
    UnknownHeader(u8),
    #[error("peer connection already shut down")]
    Closed,
}

impl TransportError {
    /// Whether this fault means the underlying stream is gone. Such faults are resolved by an
    /// idempotent shutdown of the one connection; everything else is surfaced to the handler.
    pub fn is_stream_closed(&self) -> bool {
        match self {
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            TransportError::Closed => true,
            _ => false,
        }
    }
}

/// The callback interface through which received messages reach the application.
pub trait MessageHandler: Send + Sync {
    /// Called on the connection's receive thread for every decoded message.
    fn handle(&self, message: Message, sender: &Arc<PeerCommunicator>);

    /// Called once when the connection's receive loop exits, whoever initiated the shutdown.
    fn connection_closed(&self, _peer: &Arc<PeerCommunicator>) {}

    /// Called for receive-side faults other than an orderly close, before the connection is
    /// shut down.
    fn connection_failed(&self, peer: &Arc<PeerCommunicator>, error: &TransportError) {
        error!("transport fault on connection to {}: {}", peer.address(), error);
    }
}

/// One end of a duplex connection. Cheap to share: dispatch locks the writer, shutdown is
/// guarded by an atomic flag so exactly one physical close executes.
pub struct PeerCommunicator {
    address: SocketAddr,
    local_address: SocketAddr,
    writer: Mutex<BufWriter<TcpStream>>,
    socket: TcpStream,
    closed: AtomicBool,
}

impl PeerCommunicator {
    /// Wraps an established stream and starts its receive loop on a dedicated thread.
    pub fn start(
        socket: TcpStream,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>, TransportError> {
        let address = socket.peer_addr()?;
        let local_address = socket.local_addr()?;
        let writer = Mutex::new(BufWriter::new(socket.try_clone()?));
        let reader = socket.try_clone()?;

        let peer = Arc::new(PeerCommunicator {
            address,
            local_address,
            writer,
            socket,
            closed: AtomicBool::new(false),
        });

        let looped = peer.clone();
        thread::Builder::new()
            .name(format!("peer-recv-{}", address))
            .spawn(move || looped.receive_loop(reader, handler))
            .map_err(TransportError::Io)?;

        Ok(peer)
    }

    /// The remote address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The local address of this connection, as seen by the remote peer.
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serializes and writes one message atomically. Concurrent dispatches from several threads
    /// take turns on the writer lock, so frames never interleave on the wire.
    pub fn dispatch(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        debug!("{} -> {}", message.code(), self.address);
        let mut writer = self.writer.lock().expect("peer writer lock poisoned");
        write_message(&mut *writer, message)?;
        writer.flush()?;
        Ok(())
    }

    /// Idempotent shutdown: a best-effort DISCONNECT frame, then the socket is closed, which
    /// also terminates the receive loop. Safe to call concurrently from the receive loop itself
    /// and from an external caller.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(&[DISCONNECT_HEADER]);
            let _ = writer.flush();
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        debug!("connection to {} shut down", self.address);
    }

    fn receive_loop(self: Arc<Self>, stream: TcpStream, handler: Arc<dyn MessageHandler>) {
        let mut reader = BufReader::new(stream);
        loop {
            match read_message(&mut reader) {
                Ok(Frame::Message(message)) => {
                    debug!("{} <- {}", message.code(), self.address);
                    handler.handle(message, &self);
                }
                Ok(Frame::Disconnect) => {
                    self.shutdown();
                    break;
                }
                Err(ref err) if err.is_stream_closed() => {
                    self.shutdown();
                    break;
                }
                Err(err) => {
                    handler.connection_failed(&self, &err);
                    self.shutdown();
                    break;
                }
            }
            if self.is_closed() {
                break;
            }
        }
        handler.connection_closed(&self);
    }
}

enum Frame {
    Message(Message),
    Disconnect,
}

fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), TransportError> {
    match message.payload() {
        Payload::File(path) => {
            writer.write_all(&[FILE_HEADER])?;
            writer.write_all(&message.code().to_be_bytes())?;
            let mut file = File::open(path)?;
            let length = file.metadata()?.len();
            writer.write_all(&length.to_be_bytes())?;
            io::copy(&mut file, writer)?;
        }
        payload => {
            let bytes: &[u8] = match payload {
                Payload::Data(bytes) => bytes,
                _ => &[],
            };
            writer.write_all(&[MESSAGE_HEADER])?;
            writer.write_all(&message.code().to_be_bytes())?;
            writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
            writer.write_all(bytes)?;
        }
    }
    Ok(())
}

fn read_message<R: Read>(reader: &mut R) -> Result<Frame, TransportError> {
    let mut header = [0u8; 1];
    reader.read_exact(&mut header)?;
    match header[0] {
        MESSAGE_HEADER => {
            let code = read_i32(reader)?;
            let length = read_u32(reader)? as usize;
            let payload = if length == 0 {
                Payload::Empty
            } else {
                let mut bytes = vec![0u8; length];
                reader.read_exact(&mut bytes)?;
                Payload::Data(bytes)
            };
            Ok(Frame::Message(Message::from_parts(code, payload)))
        }
        FILE_HEADER => {
            let code = read_i32(reader)?;
            let length = read_u64(reader)?;
            let path = temp_file_path();
            let mut file = File::create(&path)?;
            let mut limited = reader.take(length);
            let copied = io::copy(&mut limited, &mut file)?;
            if copied != length {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file transfer truncated",
                )));
            }
            Ok(Frame::Message(Message::with_file(code, path)))
        }
        DISCONNECT_HEADER => Ok(Frame::Disconnect),
        other => Err(TransportError::UnknownHeader(other)),
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, TransportError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, TransportError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, TransportError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_be_bytes(bytes))
}

/// A fresh uniquely-named location for an incoming file payload.
fn temp_file_path() -> PathBuf {
    std::env::temp_dir().join(format!("map-reduce-{}.chunk", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codes;

    fn round_trip(message: &Message) -> Message {
        let mut buffer = Vec::new();
        write_message(&mut buffer, message).unwrap();
        match read_message(&mut buffer.as_slice()).unwrap() {
            Frame::Message(decoded) => decoded,
            Frame::Disconnect => panic!("expected a message frame"),
        }
    }

    #[test]
    fn message_frame_round_trip() {
        let sent = Message::with_data(codes::KEY_FOUND, &"some key".to_string()).unwrap();
        let received = round_trip(&sent);

        assert_eq!(sent.code(), received.code());
        assert_eq!("some key", received.data::<String>().unwrap());
    }

    #[test]
    fn empty_frame_round_trip() {
        let received = round_trip(&Message::new(codes::IDLE));
        assert_eq!(codes::IDLE, received.code());
        assert_eq!(&Payload::Empty, received.payload());
    }

    #[test]
    fn disconnect_frame_decodes() {
        let buffer = vec![DISCONNECT_HEADER];
        match read_message(&mut buffer.as_slice()).unwrap() {
            Frame::Disconnect => {}
            Frame::Message(_) => panic!("expected a disconnect frame"),
        }
    }

    #[test]
    fn unknown_header_is_a_protocol_fault() {
        let buffer = vec![42u8];
        match read_message(&mut buffer.as_slice()) {
            Err(TransportError::UnknownHeader(42)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn file_frame_materializes_a_new_file() {
        let content = b"lorem ipsum dolor sit amet";
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), content).unwrap();

        let sent = Message::with_file(codes::SEND_RESULT, source.path());
        let received = round_trip(&sent);

        let received_path = received.file().expect("file payload expected");
        assert_ne!(source.path(), received_path);
        assert_eq!(content.to_vec(), std::fs::read(received_path).unwrap());
        std::fs::remove_file(received_path).unwrap();
    }

    #[test]
    fn truncated_file_frame_is_an_error() {
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"full content").unwrap();

        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::with_file(codes::SEND_RESULT, source.path()))
            .unwrap();
        buffer.truncate(buffer.len() - 4);

        assert!(read_message(&mut buffer.as_slice()).is_err());
    }
}
