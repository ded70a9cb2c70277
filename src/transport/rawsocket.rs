//! Length prefixed socket transport.
//!
//! Every frame (and the handshake itself) is four header bytes:
//! `[msg_type: u8][length: u24 big endian]` with
//! `msg_type ∈ {WAMP = 0, PING = 1, PONG = 2}`.  The handshake octet pair is
//! `[0x7F][serializer << 4 | max_len_nibble]` followed by two reserved zero
//! bytes; the server echoes the chosen serializer, or replies with a zero
//! serializer nibble and an error code in the low nibble.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::{thread_rng, Rng};

use crate::serializer::SerializerType;
use crate::transport::Transport;
use crate::{Error, ErrorKind, WampResult};

pub const MAGIC: u8 = 0x7F;
pub const HEADER_LENGTH: usize = 4;

/// Frame size bounds; the handshake length nibble encodes
/// `log2(max) - 9`, so 0x0 is 512 bytes and 0xF is 16 MiB.
pub const MAX_MSG_LEN: u32 = 1 << 24;
pub const MIN_MSG_LEN: u32 = 1 << 9;

const ERR_UNSUPPORTED_SERIALIZER: u8 = 1;
const ERR_UNACCEPTABLE_LENGTH: u8 = 2;
const ERR_RESERVED_BITS: u8 = 3;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FrameKind {
    Wamp = 0,
    Ping = 1,
    Pong = 2,
    // 3 - 7 reserved
}

impl FrameKind {
    pub fn from_id(id: u8) -> Option<FrameKind> {
        match id {
            x if x == FrameKind::Wamp as u8 => Some(FrameKind::Wamp),
            x if x == FrameKind::Ping as u8 => Some(FrameKind::Ping),
            x if x == FrameKind::Pong as u8 => Some(FrameKind::Pong),
            _ => None,
        }
    }
}

/// The four byte prefix in front of every frame.
pub struct FrameHeader {
    pub bytes: [u8; 4],
}

impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Type: {}, PayloadLen: {}",
            self.bytes[0],
            self.payload_len()
        )
    }
}

impl FrameHeader {
    pub fn new_from(kind: FrameKind, len: u32) -> FrameHeader {
        let len_bytes = len.to_be_bytes();
        FrameHeader {
            bytes: [kind as u8, len_bytes[1], len_bytes[2], len_bytes[3]],
        }
    }

    pub fn empty() -> FrameHeader {
        FrameHeader { bytes: [0; 4] }
    }

    pub fn frame_kind(&self) -> Option<FrameKind> {
        // The top five bits are reserved and must be zero.
        if self.bytes[0] & 0xF8 != 0 {
            return None;
        }
        FrameKind::from_id(self.bytes[0] & 0x7)
    }

    pub fn payload_len(&self) -> u32 {
        u32::from(self.bytes[3])
            + (u32::from(self.bytes[2]) << 8)
            + (u32::from(self.bytes[1]) << 16)
    }
}

/// The client's opening octets for a given serializer preference.
pub fn handshake_request(serializer: SerializerType, max_msg_len: u32) -> [u8; 4] {
    [
        MAGIC,
        ((serializer as u8) << 4) | length_nibble(max_msg_len),
        0,
        0,
    ]
}

fn length_nibble(max_msg_len: u32) -> u8 {
    let clamped = max_msg_len.clamp(MIN_MSG_LEN, MAX_MSG_LEN);
    let exp = 31 - u32::leading_zeros(clamped.next_power_of_two().min(MAX_MSG_LEN));
    (exp.saturating_sub(9) as u8) & 0x0F
}

fn handshake_refusal(error: u8) -> [u8; 4] {
    [MAGIC, error & 0x0F, 0, 0]
}

/// Checks the four octets the server sent back for our request.
fn validate_handshake_reply(request: &[u8; 4], reply: &[u8; 4]) -> WampResult<()> {
    if reply[0] != MAGIC || reply[2] != 0 || reply[3] != 0 {
        return Err(Error::new(ErrorKind::ProtocolViolation(
            "raw socket handshake reply is malformed".to_string(),
        )));
    }
    if reply[1] >> 4 == 0 {
        let reason = match reply[1] & 0x0F {
            ERR_UNSUPPORTED_SERIALIZER => "serializer not supported by peer",
            ERR_UNACCEPTABLE_LENGTH => "maximum message length rejected by peer",
            ERR_RESERVED_BITS => "peer saw reserved bits in use",
            _ => "connection refused by peer",
        };
        return Err(Error::new(ErrorKind::ProtocolViolation(format!(
            "raw socket handshake refused: {}",
            reason
        ))));
    }
    if reply[1] >> 4 != request[1] >> 4 {
        return Err(Error::new(ErrorKind::ProtocolViolation(
            "peer answered the handshake with a different serializer".to_string(),
        )));
    }
    Ok(())
}

/// A TCP or unix domain stream with cloneable read and write halves.
pub enum SocketStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl SocketStream {
    fn try_clone(&self) -> std::io::Result<SocketStream> {
        match self {
            SocketStream::Tcp(s) => s.try_clone().map(SocketStream::Tcp),
            #[cfg(unix)]
            SocketStream::Unix(s) => s.try_clone().map(SocketStream::Unix),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            SocketStream::Tcp(s) => s.read_exact(buf),
            #[cfg(unix)]
            SocketStream::Unix(s) => s.read_exact(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SocketStream::Tcp(s) => s.write_all(buf),
            #[cfg(unix)]
            SocketStream::Unix(s) => s.write_all(buf),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            SocketStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            SocketStream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

/// Raw socket transport over TCP or AF_UNIX.
pub struct RawSocketTransport {
    reader: Mutex<SocketStream>,
    writer: Mutex<SocketStream>,
    connected: AtomicBool,
    pending_pings: Mutex<HashMap<Vec<u8>, mpsc::Sender<()>>>,
}

impl RawSocketTransport {
    fn new(stream: SocketStream) -> WampResult<RawSocketTransport> {
        let write_half = stream.try_clone()?;
        Ok(RawSocketTransport {
            reader: Mutex::new(stream),
            writer: Mutex::new(write_half),
            connected: AtomicBool::new(true),
            pending_pings: Mutex::new(HashMap::new()),
        })
    }

    /// Connects and performs the client side handshake, trying each
    /// serializer in preference order.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        serializers: &[SerializerType],
    ) -> WampResult<(RawSocketTransport, SerializerType)> {
        Self::connect_with(serializers, || {
            TcpStream::connect(&addr).map(SocketStream::Tcp)
        })
    }

    #[cfg(unix)]
    pub fn connect_unix(
        path: &std::path::Path,
        serializers: &[SerializerType],
    ) -> WampResult<(RawSocketTransport, SerializerType)> {
        Self::connect_with(serializers, || {
            UnixStream::connect(path).map(SocketStream::Unix)
        })
    }

    fn connect_with<F>(
        serializers: &[SerializerType],
        mut open: F,
    ) -> WampResult<(RawSocketTransport, SerializerType)>
    where
        F: FnMut() -> std::io::Result<SocketStream>,
    {
        let mut last_error = Error::new(ErrorKind::ConnectionLost);
        for serializer in serializers {
            let mut stream = open()?;
            let request = handshake_request(*serializer, MAX_MSG_LEN);
            trace!("Sending raw socket handshake: {:?}", request);
            stream.write_all(&request)?;

            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply)?;
            match validate_handshake_reply(&request, &reply) {
                Ok(()) => {
                    debug!("Raw socket connected with serializer {:?}", serializer);
                    return Ok((RawSocketTransport::new(stream)?, *serializer));
                }
                Err(e) => {
                    warn!("Raw socket handshake failed: {}", e);
                    stream.shutdown();
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Performs the server side handshake on a freshly accepted stream.
    pub fn accept(
        stream: SocketStream,
        supported: &[SerializerType],
    ) -> WampResult<(RawSocketTransport, SerializerType)> {
        let mut stream = stream;
        let mut request = [0u8; 4];
        stream.read_exact(&mut request)?;

        if request[0] != MAGIC {
            stream.shutdown();
            return Err(Error::new(ErrorKind::ProtocolViolation(
                "raw socket client did not send the magic octet".to_string(),
            )));
        }
        if request[2] != 0 || request[3] != 0 {
            let _ = stream.write_all(&handshake_refusal(ERR_RESERVED_BITS));
            stream.shutdown();
            return Err(Error::new(ErrorKind::ProtocolViolation(
                "raw socket client used reserved handshake octets".to_string(),
            )));
        }

        let serializer = SerializerType::from_id(request[1] >> 4)
            .filter(|s| supported.contains(s))
            .ok_or_else(|| {
                let _ = stream.write_all(&handshake_refusal(ERR_UNSUPPORTED_SERIALIZER));
                stream.shutdown();
                Error::new(ErrorKind::ProtocolViolation(
                    "raw socket client requested an unsupported serializer".to_string(),
                ))
            })?;

        // Echo the accepted octets back.
        stream.write_all(&request)?;
        debug!("Accepted raw socket client with serializer {:?}", serializer);
        Ok((RawSocketTransport::new(stream)?, serializer))
    }

    fn write_frame(&self, kind: FrameKind, payload: &[u8]) -> WampResult<()> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::ConnectionLost));
        }
        if payload.len() as u32 >= MAX_MSG_LEN {
            return Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "outgoing frame of {} bytes exceeds the transport maximum",
                payload.len()
            ))));
        }
        let header = FrameHeader::new_from(kind, payload.len() as u32);

        // Header and payload are two writes; the lock keeps them contiguous
        // on the wire when several threads send at once.
        let mut writer = self.writer.lock().unwrap();
        let result = writer
            .write_all(&header.bytes)
            .and_then(|_| writer.write_all(payload));
        drop(writer);

        result.map_err(|e| {
            debug!("Raw socket write failed: {}", e);
            self.mark_disconnected();
            Error::new(ErrorKind::ConnectionLost)
        })
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pending_pings.lock().unwrap().clear();
        }
    }
}

impl Transport for RawSocketTransport {
    fn read(&self) -> WampResult<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap();
        loop {
            if !self.is_connected() {
                return Err(Error::new(ErrorKind::ConnectionLost));
            }
            let mut header = FrameHeader::empty();
            if let Err(e) = reader.read_exact(&mut header.bytes) {
                trace!("Raw socket read failed: {}", e);
                self.mark_disconnected();
                return Err(Error::new(ErrorKind::ConnectionLost));
            }
            let kind = match header.frame_kind() {
                Some(kind) => kind,
                None => {
                    self.mark_disconnected();
                    reader.shutdown();
                    return Err(Error::new(ErrorKind::ProtocolViolation(
                        "raw socket frame had an invalid header".to_string(),
                    )));
                }
            };
            let mut payload = vec![0u8; header.payload_len() as usize];
            if reader.read_exact(&mut payload).is_err() {
                self.mark_disconnected();
                return Err(Error::new(ErrorKind::ConnectionLost));
            }

            match kind {
                FrameKind::Wamp => return Ok(payload),
                FrameKind::Ping => {
                    trace!("Answering transport ping of {} bytes", payload.len());
                    self.write_frame(FrameKind::Pong, &payload)?;
                }
                FrameKind::Pong => {
                    match self.pending_pings.lock().unwrap().remove(&payload) {
                        Some(waiter) => {
                            let _ = waiter.send(());
                        }
                        None => warn!("Peer sent a pong nobody was waiting for"),
                    };
                }
            }
        }
    }

    fn write(&self, data: &[u8]) -> WampResult<()> {
        self.write_frame(FrameKind::Wamp, data)
    }

    fn close(&self) {
        self.mark_disconnected();
        self.writer.lock().unwrap().shutdown();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ping(&self, timeout: Duration) -> WampResult<f64> {
        let payload: Vec<u8> = {
            let mut rng = thread_rng();
            (0..8).map(|_| rng.gen()).collect()
        };
        let (sender, receiver) = mpsc::channel();
        self.pending_pings
            .lock()
            .unwrap()
            .insert(payload.clone(), sender);

        let started = Instant::now();
        self.write_frame(FrameKind::Ping, &payload)?;

        match receiver.recv_timeout(timeout) {
            Ok(()) => Ok(started.elapsed().as_secs_f64() * 1000.0),
            Err(_) => {
                self.pending_pings.lock().unwrap().remove(&payload);
                if self.is_connected() {
                    Err(Error::new(ErrorKind::Timeout))
                } else {
                    Err(Error::new(ErrorKind::ConnectionLost))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{
        handshake_request, validate_handshake_reply, FrameHeader, FrameKind, MAGIC, MAX_MSG_LEN,
    };
    use crate::serializer::SerializerType;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new_from(FrameKind::Wamp, 0x01_02_03);
        assert_eq!(header.bytes, [0, 1, 2, 3]);
        assert_eq!(header.frame_kind(), Some(FrameKind::Wamp));
        assert_eq!(header.payload_len(), 0x01_02_03);

        let header = FrameHeader::new_from(FrameKind::Ping, 5);
        assert_eq!(header.frame_kind(), Some(FrameKind::Ping));
        assert_eq!(header.payload_len(), 5);
    }

    #[test]
    fn reserved_bits_rejected() {
        let header = FrameHeader {
            bytes: [0xF8, 0, 0, 1],
        };
        assert_eq!(header.frame_kind(), None);
    }

    #[test]
    fn handshake_octets() {
        let request = handshake_request(SerializerType::Cbor, MAX_MSG_LEN);
        assert_eq!(request[0], MAGIC);
        assert_eq!(request[1] >> 4, SerializerType::Cbor as u8);
        assert_eq!(request[1] & 0x0F, 15); // 2^24
        assert_eq!(&request[2..], &[0, 0]);
    }

    #[test]
    fn handshake_echo_accepted() {
        let request = handshake_request(SerializerType::Json, MAX_MSG_LEN);
        assert!(validate_handshake_reply(&request, &request).is_ok());
    }

    #[test]
    fn handshake_refusal_surfaces_reason() {
        let request = handshake_request(SerializerType::MsgPack, MAX_MSG_LEN);
        let refusal = [MAGIC, 0x01, 0, 0];
        assert!(validate_handshake_reply(&request, &refusal).is_err());
    }

    #[test]
    fn handshake_serializer_mismatch_rejected() {
        let request = handshake_request(SerializerType::MsgPack, MAX_MSG_LEN);
        let reply = handshake_request(SerializerType::Json, MAX_MSG_LEN);
        assert!(validate_handshake_reply(&request, &reply).is_err());
    }
}
