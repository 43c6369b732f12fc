//! Git pkt-line framing.
//!
//! Every packet starts with four lowercase hex digits giving its total length
//! including the prefix. Lengths 0, 1 and 2 are the flush, delimiter and
//! response-end markers.

use std::io::{self, Read, Write};

use crate::{Error, Result};

/// Largest packet, prefix included.
pub const MAX_PACKET_LEN: usize = 65520;
/// Largest payload of a data packet.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Vec<u8>),
    Flush,
    Delim,
    ResponseEnd,
}

impl Packet {
    /// Payload as a text line without its trailing newline.
    pub fn text(&self) -> Option<String> {
        match self {
            Packet::Data(data) => {
                let data = data.strip_suffix(b"\n").unwrap_or(data);
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        }
    }
}

pub struct PktReader<R> {
    inner: R,
}

impl<R: Read> PktReader<R> {
    pub fn new(inner: R) -> Self {
        PktReader { inner }
    }

    /// Read the next packet. `None` on a clean end of stream.
    pub fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(Error::Protocol("truncated packet length".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Protocol(format!("read failed: {}", e))),
            }
        }

        let len = std::str::from_utf8(&prefix)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "invalid packet length {:?}",
                    String::from_utf8_lossy(&prefix)
                ))
            })?;

        match len {
            0 => Ok(Some(Packet::Flush)),
            1 => Ok(Some(Packet::Delim)),
            2 => Ok(Some(Packet::ResponseEnd)),
            3 => Err(Error::Protocol("invalid packet length 3".into())),
            n if n > MAX_PACKET_LEN => Err(Error::Protocol(format!(
                "packet length {} exceeds {}",
                n, MAX_PACKET_LEN
            ))),
            n => {
                let mut data = vec![0u8; n - 4];
                self.inner.read_exact(&mut data).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        Error::Protocol("truncated packet".into())
                    } else {
                        Error::Protocol(format!("read failed: {}", e))
                    }
                })?;
                Ok(Some(Packet::Data(data)))
            }
        }
    }

    /// Like [`read_packet`](Self::read_packet) but end of stream is an error.
    pub fn expect_packet(&mut self) -> Result<Packet> {
        self.read_packet()?
            .ok_or_else(|| Error::Protocol("unexpected end of stream".into()))
    }
}

pub struct PktWriter<W> {
    inner: W,
}

impl<W: Write> PktWriter<W> {
    pub fn new(inner: W) -> Self {
        PktWriter { inner }
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            // A zero-length data packet would read back as a flush.
            return Ok(());
        }
        for chunk in data.chunks(MAX_PAYLOAD_LEN) {
            write!(self.inner, "{:04x}", chunk.len() + 4)?;
            self.inner.write_all(chunk)?;
        }
        Ok(())
    }

    /// Write one text line, appending the newline.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "line of {} bytes does not fit in a packet",
                data.len()
            )));
        }
        self.write_data(&data)
    }

    pub fn write_flush(&mut self) -> Result<()> {
        self.inner.write_all(b"0000")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_delim(&mut self) -> Result<()> {
        self.inner.write_all(b"0001")?;
        Ok(())
    }

    pub fn write_response_end(&mut self) -> Result<()> {
        self.inner.write_all(b"0002")?;
        Ok(())
    }

    /// Copy `reader` to the stream as data packets.
    pub fn copy_from(&mut self, reader: &mut dyn Read) -> Result<u64> {
        let mut buf = vec![0u8; MAX_PAYLOAD_LEN];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e)),
            };
            self.write_data(&buf[..n])?;
            total += n as u64;
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads the payload of data packets up to the next flush.
///
/// Framing failures are recorded and surface through
/// [`take_error`](Self::take_error), apart from errors of the consumer.
pub struct DataReader<'a, R> {
    packets: &'a mut PktReader<R>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
    error: Option<Error>,
}

impl<'a, R: Read> DataReader<'a, R> {
    pub fn new(packets: &'a mut PktReader<R>) -> Self {
        DataReader {
            packets,
            pending: Vec::new(),
            pos: 0,
            done: false,
            error: None,
        }
    }

    /// Discard the rest of the data section.
    pub fn drain(&mut self) -> Result<()> {
        io::copy(self, &mut io::sink()).map(|_| ()).or_else(|e| {
            self.error
                .take()
                .map_or_else(|| Err(Error::from_io(e)), Err)
        })
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

impl<R: Read> Read for DataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.pending.len() {
            if self.done {
                return Ok(0);
            }
            match self.packets.read_packet() {
                Ok(Some(Packet::Data(data))) => {
                    self.pending = data;
                    self.pos = 0;
                }
                Ok(Some(Packet::Flush)) => self.done = true,
                Ok(Some(other)) => {
                    self.done = true;
                    self.error = Some(Error::Protocol(format!(
                        "unexpected {:?} in data section",
                        other
                    )));
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad data section"));
                }
                Ok(None) => {
                    self.done = true;
                    self.error = Some(Error::Protocol("stream ended inside data section".into()));
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Err(err) => {
                    self.done = true;
                    self.error = Some(err);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad data section"));
                }
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
