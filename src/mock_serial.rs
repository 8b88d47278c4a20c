//! Scripted serial port for frame-level `RtuLink` tests.
//!
//! Each flushed request frame releases the next queued reply onto the line, the way a device
//! answers after the master stops talking.

use crate::bus::{Reconfigure, SerialConfig};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Default)]
pub struct ScriptedPort {
    /// Bytes written since the last flush.
    outgoing: Vec<u8>,
    /// Every flushed request frame, in order.
    frames: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    /// Bytes currently readable.
    line: VecDeque<u8>,
    bauds: Vec<u32>,
    discarded: usize,
    broken_writes: bool,
    broken_reads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortFault {
    /// Nothing on the line before the port timeout.
    #[error("no reply before the port timeout")]
    Timeout,
    /// The port itself failed.
    #[error("port failure")]
    Broken,
}

impl embedded_io::Error for PortFault {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            PortFault::Timeout => embedded_io::ErrorKind::TimedOut,
            PortFault::Broken => embedded_io::ErrorKind::Other,
        }
    }
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next request.
    pub fn reply(&mut self, frame: &[u8]) -> &mut Self {
        self.replies.push_back(frame.to_vec());
        self
    }

    /// Put stray bytes on the line right now.
    pub fn noise(&mut self, bytes: &[u8]) -> &mut Self {
        self.line.extend(bytes);
        self
    }

    pub fn break_writes(&mut self, broken: bool) {
        self.broken_writes = broken;
    }

    pub fn break_reads(&mut self, broken: bool) {
        self.broken_reads = broken;
    }

    /// All request frames sent so far.
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    /// The most recent request frame, empty if none was sent.
    pub fn last_frame(&self) -> &[u8] {
        self.frames.last().map_or(&[], Vec::as_slice)
    }

    /// Baud rates applied through [`Reconfigure`], in order.
    pub fn bauds(&self) -> &[u32] {
        &self.bauds
    }

    /// Stray bytes dropped by [`Reconfigure::discard_input`].
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl embedded_io::ErrorType for ScriptedPort {
    type Error = PortFault;
}

impl embedded_io::Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.broken_writes {
            return Err(PortFault::Broken);
        }
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.broken_writes {
            return Err(PortFault::Broken);
        }
        if self.outgoing.is_empty() {
            return Ok(());
        }
        self.frames.push(std::mem::take(&mut self.outgoing));
        if let Some(reply) = self.replies.pop_front() {
            self.line.extend(reply);
        }
        Ok(())
    }
}

impl embedded_io::Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.broken_reads {
            return Err(PortFault::Broken);
        }
        if self.line.is_empty() {
            return Err(PortFault::Timeout);
        }
        let n = buf.len().min(self.line.len());
        for (slot, byte) in buf.iter_mut().zip(self.line.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Reconfigure for ScriptedPort {
    fn reconfigure(&mut self, config: &SerialConfig) -> Result<(), Self::Error> {
        self.bauds.push(config.baud);
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        self.discarded += self.line.len();
        self.line.clear();
        Ok(())
    }
}

/// Modbus CRC-16 (poly 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC, low byte first.
pub fn with_crc(frame: &[u8]) -> Vec<u8> {
    let crc = crc16(frame);
    let mut out = frame.to_vec();
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Build a "read holding registers" reply carrying `words`.
pub fn read_response(unit: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = vec![unit, 0x03, (words.len() * 2) as u8];
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    with_crc(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, Write};

    #[test]
    fn reply_arrives_after_flush() {
        let mut port = ScriptedPort::new();
        port.reply(b"ok");
        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf), Err(PortFault::Timeout));

        port.write_all(b"req").unwrap();
        assert_eq!(port.read(&mut buf), Err(PortFault::Timeout));
        port.flush().unwrap();
        assert_eq!(port.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"ok");
        assert_eq!(port.frames(), &[b"req".to_vec()]);
    }

    #[test]
    fn partial_reads_drain_in_order() {
        let mut port = ScriptedPort::new();
        port.noise(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(port.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn discard_drops_only_stray_bytes() {
        let mut port = ScriptedPort::new();
        port.noise(&[0xAA, 0xBB]).reply(&[0x01]);
        port.discard_input().unwrap();
        assert_eq!(port.discarded(), 2);

        port.write_all(&[0x00]).unwrap();
        port.flush().unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(port.read(&mut buf), Ok(1));
        assert_eq!(buf[0], 0x01);
    }

    #[test]
    fn broken_port() {
        let mut port = ScriptedPort::new();
        port.break_writes(true);
        assert_eq!(port.write(b"x"), Err(PortFault::Broken));
        assert!(port.frames().is_empty());

        port.break_reads(true);
        assert_eq!(port.read(&mut [0u8; 1]), Err(PortFault::Broken));
    }

    #[test]
    fn faults_describe_themselves() {
        use embedded_io::Error as _;
        assert_eq!(PortFault::Timeout.to_string(), "no reply before the port timeout");
        assert_eq!(PortFault::Broken.kind(), embedded_io::ErrorKind::Other);
    }

    #[test]
    fn crc_matches_known_frame() {
        let frame = with_crc(&[0x01, 0x03, 0x00, 0x20, 0x00, 0x01]);
        assert_eq!(&frame[6..], &[0x85, 0xC0]);
        assert_eq!(
            read_response(0x01, &[0x5678]),
            vec![0x01, 0x03, 0x02, 0x56, 0x78, 0x87, 0xC6]
        );
    }
}
