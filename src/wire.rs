//! Intercept channel frame protocol
//!
//! Connects the host to the companion script running inside the debugger.
//! Framing: 2-byte magic, 1-byte message type, 2-byte payload length
//! (little endian), then the payload. One request is in flight at a time;
//! a turn starts with `Hit` and ends with `FinishCont`.

use crate::error::{Result, RigError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Frame header magic
pub const FRAME_MAGIC: [u8; 2] = [0xd0, 0x11];

/// Header length: magic + type + payload length
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Debugger to host: the breakpoint location was reached
    Hit = 0x01,
    /// Host to debugger: end of turn, resume the target
    FinishCont = 0x02,
    /// Host to debugger: evaluate an expression
    Eval = 0x03,
    /// Host to debugger: execute a command
    Exec = 0x04,
    /// Debugger to host: request failed, payload is the error text
    Except = 0x05,
    /// Debugger to host: request result
    Resp = 0x06,
}

impl FrameType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Hit),
            0x02 => Ok(FrameType::FinishCont),
            0x03 => Ok(FrameType::Eval),
            0x04 => Ok(FrameType::Exec),
            0x05 => Ok(FrameType::Except),
            0x06 => Ok(FrameType::Resp),
            other => Err(RigError::Framing(format!("Unknown frame type 0x{:02x}", other))),
        }
    }
}

/// One message on an intercept channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a payload-less frame (Hit, FinishCont, empty Resp)
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Vec::new(),
        }
    }

    /// Build a frame carrying payload bytes
    pub fn with_payload(frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as text (the protocol only carries command and
    /// result strings)
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Serialize header and payload into a single buffer
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len > u16::MAX as usize {
            return Err(RigError::Framing(format!(
                "Payload of {} bytes exceeds the 16-bit length field",
                len
            )));
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&(len as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Read one frame with fixed-length reads for header then payload.
    ///
    /// Partial TCP delivery is handled by `read_exact`; a header with the
    /// wrong magic is a fatal framing error for this read.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| RigError::Framing(format!("Short read on frame header: {}", e)))?;

        if header[0..2] != FRAME_MAGIC {
            return Err(RigError::Framing(format!(
                "Wrong frame magic: {}",
                hex::encode(&header[0..2])
            )));
        }

        let frame_type = FrameType::from_u8(header[2])?;
        let payload_len = u16::from_le_bytes([header[3], header[4]]) as usize;

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| RigError::Framing(format!("Short read on frame payload: {}", e)))?;
        }

        trace!("frame in: {:?} ({} bytes)", frame_type, payload_len);
        Ok(Self { frame_type, payload })
    }

    /// Write the whole frame
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        trace!("frame out: {:?} ({} bytes)", self.frame_type, self.payload.len());
        writer
            .write_all(&buf)
            .await
            .map_err(|e| RigError::Framing(format!("Frame write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| RigError::Framing(format!("Frame flush failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: Frame) -> Frame {
        let buf = frame.encode().unwrap();
        let mut reader = buf.as_slice();
        Frame::read_from(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_empty_payload() {
        let frame = Frame::new(FrameType::Hit);
        let decoded = round_trip(frame.clone()).await;
        assert_eq!(decoded, frame);
        assert_eq!(decoded.payload().len(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_one_byte() {
        let frame = Frame::with_payload(FrameType::Exec, vec![b'x']);
        let decoded = round_trip(frame.clone()).await;
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_round_trip_mid_size() {
        let frame = Frame::with_payload(FrameType::Resp, vec![0xab; 300]);
        let decoded = round_trip(frame.clone()).await;
        assert_eq!(decoded.frame_type(), FrameType::Resp);
        assert_eq!(decoded.payload().len(), 300);
    }

    #[tokio::test]
    async fn test_round_trip_max_payload() {
        let frame = Frame::with_payload(FrameType::Eval, vec![0x5a; u16::MAX as usize]);
        let decoded = round_trip(frame.clone()).await;
        assert_eq!(decoded.payload().len(), u16::MAX as usize);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let frame = Frame::with_payload(FrameType::Eval, vec![0; u16::MAX as usize + 1]);
        assert!(matches!(frame.encode(), Err(RigError::Framing(_))));
    }

    #[tokio::test]
    async fn test_corrupted_magic_is_framing_error() {
        let frame = Frame::with_payload(FrameType::Resp, b"data".to_vec());
        let mut buf = frame.encode().unwrap();
        buf[0] ^= 0xff;
        let mut reader = buf.as_slice();
        let err = Frame::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, RigError::Framing(_)));
    }

    #[tokio::test]
    async fn test_short_header_is_framing_error() {
        let mut reader: &[u8] = &[0xd0, 0x11, 0x01];
        let err = Frame::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, RigError::Framing(_)));
    }

    #[test]
    fn test_header_constants() {
        assert_eq!(FRAME_MAGIC, [0xd0, 0x11]);
        assert_eq!(FRAME_HEADER_LEN, 5);
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        // duplex with a tiny buffer forces partial delivery
        let (mut client, mut server) = tokio::io::duplex(8);
        let frame = Frame::with_payload(FrameType::Exec, vec![0x77; 64]);

        let writer = tokio::spawn(async move {
            frame.write_to(&mut client).await.unwrap();
        });

        let decoded = Frame::read_from(&mut server).await.unwrap();
        writer.await.unwrap();
        assert_eq!(decoded.payload().len(), 64);
        assert_eq!(decoded.frame_type(), FrameType::Exec);
    }
}
