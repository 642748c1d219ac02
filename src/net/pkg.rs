// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Framed packets.
//!
//! ```text
//! +-------------- header (8 bytes) --------------+
//! | len: u32 LE | pid: u16 LE | tp: u8 | check:u8 |
//! +----------------------------------------------+
//! |                data: len bytes                |
//! +----------------------------------------------+
//! ```
//!
//! `check = tp XOR 0xFF`; a mismatch means the stream is out of frame and
//! the connection is dropped. Client-facing packets are capped at 20 MiB.

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TdbError};

pub const HEADER_SIZE: usize = 8;
pub const MAX_CLIENT_PKG_SIZE: u32 = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Pkg {
    pub pid: u16,
    pub tp: u8,
    pub data: Vec<u8>,
}

impl Pkg {
    pub fn new(pid: u16, tp: u8, data: Vec<u8>) -> Self {
        Pkg { pid, tp, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serialize header + data into one frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.data.len());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.push(self.tp);
        out.push(self.tp ^ 0xff);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse one complete frame, e.g. popped from a FIFO file.
    pub fn decode(frame: &[u8]) -> Result<Pkg> {
        if frame.len() < HEADER_SIZE {
            return Err(TdbError::Transport("frame shorter than header".into()));
        }
        let len = LittleEndian::read_u32(&frame[..4]) as usize;
        let pid = LittleEndian::read_u16(&frame[4..6]);
        let tp = frame[6];
        let check = frame[7];
        if check != tp ^ 0xff {
            return Err(TdbError::Transport("illegal frame: check bit mismatch".into()));
        }
        if frame.len() != HEADER_SIZE + len {
            return Err(TdbError::Transport("illegal frame: length mismatch".into()));
        }
        Ok(Pkg {
            pid,
            tp,
            data: frame[HEADER_SIZE..].to_vec(),
        })
    }

    /// Read one frame from a stream. `max_len` caps the payload; a larger
    /// announcement is a protocol violation and the caller disconnects.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R, max_len: u32) -> Result<Pkg> {
        let mut header = [0u8; HEADER_SIZE];
        r.read_exact(&mut header)
            .await
            .map_err(|e| TdbError::Transport(format!("read header: {e}")))?;
        let len = LittleEndian::read_u32(&header[..4]);
        let pid = LittleEndian::read_u16(&header[4..6]);
        let tp = header[6];
        let check = header[7];
        if check != tp ^ 0xff {
            return Err(TdbError::Transport("illegal frame: check bit mismatch".into()));
        }
        if len > max_len {
            return Err(TdbError::Transport(format!(
                "payload of {len} bytes exceeds the {max_len} byte limit"
            )));
        }
        let mut data = vec![0u8; len as usize];
        r.read_exact(&mut data)
            .await
            .map_err(|e| TdbError::Transport(format!("read payload: {e}")))?;
        Ok(Pkg { pid, tp, data })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode())
            .await
            .map_err(|e| TdbError::Transport(format!("write frame: {e}")))?;
        Ok(())
    }
}
