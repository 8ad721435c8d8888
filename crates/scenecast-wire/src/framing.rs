//! Length-prefixed framing for stream transports
//!
//! A frame is a 4-byte little-endian length followed by that many bytes of
//! encoded message. Lengths above [`MAX_FRAME_SIZE`] are rejected before
//! any allocation happens.

use std::io::{self, Read, Write};

/// Maximum frame payload (16 MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame length prefix size
pub const FRAME_HEADER_SIZE: usize = 4;

/// Write one frame and flush the writer
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }
    writer.write_all(&(len as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame
///
/// Returns `UnexpectedEof` when the stream closes before or inside a frame
/// and `InvalidData` when the announced length exceeds the limit.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
