//! Framing: 2 bytes BE total size (header included) + 2 bytes BE type + body.

const HEADER_SIZE: usize = 4;
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// One complete message cut from a byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self { msg_type, body }
    }

    /// Size on the wire, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Encode a message into a single frame.
pub fn encode_frame(msg_type: u16, body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let total = HEADER_SIZE + body.len();
    if total > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(total));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame of {0} bytes exceeds the 16-bit size field")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let size = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if size < HEADER_SIZE {
        return Err(FrameDecodeError::TooSmall(size));
    }
    if bytes.len() < size {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg_type = u16::from_be_bytes([bytes[2], bytes[3]]);
    let body = bytes[HEADER_SIZE..size].to_vec();
    Ok((Frame { msg_type, body }, size))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared frame size {0} is smaller than the header")]
    TooSmall(usize),
}

/// Stateful tokenizer: buffers partial frames between `feed` calls.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every frame completed by them, in stream order.
    /// A header declaring less than its own size means the stream is out of sync; the buffer is discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameDecodeError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut pos = 0;
        loop {
            match decode_frame(&self.buf[pos..]) {
                Ok((frame, n)) => {
                    frames.push(frame);
                    pos += n;
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
        self.buf.drain(..pos);
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
