use bytes::Buf;
use bytes::BytesMut;

use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// An incremental decoder that turns raw bytes into [`Frame`] values.
///
/// Feed network data with [`append`](Decoder::append), then call
/// [`decode`](Decoder::decode). `Ok(None)` means a frame is still
/// incomplete and more data is needed.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes to the internal buffer.
    ///
    /// Size limits are checked during decode, not append, so large frames
    /// can stream in incrementally.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` for a complete frame, `Ok(None)` if more
    /// data is needed, and an error description for malformed input.
    pub fn decode(&mut self) -> Result<Option<Frame>, String> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() > self.max_frame_size {
            return Err("buffer size exceeded maximum frame size".to_string());
        }

        match self.buf[0] {
            b'+' => self.decode_simple_string(),
            b'-' => self.decode_error(),
            b':' => self.decode_integer(),
            b'$' => self.decode_bulk_string(),
            b'*' => self.decode_array(),
            other => Err(format!("unknown frame type: {}", other as char)),
        }
    }

    fn decode_simple_string(&mut self) -> Result<Option<Frame>, String> {
        let end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(None),
        };
        let data = self.buf[1..end].to_vec();
        self.buf.advance(end + 2);
        Ok(Some(Frame::SimpleString(data)))
    }

    fn decode_error(&mut self) -> Result<Option<Frame>, String> {
        let end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(None),
        };
        let data = self.buf[1..end].to_vec();
        self.buf.advance(end + 2);
        Ok(Some(Frame::Error(data)))
    }

    fn decode_integer(&mut self) -> Result<Option<Frame>, String> {
        let end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(None),
        };
        let num = std::str::from_utf8(&self.buf[1..end])
            .map_err(|e| e.to_string())?
            .parse::<i64>()
            .map_err(|e| e.to_string())?;
        self.buf.advance(end + 2);
        Ok(Some(Frame::Integer(num)))
    }

    fn decode_bulk_string(&mut self) -> Result<Option<Frame>, String> {
        let end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(None),
        };
        let len: isize = std::str::from_utf8(&self.buf[1..end])
            .map_err(|e| e.to_string())?
            .parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())?;

        if len == -1 {
            self.buf.advance(end + 2);
            return Ok(Some(Frame::BulkString(None)));
        }

        let len = len as usize;
        if len > self.max_frame_size {
            return Err("bulk string length exceeds maximum frame size".to_string());
        }

        // Header plus payload plus trailing CRLF must all be present.
        if self.buf.len() < end + 2 + len + 2 {
            return Ok(None);
        }

        self.buf.advance(end + 2);
        let data = self.buf[..len].to_vec().into();
        self.buf.advance(len + 2);
        Ok(Some(Frame::BulkString(Some(data))))
    }

    fn decode_array(&mut self) -> Result<Option<Frame>, String> {
        let end = match self.find_crlf() {
            Some(end) => end,
            None => return Ok(None),
        };
        let len: isize = std::str::from_utf8(&self.buf[1..end])
            .map_err(|e| e.to_string())?
            .parse()
            .map_err(|e: std::num::ParseIntError| e.to_string())?;

        if len == -1 {
            self.buf.advance(end + 2);
            return Ok(Some(Frame::Null));
        }

        let len = len as usize;
        if len > self.max_frame_size / 16 {
            return Err("array length exceeds reasonable maximum".to_string());
        }

        // Items are decoded against a scratch copy so a partial array does
        // not consume the header from the real buffer.
        let mut scratch = Self {
            buf: self.buf.clone(),
            max_frame_size: self.max_frame_size,
        };
        scratch.buf.advance(end + 2);

        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match scratch.decode()? {
                Some(frame) => items.push(frame),
                None => return Ok(None),
            }
        }

        self.buf = scratch.buf;
        Ok(Some(Frame::Array(items)))
    }

    fn find_crlf(&self) -> Option<usize> {
        if self.buf.len() < 2 {
            return None;
        }
        for i in 1..self.buf.len() {
            if self.buf[i - 1] == b'\r' && self.buf[i] == b'\n' {
                return Some(i - 1);
            }
        }
        None
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
