use bytes::Bytes;

/// A single protocol frame.
///
/// Every value exchanged with a node is one of these shapes:
/// - SimpleString: status replies like "OK"
/// - Error: error replies, including redirect signals
/// - Integer: numeric replies
/// - BulkString: binary-safe string data
/// - Array: command requests and aggregate replies
/// - Null: the null value
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null ($-1 or *-1).
    Null,
}

impl Frame {
    /// Builds a simple `OK` status frame.
    pub fn ok() -> Frame {
        Frame::SimpleString(b"OK".to_vec())
    }

    /// Extracts the bulk string payload, if this is a non-null bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Extracts the array items, if this is an array.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Extracts the integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the frame payload as UTF-8 text where that makes sense.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::SimpleString(s) | Frame::Error(s) => String::from_utf8(s.clone()).ok(),
            Frame::BulkString(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_frame() {
        assert_eq!(Frame::ok(), Frame::SimpleString(b"OK".to_vec()));
    }

    #[test]
    fn as_bulk() {
        let data: Bytes = "hello".into();
        let frame = Frame::BulkString(Some(data.clone()));
        assert_eq!(frame.as_bulk(), Some(&data));
        assert_eq!(Frame::Integer(42).as_bulk(), None);
        assert_eq!(Frame::BulkString(None).as_bulk(), None);
    }

    #[test]
    fn as_array() {
        let items = vec![Frame::Integer(1), Frame::Integer(2)];
        let frame = Frame::Array(items.clone());
        assert_eq!(frame.as_array(), Some(items.as_slice()));
        assert_eq!(Frame::Null.as_array(), None);
    }

    #[test]
    fn as_integer() {
        assert_eq!(Frame::Integer(42).as_integer(), Some(42));
        assert_eq!(Frame::Null.as_integer(), None);
    }

    #[test]
    fn as_text() {
        assert_eq!(
            Frame::SimpleString(b"OK".to_vec()).as_text(),
            Some("OK".to_string())
        );
        assert_eq!(
            Frame::Error(b"ERR bad".to_vec()).as_text(),
            Some("ERR bad".to_string())
        );
        assert_eq!(
            Frame::BulkString(Some("state".into())).as_text(),
            Some("state".to_string())
        );
        assert_eq!(Frame::Integer(1).as_text(), None);
    }
}
