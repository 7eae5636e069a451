//! `multipart/x-mixed-replace` framing for the motion-JPEG stream.
//!
//! Each part is fully self-delimiting: consumers read `Content-Length` and
//! then exactly that many bytes, so the header value must match the payload.

use bytes::{BufMut, Bytes, BytesMut};

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

/// Serialise one JPEG into a complete part:
///
/// ```text
/// --frame\r\n
/// Content-Type: image/jpeg\r\n
/// Content-Length: <N>\r\n
/// \r\n
/// <N bytes>\r\n
/// ```
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: {PART_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );

    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}
