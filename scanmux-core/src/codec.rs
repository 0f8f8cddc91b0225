//! Wire codecs: percent encoding of command arguments, netstring
//! framing for the map socket, and bounded line reads.
//!
//! Percent encoding covers every byte that could confuse the
//! space-separated line protocol: anything <= 0x20, anything > 0x7E,
//! and `%`, `\`, `'`, `"`. Apart from the `%` that introduces an
//! escape, encoded text consists only of bytes outside the encoded
//! set, so decoding is unambiguous.
//!
//! Netstrings are `<len>:<payload>,` with a decimal length capped at
//! [`NETSTRING_MAX`]; the length prefix must appear within 16 bytes.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxError, Result};

/// Largest netstring payload accepted or produced.
pub const NETSTRING_MAX: usize = 65536;

fn needs_encoding(b: u8) -> bool {
    b <= 0x20 || b > 0x7e || matches!(b, b'%' | b'\\' | b'\'' | b'"')
}

/// Percent-encode arbitrary bytes into a printable ASCII string.
pub fn percent_encode(input: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(input.len());
    for &b in input {
        if needs_encoding(b) {
            let _ = write!(out, "%{b:02X}");
        } else {
            out.push(b as char);
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%HH` escapes; malformed escapes pass through untouched.
pub fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// [`percent_decode`] with invalid UTF-8 replaced, for log and status
/// strings.
pub fn percent_decode_lossy(input: &str) -> String {
    String::from_utf8_lossy(&percent_decode(input)).into_owned()
}

/// Read one line, including its terminating newline if present,
/// stopping after `max` bytes. Returns `None` on EOF before any data.
///
/// A return value of exactly `max` bytes with no trailing newline
/// means the sender exceeded the budget; callers treat that as a
/// protocol error rather than reading further.
pub async fn read_line_bounded<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut out: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(if out.is_empty() { None } else { Some(out) });
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let want = (pos + 1).min(max - out.len());
            out.extend_from_slice(&buf[..want]);
            reader.consume(pos + 1);
            return Ok(Some(out));
        }
        let want = buf.len().min(max - out.len());
        out.extend_from_slice(&buf[..want]);
        reader.consume(want);
        if out.len() >= max {
            return Ok(Some(out));
        }
    }
}

/// Read one netstring payload. Returns `None` on EOF before the first
/// length byte.
pub async fn read_netstring<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix: Vec<u8> = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            if prefix.is_empty() {
                return Ok(None);
            }
            return Err(MuxError::Netstring("EOF inside length prefix".into()));
        }
        if byte[0] == b':' {
            break;
        }
        prefix.push(byte[0]);
        if prefix.len() >= 16 {
            return Err(MuxError::Netstring("no ':' within 16 bytes".into()));
        }
    }

    let len: i64 = std::str::from_utf8(&prefix)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| MuxError::Netstring("unparseable length prefix".into()))?;
    if len < 0 || len as usize > NETSTRING_MAX {
        return Err(MuxError::Netstring(format!("length {len} out of range")));
    }

    let mut payload = vec![0u8; len as usize + 1];
    reader.read_exact(&mut payload).await?;
    if payload.pop() != Some(b',') {
        return Err(MuxError::Netstring("missing terminating comma".into()));
    }
    Ok(Some(payload))
}

/// Write one netstring.
pub async fn write_netstring<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > NETSTRING_MAX {
        return Err(MuxError::Netstring(format!(
            "payload of {} bytes exceeds maximum",
            payload.len()
        )));
    }
    writer
        .write_all(format!("{}:", payload.len()).as_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.write_all(b",").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[test]
    fn encode_decode_round_trip_on_all_bytes() {
        let input: Vec<u8> = (0u8..=255).collect();
        let encoded = percent_encode(&input);
        assert!(encoded.bytes().all(|b| !needs_encoding(b) || b == b'%'));
        // '%' only ever appears as the start of an escape.
        assert_eq!(percent_decode(&encoded), input);
    }

    #[test]
    fn encoded_text_is_printable_ascii() {
        let encoded = percent_encode(b"a b\x7f%\"'\\");
        assert_eq!(encoded, "a%20b%7F%25%22%27%5C");
        assert!(encoded.bytes().all(|b| (0x21..=0x7e).contains(&b)));
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode("100%zz%4"), b"100%zz%4");
        assert_eq!(percent_decode("%41%42c"), b"ABc");
    }

    #[tokio::test]
    async fn netstring_round_trip() {
        let mut cursor = Cursor::new(Vec::new());
        write_netstring(&mut cursor, b"map-name some key")
            .await
            .unwrap();
        let buf = cursor.into_inner();
        assert_eq!(buf, b"17:map-name some key,");

        let mut cursor = Cursor::new(buf);
        let got = read_netstring(&mut cursor).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"map-name some key"[..]));
    }

    #[tokio::test]
    async fn netstring_rejects_oversize_and_garbage() {
        let mut cursor = Cursor::new(b"999999:x,".to_vec());
        assert!(read_netstring(&mut cursor).await.is_err());

        let mut cursor = Cursor::new(b"abc:x,".to_vec());
        assert!(read_netstring(&mut cursor).await.is_err());

        let mut cursor = Cursor::new(b"3:abcX".to_vec());
        assert!(read_netstring(&mut cursor).await.is_err());

        let mut cursor = Cursor::new(b"aaaaaaaaaaaaaaaaaaaa".to_vec());
        assert!(read_netstring(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn netstring_eof_at_start_is_clean() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_netstring(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bounded_line_read_stops_at_newline() {
        let mut r = BufReader::new(Cursor::new(b"scan Q1 /dir\nleftover".to_vec()));
        let line = read_line_bounded(&mut r, 4096).await.unwrap().unwrap();
        assert_eq!(line, b"scan Q1 /dir\n");
    }

    #[tokio::test]
    async fn bounded_line_read_enforces_budget() {
        let mut r = BufReader::new(Cursor::new(vec![b'x'; 100]));
        let line = read_line_bounded(&mut r, 10).await.unwrap().unwrap();
        assert_eq!(line.len(), 10);
        assert!(!line.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn bounded_line_read_eof() {
        let mut r = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_line_bounded(&mut r, 10).await.unwrap().is_none());
    }
}
