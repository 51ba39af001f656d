//! TLS ClientHello SNI extraction for the transparent listener.
//!
//! The listener needs the destination hostname before it can decide
//! whether to MITM the connection, but must not consume any bytes from
//! the socket while doing so — whatever it reads has to still be there
//! for the eventual TLS handshake (or pass-through). `peek_client_hello`
//! therefore uses `TcpStream::peek`, growing the peek buffer until a
//! complete ClientHello is available or `MAX_TLS_RECORD_PAYLOAD` is hit.

use crate::constants::MAX_TLS_RECORD_PAYLOAD;
use crate::error::{FpsError, Result, SniPeekError};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

#[cfg(test)]
use tokio::io::AsyncWriteExt;

const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO_HANDSHAKE_TYPE: u8 = 0x01;
const SNI_EXTENSION_TYPE: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0x00;

const TLS_RECORD_HEADER_LEN: usize = 5;
const PEEK_STEP: usize = 512;
const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Peek at `stream` until a full ClientHello record is available,
/// returning the SNI hostname together with the bytes peeked so far. On
/// failure, the error still carries whatever was peeked before the parse
/// gave up — callers need those bytes to replay or log even when SNI
/// extraction didn't succeed. The first peek only requests the 5-byte
/// record header, so a non-TLS connection is rejected after reading
/// exactly that much rather than a full buffer's worth.
pub async fn peek_client_hello(stream: &TcpStream) -> std::result::Result<(String, Vec<u8>), SniPeekError> {
    let mut buf = vec![0u8; TLS_RECORD_HEADER_LEN];
    let mut peeked_so_far = 0usize;

    loop {
        let n = match timeout(PEEK_TIMEOUT, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(sni_peek_err(FpsError::from_io_classified(e), &buf[..peeked_so_far])),
            Err(_) => return Err(sni_peek_err(FpsError::SniTruncated, &buf[..peeked_so_far])),
        };
        peeked_so_far = n;

        if n == 0 {
            return Err(sni_peek_err(FpsError::SniTruncated, &buf[..n]));
        }

        match extract_sni(&buf[..n]) {
            Ok(domain) => return Ok((domain, buf[..n].to_vec())),
            Err(FpsError::SniTruncated) if n < MAX_TLS_RECORD_PAYLOAD => {
                let new_len = (buf.len() + PEEK_STEP).min(MAX_TLS_RECORD_PAYLOAD);
                if new_len == buf.len() {
                    return Err(sni_peek_err(FpsError::SniTruncated, &buf[..n]));
                }
                buf.resize(new_len, 0);
            }
            Err(e) => return Err(sni_peek_err(e, &buf[..n])),
        }
    }
}

fn sni_peek_err(source: FpsError, peeked: &[u8]) -> SniPeekError {
    SniPeekError {
        source,
        peeked: peeked.to_vec(),
    }
}

/// Parse the SNI hostname out of a single buffered TLS record. Every
/// length field is bounds-checked against the buffer before use.
pub fn extract_sni(record: &[u8]) -> Result<String> {
    if record.len() < 5 {
        return Err(FpsError::SniTruncated);
    }
    if record[0] != TLS_HANDSHAKE_CONTENT_TYPE {
        return Err(FpsError::NotTls);
    }

    let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    if record.len() < 5 + record_len {
        return Err(FpsError::SniTruncated);
    }

    let hs = 5;
    if record.len() < hs + 4 {
        return Err(FpsError::SniTruncated);
    }
    if record[hs] != CLIENT_HELLO_HANDSHAKE_TYPE {
        return Err(FpsError::SniMalformed("not a ClientHello".to_string()));
    }

    let handshake_len =
        ((record[hs + 1] as usize) << 16) | ((record[hs + 2] as usize) << 8) | record[hs + 3] as usize;
    if record.len() < hs + 4 + handshake_len {
        return Err(FpsError::SniTruncated);
    }

    // version(2) + random(32)
    let mut pos = hs + 4 + 2 + 32;
    if record.len() < pos + 1 {
        return Err(FpsError::SniTruncated);
    }
    let session_id_len = record[pos] as usize;
    pos += 1 + session_id_len;

    if record.len() < pos + 2 {
        return Err(FpsError::SniTruncated);
    }
    let cipher_suites_len = u16::from_be_bytes([record[pos], record[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    if record.len() < pos + 1 {
        return Err(FpsError::SniTruncated);
    }
    let compression_len = record[pos] as usize;
    pos += 1 + compression_len;

    if record.len() < pos + 2 {
        return Err(FpsError::SniTruncated);
    }
    let extensions_len = u16::from_be_bytes([record[pos], record[pos + 1]]) as usize;
    pos += 2;

    if record.len() < pos + extensions_len {
        return Err(FpsError::SniTruncated);
    }
    let extensions_end = pos + extensions_len;

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let ext_len = u16::from_be_bytes([record[pos + 2], record[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return Err(FpsError::SniTruncated);
        }

        if ext_type == SNI_EXTENSION_TYPE {
            return parse_server_name_extension(&record[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    Err(FpsError::SniMissing)
}

fn parse_server_name_extension(ext: &[u8]) -> Result<String> {
    if ext.len() < 2 {
        return Err(FpsError::SniMalformed("server_name list too short".to_string()));
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    if ext.len() < 2 + list_len {
        return Err(FpsError::SniTruncated);
    }

    let mut pos = 2;
    let end = 2 + list_len;
    while pos + 3 <= end {
        let name_type = ext[pos];
        let name_len = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > end {
            return Err(FpsError::SniTruncated);
        }

        if name_type == SNI_HOST_NAME_TYPE {
            return std::str::from_utf8(&ext[pos..pos + name_len])
                .map(|s| s.to_string())
                .map_err(|_| FpsError::SniMalformed("server name is not valid UTF-8".to_string()));
        }
        pos += name_len;
    }

    Err(FpsError::SniMissing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let name = hostname.as_bytes();
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((name.len() as u16 + 3)).to_be_bytes()); // server_name_list length
        sni_ext.push(0x00); // host_name
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // SNI ext type
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x00]); // cipher suites
        body.extend_from_slice(&[0x01, 0x00]); // compression methods
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(CLIENT_HELLO_HANDSHAKE_TYPE);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(TLS_HANDSHAKE_CONTENT_TYPE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_well_formed_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record).unwrap(), "example.com");
    }

    #[test]
    fn rejects_non_handshake_record() {
        let record = vec![0x17, 0x03, 0x03, 0x00, 0x01, 0xff];
        assert!(matches!(extract_sni(&record), Err(FpsError::NotTls)));
    }

    #[test]
    fn reports_truncated_on_short_buffer() {
        let full = client_hello_with_sni("example.com");
        let truncated = &full[..full.len() - 10];
        assert!(matches!(extract_sni(truncated), Err(FpsError::SniTruncated)));
    }

    #[test]
    fn reports_missing_when_no_sni_extension() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x00]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&0u16.to_be_bytes()); // zero-length extensions

        let mut handshake = vec![CLIENT_HELLO_HANDSHAKE_TYPE];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE_CONTENT_TYPE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        assert!(matches!(extract_sni(&record), Err(FpsError::SniMissing)));
    }

    #[tokio::test]
    async fn s5_peek_client_hello_over_real_socket_leaves_bytes_unconsumed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let record = client_hello_with_sni("real.example.com");
        let record_for_client = record.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&record_for_client).await.unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let (domain, peeked) = peek_client_hello(&server_stream).await.unwrap();
        assert_eq!(domain, "real.example.com");
        assert_eq!(peeked, record);

        let _client = client.await.unwrap();
    }

    #[tokio::test]
    async fn s5_non_tls_bytes_report_not_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let err = peek_client_hello(&server_stream).await.unwrap_err();
        assert!(matches!(err.source, FpsError::NotTls));
        assert_eq!(err.peeked.len(), 5, "error path must carry exactly the bytes peeked so far");

        let _client = client.await.unwrap();
    }
}
