//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Parses the bytes captured from the start of a connection and pulls the
//! `host_name` entry out of the `server_name` extension. Parsing is
//! read-only and every length-prefixed field is bounds-checked, so
//! attacker-controlled input can fail to parse but can never panic.
//!
//! Known limitation: the ClientHello must sit entirely inside the captured
//! bytes. A hello spread over several TCP segments, or one larger than the
//! capture bound, is reported as [`SniResult::Malformed`].

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for `server_name` (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// `NameType` value for `host_name` entries.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Client version (2 bytes) followed by the random (32 bytes).
const VERSION_AND_RANDOM_LEN: usize = 2 + 32;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Extracted `host_name`, exactly as sent by the client. May be empty.
    Found(String),
    /// ClientHello present but no usable `server_name` extension.
    NoSni,
    /// Data is not a TLS handshake record carrying a ClientHello.
    NotTls,
    /// A declared length runs past the end of the data, or the name is not UTF-8.
    Malformed,
}

impl SniResult {
    /// Short label used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SniResult::Found(_) => "found",
            SniResult::NoSni => "no_sni",
            SniResult::NotTls => "not_tls",
            SniResult::Malformed => "malformed",
        }
    }
}

/// Extract the requested server name from a captured ClientHello.
///
/// Returns `None` when no name could be extracted. `Some("")` means the
/// hello parsed but carried an empty `host_name`.
pub fn extract_server_name(data: &[u8]) -> Option<String> {
    match parse_client_hello(data) {
        SniResult::Found(hostname) => Some(hostname),
        _ => None,
    }
}

/// Parse a TLS ClientHello buffer and classify the outcome.
///
/// TLS record:
/// - 1 byte: content type (0x16 = Handshake)
/// - 2 bytes: version
/// - 2 bytes: record length
///
/// Handshake ClientHello:
/// - 1 byte: handshake type (0x01 = ClientHello)
/// - 3 bytes: length
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte + n: session ID
/// - 2 bytes + n: cipher suites
/// - 1 byte + n: compression methods
/// - 2 bytes + n: extensions
pub fn parse_client_hello(data: &[u8]) -> SniResult {
    scan_client_hello(data).unwrap_or(SniResult::Malformed)
}

/// `None` means a declared length ran past the available bytes.
fn scan_client_hello(data: &[u8]) -> Option<SniResult> {
    let mut record = Reader::new(data);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return Some(SniResult::NotTls);
    }
    let _legacy_version = record.u16()?;
    let mut handshake = Reader::new(record.vec_u16()?);

    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Some(SniResult::NotTls);
    }
    let hello_len = handshake.u24()? as usize;
    let mut hello = Reader::new(handshake.take(hello_len)?);

    hello.take(VERSION_AND_RANDOM_LEN)?;
    hello.vec_u8()?; // session id
    hello.vec_u16()?; // cipher suites
    hello.vec_u8()?; // compression methods

    if hello.is_empty() {
        return Some(SniResult::NoSni);
    }

    let mut extensions = Reader::new(hello.vec_u16()?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_data = extensions.vec_u16()?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(ext_data);
        }
    }

    Some(SniResult::NoSni)
}

/// Parse the `server_name` extension body.
///
/// - 2 bytes: server name list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes + n: name
fn parse_server_name_extension(data: &[u8]) -> Option<SniResult> {
    let mut ext = Reader::new(data);
    let mut list = Reader::new(ext.vec_u16()?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec_u16()?;

        if name_type == NAME_TYPE_HOST_NAME {
            return Some(match std::str::from_utf8(name) {
                Ok(hostname) => SniResult::Found(hostname.to_string()),
                Err(_) => SniResult::Malformed,
            });
        }
    }

    Some(SniResult::NoSni)
}

/// Forward-only cursor over a byte slice.
///
/// Every accessor returns `None` instead of reading out of bounds.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.data.len() {
            return None;
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|b| ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    /// 1-byte length prefix followed by that many bytes.
    fn vec_u8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// 2-byte length prefix followed by that many bytes.
    fn vec_u16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
