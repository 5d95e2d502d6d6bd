//! Message representation and wire codec.
//!
//! In memory a message body holds its timestamp, zero-padded address string,
//! comma-prefixed zero-padded type string, and argument bytes in host order,
//! exactly as they are laid out on the wire. Conversion to and from network
//! byte order happens once, at the socket boundary, by walking the type
//! string (and recursing through bundle elements).
//!
//! Wire frame, all multi-byte fields big-endian:
//!
//! ```text
//! frame   := length:u32  flags:u32  timestamp:f64  address:pstring
//!            typestring:pstring  args:bytes
//! bundle  := length:u32  flags:u32  timestamp:f64  "#..."-address:pstring
//!            ( length:u32  <timestamp + nested body> )*
//! pstring := zero-terminated, zero-padded to a 4-byte boundary
//! ```
//!
//! `length` counts everything after itself. The same frame layout is used as
//! a TCP record (after the record's own length prefix is consumed) and as a
//! whole UDP datagram.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::key::padded_len;
use crate::MAX_MSG_SIZE;

/// Flags word: bit 0 set means the message prefers the reliable (TCP) path.
pub(crate) const FLAG_TCP: u32 = 0x1;

/// Message body: timestamp, address, type string, and arguments, contiguous
/// and host-ordered. Offset 0..8 is the timestamp.
#[derive(Clone, PartialEq)]
pub struct MsgData {
    bytes: Vec<u8>,
}

/// A routable message: a body plus the transport hint.
#[derive(Clone, PartialEq)]
pub struct Msg {
    pub tcp: bool,
    pub data: MsgData,
}

impl MsgData {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> MsgData {
        MsgData { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn timestamp(&self) -> f64 {
        f64::from_ne_bytes(self.bytes[0..8].try_into().unwrap())
    }

    pub fn set_timestamp(&mut self, t: f64) {
        self.bytes[0..8].copy_from_slice(&t.to_ne_bytes());
    }

    /// The address string, including its leading `/`, `!`, or `#`.
    pub fn address(&self) -> &str {
        pstring_at(&self.bytes, 8).map(|(s, _)| s).unwrap_or("")
    }

    /// A bundle's address begins with `#`.
    pub fn is_bundle(&self) -> bool {
        self.bytes.get(8) == Some(&b'#')
    }

    /// Service component of the address: characters after the prefix up to
    /// the first `/`.
    pub fn service(&self) -> &str {
        let addr = self.address();
        let body = &addr[1.min(addr.len())..];
        match body.find('/') {
            Some(i) => &body[..i],
            None => body,
        }
    }

    fn types_offset(&self) -> usize {
        8 + padded_len(self.address())
    }

    /// Type characters, without the leading comma. Empty for bundles.
    pub fn types(&self) -> &str {
        if self.is_bundle() {
            return "";
        }
        match pstring_at(&self.bytes, self.types_offset()) {
            Ok((s, _)) => s.strip_prefix(',').unwrap_or(s),
            Err(_) => "",
        }
    }

    /// Argument bytes following the type string.
    pub(crate) fn args_bytes(&self) -> &[u8] {
        let off = self.types_offset();
        match pstring_at(&self.bytes, off) {
            Ok((_, padded)) => &self.bytes[off + padded..],
            Err(_) => &[],
        }
    }

    /// Iterate the elements of a bundle; each yields an owned body.
    pub fn bundle_elements(&self) -> BundleIter<'_> {
        let off = 8 + padded_len(self.address());
        BundleIter {
            bytes: &self.bytes,
            off,
        }
    }
}

impl std::fmt::Debug for MsgData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MsgData(@{} {} ,{} {}B)",
            self.timestamp(),
            self.address(),
            self.types(),
            self.bytes.len()
        )
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Msg({} {:?})",
            if self.tcp { "tcp" } else { "udp" },
            self.data
        )
    }
}

impl std::fmt::Display for MsgData {
    /// Human-readable rendering: `@time address ,types arg arg ...`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{:.6} {}", self.timestamp(), self.address())?;
        if self.is_bundle() {
            write!(f, " [")?;
            for (i, elem) in self.bundle_elements().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match elem {
                    Ok(e) => write!(f, "{e}")?,
                    Err(_) => write!(f, "<malformed>")?,
                }
            }
            return write!(f, "]");
        }
        write!(f, " ,{}", self.types())?;
        let mut reader = crate::args::ArgReader::new(self);
        loop {
            // the reader consumes vector element type characters itself
            let t = match reader.types_remaining().chars().next() {
                Some(t) => t,
                None => break,
            };
            match reader.get_next(t) {
                Ok(arg) => write!(f, " {arg:?}")?,
                Err(_) => return write!(f, " <malformed>"),
            }
        }
        Ok(())
    }
}

pub struct BundleIter<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Iterator for BundleIter<'a> {
    type Item = Result<MsgData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off + 4 > self.bytes.len() {
            return None;
        }
        let len = u32::from_ne_bytes(self.bytes[self.off..self.off + 4].try_into().unwrap())
            as usize;
        self.off += 4;
        if len < 12 || self.off + len > self.bytes.len() {
            self.off = self.bytes.len();
            return Some(Err(Error::InvalidMsg));
        }
        let body = self.bytes[self.off..self.off + len].to_vec();
        self.off += len;
        Some(Ok(MsgData::from_bytes(body)))
    }
}

impl Msg {
    /// Encode to a self-delimited wire frame (length + flags + body), with
    /// every multi-byte field converted to network order.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let body_len = self.data.bytes.len();
        let mut frame = Vec::with_capacity(8 + body_len);
        frame.extend_from_slice(&((body_len as u32 + 4).to_be_bytes()));
        let flags: u32 = if self.tcp { FLAG_TCP } else { 0 };
        frame.extend_from_slice(&flags.to_be_bytes());
        frame.extend_from_slice(&self.data.bytes);
        swap_body(&mut frame[8..], true)?;
        Ok(frame)
    }

    /// Decode a received frame (including its leading length word) back to a
    /// host-order message.
    pub fn from_wire(frame: &[u8]) -> Result<Msg> {
        if frame.len() < 8 + 12 || frame.len() > MAX_MSG_SIZE {
            return Err(Error::InvalidMsg);
        }
        let len = BigEndian::read_u32(&frame[0..4]) as usize;
        if len + 4 != frame.len() {
            return Err(Error::InvalidMsg);
        }
        let flags = BigEndian::read_u32(&frame[4..8]);
        let mut body = frame[8..].to_vec();
        swap_body(&mut body, false)?;
        Ok(Msg {
            tcp: flags & FLAG_TCP != 0,
            data: MsgData::from_bytes(body),
        })
    }
}

/// Locate the zero-terminated, zero-padded string at `off`. Returns the
/// string and its padded byte length.
fn pstring_at(bytes: &[u8], off: usize) -> Result<(&str, usize)> {
    if off >= bytes.len() {
        return Err(Error::InvalidMsg);
    }
    let rel = bytes[off..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::InvalidMsg)?;
    let padded = (rel + 4) & !3;
    if off + padded > bytes.len() {
        return Err(Error::InvalidMsg);
    }
    let s = std::str::from_utf8(&bytes[off..off + rel]).map_err(|_| Error::InvalidMsg)?;
    Ok((s, padded))
}

fn flip4(b: &mut [u8]) {
    if cfg!(target_endian = "little") {
        b[..4].reverse();
    }
}

fn flip8(b: &mut [u8]) {
    if cfg!(target_endian = "little") {
        b[..8].reverse();
    }
}

/// Read a u32 length field whose byte order depends on travel direction,
/// then flip it in place. Host-to-wire reads before the flip; wire-to-host
/// reads the network-order value.
fn flip_len(b: &mut [u8], to_wire: bool) -> usize {
    let raw: [u8; 4] = b[..4].try_into().unwrap();
    let v = if to_wire {
        u32::from_ne_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    };
    flip4(b);
    v as usize
}

/// Convert a message body (timestamp + address + types + args) between host
/// and network order, in place. Walks the type string; recurses for bundle
/// elements. Any cursor escaping the buffer means a malformed message.
pub(crate) fn swap_body(body: &mut [u8], to_wire: bool) -> Result<()> {
    if body.len() < 12 {
        return Err(Error::InvalidMsg);
    }
    flip8(&mut body[0..8]);
    let (addr, addr_padded) = pstring_at(body, 8).map(|(s, p)| (s.to_owned(), p))?;
    let mut off = 8 + addr_padded;
    if addr.starts_with('#') {
        while off < body.len() {
            if off + 4 > body.len() {
                return Err(Error::InvalidMsg);
            }
            let len = flip_len(&mut body[off..], to_wire);
            off += 4;
            if len < 12 || off + len > body.len() || len % 4 != 0 {
                return Err(Error::InvalidMsg);
            }
            swap_body(&mut body[off..off + len], to_wire)?;
            off += len;
        }
        return Ok(());
    }
    let (types_raw, types_padded) = pstring_at(body, off).map(|(s, p)| (s.to_owned(), p))?;
    off += types_padded;
    let mut types = types_raw.strip_prefix(',').unwrap_or(&types_raw).bytes();
    while let Some(t) = types.next() {
        match t {
            b'i' | b'f' | b'c' | b'm' | b'B' => {
                bound(body, off, 4)?;
                flip4(&mut body[off..]);
                off += 4;
            }
            b'h' | b'd' | b't' => {
                bound(body, off, 8)?;
                flip8(&mut body[off..]);
                off += 8;
            }
            b's' | b'S' => {
                let (_, padded) = pstring_at(body, off)?;
                off += padded;
            }
            b'b' => {
                bound(body, off, 4)?;
                let len = flip_len(&mut body[off..], to_wire);
                off += 4;
                let padded = (len + 3) & !3;
                bound(body, off, padded)?;
                off += padded;
            }
            b'v' => {
                bound(body, off, 4)?;
                let len = flip_len(&mut body[off..], to_wire);
                off += 4;
                bound(body, off, len)?;
                let elem = types.next().ok_or(Error::InvalidMsg)?;
                match elem {
                    b'i' | b'f' => {
                        for chunk in body[off..off + len].chunks_exact_mut(4) {
                            flip4(chunk);
                        }
                    }
                    b'h' | b'd' => {
                        for chunk in body[off..off + len].chunks_exact_mut(8) {
                            flip8(chunk);
                        }
                    }
                    _ => return Err(Error::InvalidMsg),
                }
                off += len;
            }
            b'T' | b'F' | b'N' | b'I' | b'[' | b']' => {}
            _ => return Err(Error::InvalidMsg),
        }
    }
    Ok(())
}

fn bound(body: &[u8], off: usize, need: usize) -> Result<()> {
    if off + need > body.len() {
        Err(Error::InvalidMsg)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Arg;

    #[test]
    fn pstring_bounds() {
        // terminated and padded
        assert_eq!(pstring_at(b"abc\0rest", 0).unwrap(), ("abc", 4));
        // terminator in the final pad position
        assert_eq!(pstring_at(b"abcdefg\0", 0).unwrap(), ("abcdefg", 8));
        // unterminated
        assert!(pstring_at(b"abcd", 0).is_err());
        // padded length escapes the buffer
        assert!(pstring_at(b"abcde\0", 0).is_err());
    }

    #[test]
    fn swap_is_an_involution() {
        let msg = Msg::build(
            "/x/y",
            7.25,
            false,
            &[Arg::Int32(5), Arg::Str("s".into()), Arg::Double(2.0)],
        )
        .unwrap();
        let mut body = msg.data.as_bytes().to_vec();
        swap_body(&mut body, true).unwrap();
        if cfg!(target_endian = "little") {
            assert_ne!(body, msg.data.as_bytes());
        }
        swap_body(&mut body, false).unwrap();
        assert_eq!(body, msg.data.as_bytes());
    }

    #[test]
    fn display_renders_address_types_and_args() {
        let msg = Msg::build("/a/b", 0.5, false, &[Arg::Int32(3), Arg::Str("hi".into())])
            .unwrap();
        let text = format!("{}", msg.data);
        assert!(text.contains("/a/b"));
        assert!(text.contains(",is"));
        assert!(text.contains("3"));
        assert!(text.contains("hi"));
    }
}
