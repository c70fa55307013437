//! Mail data decoders
//!
//! This module contains decoders for the encodings used in message bodies
//! (*quoted-printable* and *base64* transfer encodings, applied on the fly
//! while a part body is streamed out) and for the encoded portions of
//! header values
use crate::{CR, Error, LF};
use lazy_static::lazy_static;
use regex::bytes::{Captures as BinCaptures, Regex as BinRegex};
use std::borrow::Cow;
use std::io::Read;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

static QLUT: &[u8] = &[
    0x00, 0x01, 0x02, 0x03, 0x04, 0x5, 0x06, 0x07, 0x08, 0x09, // 0-9
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // :;<=>?@
    0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, // A-F
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // G-P
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // Q-Z
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // [\]^_`
    0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, // a-f
];

#[inline]
fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

#[inline]
fn unhex(hi: u8, lo: u8) -> u8 {
    ((QLUT[(hi - b'0') as usize] & 0xf) << 4) | (QLUT[(lo - b'0') as usize] & 0xf)
}

/// Decodes a RFC 2047 header value Q-encoded portion (similar to
/// *quoted-printable*)
///
/// Note: RFC 2047 is very strict about Q, however MUAs are forgiving; this
/// decoder tolerates invalid encodings
pub fn decode_q(enc: &[u8]) -> Cow<'_, [u8]> {
    lazy_static! {
        static ref RE: BinRegex = BinRegex::new(r"(?-u)(_)|(?:=([0-9A-Fa-f][0-9A-Fa-f]))").unwrap();
    }
    RE.replace_all(enc, |caps: &BinCaptures| {
        if caps.get(2).is_none() {
            [b' ']
        } else {
            [unhex(caps[2][0], caps[2][1])]
        }
    })
}

/// Maps a base64 alphabet char (RFC 4648) to its 6-bit value
fn b64_val(b: u8) -> Option<u32> {
    match b {
        b'A'..=b'Z' => Some(u32::from(b - b'A')),
        b'a'..=b'z' => Some(u32::from(b - b'a') + 26),
        b'0'..=b'9' => Some(u32::from(b - b'0') + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decodes one base64 group of four chars into up to three bytes
///
/// Returns whether the group was padded, or `None` when it holds chars
/// outside the alphabet or misplaced padding
fn decode_b64_group(group: &[u8; 4], dec: &mut Vec<u8>) -> Option<bool> {
    // Padding is only meaningful in the last one or two positions
    let datalen = match (group[2], group[3]) {
        (b'=', b'=') => 2,
        (_, b'=') => 3,
        _ => 4,
    };
    let mut acc = 0u32;
    for &c in &group[0..datalen] {
        acc = (acc << 6) | b64_val(c)?;
    }
    match datalen {
        2 => dec.push((acc >> 4) as u8),
        3 => dec.extend_from_slice(&[(acc >> 10) as u8, (acc >> 2) as u8]),
        _ => dec.extend_from_slice(&[(acc >> 16) as u8, (acc >> 8) as u8, acc as u8]),
    }
    Some(datalen < 4)
}

/// Decodes a RFC 2047 header value B-encoded portion (i.e. *base64*)
///
/// Note: this parser is strict, except for missing padding on the final
/// group
pub fn decode_b(enc: &str) -> Option<Vec<u8>> {
    let bytes = enc.as_bytes();
    let mut dec: Vec<u8> = Vec::with_capacity(bytes.len() / 4 * 3);
    let mut pos = 0;
    while pos < bytes.len() {
        let rest = &bytes[pos..];
        let group: [u8; 4] = match rest.len() {
            1 => return None,
            2 => [rest[0], rest[1], b'=', b'='],
            3 => [rest[0], rest[1], rest[2], b'='],
            _ => [rest[0], rest[1], rest[2], rest[3]],
        };
        let padded = decode_b64_group(&group, &mut dec)?;
        pos += rest.len().min(4);
        if padded && pos < bytes.len() {
            // Nothing may follow the padding
            return None;
        }
    }
    Some(dec)
}

/// Decodes text in a (supported) charset into UTF-8
///
/// Only labels whose repertoire maps straight into UTF-8 are handled;
/// anything else returns `None` and is left for the caller to keep verbatim
pub fn charset_to_utf8(label: &str, bytes: &[u8]) -> Option<String> {
    match label.trim().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Some(String::from_utf8_lossy(bytes).into_owned()),
        "us-ascii" | "ascii" | "ansi_x3.4-1968" => Some(
            bytes
                .iter()
                .map(|&b| {
                    if b < 0x80 {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        ),
        "iso-8859-1" | "iso8859-1" | "latin1" | "l1" | "cp819" => {
            Some(bytes.iter().map(|&b| b as char).collect())
        }
        _ => None,
    }
}

/// The body coding selected from `Content-Transfer-Encoding`
enum Coding {
    PassThru,
    Qp,
    B64,
}

/// Decoder for MIME part bodies (`Read` wrapper)
///
/// Wraps the part body stream and undoes the *quoted-printable* or *base64*
/// transfer encoding on the fly; the identity encodings pass through
pub struct DecodingReader<R: Read> {
    inner: R,
    coding: Coding,
    out: Vec<u8>,
    out_pos: usize,
    carry: [u8; 4],
    carry_len: usize,
    wsp: Vec<u8>,
    finished: bool,
}

impl<R: Read> DecodingReader<R> {
    /// Creates a pass-through reader
    pub fn identity(inner: R) -> Self {
        Self::with_coding(inner, Coding::PassThru)
    }

    /// Creates a *quoted-printable* decoding reader (RFC 2045 §6.7)
    pub fn quoted_printable(inner: R) -> Self {
        Self::with_coding(inner, Coding::Qp)
    }

    /// Creates a *base64* decoding reader (RFC 4648, whitespace tolerated)
    pub fn base64(inner: R) -> Self {
        Self::with_coding(inner, Coding::B64)
    }

    fn with_coding(inner: R, coding: Coding) -> Self {
        Self {
            inner,
            coding,
            out: Vec::new(),
            out_pos: 0,
            carry: [0u8; 4],
            carry_len: 0,
            wsp: Vec::new(),
            finished: false,
        }
    }

    fn flush_wsp(&mut self) {
        self.out.extend_from_slice(&self.wsp);
        self.wsp.clear();
    }

    /// Handles a byte outside any pending `=` escape
    fn qp_plain(&mut self, b: u8) {
        match b {
            b'=' => {
                self.flush_wsp();
                self.carry[0] = b;
                self.carry_len = 1;
            }
            b' ' | b'\t' => self.wsp.push(b),
            // Transport padding before a line break is dropped
            CR | LF => {
                self.wsp.clear();
                self.out.push(b);
            }
            _ => {
                self.flush_wsp();
                self.out.push(b);
            }
        }
    }

    fn qp_feed(&mut self, b: u8) {
        match self.carry_len {
            1 => match b {
                // Soft line break
                LF => self.carry_len = 0,
                CR => {
                    self.carry[1] = b;
                    self.carry_len = 2;
                }
                _ if is_hex(b) => {
                    self.carry[1] = b;
                    self.carry_len = 2;
                }
                _ => {
                    // Not an escape after all, keep the literal bytes
                    self.out.push(b'=');
                    self.carry_len = 0;
                    self.qp_plain(b);
                }
            },
            2 => {
                let prev = self.carry[1];
                self.carry_len = 0;
                if prev == CR {
                    if b != LF {
                        self.out.extend_from_slice(b"=\r");
                        self.qp_plain(b);
                    }
                    // else: soft line break
                } else if is_hex(b) {
                    self.out.push(unhex(prev, b));
                } else {
                    self.out.push(b'=');
                    self.out.push(prev);
                    self.qp_plain(b);
                }
            }
            _ => self.qp_plain(b),
        }
    }

    fn b64_feed(&mut self, b: u8) -> Result<(), Error> {
        if matches!(b, b' ' | b'\t' | CR | LF) {
            return Ok(());
        }
        if b != b'=' && b64_val(b).is_none() {
            return Err(Error::InvalidBase64);
        }
        self.carry[self.carry_len] = b;
        self.carry_len += 1;
        if self.carry_len == 4 {
            self.carry_len = 0;
            decode_b64_group(&self.carry, &mut self.out).ok_or(Error::InvalidBase64)?;
        }
        Ok(())
    }

    /// Flushes whatever is pending once the wrapped stream is exhausted
    fn finish(&mut self) -> Result<(), Error> {
        match self.coding {
            Coding::PassThru => {}
            Coding::Qp => {
                // A dangling escape is kept verbatim; trailing whitespace
                // with no line break after it is transport padding too
                let pending = &self.carry[0..self.carry_len];
                self.out.extend_from_slice(pending);
                self.carry_len = 0;
                self.wsp.clear();
            }
            Coding::B64 => match self.carry_len {
                0 => {}
                1 => return Err(Error::InvalidBase64),
                cnt => {
                    let mut group = [b'='; 4];
                    group[0..cnt].copy_from_slice(&self.carry[0..cnt]);
                    self.carry_len = 0;
                    decode_b64_group(&group, &mut self.out).ok_or(Error::InvalidBase64)?;
                }
            },
        }
        Ok(())
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.out_pos < self.out.len() {
                let n = (self.out.len() - self.out_pos).min(buf.len());
                buf[0..n].copy_from_slice(&self.out[self.out_pos..(self.out_pos + n)]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            let mut raw = [0u8; 4096];
            let got = self.inner.read(&mut raw)?;
            self.out.clear();
            self.out_pos = 0;
            if got == 0 {
                self.finish().map_err(Error::into_io)?;
                self.finished = true;
                continue;
            }
            match self.coding {
                Coding::PassThru => self.out.extend_from_slice(&raw[0..got]),
                Coding::Qp => {
                    for &b in &raw[0..got] {
                        self.qp_feed(b);
                    }
                }
                Coding::B64 => {
                    for &b in &raw[0..got] {
                        self.b64_feed(b).map_err(Error::into_io)?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn qp(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        DecodingReader::quoted_printable(data)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn b64(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut out = Vec::new();
        DecodingReader::base64(data).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_decode_b64_group() {
        let mut out = Vec::<u8>::new();
        assert_eq!(decode_b64_group(b"TWF5", &mut out), Some(false));
        assert_eq!(out, b"May");
        out.clear();
        assert_eq!(decode_b64_group(b"TWE=", &mut out), Some(true));
        assert_eq!(out, b"Ma");
        out.clear();
        assert_eq!(decode_b64_group(b"TQ==", &mut out), Some(true));
        assert_eq!(out, b"M");
        out.clear();
        assert_eq!(decode_b64_group(b"0LU=", &mut out), Some(true));
        assert_eq!(out, [0xd0, 0xb5]);
        assert!(decode_b64_group(b"T?==", &mut out).is_none());
        assert!(decode_b64_group(b"=AAA", &mut out).is_none());
        assert!(decode_b64_group(b"AA=A", &mut out).is_none());
    }

    #[test]
    fn test_decode_b() {
        assert_eq!(decode_b("").unwrap(), b"");
        assert!(decode_b("?AAA").is_none());
        assert!(decode_b("A?AA").is_none());
        assert!(decode_b("AA?A").is_none());
        assert!(decode_b("AAA?").is_none());
        assert!(decode_b("A").is_none());
        assert_eq!(decode_b("VarM").unwrap(), &[85, 170, 204]);
        assert_eq!(decode_b("MVar").unwrap(), &[49, 86, 171]);
        assert!(decode_b("aCaB4===").is_none());
        assert!(decode_b("aCaB42==").is_some());
        assert!(decode_b("aCaB423=").is_some());
    }

    #[test]
    fn test_decode_q() {
        assert_eq!(decode_q(b""), Cow::from(b"".as_slice()));
        assert_eq!(decode_q(b"asd"), Cow::from(b"asd".as_slice()));
        assert_eq!(decode_q(b"=31=3337"), Cow::from(b"1337".as_slice()));
        assert_eq!(decode_q(b"=2E"), Cow::from(b".".as_slice()));
        assert_eq!(decode_q(b"=2e"), Cow::from(b".".as_slice()));
        assert_eq!(decode_q(b"_"), Cow::from(b" ".as_slice()));
    }

    #[test]
    fn test_charsets() {
        assert_eq!(charset_to_utf8("UTF-8", "héllo".as_bytes()).unwrap(), "héllo");
        assert_eq!(charset_to_utf8("us-ascii", b"plain").unwrap(), "plain");
        assert_eq!(
            charset_to_utf8("ISO-8859-1", b"caf\xe9").unwrap(),
            "café"
        );
        assert!(charset_to_utf8("utf-7", b"+AOk-").is_none());
    }

    #[test]
    fn test_qp_stream() {
        assert_eq!(qp(b""), b"");
        assert_eq!(qp(b"plain text\n"), b"plain text\n");
        assert_eq!(qp(b"=31=3337"), b"1337");
        assert_eq!(qp(b"=e2=82=ac"), "€".as_bytes());
        // Soft line breaks
        assert_eq!(qp(b"one=\ntwo=\r\nthree\n"), b"onetwothree\n");
        // Transport padding is dropped, inner whitespace kept
        assert_eq!(qp(b"a b  \nc\n"), b"a b\nc\n");
        // Space before a soft break is content
        assert_eq!(qp(b"caf=C3=A9 =\ntail"), "café tail".as_bytes());
        // Broken escapes pass through
        assert_eq!(qp(b"=ZZ=4"), b"=ZZ=4");
        assert_eq!(qp(b"==41"), b"=A");
    }

    #[test]
    fn test_b64_stream() {
        assert_eq!(b64(b"").unwrap(), b"");
        assert_eq!(b64(b"aGVsbG8=").unwrap(), b"hello");
        assert_eq!(b64(b"aGVs\r\nbG8=\r\n").unwrap(), b"hello");
        assert_eq!(b64(b"aGVsbG8").unwrap(), b"hello");
        assert_eq!(b64(b"YQ==Yg==Yw==").unwrap(), b"abc");
        assert_eq!(
            b64(b"4oiuIEXii4VkYSA9IFE=").unwrap(),
            "∮ E⋅da = Q".as_bytes()
        );
        assert!(b64(b"a?b~").is_err());
        assert!(b64(b"aaaaQ").is_err());
    }

    #[test]
    fn test_b64_stream_chunked() {
        // Chunk groups split across tiny reads
        struct OneByte<R: Read>(R);
        impl<R: Read> Read for OneByte<R> {
            fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
                let len = buf.len().min(1);
                self.0.read(&mut buf[0..len])
            }
        }
        let mut out = Vec::new();
        DecodingReader::base64(OneByte(b"VGhlIGV1cm8gc2lnbjog4oKs".as_slice()))
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, "The euro sign: €".as_bytes());
    }
}
