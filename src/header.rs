//! Mail header parsers and utility functions
//!
//! The grammar follows RFC 5322 (with the RFC 6532 UTF-8 extensions) for the
//! constructs the parser recognizes: comments and folding whitespace, atoms,
//! quoted strings, domain literals and message identifiers, plus the
//! RFC 2045/2231 media-type syntax and the RFC 2047/2392 codecs
use crate::Error;
use crate::decode::{charset_to_utf8, decode_b, decode_q};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

/// A mapping from lowercased header keys to the values observed for them
///
/// Both the key order and the per-key value order reflect the order of
/// arrival in the message
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeaderMap(Vec<(String, Vec<String>)>);

impl HeaderMap {
    /// Appends a value under `key`
    pub(crate) fn append(&mut self, key: &str, value: String) {
        if let Some((_, vals)) = self.0.iter_mut().find(|(k, _)| k == key) {
            vals.push(value);
        } else {
            self.0.push((key.to_string(), vec![value]));
        }
    }

    /// Drops all but the last value of `key`
    pub(crate) fn keep_last(&mut self, key: &str) {
        if let Some((_, vals)) = self.0.iter_mut().find(|(k, _)| k == key) {
            if vals.len() > 1 {
                vals.drain(0..(vals.len() - 1));
            }
        }
    }

    /// Returns the values recorded under `key`, if any
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Returns the last value recorded under `key`
    pub fn last(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|vals| vals.last())
            .map(|v| v.as_str())
    }

    /// Checks whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Iterates over keys and their value lists in order of arrival
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// The number of distinct keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the map holds no headers at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Checks whether a header key is normal enough to be routed to the parsed
/// map; anything else is kept in the raw map only
pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 100
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'*')
}

/// Collapses folded line breaks (whitespace runs containing a newline) into
/// a single space and replaces invalid UTF-8 along the way
pub(crate) fn collapse_folds(value: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        let b = value[i];
        if matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c) {
            let start = i;
            let mut folded = false;
            while i < value.len() && matches!(value[i], b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
            {
                folded |= value[i] == b'\n';
                i += 1;
            }
            if folded {
                out.push(b' ');
            } else {
                out.extend_from_slice(&value[start..i]);
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Returns the value with all `(...)` comments stripped and whitespace
/// packed
///
/// Unterminated comments swallow the remainder of the value
pub fn strip_comments(value: &str) -> String {
    let mut p = Cursor::new(value);
    let mut ret = String::new();
    let mut gap = false;
    while let Some(c) = p.peek() {
        p.consume(c);
        if c == '(' {
            p.consume_comment();
        } else if c.is_whitespace() {
            gap = !ret.is_empty();
        } else {
            if gap {
                ret.push(' ');
                gap = false;
            }
            ret.push(c);
        }
    }
    ret
}

// ---- Character classes (RFC 5322 / RFC 6532) ----

/// Reports whether `c` is an RFC 5322 VCHAR (or RFC 6532 non-ASCII)
fn is_vchar(c: char) -> bool {
    ('!'..='~').contains(&c) || !c.is_ascii()
}

/// Atom text under the tri-bit policy: whether `.`, the RFC 5322 3.2.3
/// specials and `@` are allowed inside the atom
fn is_atext(c: char, dot: bool, lenient: bool, at: bool) -> bool {
    match c {
        '.' => dot,
        '(' | ')' | '[' | ']' | ';' | '\\' | ',' => lenient,
        '@' => at,
        '<' | '>' | '"' | ':' => false,
        _ => is_vchar(c),
    }
}

fn is_dtext(c: char) -> bool {
    match c {
        '[' | ']' | '\\' => false,
        _ => is_vchar(c),
    }
}

fn is_qtext(c: char) -> bool {
    if c == '\\' || c == '"' {
        return false;
    }
    is_vchar(c)
}

fn is_wsp(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// A cursor over a header value
pub(crate) struct Cursor<'a> {
    s: &'a str,
}

impl<'a> Cursor<'a> {
    pub fn new(s: &'a str) -> Self {
        Self { s }
    }

    pub fn empty(&self) -> bool {
        self.s.is_empty()
    }

    /// The unconsumed remainder
    pub fn rest(&self) -> &'a str {
        self.s
    }

    pub fn peek(&self) -> Option<char> {
        self.s.chars().next()
    }

    pub fn consume(&mut self, c: char) -> bool {
        let mut chars = self.s.chars();
        if chars.next() != Some(c) {
            return false;
        }
        self.s = chars.as_str();
        true
    }

    /// Skips the leading space and tab characters
    pub fn skip_space(&mut self) {
        self.s = self.s.trim_start_matches([' ', '\t']);
    }

    /// Skips any run of whitespace and `(...)` comments
    ///
    /// Returns false on an unterminated comment
    pub fn skip_cfws(&mut self) -> bool {
        self.skip_space();
        loop {
            if !self.consume('(') {
                break;
            }
            if !self.consume_comment() {
                return false;
            }
            self.skip_space();
        }
        true
    }

    /// Consumes a comment body; the opening `(` is already consumed
    fn consume_comment(&mut self) -> bool {
        let mut depth = 1;
        let mut chars = self.s.chars();
        loop {
            let c = match chars.next() {
                Some(c) => c,
                None => break,
            };
            match c {
                '\\' => {
                    // The escaped char (if any) has no structural meaning
                    chars.next();
                }
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        self.s = chars.as_str();
        depth == 0
    }

    /// Consumes a maximal run of atom text under the given policy
    pub fn consume_atom_text(
        &mut self,
        dot: bool,
        lenient: bool,
        at: bool,
    ) -> Result<&'a str, Error> {
        let mut i = 0;
        for c in self.s.chars() {
            if !is_atext(c, dot, lenient, at) {
                break;
            }
            i += c.len_utf8();
        }
        if i == 0 {
            return Err(Error::EmptyAtom);
        }
        let (atom, rest) = self.s.split_at(i);
        self.s = rest;
        Ok(atom)
    }

    /// Consumes a quoted-string; the cursor must sit on the opening quote
    pub fn consume_quoted_string(&mut self) -> Result<String, Error> {
        let mut chars = self.s.chars();
        chars.next(); // opening quote
        let mut qsb = String::new();
        let mut escaped = false;
        loop {
            let c = match chars.next() {
                Some(c) => c,
                None => return Err(Error::Header("unclosed quoted-string".to_string())),
            };
            if escaped {
                // quoted-pair = "\" (VCHAR / WSP)
                if !is_vchar(c) && !is_wsp(c) {
                    return Err(Error::Header(format!(
                        "bad character in quoted-string: {:?}",
                        c
                    )));
                }
                qsb.push(c);
                escaped = false;
            } else if is_qtext(c) || is_wsp(c) {
                qsb.push(c);
            } else if c == '"' {
                break;
            } else if c == '\\' {
                escaped = true;
            } else {
                return Err(Error::Header(format!(
                    "bad character in quoted-string: {:?}",
                    c
                )));
            }
        }
        self.s = chars.as_str();
        Ok(qsb)
    }

    /// Parses a no-fold-literal (`"[" *dtext "]"`), returned with brackets
    pub fn parse_no_fold_literal(&mut self) -> Result<&'a str, Error> {
        if !self.s.starts_with('[') {
            return Err(Error::Header("missing '[' in no-fold-literal".to_string()));
        }
        let mut i = 1;
        for c in self.s[1..].chars() {
            if !is_dtext(c) {
                break;
            }
            i += c.len_utf8();
        }
        if !self.s[i..].starts_with(']') {
            return Err(Error::Header("missing ']' in no-fold-literal".to_string()));
        }
        let (lit, rest) = self.s.split_at(i + 1);
        self.s = rest;
        Ok(lit)
    }

    /// Parses a strict RFC 5322 3.6.4 msg-id
    ///
    /// Returns `left@right` with the angle brackets removed
    pub fn parse_msg_id(&mut self) -> Result<String, Error> {
        if !self.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        if !self.consume('<') {
            return Err(Error::Header("missing '<' in msg-id".to_string()));
        }
        let left = self.consume_atom_text(true, false, false)?;
        if !self.consume('@') {
            return Err(Error::Header("missing '@' in msg-id".to_string()));
        }
        let right = if self.peek() == Some('[') {
            self.parse_no_fold_literal()?
        } else {
            self.consume_atom_text(true, false, false)?
        };
        let ret = format!("{}@{}", left, right);
        if !self.consume('>') {
            return Err(Error::Header("missing '>' in msg-id".to_string()));
        }
        if !self.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        Ok(ret)
    }

    /// Parses a msg-id the way they actually appear in the wild
    ///
    /// Compared to [`parse_msg_id`](Self::parse_msg_id) this tolerates
    /// missing angle brackets (unless `require_angle`), a quoted-string on
    /// the left side, RFC 5322 specials inside atoms and an empty or
    /// `@`-ridden right side (`<local@domain1@domain2>` is kept whole)
    ///
    /// The result is always wrapped in angle brackets
    pub fn parse_msg_id_lenient(&mut self, require_angle: bool) -> Result<String, Error> {
        if !self.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        let angle = self.consume('<');
        if require_angle && !angle {
            return Err(Error::Header("missing '<' in msg-id".to_string()));
        }

        // The left side may be a quoted-string or a dot-atom
        if self.empty() {
            return Err(Error::EmptyAtom);
        }
        let left = if self.peek() == Some('"') {
            let qs = self.consume_quoted_string()?;
            if qs.is_empty() {
                return Err(Error::Header("empty quoted-string in msg-id".to_string()));
            }
            qs
        } else {
            self.consume_atom_text(true, true, false)?.to_string()
        };

        let mut right = String::new();
        if self.consume('@') {
            if !self.skip_cfws() {
                return Err(Error::Header(
                    "malformed parenthetical comment after @".to_string(),
                ));
            }
            if self.peek() == Some('[') {
                right = self.parse_no_fold_literal()?.to_string();
            } else {
                match self.consume_atom_text(true, true, true) {
                    Ok(v) => right = v.to_string(),
                    // Ids with a naked @ still get through
                    Err(Error::EmptyAtom) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if angle && !self.consume('>') {
            return Err(Error::Header("missing '>' in msg-id".to_string()));
        }

        if right.is_empty() {
            Ok(format!("<{}>", left))
        } else {
            Ok(format!("<{}@{}>", left, right))
        }
    }
}

/// Parses a single strict RFC 5322 3.6.4 msg-id value
///
/// Returns `left@right` with the angle brackets removed; for the forms
/// actually found in the wild see [`msg_id_list`]
pub fn parse_msg_id(v: &str) -> Result<String, Error> {
    let mut p = Cursor::new(v);
    let id = p.parse_msg_id()?;
    if !p.empty() {
        return Err(Error::Header(format!(
            "trailing data after msg-id: {:?}",
            p.rest()
        )));
    }
    Ok(id)
}

/// Parses a list of message identifiers, each returned in angle brackets
///
/// This fits the `In-Reply-To` and `References` header fields
pub fn msg_id_list(v: &str) -> Result<Vec<String>, Error> {
    let mut p = Cursor::new(v);
    let mut l = Vec::new();
    loop {
        if !p.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        if p.empty() {
            break;
        }
        l.push(p.parse_msg_id_lenient(false)?);
    }
    Ok(l)
}

/// Decodes a Content-ID or Message-ID header value (RFC 2392) into a UTF-8
/// string
///
/// Example: `<foo%3fbar+baz>` becomes `foo?bar baz`
pub fn from_id_header(v: &str) -> String {
    if v.is_empty() {
        return v.to_string();
    }
    let v = v.trim_start_matches('<').trim_end_matches('>');
    let v = v.replace('+', " ");
    match urlencoding::decode(&v) {
        Ok(dec) => dec.into_owned(),
        Err(_) => v,
    }
}

/// Encodes a Content-ID or Message-ID header value (RFC 2392) from a UTF-8
/// string, preserving literal `@`
pub fn to_id_header(v: &str) -> String {
    format!("<{}>", urlencoding::encode(v).replace("%40", "@"))
}

/// Decodes RFC 2047 encoded words within a header value
///
/// Tokens with an unsupported charset or a broken payload are left verbatim
pub fn decode_rfc2047(enc: &str) -> String {
    lazy_static! {
        static ref RE: Regex =
            Regex::new(r"=\?([^?*]+)(?:\*[^?]*)?\?(.)\?([^?]{0,128})\?=").unwrap();
    }
    RE.replace_all(enc, |caps: &Captures| {
        let decoded: Vec<u8> = match caps[2].as_bytes()[0] {
            b'q' | b'Q' => decode_q(caps[3].as_bytes()).into_owned(),
            b'b' | b'B' => match decode_b(&caps[3]) {
                Some(dec) => dec,
                None => return caps[0].to_string(),
            },
            c => {
                warn!("Invalid RFC 2047 type \"{}\"", c as char);
                return caps[0].to_string();
            }
        };
        match charset_to_utf8(&caps[1], &decoded) {
            Some(v) => v,
            None => {
                warn!("Unsupported RFC 2047 charset \"{}\"", &caps[1]);
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

lazy_static! {
    static ref RE2231: Regex = Regex::new(r"^([^']*)'[^*']*'(.*)").unwrap();
}

/// Splits an RFC 2231 parameter key into its base name, continuation
/// number and charset-encoding flag; `None` for ordinary keys
fn rfc2231_key(k: &str) -> Option<(String, Option<u32>, bool)> {
    if !k.contains('*') {
        return None;
    }
    let (k, encoded) = match k.strip_suffix('*') {
        Some(v) => (v, true),
        None => (k, false),
    };
    match k.split_once('*') {
        Some((base, seg)) => {
            let seg = seg.parse::<u32>().ok()?;
            Some((base.to_string(), Some(seg), encoded))
        }
        None if encoded => Some((k.to_string(), None, true)),
        None => None,
    }
}

/// Merges RFC 2231 continuations and decodes charset-tagged values
fn merge_rfc2231(params: Vec<(String, String)>) -> Vec<(String, String)> {
    if !params.iter().any(|(k, _)| k.contains('*')) {
        return params;
    }
    enum Val {
        Plain(String),
        Ext(Vec<(u32, bool, String)>),
    }
    let mut tmp: Vec<(String, Val)> = Vec::new();
    for (k, v) in params {
        match rfc2231_key(&k) {
            None => tmp.push((k, Val::Plain(v))),
            Some((base, seg, enc)) => {
                let seg = seg.unwrap_or(0);
                if let Some((_, Val::Ext(list))) = tmp
                    .iter_mut()
                    .find(|(b, val)| *b == base && matches!(val, Val::Ext(_)))
                {
                    list.push((seg, enc, v));
                } else {
                    tmp.push((base, Val::Ext(vec![(seg, enc, v)])));
                }
            }
        }
    }
    tmp.into_iter()
        .map(|(k, val)| match val {
            Val::Plain(v) => (k, v),
            Val::Ext(mut list) => {
                list.sort_by_key(|&(seg, _, _)| seg);
                let mut charset = String::new();
                let mut any_enc = false;
                let mut data: Vec<u8> = Vec::new();
                for (i, (_, enc, v)) in list.into_iter().enumerate() {
                    if enc {
                        any_enc = true;
                        let mut payload = v.as_str();
                        if i == 0 {
                            if let Some(caps) = RE2231.captures(payload) {
                                charset = caps.get(1).unwrap().as_str().to_string();
                                payload = caps.get(2).unwrap().as_str();
                            }
                        }
                        data.extend_from_slice(&urlencoding::decode_binary(payload.as_bytes()));
                    } else {
                        data.extend_from_slice(v.as_bytes());
                    }
                }
                let dec = if any_enc {
                    let cs = if charset.is_empty() {
                        "us-ascii"
                    } else {
                        charset.as_str()
                    };
                    charset_to_utf8(cs, &data).unwrap_or_else(|| {
                        warn!("Unsupported RFC 2231 charset \"{}\"", cs);
                        String::from_utf8_lossy(&data).into_owned()
                    })
                } else {
                    String::from_utf8_lossy(&data).into_owned()
                };
                (k, dec)
            }
        })
        .collect()
}

/// Parses an RFC 2045 media-type value into the type token and its
/// parameter list
///
/// The type and the parameter names are lowercased, parameter values keep
/// their case; RFC 2231 continuations are merged and decoded to UTF-8.
/// RFC 2047 encoded words inside parameter values (a known producer bug)
/// are not interpreted
fn parse_media_type(s: &str) -> Result<(String, Vec<(String, String)>), Error> {
    let (value, mut remaining) = match s.split_once(';') {
        Some((value, params)) => (value, params),
        None => (s, ""),
    };
    let value = value
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ");
    if value.is_empty() {
        return Err(Error::Header(format!("empty media type in {:?}", s)));
    }

    // Split param/value pairs, handling quoted-string values; params
    // without a value are illegal but generally disregarded by MUAs
    let mut params: Vec<(String, String)> = Vec::new();
    while !remaining.is_empty() {
        let (attr, mut rem) = remaining.split_once('=').unwrap_or((remaining, ""));
        let mut attr = attr.to_lowercase();
        while let Some((naked, rest)) = attr.split_once(';') {
            params.push((naked.trim().to_string(), String::new()));
            attr = rest.to_string();
        }

        rem = rem.trim_start();
        let mut val: String = if rem.starts_with('"') {
            // A very tolerant quoted-string decoder
            let mut last_was_backslash = false;
            let mut val = String::new();
            let mut chars = rem[1..].chars();
            for c in chars.by_ref() {
                if c == '\\' {
                    if !last_was_backslash {
                        last_was_backslash = true;
                        continue;
                    }
                } else if c == '"' && !last_was_backslash {
                    break;
                }
                last_was_backslash = false;
                val.push(c);
            }
            rem = chars.as_str().trim_start();
            val
        } else {
            String::new()
        };

        // Token values and quoted-string tails
        let (token, rest) = rem.split_once(';').unwrap_or((rem, ""));
        remaining = rest;
        val.push_str(token.trim());

        params.push((attr.trim().to_string(), val));
    }

    Ok((value, merge_rfc2231(params)))
}

/// A parsed `Content-Type` value
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContentType {
    /// The media type (e.g. `multipart`)
    pub ctype: String,
    /// The media subtype (e.g. `mixed`)
    pub subtype: String,
    /// The parameters following the type
    pub params: Vec<(String, String)>,
}

impl ContentType {
    /// Returns the first parameter matching `name`
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The full `type/subtype` token
    pub fn media_type(&self) -> String {
        if self.subtype.is_empty() {
            self.ctype.clone()
        } else {
            format!("{}/{}", self.ctype, self.subtype)
        }
    }
}

/// A parsed `Content-Disposition` value
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ContentDisposition {
    /// The disposition (`inline` or `attachment`)
    pub media_type: String,
    /// The parameters following the disposition
    pub params: Vec<(String, String)>,
}

impl ContentDisposition {
    /// Returns the first parameter matching `name`
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a `Content-Type` header value
pub fn parse_content_type(s: &str) -> Result<ContentType, Error> {
    let (mediatype, params) = parse_media_type(s)?;
    let (ctype, subtype) = match mediatype.split_once('/') {
        Some((t, s)) => (t.to_string(), s.to_string()),
        None => (mediatype, String::new()),
    };
    Ok(ContentType {
        ctype,
        subtype,
        params,
    })
}

/// Parses a `Content-Disposition` header value
pub fn parse_content_disposition(s: &str) -> Result<ContentDisposition, Error> {
    let (media_type, params) = parse_media_type(s)?;
    Ok(ContentDisposition { media_type, params })
}
