//! Mailbox and address-list parsing
//!
//! Covers the RFC 5322 `address-list` production as found in `To`, `From`,
//! `Cc` and friends: mailboxes with optional display names, angle
//! addresses, domain literals and (flattened) groups. Encoded words are
//! expected to be decoded before the value gets here
use crate::Error;
use crate::header::Cursor;

/// A single parsed mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The display name (possibly empty)
    pub name: String,
    /// The addr-spec (`local@domain`)
    pub address: String,
}

impl Address {
    /// The display form of the mailbox, quoting the name when needed
    pub fn formatted(&self) -> String {
        if self.name.is_empty() {
            return format!("<{}>", self.address);
        }
        let plain = self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || " .-_".contains(c));
        if plain {
            format!("{} <{}>", self.name, self.address)
        } else {
            let escaped = self.name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\" <{}>", escaped, self.address)
        }
    }
}

/// Parses an address list, flattening any groups it contains
///
/// A mailbox not followed by a separator fails with
/// [`Error::ExpectedComma`], which callers may recover from via
/// [`insert_list_commas`]
pub fn parse_address_list(s: &str) -> Result<Vec<Address>, Error> {
    let mut p = Cursor::new(s);
    let mut list = Vec::new();
    loop {
        if !p.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        // Empty list elements happen in the wild
        if p.consume(',') {
            continue;
        }
        if p.empty() {
            break;
        }
        parse_address(&mut p, &mut list)?;
        if !p.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        if p.empty() {
            break;
        }
        if !p.consume(',') && !p.consume(';') {
            return Err(Error::ExpectedComma);
        }
    }
    Ok(list)
}

/// Parses one address (a mailbox or a group) and appends its mailboxes
fn parse_address(p: &mut Cursor<'_>, out: &mut Vec<Address>) -> Result<(), Error> {
    if p.peek() == Some('<') {
        let address = parse_angle_addr(p)?;
        out.push(Address {
            name: String::new(),
            address,
        });
        return Ok(());
    }

    // A bare addr-spec, or a display name followed by an angle-addr or a
    // group; the addr-spec attempt goes first and backtracks
    let save = p.rest();
    if let Ok(address) = parse_addr_spec(p) {
        out.push(Address {
            name: String::new(),
            address,
        });
        return Ok(());
    }
    *p = Cursor::new(save);

    let name = parse_display_name(p)?;
    if !p.skip_cfws() {
        return Err(Error::Header("malformed parenthetical comment".to_string()));
    }
    if p.consume(':') {
        // Group: the display name is dropped, the members are kept
        loop {
            if !p.skip_cfws() {
                return Err(Error::Header("malformed parenthetical comment".to_string()));
            }
            if p.consume(';') || p.empty() {
                break;
            }
            if p.consume(',') {
                continue;
            }
            parse_address(p, out)?;
            if !p.skip_cfws() {
                return Err(Error::Header("malformed parenthetical comment".to_string()));
            }
            if p.consume(';') {
                break;
            }
            if p.empty() {
                break;
            }
            if !p.consume(',') {
                return Err(Error::ExpectedComma);
            }
        }
        return Ok(());
    }
    if p.peek() == Some('<') {
        let address = parse_angle_addr(p)?;
        out.push(Address { name, address });
        return Ok(());
    }
    Err(Error::Header(format!(
        "missing angle-addr after display name {:?}",
        name
    )))
}

/// Parses `"<" addr-spec ">"`; the cursor must sit on the `<`
fn parse_angle_addr(p: &mut Cursor<'_>) -> Result<String, Error> {
    p.consume('<');
    if !p.skip_cfws() {
        return Err(Error::Header("malformed parenthetical comment".to_string()));
    }
    let address = parse_addr_spec(p)
        .map_err(|_| Error::Header("missing addr-spec in angle-addr".to_string()))?;
    if !p.skip_cfws() {
        return Err(Error::Header("malformed parenthetical comment".to_string()));
    }
    if !p.consume('>') {
        return Err(Error::Header("missing '>' in angle-addr".to_string()));
    }
    Ok(address)
}

/// Parses `local-part "@" domain`
fn parse_addr_spec(p: &mut Cursor<'_>) -> Result<String, Error> {
    let local = if p.peek() == Some('"') {
        let qs = p.consume_quoted_string()?;
        if qs.is_empty() {
            return Err(Error::Header("empty quoted-string in addr-spec".to_string()));
        }
        qs
    } else {
        p.consume_atom_text(true, false, false)?.to_string()
    };
    if !p.consume('@') {
        return Err(Error::Header("missing '@' in addr-spec".to_string()));
    }
    let domain = if p.peek() == Some('[') {
        p.parse_no_fold_literal()?.to_string()
    } else {
        p.consume_atom_text(true, false, false)?.to_string()
    };
    Ok(format!("{}@{}", local, domain))
}

/// Parses a display name: a run of atoms and quoted strings joined with
/// single spaces
fn parse_display_name(p: &mut Cursor<'_>) -> Result<String, Error> {
    let mut words: Vec<String> = Vec::new();
    loop {
        if !p.skip_cfws() {
            return Err(Error::Header("malformed parenthetical comment".to_string()));
        }
        if p.peek() == Some('"') {
            words.push(p.consume_quoted_string()?);
            continue;
        }
        match p.consume_atom_text(true, false, false) {
            Ok(atom) => words.push(atom.to_string()),
            Err(Error::EmptyAtom) => break,
            Err(e) => return Err(e),
        }
    }
    if words.is_empty() {
        return Err(Error::EmptyAtom);
    }
    Ok(words.join(" "))
}

/// Repairs address lists whose producer forgot the separators
///
/// Walks the value and, outside of quoted strings, emits a comma at the
/// first `,`, `;` or whitespace after each `@`
pub fn insert_list_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_quote = false;
    let mut escaped = false;
    let mut in_domain = false;
    for c in s.chars() {
        if in_quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                out.push(c);
            }
            '@' => {
                in_domain = true;
                out.push(c);
            }
            ',' | ';' if in_domain => {
                in_domain = false;
                out.push(',');
            }
            _ if c.is_whitespace() && in_domain => {
                in_domain = false;
                out.push(',');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(name: &str, address: &str) -> Address {
        Address {
            name: name.to_string(),
            address: address.to_string(),
        }
    }

    #[test]
    fn test_single() {
        assert_eq!(
            parse_address_list("revant jha <abc.94@gmail.com>").unwrap(),
            [addr("revant jha", "abc.94@gmail.com")]
        );
        assert_eq!(
            parse_address_list("efgh@promignis.com").unwrap(),
            [addr("", "efgh@promignis.com")]
        );
        assert_eq!(
            parse_address_list(" <solo@example.org> ").unwrap(),
            [addr("", "solo@example.org")]
        );
        assert_eq!(
            parse_address_list("\"Quoted, Name\" <q@example.org>").unwrap(),
            [addr("Quoted, Name", "q@example.org")]
        );
        assert_eq!(
            parse_address_list("lit <l@[127.0.0.1]>").unwrap(),
            [addr("lit", "l@[127.0.0.1]")]
        );
        assert_eq!(
            parse_address_list("用户 <用户@例子.广告>").unwrap(),
            [addr("用户", "用户@例子.广告")]
        );
    }

    #[test]
    fn test_list() {
        assert_eq!(
            parse_address_list("a@b, Two <c@d> , \"Three\" <e@f>").unwrap(),
            [addr("", "a@b"), addr("Two", "c@d"), addr("Three", "e@f")]
        );
        // Stray commas are tolerated
        assert_eq!(
            parse_address_list(",a@b,, c@d,").unwrap(),
            [addr("", "a@b"), addr("", "c@d")]
        );
        // Comments are invisible
        assert_eq!(
            parse_address_list("a@b (work), c@d (home)").unwrap(),
            [addr("", "a@b"), addr("", "c@d")]
        );
    }

    #[test]
    fn test_group() {
        assert_eq!(
            parse_address_list("Team: a@b, Two <c@d>;").unwrap(),
            [addr("", "a@b"), addr("Two", "c@d")]
        );
        assert_eq!(
            parse_address_list("Team: a@b;, e@f").unwrap(),
            [addr("", "a@b"), addr("", "e@f")]
        );
        // Semicolon-separated lists happen too
        assert_eq!(
            parse_address_list("x@y; z@w").unwrap(),
            [addr("", "x@y"), addr("", "z@w")]
        );
        assert!(
            parse_address_list("undisclosed-recipients:;")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_address_list("a@b c@d"),
            Err(Error::ExpectedComma)
        ));
        assert!(parse_address_list("no-at-sign").is_err());
        assert!(parse_address_list("name <unclosed@angle").is_err());
    }

    #[test]
    fn test_comma_repair() {
        assert_eq!(insert_list_commas("a@b c@d"), "a@b, c@d");
        assert_eq!(insert_list_commas("a@b; c@d"), "a@b, c@d");
        assert_eq!(insert_list_commas("a@b, c@d"), "a@b, c@d");
        assert_eq!(
            insert_list_commas("One <a@b> Two <c@d>"),
            "One <a@b>, Two <c@d>"
        );
        assert_eq!(
            insert_list_commas("\"spaced @name\" <a@b> c@d"),
            "\"spaced @name\" <a@b>, c@d"
        );
        let repaired = insert_list_commas("One <a@b> Two <c@d>");
        assert_eq!(
            parse_address_list(&repaired).unwrap(),
            [addr("One", "a@b"), addr("Two", "c@d")]
        );
    }

    #[test]
    fn test_formatted() {
        assert_eq!(addr("", "a@b").formatted(), "<a@b>");
        assert_eq!(addr("Plain Name", "a@b").formatted(), "Plain Name <a@b>");
        assert_eq!(
            addr("Odd, \"Name\"", "a@b").formatted(),
            "\"Odd, \\\"Name\\\"\" <a@b>"
        );
    }
}
