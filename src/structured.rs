//! Structured header dispatch
//!
//! Maps the recognized root headers to typed values (addresses, dates,
//! message identifier lists) and performs the RFC 5322 cross-field
//! validations; everything unrecognized is kept verbatim
use crate::address::{Address, insert_list_commas, parse_address_list};
use crate::header::{HeaderMap, decode_rfc2047, msg_id_list, strip_comments};
use crate::{Error, Part};
use std::io::Read;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

/// Priority header family; could be a number like "1" or a string like
/// "High", kept raw either way
const PRIORITY_FIELDS: &[&str] = &["priority", "x-priority", "x-msmail-priority", "importance"];

/// Address-list header fields
const ADDRESS_FIELDS: &[&str] = &[
    "to",
    "from",
    "cc",
    "bcc",
    "sender",
    "reply-to",
    "delivered-to",
    "return-path",
];

/// The structured view over a message's top-level headers
///
/// Populate it from the root-header callback:
///
/// `tree.parse(body_cb, |part| sm.collect(part))`
#[derive(Debug, Default)]
pub struct StructuredMime {
    /// Headers not covered by any typed field, verbatim
    pub headers: HeaderMap,
    /// The decoded `Subject`
    pub subject: String,
    /// The parsed `Date`; the current wall-clock time when absent
    pub date: Option<OffsetDateTime>,
    /// The message identifier, in angle brackets
    pub message_id: String,
    /// The `References` identifier list
    pub references: Vec<String>,
    /// The `In-Reply-To` identifier list
    pub in_reply_to: Vec<String>,
    /// The last priority value observed, verbatim
    pub priority: String,
    /// `From` mailboxes
    pub from: Vec<Address>,
    /// `To` mailboxes
    pub to: Vec<Address>,
    /// `Cc` mailboxes
    pub cc: Vec<Address>,
    /// `Bcc` mailboxes
    pub bcc: Vec<Address>,
    /// `Sender` mailboxes
    pub sender: Vec<Address>,
    /// `Reply-To` mailboxes
    pub reply_to: Vec<Address>,
    /// `Delivered-To` mailboxes
    pub delivered_to: Vec<Address>,
    /// `Return-Path` mailboxes
    pub return_path: Vec<Address>,
}

impl StructuredMime {
    /// Creates an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches the headers of `part` into the typed fields
    ///
    /// Meant to run once, on the outermost part, from the root-header
    /// callback; any error aborts the parse
    pub fn collect(&mut self, part: &Part) -> Result<(), Error> {
        let mut date_seen = false;
        let mut msgid_seen = false;
        for (key, values) in part.headers.iter() {
            match key {
                "subject" => {
                    // May carry RFC 2047 encoded words
                    self.subject = decode_rfc2047(values.last().map(|v| v.trim()).unwrap_or(""));
                }
                "date" => {
                    date_seen = true;
                    let raw = values.last().map(|v| v.as_str()).unwrap_or("");
                    let value = strip_comments(raw);
                    self.date = Some(OffsetDateTime::parse(&value, &Rfc2822).map_err(|e| {
                        Error::Header(format!("unable to parse date {:?}: {}", raw, e))
                    })?);
                }
                // Note: Message-Id can not have RFC 2047 encoded words
                "message-id" => {
                    msgid_seen = true;
                    if values.len() > 1 {
                        return Err(Error::Header(
                            "can't have more than one message-id header".to_string(),
                        ));
                    }
                    let ids = msg_id_list(&values[0]).map_err(|e| {
                        Error::Header(format!("unable to parse message-id {:?}: {}", values[0], e))
                    })?;
                    match ids.into_iter().next() {
                        Some(id) => self.message_id = id,
                        None => {
                            return Err(Error::Header(format!(
                                "empty message-id header {:?}",
                                values[0]
                            )));
                        }
                    }
                }
                "references" => {
                    for refs in values {
                        let ids = msg_id_list(refs).map_err(|e| {
                            Error::Header(format!("unable to parse references {:?}: {}", refs, e))
                        })?;
                        self.references.extend(ids);
                    }
                }
                "in-reply-to" => {
                    for refs in values {
                        let ids = msg_id_list(refs).map_err(|e| {
                            Error::Header(format!("unable to parse in-reply-to {:?}: {}", refs, e))
                        })?;
                        self.in_reply_to.extend(ids);
                    }
                }
                key if PRIORITY_FIELDS.contains(&key) => {
                    self.priority = values.last().cloned().unwrap_or_default();
                }
                key if ADDRESS_FIELDS.contains(&key) => {
                    for value in values {
                        let addresses = parse_addresses(value).map_err(|e| {
                            Error::Header(format!(
                                "error parsing address header {}: {:?}: {}",
                                key, value, e
                            ))
                        })?;
                        match key {
                            "from" => self.from.extend(addresses),
                            "to" => self.to.extend(addresses),
                            "cc" => self.cc.extend(addresses),
                            "bcc" => self.bcc.extend(addresses),
                            "sender" => self.sender.extend(addresses),
                            "reply-to" => self.reply_to.extend(addresses),
                            "delivered-to" => self.delivered_to.extend(addresses),
                            "return-path" => self.return_path.extend(addresses),
                            _ => unreachable!(),
                        }
                    }
                }
                _ => {
                    for value in values {
                        self.headers.append(key, value.clone());
                    }
                }
            }
        }
        if !date_seen {
            self.date = Some(OffsetDateTime::now_utc());
        }
        if !msgid_seen {
            return Err(Error::Header("no message-id header".to_string()));
        }

        // RFC 5322 3.6.2
        if self.from.is_empty() && self.sender.is_empty() {
            return Err(Error::Header(
                "from and sender headers can not both be empty".to_string(),
            ));
        }
        // A multi-mailbox From requires a single Sender
        if self.from.len() > 1 && self.sender.len() != 1 {
            return Err(Error::Header(
                "sender header is needed when there are multiple from values".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decodes and parses one address header value
///
/// Producers which glue mailboxes together without separators get a second
/// chance through the comma-insertion heuristic
fn parse_addresses(value: &str) -> Result<Vec<Address>, Error> {
    let decoded = decode_rfc2047(value.trim());
    match parse_address_list(&decoded) {
        Err(Error::ExpectedComma) => {
            debug!("Retrying address list with separator repair: {:?}", decoded);
            parse_address_list(&insert_list_commas(&decoded))
        }
        other => other,
    }
}

/// Storage contract for message bodies
///
/// The parser core is storage-agnostic and never calls this itself; it is
/// the interface drivers implement to file leaf bodies away
pub trait Store {
    /// A tag identifying the backend type
    fn get_type(&self) -> &str;
    /// Stores the stream under `key`
    fn put(&mut self, key: &str, reader: &mut dyn Read) -> Result<(), std::io::Error>;
    /// Retrieves the stream stored under `key`
    fn get(&self, key: &str) -> Result<Box<dyn Read>, std::io::Error>;
}
