//! Sample driver: parses a message file, stores the decoded leaf bodies
//! and prints a JSON document with the tree and the structured headers
mod config;

use mimetree_rs::Part;
use mimetree_rs::structured::{Store, StructuredMime};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let config = config::Config::new()?;
    let input_name = std::env::args()
        .nth(1)
        .ok_or("usage: mimetree-rs <message.eml>")?;
    info!("Parsing {}", input_name);
    let input_file = std::fs::File::open(&input_name)?;

    let mut store = FileStore {
        dir: PathBuf::from(&config.output_path),
        max_size: config.max_part_size,
    };
    let mut sm = StructuredMime::new();
    let mut parts: Vec<PartMeta> = Vec::new();

    let root = mimetree_rs::parse(
        input_file,
        |body| {
            let key = format!("part-{}", parts.len());
            store.put(&key, body).map_err(mimetree_rs::Error::Io)?;
            parts.push(PartMeta::describe(body.part(), parts.len() as u64, key));
            Ok(())
        },
        |part| sm.collect(part),
    )?;

    let doc = MessageMeta {
        subject: &sm.subject,
        message_id: &sm.message_id,
        date_ts: sm.date.map(|dt| dt.unix_timestamp()),
        from: formatted(&sm.from),
        to: formatted(&sm.to),
        cc: formatted(&sm.cc),
        bcc: formatted(&sm.bcc),
        sender: formatted(&sm.sender),
        reply_to: formatted(&sm.reply_to),
        references: &sm.references,
        in_reply_to: &sm.in_reply_to,
        priority: &sm.priority,
        multipart: root.is_multipart(),
        mime_type: root.content_type.media_type(),
        tree: TreeMeta::describe(&root),
        parts,
    };
    let rendered = if config.pretty {
        serde_json::to_string_pretty(&doc)?
    } else {
        serde_json::to_string(&doc)?
    };
    println!("{}", rendered);
    Ok(())
}

#[derive(Serialize)]
struct MessageMeta<'a> {
    subject: &'a str,
    message_id: &'a str,
    date_ts: Option<i64>,
    from: Vec<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    sender: Vec<String>,
    reply_to: Vec<String>,
    references: &'a [String],
    in_reply_to: &'a [String],
    priority: &'a str,
    multipart: bool,
    mime_type: String,
    tree: TreeMeta,
    parts: Vec<PartMeta>,
}

fn formatted(addresses: &[mimetree_rs::address::Address]) -> Vec<String> {
    addresses.iter().map(|a| a.formatted()).collect()
}

#[derive(Serialize)]
struct PartMeta {
    ord: u64,
    key: String,
    mime_type: String,
    disposition: String,
    inline: bool,
    transfer_encoding: Option<String>,
    name: Option<String>,
    size: u64,
    bad_header_keys: usize,
}

impl PartMeta {
    fn describe(part: &Part, ord: u64, key: String) -> Self {
        Self {
            ord,
            key,
            mime_type: part.content_type.media_type(),
            disposition: part
                .content_disposition
                .as_ref()
                .map(|cd| cd.media_type.clone())
                .unwrap_or_else(|| "inline".to_string()),
            inline: part.is_inline(),
            transfer_encoding: part.content_transfer_encoding().map(|cte| cte.to_string()),
            name: part.filename().map(|name| name.to_string()),
            size: part.size,
            bad_header_keys: part.bad_headers.len(),
        }
    }
}

#[derive(Serialize)]
struct TreeMeta {
    mime_type: String,
    multipart: String,
    size: u64,
    children: Vec<TreeMeta>,
}

impl TreeMeta {
    fn describe(part: &Part) -> Self {
        Self {
            mime_type: part.content_type.media_type(),
            multipart: part.multipart.clone(),
            size: part.size,
            children: part
                .children
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(TreeMeta::describe)
                .collect(),
        }
    }
}

/// Filesystem-backed body storage
struct FileStore {
    dir: PathBuf,
    max_size: u64,
}

impl Store for FileStore {
    fn get_type(&self) -> &str {
        "file"
    }

    fn put(&mut self, key: &str, reader: &mut dyn Read) -> Result<(), std::io::Error> {
        let mut output_file = tempfile::NamedTempFile::new_in(&self.dir)?;
        let written = std::io::copy(&mut reader.take(self.max_size), &mut output_file)?;
        let path = self.dir.join(key);
        output_file.persist(&path).map_err(|e| e.error)?;
        debug!("Stored {} ({} bytes)", path.display(), written);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read>, std::io::Error> {
        Ok(Box::new(std::fs::File::open(self.dir.join(key))?))
    }
}
