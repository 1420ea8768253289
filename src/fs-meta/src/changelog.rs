//! Changelog records and replay. Every successful mutation on the master
//! appends one line:
//!
//! ```text
//! <metaversion>|<timestamp>|<OP>(<args>)[:<result>]
//! ```
//!
//! `metaversion` is the pre-increment value. A shadow consumes lines in
//! order, re-applies each operation and verifies the encoded result; any
//! divergence stops replay with `Mismatch` and forces a full resync.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use tokio::sync::broadcast;

use crate::metadata::FsMetadata;
use crate::node::AclVariant;
use crate::{FsError, FsResult};

/// In-memory tail kept for late-joining subscribers and tests.
const RECENT_CAPACITY: usize = 4096;
const BROADCAST_CAPACITY: usize = 1024;

pub struct ChangelogSink {
    file: Option<BufWriter<File>>,
    recent: VecDeque<(u64, String)>,
    broadcast: broadcast::Sender<(u64, String)>,
    last_version: u64,
}

impl ChangelogSink {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            file: None,
            recent: VecDeque::new(),
            broadcast,
            last_version: 0,
        }
    }

    pub fn open_file(&mut self, path: &Path) -> FsResult<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn close_file(&mut self) -> FsResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(u64, String)> {
        self.broadcast.subscribe()
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    pub fn append(&mut self, version: u64, ts: u32, entry: &str) {
        let line = format!("{}|{}|{}", version, ts, entry);
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = writeln!(file, "{}", line) {
                warn!("changelog write failed: {}", err);
            }
        }
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back((version, line.clone()));
        self.last_version = version;
        let _ = self.broadcast.send((version, line));
    }

    pub fn flush(&mut self) -> FsResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Lines with version > `after`, oldest first, from the in-memory tail.
    pub fn lines_after(&self, after: u64) -> Vec<(u64, String)> {
        self.recent
            .iter()
            .filter(|(version, _)| *version > after)
            .cloned()
            .collect()
    }
}

impl Default for ChangelogSink {
    fn default() -> Self {
        Self::new()
    }
}

// ========== record text ==========

/// Escape a string for embedding in a record argument list.
pub fn escape_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b',' => out.push_str("\\,"),
            b'(' => out.push_str("\\("),
            b')' => out.push_str("\\)"),
            b'|' => out.push_str("\\|"),
            b':' => out.push_str("\\:"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                out.push_str(&format!("\\x{:02x}", byte));
            }
        }
    }
    out
}

pub fn unescape_name(value: &str) -> FsResult<String> {
    let mut out: Vec<u8> = Vec::with_capacity(value.len());
    let mut chars = value.bytes();
    while let Some(byte) = chars.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match chars.next() {
            Some(b'x') => {
                let hi = chars.next().ok_or(FsError::Inval)?;
                let lo = chars.next().ok_or(FsError::Inval)?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| FsError::Inval)?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| FsError::Inval)?);
            }
            Some(escaped) => out.push(escaped),
            None => return Err(FsError::Inval),
        }
    }
    String::from_utf8(out).map_err(|_| FsError::Inval)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangelogRecord {
    pub version: u64,
    pub ts: u32,
    pub op: String,
    pub args: Vec<String>,
    pub result: Option<String>,
}

impl ChangelogRecord {
    pub fn parse(line: &str) -> FsResult<ChangelogRecord> {
        let mut fields = line.splitn(3, '|');
        let version: u64 = fields
            .next()
            .ok_or(FsError::Inval)?
            .parse()
            .map_err(|_| FsError::Inval)?;
        let ts: u32 = fields
            .next()
            .ok_or(FsError::Inval)?
            .parse()
            .map_err(|_| FsError::Inval)?;
        let body = fields.next().ok_or(FsError::Inval)?;

        let open = body.find('(').ok_or(FsError::Inval)?;
        let op = body[..open].to_string();
        if op.is_empty() || !op.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(FsError::Inval);
        }

        // Walk the argument list with escape awareness.
        let mut args = Vec::new();
        let mut current = String::new();
        let mut any_content = false;
        let bytes = body.as_bytes();
        let mut i = open + 1;
        let close;
        loop {
            if i >= bytes.len() {
                return Err(FsError::Inval);
            }
            match bytes[i] {
                b'\\' => {
                    if i + 1 >= bytes.len() {
                        return Err(FsError::Inval);
                    }
                    current.push('\\');
                    current.push(bytes[i + 1] as char);
                    i += 2;
                    any_content = true;
                }
                b',' => {
                    args.push(unescape_name(&current)?);
                    current.clear();
                    i += 1;
                    any_content = true;
                }
                b')' => {
                    close = i;
                    break;
                }
                other => {
                    current.push(other as char);
                    i += 1;
                    any_content = true;
                }
            }
        }
        if any_content || !args.is_empty() {
            args.push(unescape_name(&current)?);
        }

        let rest = &body[close + 1..];
        let result = match rest.strip_prefix(':') {
            Some(result) => Some(result.to_string()),
            None if rest.is_empty() => None,
            None => return Err(FsError::Inval),
        };
        Ok(ChangelogRecord {
            version,
            ts,
            op,
            args,
            result,
        })
    }

    fn arg(&self, index: usize) -> FsResult<&str> {
        self.args
            .get(index)
            .map(|s| s.as_str())
            .ok_or(FsError::Inval)
    }

    pub fn num<T: std::str::FromStr>(&self, index: usize) -> FsResult<T> {
        self.arg(index)?.parse().map_err(|_| FsError::Inval)
    }

    pub fn text(&self, index: usize) -> FsResult<String> {
        Ok(self.arg(index)?.to_string())
    }

    pub fn result_num<T: std::str::FromStr>(&self) -> FsResult<T> {
        self.result
            .as_deref()
            .ok_or(FsError::Inval)?
            .parse()
            .map_err(|_| FsError::Inval)
    }

    /// Results of the form "a,b,c".
    pub fn result_nums(&self) -> FsResult<Vec<u64>> {
        self.result
            .as_deref()
            .ok_or(FsError::Inval)?
            .split(',')
            .map(|v| v.parse().map_err(|_| FsError::Inval))
            .collect()
    }
}

// ========== replay ==========

impl FsMetadata {
    /// Apply one changelog line on a shadow (or during startup replay).
    /// The record's version must be exactly the next one.
    pub fn apply_line(&mut self, line: &str) -> FsResult<()> {
        let record = ChangelogRecord::parse(line)?;
        if record.version != self.metaversion {
            warn!(
                "changelog version {} does not match metadata version {}",
                record.version, self.metaversion
            );
            return Err(FsError::Mismatch);
        }
        self.apply_record(&record)?;
        self.metaversion += 1;
        Ok(())
    }

    fn apply_record(&mut self, record: &ChangelogRecord) -> FsResult<()> {
        let ts = record.ts;
        match record.op.as_str() {
            "CREATE" => {
                let type_char = record
                    .text(2)?
                    .chars()
                    .next()
                    .ok_or(FsError::Inval)?;
                self.apply_create(
                    ts,
                    record.num(0)?,
                    &record.text(1)?,
                    type_char,
                    record.num(3)?,
                    record.num(4)?,
                    record.num(5)?,
                    record.num(6)?,
                    record.result_num()?,
                )
            }
            "SYMLINK" => self.apply_symlink(
                ts,
                record.num(0)?,
                &record.text(1)?,
                &record.text(2)?,
                record.num(3)?,
                record.num(4)?,
                record.result_num()?,
            ),
            "UNLINK" => self.apply_unlink(ts, record.num(0)?, &record.text(1)?, record.result_num()?),
            "MOVE" => self.apply_move(
                ts,
                record.num(0)?,
                &record.text(1)?,
                record.num(2)?,
                &record.text(3)?,
                record.result_num()?,
            ),
            "LINK" => self.apply_link(ts, record.num(0)?, record.num(1)?, &record.text(2)?),
            "TRUNC" => self.apply_trunc(
                ts,
                record.num(0)?,
                record.num(1)?,
                record.num(2)?,
                record.result_num()?,
            ),
            "LENGTH" => self.apply_length(ts, record.num(0)?, record.num(1)?),
            "WRITE" => self.apply_write(
                ts,
                record.num(0)?,
                record.num(1)?,
                record.num::<u8>(2)? != 0,
                record.num(3)?,
                record.result_num()?,
            ),
            "UNLOCK" => self.apply_unlock(record.num(0)?),
            "ATTR" => self.apply_attr(
                ts,
                record.num(0)?,
                record.num(1)?,
                record.num(2)?,
                record.num(3)?,
                record.num(4)?,
                record.num(5)?,
            ),
            "SETGOAL" => {
                let counts = record.result_nums()?;
                self.apply_setgoal(
                    ts,
                    record.num(0)?,
                    record.num(1)?,
                    record.num(2)?,
                    record.num(3)?,
                    &counts,
                )
            }
            "SETTRASHTIME" => {
                let counts = record.result_nums()?;
                self.apply_settrashtime(
                    ts,
                    record.num(0)?,
                    record.num(1)?,
                    record.num(2)?,
                    record.num(3)?,
                    &counts,
                )
            }
            "SETEATTR" => {
                let counts = record.result_nums()?;
                self.apply_seteattr(
                    ts,
                    record.num(0)?,
                    record.num(1)?,
                    record.num(2)?,
                    record.num(3)?,
                    &counts,
                )
            }
            "SETXATTR" => self.apply_setxattr(
                ts,
                record.num(0)?,
                &record.text(1)?,
                record.text(2)?.into_bytes(),
                record.num(3)?,
            ),
            "SETACL" => {
                let variant = record
                    .text(1)?
                    .chars()
                    .next()
                    .and_then(AclVariant::from_type_char)
                    .ok_or(FsError::Inval)?;
                self.apply_setacl(ts, record.num(0)?, variant, &record.text(2)?)
            }
            "DELETEACL" => {
                let variant = record
                    .text(1)?
                    .chars()
                    .next()
                    .and_then(AclVariant::from_type_char)
                    .ok_or(FsError::Inval)?;
                self.apply_deleteacl(ts, record.num(0)?, variant)
            }
            "ACQUIRE" => self.apply_acquire(record.num(0)?, record.num(1)?),
            "RELEASE" => self.apply_release(ts, record.num(0)?, record.num(1)?),
            "SESSION" => self.apply_session(record.result_num()?),
            "PURGE" => self.apply_purge(ts, record.num(0)?),
            "UNDEL" => self.apply_undel(ts, record.num(0)?),
            "SETPATH" => self.apply_setpath(record.num(0)?, &record.text(1)?),
            "REPAIR" => self.apply_repair(ts, record.num(0)?, record.num(1)?, record.result_num()?),
            "APPEND" => self.apply_append(ts, record.num(0)?, record.num(1)?),
            "FLCK" => self.apply_flock_op(
                record.num(0)?,
                record.num(1)?,
                record.num(2)?,
                record.num(3)?,
                record.num(4)?,
                record.num(5)?,
                record.num(6)?,
            ),
            "CLRLCK" => self.apply_locks_clear_session(record.num(0)?, record.num(1)?, record.num(2)?),
            "FLCKINODE" => self.apply_locks_unlock_inode(record.num(0)?, record.num(1)?),
            "RMPLOCK" => self.apply_locks_remove_pending(
                record.num(0)?,
                record.num(1)?,
                record.num(2)?,
                record.num(3)?,
                record.num(4)?,
            ),
            "NEXTCHUNKID" => self.chunks.set_next_chunk_id(record.num(0)?),
            "INCVERSION" => self.apply_incversion(record.num(0)?),
            "SETQUOTA" => self.apply_setquota(
                &record.text(0)?,
                record.num(1)?,
                &record.text(2)?,
                &record.text(3)?,
                record.num(4)?,
            ),
            "CHECKSUM" => {
                let expected: u64 = record.result_num()?;
                if self.checksum() != expected {
                    return Err(FsError::BadMetadataChecksum);
                }
                Ok(())
            }
            other => {
                warn!("unknown changelog operation {}", other);
                Err(FsError::Inval)
            }
        }
    }

    /// Emit the periodic checksum record (master side).
    pub fn emit_checksum(&mut self, ts: u32) {
        let checksum = self.checksum();
        let version = self.metaversion;
        self.metaversion += 1;
        self.changelog
            .append(version, ts, &format!("CHECKSUM():{}", checksum));
        info!("metadata checksum at version {}: {:016x}", version, checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_round_trip() {
        for name in [
            "plain",
            "with,comma",
            "with)close",
            "with(open",
            "back\\slash",
            "pipe|colon:",
            "bin\u{1}ary",
            "zażółć",
        ] {
            let escaped = escape_name(name);
            assert!(!escaped.contains('|'), "escaped {:?}", escaped);
            assert_eq!(unescape_name(&escaped).unwrap(), name);
        }
    }

    #[test]
    fn record_parsing() {
        let record =
            ChangelogRecord::parse("17|1000|CREATE(1,etc,d,493,0,0,0):5").unwrap();
        assert_eq!(record.version, 17);
        assert_eq!(record.ts, 1000);
        assert_eq!(record.op, "CREATE");
        assert_eq!(record.args.len(), 7);
        assert_eq!(record.args[1], "etc");
        assert_eq!(record.result.as_deref(), Some("5"));
    }

    #[test]
    fn record_with_escaped_args() {
        let entry = format!("3|5|UNLINK(7,{}):9", escape_name("a,b)c"));
        let record = ChangelogRecord::parse(&entry).unwrap();
        assert_eq!(record.args[1], "a,b)c");
        assert_eq!(record.result_num::<u32>().unwrap(), 9);
    }

    #[test]
    fn record_without_args_or_result() {
        let record = ChangelogRecord::parse("8|9|SESSION():4").unwrap();
        assert!(record.args.is_empty());
        assert_eq!(record.result_num::<u32>().unwrap(), 4);

        let record = ChangelogRecord::parse("8|9|UNLOCK(77)").unwrap();
        assert_eq!(record.args, vec!["77".to_string()]);
        assert!(record.result.is_none());
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(ChangelogRecord::parse("x|1|OP()").is_err());
        assert!(ChangelogRecord::parse("1|1|no_paren").is_err());
        assert!(ChangelogRecord::parse("1|1|OP(unclosed").is_err());
        assert!(ChangelogRecord::parse("1|1|OP()garbage").is_err());
        assert!(ChangelogRecord::parse("1|1|lower()").is_err());
    }

    #[test]
    fn sink_keeps_recent_tail() {
        let mut sink = ChangelogSink::new();
        sink.append(1, 10, "SESSION():1");
        sink.append(2, 11, "UNLOCK(5)");
        assert_eq!(sink.last_version(), 2);
        let tail = sink.lines_after(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].1, "2|11|UNLOCK(5)");
    }
}
