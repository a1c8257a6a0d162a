//! Tagged filelist
//!
//! A depth-first listing of every backed-up directory and file:
//!
//! ```text
//! Dir      [Tag::Dir][u32-bytes name][varint timestamp]   ... children ...   [Tag::DirEnd]
//! File2    [Tag::File2][u32-bytes name][varint timestamp][varint size][u8-bytes checksum][varint offset]
//! end      [Tag::FilelistEnd]
//! ```
//!
//! An empty checksum means none. The encoded list is gzip-compressed before
//! it goes into the archive trailer.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use arca_core::{ArcaError, ArcaResult, Info, Tag, WireRead, WireWrite};

use crate::content::gunzip;

/// Longest entry name, in bytes.
pub const MAX_NAME_LEN: usize = 32 * 1024;

/// Largest decompressed filelist a reader accepts.
pub const MAX_FILELIST_LEN: usize = 256 * 1024 * 1024;

/// Flat form: relative path (`a/b/c`, root is `""`) to entry.
pub type Filelist = BTreeMap<String, Info>;

/// Reject names that cannot be a single path component.
pub fn check_name(name: &str) -> ArcaResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > MAX_NAME_LEN
        || name.contains(['/', '\\', '\0'])
    {
        return Err(ArcaError::InvalidArgument(format!("bad entry name {name:?}")));
    }
    Ok(())
}

/// Join a relative directory path and a child name.
pub fn join_rpath(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Accumulates filelist records in walk order.
#[derive(Default)]
pub struct FilelistBuilder {
    buf: Vec<u8>,
    depth: usize,
}

impl FilelistBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a directory. Every following record belongs to it until
    /// [`FilelistBuilder::dir_end`].
    pub fn dir(&mut self, name: &str, timestamp: u64) -> ArcaResult<()> {
        check_name(name)?;
        self.buf.write_tag(Tag::Dir)?;
        self.buf.write_u32_bytes(name.as_bytes())?;
        self.buf.write_varint(timestamp)?;
        self.depth += 1;
        Ok(())
    }

    pub fn dir_end(&mut self) -> ArcaResult<()> {
        if self.depth == 0 {
            return Err(ArcaError::InvalidArgument("unbalanced directory end".into()));
        }
        self.buf.write_tag(Tag::DirEnd)?;
        self.depth -= 1;
        Ok(())
    }

    pub fn file(&mut self, name: &str, info: &Info) -> ArcaResult<()> {
        check_name(name)?;
        if info.is_dir() {
            return Err(ArcaError::InvalidArgument(format!("{name} is a directory")));
        }
        self.buf.write_tag(Tag::File2)?;
        self.buf.write_u32_bytes(name.as_bytes())?;
        self.buf.write_varint(info.timestamp)?;
        self.buf.write_varint(info.size as u64)?;
        self.buf
            .write_u8_bytes(info.checksum.as_deref().unwrap_or_default())?;
        self.buf.write_varint(info.offset)?;
        Ok(())
    }

    /// Close the list and return its uncompressed encoding.
    pub fn finish(mut self) -> ArcaResult<Vec<u8>> {
        if self.depth != 0 {
            return Err(ArcaError::InvalidArgument("unclosed directory".into()));
        }
        self.buf.write_tag(Tag::FilelistEnd)?;
        Ok(self.buf)
    }
}

enum Record<'a> {
    Dir(&'a [String], Info),
    DirEnd,
    File(&'a [String], Info),
}

fn walk<F>(mut input: &[u8], mut visit: F) -> ArcaResult<()>
where
    F: FnMut(Record<'_>) -> ArcaResult<()>,
{
    let mut path: Vec<String> = Vec::new();
    let read_name = |input: &mut &[u8]| -> ArcaResult<String> {
        let name = input.read_u32_utf8(MAX_NAME_LEN)?;
        check_name(&name).map_err(|_| ArcaError::Format)?;
        Ok(name)
    };
    loop {
        match input.read_tag()? {
            Tag::Dir => {
                let name = read_name(&mut input)?;
                let timestamp = input.read_varint()?;
                path.push(name);
                visit(Record::Dir(&path, Info::dir(timestamp)))?;
            }
            Tag::DirEnd => {
                if path.pop().is_none() {
                    return Err(ArcaError::Format);
                }
                visit(Record::DirEnd)?;
            }
            Tag::File2 => {
                let name = read_name(&mut input)?;
                let timestamp = input.read_varint()?;
                let size = input.read_varint()?;
                let checksum = input.read_u8_bytes()?;
                let offset = input.read_varint()?;
                let checksum = (!checksum.is_empty()).then_some(checksum);
                path.push(name);
                visit(Record::File(&path, Info::file(timestamp, size, offset, checksum)))?;
                path.pop();
            }
            Tag::FilelistEnd if path.is_empty() => return Ok(()),
            _ => return Err(ArcaError::Format),
        }
    }
}

/// Decode an uncompressed filelist into its flat form.
pub fn decode_filelist(raw: &[u8]) -> ArcaResult<Filelist> {
    let mut list = Filelist::new();
    list.insert(String::new(), Info::dir(0));
    walk(raw, |record| {
        match record {
            Record::Dir(path, info) | Record::File(path, info) => {
                list.insert(path.join("/"), info);
            }
            Record::DirEnd => {}
        }
        Ok(())
    })?;
    Ok(list)
}

fn info_json(name: &str, info: &Info) -> Map<String, Value> {
    let mut node = Map::new();
    node.insert("name".into(), json!(name));
    node.insert("lastModified".into(), json!(info.timestamp));
    node.insert("offset".into(), json!(info.offset));
    if let Some(checksum) = &info.checksum {
        node.insert("checksum".into(), json!(hex::encode(checksum)));
    }
    if info.is_dir() {
        node.insert("isdir".into(), json!(true));
        node.insert("length".into(), json!(0));
        node.insert("files".into(), Value::Object(Map::new()));
    } else {
        node.insert("isfile".into(), json!(true));
        node.insert("length".into(), json!(info.size));
    }
    node
}

fn attach(parent: &mut Map<String, Value>, name: String, child: Map<String, Value>) {
    if let Some(Value::Object(files)) = parent.get_mut("files") {
        files.insert(name, Value::Object(child));
    }
}

/// Decode an uncompressed filelist into a nested tree: every directory node
/// carries a `files` object keyed by child name.
pub fn decode_filetree(raw: &[u8]) -> ArcaResult<Value> {
    let mut stack: Vec<(String, Map<String, Value>)> = vec![(String::new(), info_json("", &Info::dir(0)))];
    walk(raw, |record| {
        match record {
            Record::Dir(path, info) => {
                let name = path.last().cloned().unwrap_or_default();
                let node = info_json(&name, &info);
                stack.push((name, node));
            }
            Record::DirEnd => {
                let (name, node) = stack.pop().ok_or(ArcaError::Format)?;
                let (_, parent) = stack.last_mut().ok_or(ArcaError::Format)?;
                attach(parent, name, node);
            }
            Record::File(path, info) => {
                let name = path.last().cloned().unwrap_or_default();
                let (_, parent) = stack.last_mut().ok_or(ArcaError::Format)?;
                let node = info_json(&name, &info);
                attach(parent, name, node);
            }
        }
        Ok(())
    })?;
    let (_, root) = stack.pop().ok_or(ArcaError::Format)?;
    Ok(Value::Object(root))
}

/// Inflate a compressed filelist, bounded by [`MAX_FILELIST_LEN`].
pub fn inflate(gz: &[u8]) -> ArcaResult<Vec<u8>> {
    gunzip(gz, MAX_FILELIST_LEN)
}

/// Compress an encoded filelist for the trailer.
pub fn deflate(raw: &[u8]) -> ArcaResult<Vec<u8>> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    let mut gz = GzEncoder::new(Vec::new(), Compression::best());
    gz.write_all(raw)?;
    Ok(gz.finish()?)
}
