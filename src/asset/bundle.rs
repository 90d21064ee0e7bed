//! Model asset bundle: a zip container of sub-model files and metadata.
//!
//! The bundle file is mapped read-only once; the central directory is parsed
//! up front into a name → span index. Every span handed out borrows the
//! mapping, so sub-model bytes are never copied out of the file.
//!
//! Only *stored* (uncompressed) entries are supported: the whole point of the
//! container is that backends consume entry bytes directly from the mapping.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{EdgeLmError, Result};

use super::mmap::MappedFile;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_DIR_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;

/// Fixed part of the end-of-central-directory record.
const EOCD_LEN: usize = 22;
/// Maximum trailing comment a zip file may carry after the EOCD record.
const MAX_COMMENT_LEN: usize = 0xFFFF;
/// Fixed part of a central-directory file header.
const CENTRAL_HEADER_LEN: usize = 46;
/// Fixed part of a local file header.
const LOCAL_HEADER_LEN: usize = 30;

const METHOD_STORED: u16 = 0;

/// Byte range of one entry within the mapping.
#[derive(Debug, Clone, Copy)]
struct EntrySpan {
    offset: usize,
    len: usize,
}

/// An opened model asset bundle.
///
/// Owns the file mapping; all entry spans returned by [`get_file`]
/// (`AssetBundle::get_file`) share its lifetime.
#[derive(Debug)]
pub struct AssetBundle {
    tag: String,
    mapped: MappedFile,
    entries: HashMap<String, EntrySpan>,
}

impl AssetBundle {
    /// Map the bundle file and parse its central directory.
    ///
    /// `tag` labels the bundle in logs; it carries no semantics.
    pub fn create(tag: &str, path: &Path) -> Result<Self> {
        let mapped = MappedFile::open(path)?;
        let entries = parse_central_directory(mapped.as_bytes())?;
        tracing::info!(
            tag,
            path = %path.display(),
            num_entries = entries.len(),
            "opened model asset bundle"
        );
        Ok(AssetBundle {
            tag: tag.to_string(),
            mapped,
            entries,
        })
    }

    /// Look up an entry's bytes by file name.
    ///
    /// The `NotFound` message lists every entry the bundle does contain, so
    /// a typo'd name is diagnosable from the error alone.
    pub fn get_file(&self, name: &str) -> Result<&[u8]> {
        match self.entries.get(name) {
            // Span bounds were validated against the mapping when the
            // central directory was parsed.
            Some(span) => Ok(&self.mapped.as_bytes()[span.offset..span.offset + span.len]),
            None => Err(EdgeLmError::NotFound(format!(
                "no file with name: {name}. All files in the model asset bundle are: {}.",
                self.list_files().join(", ")
            ))),
        }
    }

    /// All entry names, sorted.
    pub fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Locate the EOCD record and walk the central directory into an entry index.
fn parse_central_directory(data: &[u8]) -> Result<HashMap<String, EntrySpan>> {
    let eocd = find_eocd(data)?;
    let total_entries = LittleEndian::read_u16(&data[eocd + 10..]) as usize;
    let cd_size = LittleEndian::read_u32(&data[eocd + 12..]) as usize;
    let cd_offset = LittleEndian::read_u32(&data[eocd + 16..]) as usize;

    if cd_offset
        .checked_add(cd_size)
        .map_or(true, |end| end > data.len())
    {
        return Err(EdgeLmError::InvalidArgument(
            "central directory extends past end of bundle".into(),
        ));
    }

    let mut entries = HashMap::with_capacity(total_entries);
    let mut pos = cd_offset;
    for _ in 0..total_entries {
        if pos + CENTRAL_HEADER_LEN > data.len()
            || LittleEndian::read_u32(&data[pos..]) != CENTRAL_DIR_SIGNATURE
        {
            return Err(EdgeLmError::InvalidArgument(
                "corrupt central directory header".into(),
            ));
        }
        let method = LittleEndian::read_u16(&data[pos + 10..]);
        let compressed_size = LittleEndian::read_u32(&data[pos + 20..]) as usize;
        let uncompressed_size = LittleEndian::read_u32(&data[pos + 24..]) as usize;
        let name_len = LittleEndian::read_u16(&data[pos + 28..]) as usize;
        let extra_len = LittleEndian::read_u16(&data[pos + 30..]) as usize;
        let comment_len = LittleEndian::read_u16(&data[pos + 32..]) as usize;
        let local_offset = LittleEndian::read_u32(&data[pos + 42..]) as usize;

        if pos + CENTRAL_HEADER_LEN + name_len > data.len() {
            return Err(EdgeLmError::InvalidArgument(
                "entry name extends past end of bundle".into(),
            ));
        }
        let name_bytes = &data[pos + CENTRAL_HEADER_LEN..pos + CENTRAL_HEADER_LEN + name_len];
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| EdgeLmError::InvalidArgument("entry name is not valid UTF-8".into()))?
            .to_string();

        if method != METHOD_STORED {
            return Err(EdgeLmError::DataLoss(format!(
                "entry {name} uses compression method {method}; only stored entries are supported"
            )));
        }
        if compressed_size == 0xFFFF_FFFF || local_offset == 0xFFFF_FFFF {
            return Err(EdgeLmError::DataLoss(format!(
                "entry {name} requires zip64, which is not supported"
            )));
        }

        let data_offset = entry_data_offset(data, local_offset, &name)?;
        if data_offset
            .checked_add(uncompressed_size)
            .map_or(true, |end| end > data.len())
        {
            return Err(EdgeLmError::InvalidArgument(format!(
                "entry {name} data extends past end of bundle"
            )));
        }

        entries.insert(
            name,
            EntrySpan {
                offset: data_offset,
                len: uncompressed_size,
            },
        );
        pos += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
    }
    Ok(entries)
}

/// Scan backward for the end-of-central-directory signature.
fn find_eocd(data: &[u8]) -> Result<usize> {
    if data.len() < EOCD_LEN {
        return Err(EdgeLmError::InvalidArgument(
            "bundle is too small to be a zip archive".into(),
        ));
    }
    let scan_floor = data.len().saturating_sub(EOCD_LEN + MAX_COMMENT_LEN);
    let mut pos = data.len() - EOCD_LEN;
    loop {
        if LittleEndian::read_u32(&data[pos..]) == EOCD_SIGNATURE {
            return Ok(pos);
        }
        if pos == scan_floor {
            return Err(EdgeLmError::InvalidArgument(
                "no end-of-central-directory record found".into(),
            ));
        }
        pos -= 1;
    }
}

/// Resolve the start of an entry's data by reading its local header. The
/// local extra field may differ in length from the central one, so the local
/// header is authoritative for the data offset.
fn entry_data_offset(data: &[u8], local_offset: usize, name: &str) -> Result<usize> {
    if local_offset + LOCAL_HEADER_LEN > data.len()
        || LittleEndian::read_u32(&data[local_offset..]) != LOCAL_HEADER_SIGNATURE
    {
        return Err(EdgeLmError::InvalidArgument(format!(
            "corrupt local header for entry {name}"
        )));
    }
    let name_len = LittleEndian::read_u16(&data[local_offset + 26..]) as usize;
    let extra_len = LittleEndian::read_u16(&data[local_offset + 28..]) as usize;
    Ok(local_offset + LOCAL_HEADER_LEN + name_len + extra_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal stored-entry zip writer for fixtures.
    fn build_stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (name, body) in entries {
            let local_offset = out.len() as u32;
            // Local header.
            out.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // version, flags, method, time, date
            out.extend_from_slice(&0u32.to_le_bytes()); // crc (unchecked)
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.write_all(name.as_bytes()).unwrap();
            out.write_all(body).unwrap();
            // Central header.
            central.extend_from_slice(&CENTRAL_DIR_SIGNATURE.to_le_bytes());
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            central.extend_from_slice(&0u32.to_le_bytes()); // crc
            central.extend_from_slice(&(body.len() as u32).to_le_bytes());
            central.extend_from_slice(&(body.len() as u32).to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0u8; 12]); // extra/comment lens, disk, attrs
            central.extend_from_slice(&local_offset.to_le_bytes());
            central.write_all(name.as_bytes()).unwrap();
        }
        let cd_offset = out.len() as u32;
        let cd_size = central.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // disk numbers
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment len
        out
    }

    fn write_bundle(entries: &[(&str, &[u8])]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.task");
        std::fs::write(&path, build_stored_zip(entries)).unwrap();
        (dir, path)
    }

    #[test]
    fn get_file_returns_entry_bytes() {
        let (_dir, path) = write_bundle(&[("a.tflite", b"AAAA"), ("b.json", b"{}")]);
        let bundle = AssetBundle::create("test", &path).unwrap();
        assert_eq!(bundle.get_file("a.tflite").unwrap(), b"AAAA");
        assert_eq!(bundle.get_file("b.json").unwrap(), b"{}");
    }

    #[test]
    fn missing_file_lists_available_entries() {
        let (_dir, path) = write_bundle(&[("a.tflite", b"AAAA"), ("b.json", b"{}")]);
        let bundle = AssetBundle::create("test", &path).unwrap();
        let err = bundle.get_file("nope.bin").unwrap_err();
        match err {
            EdgeLmError::NotFound(msg) => {
                assert!(msg.contains("nope.bin"));
                assert!(msg.contains("a.tflite"));
                assert!(msg.contains("b.json"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn list_files_matches_successful_lookups() {
        let (_dir, path) = write_bundle(&[("z.bin", b"z"), ("a.bin", b"a"), ("m.bin", b"m")]);
        let bundle = AssetBundle::create("test", &path).unwrap();
        let names = bundle.list_files();
        assert_eq!(names, vec!["a.bin", "m.bin", "z.bin"]);
        for name in &names {
            assert!(bundle.get_file(name).is_ok());
        }
    }

    #[test]
    fn empty_archive_lists_nothing() {
        let (_dir, path) = write_bundle(&[]);
        let bundle = AssetBundle::create("test", &path).unwrap();
        assert!(bundle.list_files().is_empty());
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.task");
        std::fs::write(&path, b"this is not a zip archive, not even close").unwrap();
        let err = AssetBundle::create("test", &path).unwrap_err();
        assert!(matches!(err, EdgeLmError::InvalidArgument(_)));
    }

    #[test]
    fn unreadable_path_is_rejected() {
        let err = AssetBundle::create("test", Path::new("/definitely/not/here.task")).unwrap_err();
        assert!(matches!(err, EdgeLmError::InvalidArgument(_)));
    }

    #[test]
    fn compressed_entry_is_rejected() {
        // Patch the method field of a valid archive to "deflate".
        let mut bytes = build_stored_zip(&[("c.bin", b"cccc")]);
        // Local header method at offset 8, central header method at cd+10.
        let cd_offset = {
            let eocd = bytes.len() - EOCD_LEN;
            LittleEndian::read_u32(&bytes[eocd + 16..]) as usize
        };
        bytes[cd_offset + 10] = 8;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deflate.task");
        std::fs::write(&path, bytes).unwrap();
        let err = AssetBundle::create("test", &path).unwrap_err();
        assert!(matches!(err, EdgeLmError::DataLoss(_)));
    }
}
