//! Index persistence
//!
//! The index is cached on disk so later opens skip the full decode pass. The
//! file is little-endian binary: a `"BS2V"` magic and version, the identity of
//! the indexed source (size, track, open options), then the frame records.
//! Strings are length-prefixed (`i32` length + bytes, no NUL). Any mismatch on
//! load is treated as a missing file; the caller silently rebuilds.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use videoseek_common::Result;

use crate::hash::HASH_SIZE;
use crate::index::{FrameInfo, TrackIndex};

const INDEX_MAGIC: &[u8; 4] = b"BS2V";
const INDEX_VERSION: i32 = 1;

/// Values that must match between the cache file and the current open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub source_size: i64,
    pub track: i32,
    pub variable_format: bool,
    pub hw_device: String,
    pub demuxer_options: BTreeMap<String, String>,
}

/// Cache file path for `source` track `track`: inside `cache_dir` keyed by the
/// source basename, or next to the source itself when no cache dir is set.
#[must_use]
pub fn index_cache_path(source: &Path, cache_dir: Option<&Path>, track: i32) -> PathBuf {
    match cache_dir {
        Some(dir) => {
            let basename = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            dir.join(format!("{basename}.{track}.bsindex"))
        }
        None => {
            let mut name = source.as_os_str().to_owned();
            name.push(format!(".{track}.bsindex"));
            PathBuf::from(name)
        }
    }
}

/// Write the index cache file, going through a temp sibling and an atomic
/// rename so concurrent writers cannot leave a torn file behind.
pub fn write_index(path: &Path, meta: &IndexMeta, index: &TrackIndex) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(INDEX_MAGIC)?;
        write_i32(&mut w, INDEX_VERSION)?;
        write_i64(&mut w, meta.source_size)?;
        write_i32(&mut w, meta.track)?;
        write_i32(&mut w, i32::from(meta.variable_format))?;
        write_string(&mut w, &meta.hw_device)?;

        write_i32(&mut w, meta.demuxer_options.len() as i32)?;
        for (key, value) in &meta.demuxer_options {
            write_string(&mut w, key)?;
            write_string(&mut w, value)?;
        }

        write_i64(&mut w, index.frames.len() as i64)?;
        write_i64(&mut w, index.last_frame_duration)?;

        for frame in &index.frames {
            w.write_all(&frame.hash)?;
            write_i64(&mut w, frame.pts)?;
            write_i32(&mut w, frame.repeat_pict)?;
            let flags = i32::from(frame.key_frame) | (i32::from(frame.top_field_first) << 1);
            write_i32(&mut w, flags)?;
        }
        w.flush()?;
    }

    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), frames = index.frames.len(), "wrote index cache");
    Ok(())
}

/// Load the index cache file if it exists and matches `meta` exactly.
/// Returns `None` on any mismatch or corruption; the caller rebuilds.
#[must_use]
pub fn read_index(path: &Path, meta: &IndexMeta) -> Option<TrackIndex> {
    let file = File::open(path).ok()?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).ok()?;
    if &magic != INDEX_MAGIC {
        return None;
    }
    if read_i32(&mut r).ok()? != INDEX_VERSION {
        return None;
    }
    if read_i64(&mut r).ok()? != meta.source_size {
        return None;
    }
    if read_i32(&mut r).ok()? != meta.track {
        return None;
    }
    if read_i32(&mut r).ok()? != i32::from(meta.variable_format) {
        return None;
    }
    if read_string(&mut r).ok()? != meta.hw_device {
        return None;
    }

    let opt_count = read_i32(&mut r).ok()?;
    if opt_count < 0 {
        return None;
    }
    let mut options = BTreeMap::new();
    for _ in 0..opt_count {
        let key = read_string(&mut r).ok()?;
        let value = read_string(&mut r).ok()?;
        options.insert(key, value);
    }
    if options != meta.demuxer_options {
        return None;
    }

    let num_frames = read_i64(&mut r).ok()?;
    if num_frames < 0 {
        return None;
    }
    let mut index = TrackIndex {
        frames: Vec::with_capacity(num_frames.min(1 << 24) as usize),
        last_frame_duration: read_i64(&mut r).ok()?,
    };

    for _ in 0..num_frames {
        let mut hash = [0u8; HASH_SIZE];
        r.read_exact(&mut hash).ok()?;
        let pts = read_i64(&mut r).ok()?;
        let repeat_pict = read_i32(&mut r).ok()?;
        let flags = read_i32(&mut r).ok()?;
        index.frames.push(FrameInfo {
            pts,
            repeat_pict,
            key_frame: flags & 1 != 0,
            top_field_first: flags & 2 != 0,
            hash,
        });
    }

    if index.frames.is_empty() {
        return None;
    }

    debug!(path = %path.display(), frames = index.frames.len(), "loaded index cache");
    Some(index)
}

fn write_i32<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_i64<W: Write>(w: &mut W, value: i64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_string<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    write_i32(w, value.len() as i32)?;
    w.write_all(value.as_bytes())
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_i32(r)?;
    if !(0..=(1 << 20)).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unreasonable string length",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> IndexMeta {
        IndexMeta {
            source_size: 123_456,
            track: 0,
            variable_format: false,
            hw_device: String::new(),
            demuxer_options: BTreeMap::from([("probesize".to_string(), "5000000".to_string())]),
        }
    }

    fn sample_index() -> TrackIndex {
        let frames = (0..64)
            .map(|i| FrameInfo {
                pts: i64::from(i) * 1000,
                repeat_pict: i32::from(i % 4 == 0),
                key_frame: i % 16 == 0,
                top_field_first: i % 2 == 0,
                hash: [i as u8; HASH_SIZE],
            })
            .collect();
        TrackIndex {
            frames,
            last_frame_duration: 1000,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv.0.bsindex");
        let meta = sample_meta();
        let index = sample_index();

        write_index(&path, &meta, &index).unwrap();
        let loaded = read_index(&path, &meta).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn mismatches_reject_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv.0.bsindex");
        let meta = sample_meta();
        write_index(&path, &meta, &sample_index()).unwrap();

        let mut wrong = meta.clone();
        wrong.source_size += 1;
        assert!(read_index(&path, &wrong).is_none());

        let mut wrong = meta.clone();
        wrong.track = 2;
        assert!(read_index(&path, &wrong).is_none());

        let mut wrong = meta.clone();
        wrong.variable_format = true;
        assert!(read_index(&path, &wrong).is_none());

        let mut wrong = meta.clone();
        wrong.hw_device = "cuda".to_string();
        assert!(read_index(&path, &wrong).is_none());

        let mut wrong = meta.clone();
        wrong.demuxer_options.insert("fflags".to_string(), "+genpts".to_string());
        assert!(read_index(&path, &wrong).is_none());

        assert!(read_index(&path, &meta).is_some());
    }

    #[test]
    fn truncated_file_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv.0.bsindex");
        let meta = sample_meta();
        write_index(&path, &meta, &sample_index()).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(read_index(&path, &meta).is_none());
    }

    #[test]
    fn missing_file_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.0.bsindex");
        assert!(read_index(&path, &sample_meta()).is_none());
    }

    #[test]
    fn cache_path_layouts() {
        let source = Path::new("/media/clips/movie.mkv");
        assert_eq!(
            index_cache_path(source, Some(Path::new("/tmp/cache")), 1),
            Path::new("/tmp/cache/movie.mkv.1.bsindex")
        );
        assert_eq!(
            index_cache_path(source, None, 0),
            Path::new("/media/clips/movie.mkv.0.bsindex")
        );
    }
}
