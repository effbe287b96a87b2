//! The index file is the block's series directory: a small header followed by
//! one entry per series, sorted by label set. Each entry carries the labels
//! and the location of the series' sample run in the chunk segment.

use std::{
    fs::{
        self,
        File,
    },
    io::{
        BufReader,
        BufWriter,
        Read,
        Write,
    },
    path::Path,
};

use anyhow::Context;
use byteorder::{
    LittleEndian,
    ReadBytesExt,
    WriteBytesExt,
};
use timeseries::{
    Label,
    Labels,
};

use crate::INDEX_FILENAME;

const INDEX_MAGIC: u32 = 0x5453_4258; // "TSBX"
const INDEX_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub labels: Labels,
    /// Byte offset of the sample run in the chunk segment.
    pub chunk_offset: u64,
    pub num_samples: u32,
    pub min_time: i64,
    pub max_time: i64,
}

impl IndexEntry {
    pub fn overlaps(&self, mint: i64, maxt: i64) -> bool {
        self.min_time <= maxt && self.max_time >= mint
    }
}

/// Entries must already be sorted by label set; the writer enforces it.
pub fn write_index(block_dir: &Path, entries: &[IndexEntry]) -> anyhow::Result<()> {
    debug_assert!(entries.windows(2).all(|w| w[0].labels < w[1].labels));
    let path = block_dir.join(INDEX_FILENAME);
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    out.write_u32::<LittleEndian>(INDEX_MAGIC)?;
    out.write_u8(INDEX_VERSION)?;
    out.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        out.write_u16::<LittleEndian>(entry.labels.len() as u16)?;
        for label in entry.labels.iter() {
            write_string(&mut out, &label.name)?;
            write_string(&mut out, &label.value)?;
        }
        out.write_u64::<LittleEndian>(entry.chunk_offset)?;
        out.write_u32::<LittleEndian>(entry.num_samples)?;
        out.write_i64::<LittleEndian>(entry.min_time)?;
        out.write_i64::<LittleEndian>(entry.max_time)?;
    }
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(())
}

pub fn read_index(block_dir: &Path) -> anyhow::Result<Vec<IndexEntry>> {
    let path = block_dir.join(INDEX_FILENAME);
    let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let mut input = BufReader::new(raw.as_slice());
    let magic = input.read_u32::<LittleEndian>()?;
    anyhow::ensure!(magic == INDEX_MAGIC, "bad index magic {magic:#x}");
    let version = input.read_u8()?;
    anyhow::ensure!(version == INDEX_VERSION, "unsupported index version {version}");
    let num_series = input.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(num_series as usize);
    for _ in 0..num_series {
        let num_labels = input.read_u16::<LittleEndian>()?;
        let mut labels = Vec::with_capacity(num_labels as usize);
        for _ in 0..num_labels {
            let name = read_string(&mut input)?;
            let value = read_string(&mut input)?;
            labels.push(Label::new(name, value));
        }
        entries.push(IndexEntry {
            labels: Labels::new(labels),
            chunk_offset: input.read_u64::<LittleEndian>()?,
            num_samples: input.read_u32::<LittleEndian>()?,
            min_time: input.read_i64::<LittleEndian>()?,
            max_time: input.read_i64::<LittleEndian>()?,
        });
    }
    Ok(entries)
}

fn write_string<W: Write>(out: &mut W, s: &str) -> anyhow::Result<()> {
    out.write_u16::<LittleEndian>(s.len() as u16)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(input: &mut R) -> anyhow::Result<String> {
    let len = input.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod tests {
    use timeseries::Labels;

    use super::{
        read_index,
        write_index,
        IndexEntry,
    };

    #[test]
    fn test_index_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let entries = vec![
            IndexEntry {
                labels: Labels::from_pairs([("__name__", "up"), ("job", "node")]),
                chunk_offset: 0,
                num_samples: 120,
                min_time: 0,
                max_time: 3_599_000,
            },
            IndexEntry {
                labels: Labels::from_pairs([("__name__", "up"), ("job", "prom")]),
                chunk_offset: 1920,
                num_samples: 60,
                min_time: 0,
                max_time: 3_540_000,
            },
        ];
        write_index(dir.path(), &entries)?;
        assert_eq!(read_index(dir.path())?, entries);
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("index"), b"not an index file")?;
        assert!(read_index(dir.path()).is_err());
        Ok(())
    }
}
