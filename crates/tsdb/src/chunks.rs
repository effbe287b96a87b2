//! The chunk segment holds every series' samples as consecutive runs of
//! fixed-width records: little-endian `i64` timestamp followed by the `f64`
//! value bits, 16 bytes per sample. The index addresses a run by byte offset
//! and sample count.

use std::{
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        BufWriter,
        Read,
        Seek,
        SeekFrom,
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
use timeseries::Sample;

use crate::{
    CHUNKS_DIRNAME,
    CHUNK_SEGMENT_FILENAME,
};

pub const SAMPLE_RECORD_BYTES: u64 = 16;

pub struct ChunkWriter {
    out: BufWriter<File>,
    offset: u64,
}

impl ChunkWriter {
    pub fn create(block_dir: &Path) -> anyhow::Result<Self> {
        let chunks_dir = block_dir.join(CHUNKS_DIRNAME);
        fs::create_dir_all(&chunks_dir)?;
        let path = chunks_dir.join(CHUNK_SEGMENT_FILENAME);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            offset: 0,
        })
    }

    /// Appends one series' samples, returning the byte offset of the run.
    pub fn write_run(&mut self, samples: &[Sample]) -> anyhow::Result<u64> {
        let offset = self.offset;
        for sample in samples {
            self.out.write_i64::<LittleEndian>(sample.timestamp_ms)?;
            self.out.write_f64::<LittleEndian>(sample.value)?;
        }
        self.offset += samples.len() as u64 * SAMPLE_RECORD_BYTES;
        Ok(offset)
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

pub struct ChunkReader {
    file: File,
}

impl ChunkReader {
    pub fn open(block_dir: &Path) -> anyhow::Result<Self> {
        let path = block_dir.join(CHUNKS_DIRNAME).join(CHUNK_SEGMENT_FILENAME);
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn read_run(&mut self, offset: u64, num_samples: u32) -> anyhow::Result<Vec<Sample>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; num_samples as usize * SAMPLE_RECORD_BYTES as usize];
        self.file.read_exact(&mut raw)?;
        let mut cursor = raw.as_slice();
        let mut samples = Vec::with_capacity(num_samples as usize);
        for _ in 0..num_samples {
            let timestamp_ms = cursor.read_i64::<LittleEndian>()?;
            let value = cursor.read_f64::<LittleEndian>()?;
            samples.push(Sample::new(timestamp_ms, value));
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use timeseries::Sample;

    use super::{
        ChunkReader,
        ChunkWriter,
    };

    #[test]
    fn test_run_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = ChunkWriter::create(dir.path())?;
        let first = vec![Sample::new(1, 0.5), Sample::new(2, f64::NAN)];
        let second = vec![Sample::new(10, -3.25)];
        let off_first = writer.write_run(&first)?;
        let off_second = writer.write_run(&second)?;
        writer.finish()?;

        let mut reader = ChunkReader::open(dir.path())?;
        let got = reader.read_run(off_second, 1)?;
        assert_eq!(got, second);
        let got = reader.read_run(off_first, 2)?;
        assert_eq!(got[0], first[0]);
        assert_eq!(got[1].timestamp_ms, 2);
        assert!(got[1].value.is_nan());
        Ok(())
    }
}
