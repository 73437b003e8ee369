use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use ndarray::Array3;

use crate::config::{CHANNELS, IMAGE_SIZE, NUM_CLASSES};
use crate::error::{Error, Result};

// One label byte followed by a 32x32 image stored as three planes (R, then G, then B), each in
// row-major order.
pub const IMAGE_BYTES: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
pub const RECORD_BYTES: usize = 1 + IMAGE_BYTES;

pub const TRAINING_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
pub const TEST_FILE: &str = "test_batch.bin";

// The archive from the CIFAR website unpacks into this directory.
const ARCHIVE_DIR: &str = "cifar-10-batches-bin";

// A single image and its label. Pixels are kept as raw bytes in [channel, row, column] layout;
// conversion to normalized floats happens when batches are built so the whole training set stays
// small in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Array3<u8>,
    pub label: u8,
}

impl Sample {
    // Serialize back into the on-disk record format.
    pub fn to_record_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RECORD_BYTES);
        bytes.push(self.label);
        bytes.extend(self.image.iter());
        bytes
    }
}

pub struct CifarData {
    pub training_data: Vec<Sample>,
    pub test_data: Vec<Sample>,
}

impl CifarData {
    pub fn load(
        dir: &Path,
        train_limit: Option<usize>,
        test_limit: Option<usize>,
    ) -> Result<CifarData> {
        let mut training_data = Vec::new();
        for name in TRAINING_FILES {
            if train_limit.is_some_and(|limit| training_data.len() >= limit) {
                break;
            }
            training_data.extend(load_file(&locate(dir, name)?)?);
        }
        if let Some(limit) = train_limit {
            training_data.truncate(limit);
        }

        let mut test_data = load_file(&locate(dir, TEST_FILE)?)?;
        if let Some(limit) = test_limit {
            test_data.truncate(limit);
        }

        tracing::info!(
            train = training_data.len(),
            test = test_data.len(),
            "loaded CIFAR-10 from {}",
            dir.display()
        );

        Ok(CifarData {
            training_data,
            test_data,
        })
    }
}

// Find a batch file either directly under `dir` or inside the unpacked archive directory,
// compressed or not.
fn locate(dir: &Path, name: &str) -> Result<PathBuf> {
    let gz_name = format!("{name}.gz");
    [
        dir.join(name),
        dir.join(&gz_name),
        dir.join(ARCHIVE_DIR).join(name),
        dir.join(ARCHIVE_DIR).join(&gz_name),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
    .ok_or_else(|| Error::MissingDatasetFile(dir.join(name)))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(Error::io(path))?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(Error::io(path))?;
    } else {
        let mut file = file;
        file.read_to_end(&mut bytes).map_err(Error::io(path))?;
    }
    Ok(bytes)
}

pub fn load_file(path: &Path) -> Result<Vec<Sample>> {
    let bytes = read_bytes(path)?;
    parse_records(path, &bytes)
}

pub fn parse_records(path: &Path, bytes: &[u8]) -> Result<Vec<Sample>> {
    let malformed = |reason: String| Error::MalformedDataset {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() % RECORD_BYTES != 0 {
        return Err(malformed(format!(
            "{} bytes is not a whole number of {RECORD_BYTES}-byte records",
            bytes.len()
        )));
    }

    bytes
        .chunks_exact(RECORD_BYTES)
        .enumerate()
        .map(|(index, record)| {
            let label = record[0];
            if usize::from(label) >= NUM_CLASSES {
                return Err(malformed(format!("record {index} has label {label}")));
            }
            let image = Array3::from_shape_vec(
                (CHANNELS, IMAGE_SIZE, IMAGE_SIZE),
                record[1..].to_vec(),
            )
            .map_err(|e| malformed(e.to_string()))?;
            Ok(Sample { image, label })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    fn sample(label: u8, fill: u8) -> Sample {
        Sample {
            image: Array3::from_elem((CHANNELS, IMAGE_SIZE, IMAGE_SIZE), fill),
            label,
        }
    }

    fn write_batch(path: &Path, samples: &[Sample]) {
        let bytes: Vec<u8> = samples.iter().flat_map(Sample::to_record_bytes).collect();
        std::fs::write(path, bytes).unwrap();
    }

    fn write_full_set(dir: &Path, per_file: usize) {
        for (i, name) in TRAINING_FILES.iter().enumerate() {
            let samples: Vec<_> = (0..per_file).map(|j| sample(((i + j) % 10) as u8, 7)).collect();
            write_batch(&dir.join(name), &samples);
        }
        write_batch(&dir.join(TEST_FILE), &[sample(3, 1), sample(4, 2)]);
    }

    #[test]
    fn parses_label_and_channel_planes() {
        let mut record = vec![6u8];
        record.extend(std::iter::repeat_n(10u8, 1024));
        record.extend(std::iter::repeat_n(20u8, 1024));
        record.extend(std::iter::repeat_n(30u8, 1024));

        let samples = parse_records(Path::new("mem"), &record).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, 6);
        assert_eq!(samples[0].image[[0, 31, 31]], 10);
        assert_eq!(samples[0].image[[1, 0, 0]], 20);
        assert_eq!(samples[0].image[[2, 16, 5]], 30);
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = vec![0u8; RECORD_BYTES + 5];
        let err = parse_records(Path::new("short.bin"), &bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedDataset { .. }));
    }

    #[test]
    fn rejects_out_of_range_label() {
        let mut bytes = vec![0u8; RECORD_BYTES];
        bytes[0] = 10;
        assert!(parse_records(Path::new("bad.bin"), &bytes).is_err());
    }

    #[test]
    fn loads_all_splits_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_full_set(dir.path(), 3);

        let data = CifarData::load(dir.path(), None, None).unwrap();
        assert_eq!(data.training_data.len(), 15);
        assert_eq!(data.test_data.len(), 2);

        let data = CifarData::load(dir.path(), Some(4), Some(1)).unwrap();
        assert_eq!(data.training_data.len(), 4);
        assert_eq!(data.test_data.len(), 1);
        assert_eq!(data.test_data[0].label, 3);
    }

    #[test]
    fn finds_gzipped_files_inside_archive_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join(ARCHIVE_DIR);
        std::fs::create_dir(&archive).unwrap();
        write_full_set(&archive, 1);

        // Replace the test batch with a compressed copy.
        let plain = std::fs::read(archive.join(TEST_FILE)).unwrap();
        std::fs::remove_file(archive.join(TEST_FILE)).unwrap();
        let mut encoder = GzEncoder::new(
            File::create(archive.join(format!("{TEST_FILE}.gz"))).unwrap(),
            Compression::default(),
        );
        encoder.write_all(&plain).unwrap();
        encoder.finish().unwrap();

        let data = CifarData::load(dir.path(), None, None).unwrap();
        assert_eq!(data.test_data.len(), 2);
        assert_eq!(data.test_data[1].image[[0, 0, 0]], 2);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CifarData::load(dir.path(), None, None).err().unwrap();
        assert!(matches!(err, Error::MissingDatasetFile(_)));
    }
}
