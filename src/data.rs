use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor, TensorData},
};
use rayon::prelude::*;
use safetensors::{tensor::TensorView, Dtype};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AeError, Result};

/// Contiguous train / validation / test row ranges over `[0, N)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPartition {
    pub train: Range<usize>,
    pub valid: Range<usize>,
    pub test: Range<usize>,
}

impl IndexPartition {
    pub fn total(&self) -> usize {
        self.test.end
    }
}

/// Splits `n` records into train, validation and test ranges, in that order.
///
/// The train range holds `round(n * train_frac)` records and the validation
/// range `round(n * val_frac)`; the test range takes whatever remains. Rounding
/// is half-to-even.
pub fn split(n: usize, train_frac: f64, val_frac: f64) -> Result<IndexPartition> {
    if n == 0 {
        return Err(AeError::InvalidSplit("record count must be > 0".to_string()));
    }
    if !(train_frac.is_finite() && val_frac.is_finite()) || train_frac <= 0.0 || val_frac <= 0.0 {
        return Err(AeError::InvalidSplit(format!(
            "fractions must be positive, got train {train_frac} valid {val_frac}"
        )));
    }
    if train_frac + val_frac >= 1.0 {
        return Err(AeError::InvalidSplit(format!(
            "fractions must sum below 1, got {}",
            train_frac + val_frac
        )));
    }

    let a = ((n as f64 * train_frac).round_ties_even() as usize).min(n);
    let b = (a + (n as f64 * val_frac).round_ties_even() as usize).min(n);

    Ok(IndexPartition {
        train: 0..a,
        valid: a..b,
        test: b..n,
    })
}

/// Addresses a contiguous span of leading rows and the full extent of every
/// trailing dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceDescriptor {
    pub rows: Range<usize>,
    pub trailing: Vec<usize>,
}

impl SliceDescriptor {
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.trailing.len() + 1);
        shape.push(self.rows.len());
        shape.extend_from_slice(&self.trailing);
        shape
    }

    /// Fetches the described rows from `source`, in their original order.
    pub fn apply<S: RecordSource + ?Sized>(&self, source: &S) -> Result<RecordArray> {
        let source_shape = source.shape();
        if source_shape.get(1..) != Some(self.trailing.as_slice()) {
            return Err(AeError::ShapeMismatch(format!(
                "slice expects trailing dims {:?}, source has {:?}",
                self.trailing, source_shape
            )));
        }
        let data = source.read_rows(self.rows.clone())?;
        RecordArray::new(self.shape(), data)
    }
}

/// Builds one descriptor per partition range for a dataset of `shape`.
pub fn slicer(shape: &[usize], partition: &IndexPartition) -> [SliceDescriptor; 3] {
    let trailing = shape.get(1..).unwrap_or_default().to_vec();
    let describe = |rows: &Range<usize>| SliceDescriptor {
        rows: rows.clone(),
        trailing: trailing.clone(),
    };
    [
        describe(&partition.train),
        describe(&partition.valid),
        describe(&partition.test),
    ]
}

/// Read-only access to an `(N, H, W, C)` record array.
pub trait RecordSource {
    fn shape(&self) -> &[usize];

    /// Returns the values of `rows`, row-major.
    fn read_rows(&self, rows: Range<usize>) -> Result<Vec<f32>>;

    fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_len(&self) -> usize {
        self.shape().iter().skip(1).product()
    }
}

fn check_rows(rows: &Range<usize>, len: usize) -> Result<()> {
    if rows.start > rows.end || rows.end > len {
        return Err(AeError::RowsOutOfRange {
            rows: rows.clone(),
            len,
        });
    }
    Ok(())
}

/// In-memory row-major f32 array.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl RecordArray {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected != data.len() {
            return Err(AeError::ShapeMismatch(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let row_len = self.row_len();
        self.data.get(index * row_len..(index + 1) * row_len)
    }

    /// `[H, W, C]` of one record.
    pub fn record_shape(&self) -> Result<[usize; 3]> {
        match self.shape.as_slice() {
            [_, h, w, c] => Ok([*h, *w, *c]),
            other => Err(AeError::ShapeMismatch(format!(
                "expected (N, H, W, C) records, got {other:?}"
            ))),
        }
    }

    /// Writes the array as the single named tensor of a safetensors file.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P, name: &str) -> Result<()> {
        let bytes: Vec<u8> = self.data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::F32, self.shape.clone(), &bytes)?;
        safetensors::serialize_to_file([(name, view)], &None, path.as_ref())?;
        Ok(())
    }
}

impl RecordSource for RecordArray {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read_rows(&self, rows: Range<usize>) -> Result<Vec<f32>> {
        check_rows(&rows, self.len())?;
        let row_len = self.row_len();
        Ok(self.data[rows.start * row_len..rows.end * row_len].to_vec())
    }
}

/// Upper bound on the JSON header, matching the limit of the safetensors crate.
const MAX_HEADER_LEN: u64 = 100_000_000;

#[derive(Debug, Deserialize)]
struct HeaderEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Read-only handle on one named dataset inside a safetensors container.
///
/// Only the header is parsed on open; rows are read on demand so a slice
/// touches nothing but its own byte span.
#[derive(Debug, Clone)]
pub struct SafeTensorsFile {
    path: PathBuf,
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    data_start: u64,
}

impl SafeTensorsFile {
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len > MAX_HEADER_LEN || header_len > file_len.saturating_sub(8) {
            return Err(AeError::CorruptContainer(format!(
                "header length {header_len} exceeds file size {file_len}"
            )));
        }
        let mut header = vec![0u8; header_len as usize];
        file.read_exact(&mut header)?;

        let mut entries: HashMap<String, serde_json::Value> = serde_json::from_slice(&header)?;
        let entry = entries
            .remove(name)
            .ok_or_else(|| AeError::DatasetNotFound(name.to_string()))?;
        let entry: HeaderEntry = serde_json::from_value(entry)?;

        let element_size: usize = match entry.dtype {
            Dtype::F32 => 4,
            Dtype::F64 => 8,
            other => {
                return Err(AeError::UnsupportedDtype(format!(
                    "dataset '{name}' has dtype {other:?}, expected F32 or F64"
                )))
            }
        };
        let expected = entry
            .shape
            .iter()
            .try_fold(element_size, |acc, &d| acc.checked_mul(d));
        let [begin, end] = entry.data_offsets;
        if begin > end || expected != Some(end - begin) {
            return Err(AeError::CorruptContainer(format!(
                "dataset '{name}' stores bytes {begin}..{end} for shape {:?}",
                entry.shape
            )));
        }
        let data_start = 8 + header_len;
        if data_start.saturating_add(end as u64) > file_len {
            return Err(AeError::CorruptContainer(format!(
                "dataset '{name}' ends at byte {} past file size {file_len}",
                data_start.saturating_add(end as u64)
            )));
        }

        debug!(
            path = %path.display(),
            dataset = name,
            shape = ?entry.shape,
            dtype = ?entry.dtype,
            "opened dataset"
        );

        Ok(Self {
            path,
            name: name.to_string(),
            dtype: entry.dtype,
            shape: entry.shape,
            data_start: data_start + begin as u64,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn element_size(&self) -> usize {
        match self.dtype {
            Dtype::F64 => 8,
            _ => 4,
        }
    }
}

impl RecordSource for SafeTensorsFile {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read_rows(&self, rows: Range<usize>) -> Result<Vec<f32>> {
        check_rows(&rows, self.len())?;
        let row_bytes = self.row_len() * self.element_size();

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.data_start + (rows.start * row_bytes) as u64))?;
        let mut bytes = vec![0u8; rows.len() * row_bytes];
        file.read_exact(&mut bytes)?;

        let values = match self.dtype {
            Dtype::F64 => bytes
                .par_chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect(),
            _ => bytes
                .par_chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        };
        Ok(values)
    }
}

/// Train, validation and test partitions loaded into memory.
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub partition: IndexPartition,
    pub train: RecordArray,
    pub valid: RecordArray,
    pub test: RecordArray,
}

impl DataSplits {
    pub fn load<S: RecordSource + ?Sized>(source: &S, train_frac: f64, val_frac: f64) -> Result<Self> {
        let partition = split(source.len(), train_frac, val_frac)?;
        let [trn, vld, tst] = slicer(source.shape(), &partition);

        let splits = Self {
            train: trn.apply(source)?,
            valid: vld.apply(source)?,
            test: tst.apply(source)?,
            partition,
        };

        info!(
            "📈 Split {} records: {} train, {} validation, {} test",
            splits.partition.total(),
            splits.train.len(),
            splits.valid.len(),
            splits.test.len()
        );

        Ok(splits)
    }

    pub fn record_shape(&self) -> Result<[usize; 3]> {
        self.train.record_shape()
    }
}

#[derive(Debug, Clone)]
pub struct RecordItem {
    pub values: Vec<f32>,
}

/// Burn view over a `RecordArray`, one item per record.
#[derive(Debug, Clone)]
pub struct RecordDataset {
    records: RecordArray,
}

impl RecordDataset {
    pub fn new(records: RecordArray) -> Self {
        Self { records }
    }
}

impl Dataset<RecordItem> for RecordDataset {
    fn get(&self, index: usize) -> Option<RecordItem> {
        self.records.row(index).map(|values| RecordItem {
            values: values.to_vec(),
        })
    }

    fn len(&self) -> usize {
        RecordSource::len(&self.records)
    }
}

#[derive(Debug, Clone)]
pub struct AutoencoderBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub records: Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub struct RecordBatcher {
    pub record_shape: [usize; 3],
}

impl RecordBatcher {
    pub fn new(record_shape: [usize; 3]) -> Self {
        Self { record_shape }
    }
}

/// Stacks NHWC rows into an NCHW tensor.
pub fn records_to_tensor<B: Backend>(
    values: Vec<f32>,
    batch_size: usize,
    [height, width, channels]: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let data = TensorData::new(values, [batch_size, height, width, channels]);
    Tensor::<B, 4>::from_data(data, device).permute([0, 3, 1, 2])
}

impl<B: Backend> Batcher<B, RecordItem, AutoencoderBatch<B>> for RecordBatcher {
    fn batch(&self, items: Vec<RecordItem>, device: &B::Device) -> AutoencoderBatch<B> {
        let batch_size = items.len();
        let mut values = Vec::with_capacity(batch_size * self.record_shape.iter().product::<usize>());
        for item in items {
            values.extend(item.values);
        }

        AutoencoderBatch {
            records: records_to_tensor(values, batch_size, self.record_shape, device),
        }
    }
}
