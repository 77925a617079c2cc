use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A token id (or per-token auxiliary value such as an attention mask bit).
pub type TokenId = u32;

/// One tokenized source record: field name to per-token values.
///
/// Every field of a record comes out of the same tokenization pass, so all
/// fields are expected to share one length.
pub type TokenizedRecord = BTreeMap<String, Vec<TokenId>>;

/// Stable identifier for a tokenized dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Columnar batch of tokenized records: field name to one sequence per record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenizedBatch {
    columns: BTreeMap<String, Vec<Vec<TokenId>>>,
}

impl TokenizedBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from columns. Every column must hold the same number of records.
    pub fn from_columns(columns: BTreeMap<String, Vec<Vec<TokenId>>>) -> TrainingResult<Self> {
        let batch = Self { columns };
        batch.check_record_counts()?;
        Ok(batch)
    }

    /// Build a batch from row-oriented records. All records must carry the same field set.
    pub fn from_records<I>(records: I) -> TrainingResult<Self>
    where
        I: IntoIterator<Item = TokenizedRecord>,
    {
        let mut batch = Self::new();
        for record in records {
            batch.push_record(record)?;
        }
        Ok(batch)
    }

    pub fn push_record(&mut self, record: TokenizedRecord) -> TrainingResult<()> {
        if record.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "record[{}] has no fields",
                self.num_records()
            )));
        }

        if self.columns.is_empty() {
            for (field, values) in record {
                self.columns.insert(field, vec![values]);
            }
            return Ok(());
        }

        if !record.keys().eq(self.columns.keys()) {
            return Err(TrainingError::Dataset(format!(
                "record[{}] fields [{}] do not match batch fields [{}]",
                self.num_records(),
                record.keys().cloned().collect::<Vec<_>>().join(", "),
                self.field_names().join(", "),
            )));
        }

        for (field, values) in record {
            if let Some(column) = self.columns.get_mut(&field) {
                column.push(values);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn num_records(&self) -> usize {
        self.columns.values().next().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_records() == 0
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    #[must_use]
    pub fn column(&self, field: &str) -> Option<&[Vec<TokenId>]> {
        self.columns.get(field).map(Vec::as_slice)
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, Vec<Vec<TokenId>>> {
        &self.columns
    }

    /// Total number of values in `field` once its records are concatenated.
    #[must_use]
    pub fn flattened_len(&self, field: &str) -> usize {
        self.columns
            .get(field)
            .map_or(0, |column| column.iter().map(Vec::len).sum())
    }

    /// Row view of record `idx`.
    #[must_use]
    pub fn record(&self, idx: usize) -> Option<TokenizedRecord> {
        if idx >= self.num_records() {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(field, column)| (field.clone(), column[idx].clone()))
                .collect(),
        )
    }

    /// Split into consecutive batches of at most `batch_records` records, preserving order.
    pub fn chunks(&self, batch_records: usize) -> impl Iterator<Item = TokenizedBatch> + '_ {
        let step = batch_records.max(1);
        (0..self.num_records()).step_by(step).map(move |start| {
            let end = (start + step).min(self.num_records());
            TokenizedBatch {
                columns: self
                    .columns
                    .iter()
                    .map(|(field, column)| (field.clone(), column[start..end].to_vec()))
                    .collect(),
            }
        })
    }

    /// Check the batch against the packer's input contract.
    ///
    /// The primary field must be present and every column must hold the same
    /// number of records. Per-record length agreement across fields is only
    /// checked when `strict` is set.
    pub fn validate(&self, primary_field: &str, strict: bool) -> TrainingResult<()> {
        if !self.columns.is_empty() && !self.columns.contains_key(primary_field) {
            return Err(TrainingError::Dataset(format!(
                "primary field '{primary_field}' is missing (fields: [{}])",
                self.field_names().join(", ")
            )));
        }
        self.check_record_counts()?;

        if strict {
            for idx in 0..self.num_records() {
                let mut lengths = self.columns.iter().map(|(field, column)| (field, column[idx].len()));
                if let Some((first_field, expected)) = lengths.next() {
                    if let Some((field, len)) = lengths.find(|(_, len)| *len != expected) {
                        return Err(TrainingError::Dataset(format!(
                            "record[{idx}] field '{field}' has {len} values but '{first_field}' has {expected}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_record_counts(&self) -> TrainingResult<()> {
        let expected = self.num_records();
        for (field, column) in &self.columns {
            if column.len() != expected {
                return Err(TrainingError::Dataset(format!(
                    "field '{field}' has {} records, expected {expected}",
                    column.len()
                )));
            }
        }
        Ok(())
    }
}

/// Where a tokenized dataset comes from (builder responsibility).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetSource {
    /// Pre-tokenized JSONL, one `TokenizedRecord` per line.
    TokenizedJsonl { path: PathBuf },
    /// Plain text files/directories run through a `Tokenizer`.
    TextFiles { paths: Vec<PathBuf> },
}

pub fn compute_dataset_id(batch: &TokenizedBatch) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for idx in 0..batch.num_records() {
        let record: BTreeMap<&str, &[TokenId]> = batch
            .columns()
            .iter()
            .map(|(field, column)| (field.as_str(), column[idx].as_slice()))
            .collect();
        hasher.update(serde_json::to_vec(&record)?);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_dataset(batch: &TokenizedBatch, primary_field: &str, strict: bool) -> TrainingResult<()> {
    if batch.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    batch.validate(primary_field, strict)
}
