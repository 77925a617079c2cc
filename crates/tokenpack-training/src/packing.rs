//! Fixed-size sequence packing for causal language modeling.
//!
//! Records are concatenated per field in input order and sliced into
//! consecutive, non-overlapping blocks of exactly `block_size` values. The
//! trailing remainder that does not fill a block is dropped (never padded) and
//! reported in [`PackStats`]. A `labels` column is synthesized as an owned copy
//! of the primary field's blocks.

use crate::dataset::{TokenId, TokenizedBatch};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_BLOCK_SIZE: usize = 2048;
pub const DEFAULT_PRIMARY_FIELD: &str = "input_ids";
pub const DEFAULT_LABELS_FIELD: &str = "labels";
pub const DEFAULT_BATCH_RECORDS: usize = 1000;

/// One packed training example for a single field.
pub type Block = Vec<TokenId>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackOptions {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_primary_field")]
    pub primary_field: String,
    #[serde(default = "default_labels_field")]
    pub labels_field: String,
    /// Reject batches whose fields disagree on length within a record.
    #[serde(default)]
    pub strict_field_lengths: bool,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_primary_field() -> String {
    DEFAULT_PRIMARY_FIELD.to_string()
}

fn default_labels_field() -> String {
    DEFAULT_LABELS_FIELD.to_string()
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            primary_field: default_primary_field(),
            labels_field: default_labels_field(),
            strict_field_lengths: false,
        }
    }
}

impl PackOptions {
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self { block_size, ..Self::default() }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.block_size == 0 {
            return Err(TrainingError::InvalidConfig("block_size must be >= 1".to_string()));
        }
        if self.primary_field.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("primary_field is required".to_string()));
        }
        if self.labels_field.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("labels_field is required".to_string()));
        }
        if self.primary_field == self.labels_field {
            return Err(TrainingError::InvalidConfig(format!(
                "labels_field must differ from primary_field ('{}')",
                self.primary_field
            )));
        }
        Ok(())
    }
}

/// How record batches are grouped before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PackingPolicy {
    /// Pack the dataset as one stream; only the final remainder is dropped.
    Global,
    /// Pack every `batch_records` records independently; each batch drops its own remainder.
    PerBatch { batch_records: usize },
}

impl Default for PackingPolicy {
    fn default() -> Self {
        Self::Global
    }
}

impl PackingPolicy {
    pub fn validate(&self) -> TrainingResult<()> {
        if let Self::PerBatch { batch_records: 0 } = self {
            return Err(TrainingError::InvalidConfig("batch_records must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Token accounting for one or more pack calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackStats {
    /// Primary-field tokens consumed.
    pub total_tokens: u64,
    /// Tokens that ended up in a block.
    pub retained_tokens: u64,
    /// Trailing tokens that did not fill a block.
    pub dropped_tokens: u64,
    pub blocks: u64,
}

impl PackStats {
    pub fn merge(&mut self, other: &Self) {
        self.total_tokens += other.total_tokens;
        self.retained_tokens += other.retained_tokens;
        self.dropped_tokens += other.dropped_tokens;
        self.blocks += other.blocks;
    }
}

/// Output of the packer: field name to blocks, including the synthesized labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBatch {
    block_size: usize,
    primary_field: String,
    labels_field: String,
    columns: BTreeMap<String, Vec<Block>>,
}

impl PackedBatch {
    /// An empty packed batch with the given input fields (labels are added).
    #[must_use]
    pub fn empty<'a>(options: &PackOptions, fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut columns: BTreeMap<String, Vec<Block>> =
            fields.into_iter().map(|f| (f.to_string(), Vec::new())).collect();
        columns.insert(options.labels_field.clone(), Vec::new());
        Self {
            block_size: options.block_size,
            primary_field: options.primary_field.clone(),
            labels_field: options.labels_field.clone(),
            columns,
        }
    }

    /// Reassemble a packed batch from persisted columns, checking block shape.
    pub fn from_parts(
        block_size: usize,
        primary_field: String,
        labels_field: String,
        columns: BTreeMap<String, Vec<Block>>,
    ) -> TrainingResult<Self> {
        if block_size == 0 {
            return Err(TrainingError::InvalidConfig("block_size must be >= 1".to_string()));
        }
        let expected = columns
            .get(&primary_field)
            .ok_or_else(|| TrainingError::Packing(format!("missing primary column '{primary_field}'")))?
            .len();
        if !columns.contains_key(&labels_field) {
            return Err(TrainingError::Packing(format!("missing labels column '{labels_field}'")));
        }
        for (field, blocks) in &columns {
            if blocks.len() != expected {
                return Err(TrainingError::Packing(format!(
                    "column '{field}' has {} blocks, expected {expected}",
                    blocks.len()
                )));
            }
            if let Some(idx) = blocks.iter().position(|b| b.len() != block_size) {
                return Err(TrainingError::Packing(format!(
                    "column '{field}' block[{idx}] has {} values, expected {block_size}",
                    blocks[idx].len()
                )));
            }
        }
        Ok(Self { block_size, primary_field, labels_field, columns })
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn primary_field(&self) -> &str {
        &self.primary_field
    }

    #[must_use]
    pub fn labels_field(&self) -> &str {
        &self.labels_field
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.columns.get(&self.primary_field).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_blocks() == 0
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    #[must_use]
    pub fn column(&self, field: &str) -> Option<&[Block]> {
        self.columns.get(field).map(Vec::as_slice)
    }

    #[must_use]
    pub fn primary(&self) -> &[Block] {
        self.column(&self.primary_field).unwrap_or_default()
    }

    #[must_use]
    pub fn labels(&self) -> &[Block] {
        self.column(&self.labels_field).unwrap_or_default()
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, Vec<Block>> {
        &self.columns
    }

    #[must_use]
    pub fn into_columns(self) -> BTreeMap<String, Vec<Block>> {
        self.columns
    }

    /// Concatenation of every block of `field`, in order.
    #[must_use]
    pub fn flatten(&self, field: &str) -> Vec<TokenId> {
        self.column(field).map(|blocks| blocks.concat()).unwrap_or_default()
    }

    /// Append the blocks of `other`. Both batches must share block size and fields.
    pub fn extend(&mut self, other: Self) -> TrainingResult<()> {
        if other.block_size != self.block_size {
            return Err(TrainingError::Packing(format!(
                "cannot merge block_size {} into block_size {}",
                other.block_size, self.block_size
            )));
        }
        if !other.columns.keys().eq(self.columns.keys()) {
            return Err(TrainingError::Packing("cannot merge packed batches with different fields".to_string()));
        }
        for (field, blocks) in other.columns {
            if let Some(column) = self.columns.get_mut(&field) {
                column.extend(blocks);
            }
        }
        Ok(())
    }

    fn assemble(options: &PackOptions, mut columns: BTreeMap<String, Vec<Block>>) -> Self {
        let labels = columns.get(&options.primary_field).cloned().unwrap_or_default();
        columns.insert(options.labels_field.clone(), labels);
        Self {
            block_size: options.block_size,
            primary_field: options.primary_field.clone(),
            labels_field: options.labels_field.clone(),
            columns,
        }
    }
}

/// Stateless packer over a single batch.
#[derive(Debug, Clone)]
pub struct SequencePacker {
    options: PackOptions,
}

impl SequencePacker {
    pub fn new(options: PackOptions) -> TrainingResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    #[must_use]
    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Pack one batch into fixed-size blocks.
    ///
    /// The trailing `total % block_size` primary tokens (and the matching
    /// values of every other field) are dropped and counted in the stats.
    pub fn pack(&self, batch: &TokenizedBatch) -> TrainingResult<(PackedBatch, PackStats)> {
        self.check_batch(batch)?;

        let flat: BTreeMap<&str, Vec<TokenId>> = batch
            .columns()
            .iter()
            .map(|(field, records)| (field.as_str(), records.concat()))
            .collect();
        let total = flat.get(self.options.primary_field.as_str()).map_or(0, Vec::len);
        check_flat_lengths(flat.iter().map(|(f, v)| (*f, v.len())), &self.options.primary_field, total)?;

        let n_blocks = total / self.options.block_size;
        let columns = flat
            .into_iter()
            .map(|(field, values)| (field.to_string(), slice_blocks(&values, self.options.block_size, n_blocks)))
            .collect();

        let retained = n_blocks * self.options.block_size;
        let stats = PackStats {
            total_tokens: total as u64,
            retained_tokens: retained as u64,
            dropped_tokens: (total - retained) as u64,
            blocks: n_blocks as u64,
        };
        if stats.dropped_tokens > 0 {
            debug!(
                dropped = stats.dropped_tokens,
                block_size = self.options.block_size,
                "dropped trailing tokens that do not fill a block"
            );
        }

        Ok((PackedBatch::assemble(&self.options, columns), stats))
    }

    fn check_batch(&self, batch: &TokenizedBatch) -> TrainingResult<()> {
        batch.validate(&self.options.primary_field, self.options.strict_field_lengths)?;
        if batch.column(&self.options.labels_field).is_some() {
            return Err(TrainingError::Packing(format!(
                "input already has a '{}' field; it would be overwritten by the synthesized labels",
                self.options.labels_field
            )));
        }
        Ok(())
    }
}

/// Pack a batch with `options`, rejecting invalid options before any work.
pub fn pack_batch(batch: &TokenizedBatch, options: &PackOptions) -> TrainingResult<(PackedBatch, PackStats)> {
    SequencePacker::new(options.clone())?.pack(batch)
}

/// Packer that carries each batch's remainder into the next push.
///
/// Feeding batches one at a time produces exactly the blocks a single pack
/// over their concatenation would, without buffering the whole dataset.
#[derive(Debug)]
pub struct StreamingPacker {
    packer: SequencePacker,
    carry: BTreeMap<String, Vec<TokenId>>,
    stats: PackStats,
}

impl StreamingPacker {
    pub fn new(options: PackOptions) -> TrainingResult<Self> {
        Ok(Self { packer: SequencePacker::new(options)?, carry: BTreeMap::new(), stats: PackStats::default() })
    }

    /// Primary-field tokens waiting for the next push.
    #[must_use]
    pub fn pending_tokens(&self) -> usize {
        self.carry.get(&self.packer.options.primary_field).map_or(0, Vec::len)
    }

    /// Push a batch and return the blocks it completed.
    pub fn push(&mut self, batch: &TokenizedBatch) -> TrainingResult<PackedBatch> {
        let options = &self.packer.options;
        self.packer.check_batch(batch)?;

        // A batch without records neither completes blocks nor fixes the field set.
        if batch.is_empty() {
            let fields: Vec<&str> = if self.carry.is_empty() {
                batch.fields().collect()
            } else {
                self.carry.keys().map(String::as_str).collect()
            };
            return Ok(PackedBatch::empty(options, fields));
        }

        if self.carry.is_empty() {
            self.carry = batch.fields().map(|f| (f.to_string(), Vec::new())).collect();
        } else if !batch.columns().keys().eq(self.carry.keys()) {
            return Err(TrainingError::Dataset(format!(
                "batch fields [{}] differ from earlier batches [{}]",
                batch.field_names().join(", "),
                self.carry.keys().cloned().collect::<Vec<_>>().join(", "),
            )));
        }

        let available = self.pending_tokens() + batch.flattened_len(&options.primary_field);
        check_flat_lengths(
            self.carry.iter().map(|(f, v)| (f.as_str(), v.len() + batch.flattened_len(f))),
            &options.primary_field,
            available,
        )?;

        for (field, records) in batch.columns() {
            if let Some(buffer) = self.carry.get_mut(field) {
                for record in records {
                    buffer.extend_from_slice(record);
                }
            }
        }

        let n_blocks = available / options.block_size;
        let retained = n_blocks * options.block_size;

        let mut columns = BTreeMap::new();
        for (field, buffer) in &mut self.carry {
            let blocks = slice_blocks(buffer, options.block_size, n_blocks);
            buffer.drain(..retained);
            columns.insert(field.clone(), blocks);
        }

        self.stats.total_tokens += batch.flattened_len(&options.primary_field) as u64;
        self.stats.retained_tokens += retained as u64;
        self.stats.blocks += n_blocks as u64;

        Ok(PackedBatch::assemble(options, columns))
    }

    /// Finish the stream; the still-pending tokens are reported as dropped.
    #[must_use]
    pub fn finish(self) -> PackStats {
        let mut stats = self.stats;
        stats.dropped_tokens += self.pending_tokens() as u64;
        stats
    }
}

/// Pack a whole dataset under `policy`.
pub fn pack_dataset(
    dataset: &TokenizedBatch,
    options: &PackOptions,
    policy: PackingPolicy,
) -> TrainingResult<(PackedBatch, PackStats)> {
    policy.validate()?;
    match policy {
        PackingPolicy::Global => pack_batch(dataset, options),
        PackingPolicy::PerBatch { batch_records } => pack_batches(dataset.chunks(batch_records), options, policy),
    }
}

/// Pack a sequence of batches under `policy`.
///
/// `Global` streams the batches through a [`StreamingPacker`]; `PerBatch`
/// packs every incoming batch independently, ignoring `batch_records`.
pub fn pack_batches<I>(batches: I, options: &PackOptions, policy: PackingPolicy) -> TrainingResult<(PackedBatch, PackStats)>
where
    I: IntoIterator<Item = TokenizedBatch>,
{
    policy.validate()?;
    let mut packed: Option<PackedBatch> = None;
    let mut stats = PackStats::default();
    let mut batch_count = 0usize;
    let batches = batches.into_iter().filter(|batch| !batch.is_empty());

    match policy {
        PackingPolicy::Global => {
            let mut stream = StreamingPacker::new(options.clone())?;
            for batch in batches {
                batch_count += 1;
                let part = stream.push(&batch)?;
                append(part, &mut packed)?;
            }
            stats = stream.finish();
        }
        PackingPolicy::PerBatch { .. } => {
            let packer = SequencePacker::new(options.clone())?;
            for batch in batches {
                batch_count += 1;
                let (part, part_stats) = packer.pack(&batch)?;
                stats.merge(&part_stats);
                append(part, &mut packed)?;
            }
        }
    }

    let packed = packed.unwrap_or_else(|| PackedBatch::empty(options, [options.primary_field.as_str()]));
    info!(
        batches = batch_count,
        blocks = stats.blocks,
        block_size = options.block_size,
        total_tokens = stats.total_tokens,
        dropped_tokens = stats.dropped_tokens,
        "packed dataset"
    );
    Ok((packed, stats))
}

fn append(part: PackedBatch, packed: &mut Option<PackedBatch>) -> TrainingResult<()> {
    match packed {
        Some(acc) => acc.extend(part),
        None => {
            *packed = Some(part);
            Ok(())
        }
    }
}

fn slice_blocks(values: &[TokenId], block_size: usize, n_blocks: usize) -> Vec<Block> {
    values.chunks_exact(block_size).take(n_blocks).map(<[TokenId]>::to_vec).collect()
}

/// Every field must flatten to as many values as the primary field, or the
/// blocks of different fields would not line up.
fn check_flat_lengths<'a>(
    lengths: impl IntoIterator<Item = (&'a str, usize)>,
    primary_field: &str,
    expected: usize,
) -> TrainingResult<()> {
    for (field, len) in lengths {
        if len != expected {
            return Err(TrainingError::Packing(format!(
                "field '{field}' flattens to {len} values but '{primary_field}' flattens to {expected}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TokenizedRecord;

    fn batch_of(lengths: &[usize]) -> TokenizedBatch {
        let mut next = 0u32;
        let records = lengths.iter().map(|&len| {
            let ids: Vec<TokenId> = (next..next + len as u32).collect();
            next += len as u32;
            let mut record = TokenizedRecord::new();
            record.insert("attention_mask".to_string(), vec![1; len]);
            record.insert("input_ids".to_string(), ids);
            record
        });
        TokenizedBatch::from_records(records.collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_5000_tokens_into_2048_blocks() {
        let batch = batch_of(&[1000, 2500, 1500]);
        let (packed, stats) = pack_batch(&batch, &PackOptions::default()).unwrap();

        assert_eq!(packed.num_blocks(), 2);
        assert!(packed.primary().iter().all(|b| b.len() == 2048));
        assert_eq!(packed.column("attention_mask").unwrap().len(), 2);
        assert_eq!(packed.labels(), packed.primary());
        assert_eq!(stats.retained_tokens, 4096);
        assert_eq!(stats.dropped_tokens, 904);
        assert_eq!(stats.total_tokens, 5000);
    }

    #[test]
    fn test_short_input_yields_zero_blocks() {
        let (packed, stats) = pack_batch(&batch_of(&[60, 40]), &PackOptions::default()).unwrap();

        assert!(packed.is_empty());
        for field in ["input_ids", "attention_mask", "labels"] {
            assert_eq!(packed.column(field).unwrap().len(), 0, "field {field}");
        }
        assert_eq!(stats.dropped_tokens, 100);
    }

    #[test]
    fn test_zero_block_size_rejected_before_processing() {
        let options = PackOptions::with_block_size(0);
        let err = pack_batch(&batch_of(&[10]), &options).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidConfig(_)));
        assert!(SequencePacker::new(options).is_err());
    }

    #[test]
    fn test_labels_are_independent_copies() {
        let (packed, _) = pack_batch(&batch_of(&[8]), &PackOptions::with_block_size(4)).unwrap();
        let mut columns = packed.into_columns();
        columns.get_mut("input_ids").unwrap()[0][0] = 999;
        assert_eq!(columns["labels"][0][0], 0);
    }

    #[test]
    fn test_existing_labels_field_is_rejected() {
        let mut record = TokenizedRecord::new();
        record.insert("input_ids".to_string(), vec![1, 2]);
        record.insert("labels".to_string(), vec![1, 2]);
        let batch = TokenizedBatch::from_records(vec![record]).unwrap();
        assert!(pack_batch(&batch, &PackOptions::with_block_size(2)).is_err());
    }

    #[test]
    fn test_flattened_length_mismatch_is_rejected() {
        let mut a = TokenizedRecord::new();
        a.insert("input_ids".to_string(), vec![1, 2, 3]);
        a.insert("attention_mask".to_string(), vec![1, 1]);
        let batch = TokenizedBatch::from_records(vec![a]).unwrap();
        let err = pack_batch(&batch, &PackOptions::with_block_size(2)).unwrap_err();
        assert!(matches!(err, TrainingError::Packing(_)));
    }

    #[test]
    fn test_lenient_mode_does_not_detect_per_record_misalignment() {
        let mut a = TokenizedRecord::new();
        a.insert("input_ids".to_string(), vec![1, 2, 3]);
        a.insert("attention_mask".to_string(), vec![1, 1]);
        let mut b = TokenizedRecord::new();
        b.insert("input_ids".to_string(), vec![4]);
        b.insert("attention_mask".to_string(), vec![1, 1]);
        let batch = TokenizedBatch::from_records(vec![a, b]).unwrap();

        let lenient = PackOptions::with_block_size(2);
        assert!(pack_batch(&batch, &lenient).is_ok());

        let strict = PackOptions { strict_field_lengths: true, ..lenient };
        assert!(pack_batch(&batch, &strict).is_err());
    }

    #[test]
    fn test_streaming_matches_single_global_pack() {
        let dataset = batch_of(&[7, 3, 11, 2, 9, 5, 1]);
        let options = PackOptions::with_block_size(6);
        let (expected, expected_stats) = pack_batch(&dataset, &options).unwrap();

        let (streamed, streamed_stats) = pack_batches(dataset.chunks(2), &options, PackingPolicy::Global).unwrap();
        assert_eq!(streamed, expected);
        assert_eq!(streamed_stats, expected_stats);
    }

    #[test]
    fn test_streaming_packer_carries_remainder() {
        let options = PackOptions::with_block_size(4);
        let mut stream = StreamingPacker::new(options).unwrap();

        let first = stream.push(&batch_of(&[3])).unwrap();
        assert_eq!(first.num_blocks(), 0);
        assert_eq!(stream.pending_tokens(), 3);

        let second = stream.push(&batch_of(&[6])).unwrap();
        assert_eq!(second.num_blocks(), 2);
        assert_eq!(second.primary()[0], vec![0, 1, 2, 0]);
        assert_eq!(stream.pending_tokens(), 1);

        let stats = stream.finish();
        assert_eq!(stats.total_tokens, 9);
        assert_eq!(stats.retained_tokens, 8);
        assert_eq!(stats.dropped_tokens, 1);
    }

    #[test]
    fn test_streaming_packer_skips_empty_leading_batch() {
        let mut columns = BTreeMap::new();
        columns.insert("input_ids".to_string(), Vec::new());
        columns.insert("token_type_ids".to_string(), Vec::new());
        let empty = TokenizedBatch::from_columns(columns).unwrap();
        assert!(empty.is_empty());

        let mut stream = StreamingPacker::new(PackOptions::with_block_size(2)).unwrap();
        let nothing = stream.push(&empty).unwrap();
        assert_eq!(nothing.num_blocks(), 0);
        assert_eq!(stream.pending_tokens(), 0);

        // The field set comes from the first batch that has records.
        let packed = stream.push(&batch_of(&[3, 2])).unwrap();
        assert_eq!(packed.num_blocks(), 2);
        assert_eq!(packed.fields().collect::<Vec<_>>(), vec!["attention_mask", "input_ids", "labels"]);
        assert_eq!(stream.pending_tokens(), 1);

        // Empty batches after that still report the established fields.
        let later = stream.push(&empty).unwrap();
        assert_eq!(later.fields().collect::<Vec<_>>(), vec!["attention_mask", "input_ids", "labels"]);

        let stats = stream.finish();
        assert_eq!(stats.total_tokens, 5);
        assert_eq!(stats.dropped_tokens, 1);
    }

    #[test]
    fn test_pack_batches_ignores_empty_batches() {
        let mut columns = BTreeMap::new();
        columns.insert("input_ids".to_string(), Vec::new());
        let empty = TokenizedBatch::from_columns(columns).unwrap();

        let options = PackOptions::with_block_size(2);
        let batches = vec![empty, batch_of(&[4])];
        let (packed, stats) = pack_batches(batches, &options, PackingPolicy::Global).unwrap();
        assert_eq!(packed.num_blocks(), 2);
        assert_eq!(stats.dropped_tokens, 0);
    }

    #[test]
    fn test_per_batch_policy_drops_remainder_per_batch() {
        let dataset = batch_of(&[5, 5, 5, 5]);
        let options = PackOptions::with_block_size(4);

        let (per_batch, per_batch_stats) =
            pack_dataset(&dataset, &options, PackingPolicy::PerBatch { batch_records: 1 }).unwrap();
        assert_eq!(per_batch.num_blocks(), 4);
        assert_eq!(per_batch_stats.dropped_tokens, 4);

        let (global, global_stats) = pack_dataset(&dataset, &options, PackingPolicy::Global).unwrap();
        assert_eq!(global.num_blocks(), 5);
        assert_eq!(global_stats.dropped_tokens, 0);
    }

    #[test]
    fn test_per_batch_zero_records_rejected() {
        let policy = PackingPolicy::PerBatch { batch_records: 0 };
        assert!(pack_dataset(&batch_of(&[4]), &PackOptions::with_block_size(2), policy).is_err());
    }

    #[test]
    fn test_from_parts_rejects_wrong_block_length() {
        let mut columns = BTreeMap::new();
        columns.insert("input_ids".to_string(), vec![vec![1, 2], vec![3]]);
        columns.insert("labels".to_string(), vec![vec![1, 2], vec![3]]);
        assert!(PackedBatch::from_parts(2, "input_ids".to_string(), "labels".to_string(), columns).is_err());
    }

    mod packing_properties {
        use super::*;
        use proptest::prelude::*;

        fn lengths() -> impl Strategy<Value = Vec<usize>> {
            prop::collection::vec(0usize..40, 1..12)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_blocks_have_exact_size_and_count(lens in lengths(), block_size in 1usize..16) {
                let batch = batch_of(&lens);
                let total: usize = lens.iter().sum();
                let (packed, stats) = pack_batch(&batch, &PackOptions::with_block_size(block_size)).unwrap();

                for field in packed.fields() {
                    let blocks = packed.column(field).unwrap();
                    prop_assert_eq!(blocks.len(), total / block_size);
                    prop_assert!(blocks.iter().all(|b| b.len() == block_size));
                }
                prop_assert_eq!(stats.blocks as usize, total / block_size);
            }

            #[test]
            fn prop_labels_equal_primary(lens in lengths(), block_size in 1usize..16) {
                let (packed, _) = pack_batch(&batch_of(&lens), &PackOptions::with_block_size(block_size)).unwrap();
                prop_assert_eq!(packed.labels(), packed.primary());
            }

            #[test]
            fn prop_remainder_law(lens in lengths(), block_size in 1usize..16) {
                let total: usize = lens.iter().sum();
                let (_, stats) = pack_batch(&batch_of(&lens), &PackOptions::with_block_size(block_size)).unwrap();
                prop_assert_eq!(stats.dropped_tokens, (total - stats.blocks as usize * block_size) as u64);
                prop_assert!((stats.dropped_tokens as usize) < block_size);
            }

            #[test]
            fn prop_output_is_prefix_of_input(lens in lengths(), block_size in 1usize..16) {
                let batch = batch_of(&lens);
                let (packed, _) = pack_batch(&batch, &PackOptions::with_block_size(block_size)).unwrap();
                for field in ["input_ids", "attention_mask"] {
                    let input = batch.column(field).map(|records| records.concat()).unwrap_or_default();
                    let output = packed.flatten(field);
                    prop_assert!(input.starts_with(&output));
                }
            }

            #[test]
            fn prop_repacking_is_idempotent(lens in lengths(), block_size in 1usize..16) {
                let options = PackOptions::with_block_size(block_size);
                let (packed, _) = pack_batch(&batch_of(&lens), &options).unwrap();

                let mut record = TokenizedRecord::new();
                record.insert("input_ids".to_string(), packed.flatten("input_ids"));
                record.insert("attention_mask".to_string(), packed.flatten("attention_mask"));
                let repacked_input = TokenizedBatch::from_records(vec![record]).unwrap();
                let (repacked, stats) = pack_batch(&repacked_input, &options).unwrap();

                prop_assert_eq!(&repacked, &packed);
                prop_assert_eq!(stats.dropped_tokens, 0);
            }

            #[test]
            fn prop_global_policy_ignores_batch_boundaries(
                lens in lengths(),
                block_size in 1usize..16,
                batch_records in 1usize..5,
            ) {
                let dataset = batch_of(&lens);
                let options = PackOptions::with_block_size(block_size);
                let (whole, whole_stats) = pack_batch(&dataset, &options).unwrap();
                let (streamed, streamed_stats) =
                    pack_batches(dataset.chunks(batch_records), &options, PackingPolicy::Global).unwrap();

                prop_assert_eq!(streamed.primary(), whole.primary());
                prop_assert_eq!(streamed_stats, whole_stats);
            }
        }
    }
}
