//! Token batch construction for causal LM training
//!
//! Builds the shifted input/target pair from a tokenized batch: input is every
//! token but the last, target is every token but the first, and the attention
//! mask is shifted along with the targets so that masked cross-entropy sees
//! exactly the valid target positions.

use crate::data::{LabeledText, Tokenizer};
use crate::{Error, Result};
use ndarray::{s, Array2};

/// One training batch: shifted ids, target-aligned mask, one-hot labels
///
/// The mask is optional; an absent mask means every position is valid.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// `[batch, seq-1]` input token ids
    pub input_ids: Array2<u32>,
    /// `[batch, seq-1]` next-token targets
    pub target_ids: Array2<u32>,
    /// `[batch, seq-1]` validity mask aligned with `target_ids`
    pub mask: Option<Array2<bool>>,
    /// `[batch, class_count]` one-hot class labels
    pub label_onehot: Array2<f32>,
}

impl TokenBatch {
    /// Tokenize records and build the shifted batch
    pub fn from_records<T: Tokenizer + ?Sized>(
        records: &[LabeledText],
        tokenizer: &T,
        max_length: usize,
        class_count: usize,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::Dataset("empty record batch".to_string()));
        }
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let enc = tokenizer.encode_batch(&texts, max_length);
        let cols = enc.ids.ncols();
        if cols < 2 {
            return Err(Error::Dataset(format!(
                "sequences of length {cols} cannot be shifted into input/target pairs"
            )));
        }
        if enc.mask.dim() != enc.ids.dim() {
            return Err(Error::Model(format!(
                "tokenizer mask shape {:?} does not match ids shape {:?}",
                enc.mask.dim(),
                enc.ids.dim()
            )));
        }

        let input_ids = enc.ids.slice(s![.., ..cols - 1]).to_owned();
        let target_ids = enc.ids.slice(s![.., 1..]).to_owned();
        let mask = enc.mask.slice(s![.., 1..]).to_owned();

        let labels: Vec<usize> = records.iter().map(|r| r.label).collect();
        let label_onehot = one_hot(&labels, class_count)?;

        Ok(Self {
            input_ids,
            target_ids,
            mask: Some(mask),
            label_onehot,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// Encode integer labels as one-hot rows
///
/// A label outside `0..class_count` is a dataset error.
pub fn one_hot(labels: &[usize], class_count: usize) -> Result<Array2<f32>> {
    let mut out = Array2::zeros((labels.len(), class_count));
    for (i, &label) in labels.iter().enumerate() {
        if label >= class_count {
            return Err(Error::Dataset(format!(
                "label {label} out of range for {class_count} classes"
            )));
        }
        out[[i, label]] = 1.0;
    }
    Ok(out)
}
