//! Dataset and tokenizer contracts, plus batch prefetching
//!
//! The training loop is agnostic to where text comes from: a split is a
//! newline-delimited file of `<label>\t<text>` records, and tokenization is
//! an external service behind the [`Tokenizer`] trait. The only concurrency
//! in the crate lives here: an optional background producer thread that
//! prefetches record batches into a bounded channel.

use crate::{Error, Result};
use ndarray::Array2;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::JoinHandle;

/// One dataset record: raw text plus an integer class label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledText {
    pub text: String,
    pub label: usize,
}

/// A split of labeled text records for conditional generation
#[derive(Debug, Clone, Default)]
pub struct ConditionalDataset {
    records: Vec<LabeledText>,
}

impl ConditionalDataset {
    pub fn new(records: Vec<LabeledText>) -> Self {
        Self { records }
    }

    /// Load a split from a newline-delimited file, one `<label>\t<text>`
    /// record per line. Blank lines are skipped; a malformed line is a
    /// dataset error (fail fast, before training begins).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (label, text) = line.split_once('\t').ok_or_else(|| {
                Error::Dataset(format!(
                    "{}:{}: expected '<label>\\t<text>'",
                    path.display(),
                    lineno + 1
                ))
            })?;
            let label: usize = label.trim().parse().map_err(|_| {
                Error::Dataset(format!(
                    "{}:{}: label '{label}' is not an integer",
                    path.display(),
                    lineno + 1
                ))
            })?;
            records.push(LabeledText {
                text: text.to_string(),
                label,
            });
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LabeledText] {
        &self.records
    }

    /// Iterate the split in fixed-size record batches
    ///
    /// With `drop_last` a trailing partial batch is discarded, matching the
    /// training loader's behavior.
    pub fn batches(
        &self,
        batch_size: usize,
        drop_last: bool,
    ) -> impl Iterator<Item = Vec<LabeledText>> + '_ {
        self.records
            .chunks(batch_size)
            .filter(move |c| !drop_last || c.len() == batch_size)
            .map(<[LabeledText]>::to_vec)
    }
}

/// Padded token-id batch produced by a tokenizer
#[derive(Debug, Clone)]
pub struct Encoding {
    /// `[batch, seq]` token ids, padded to a common length
    pub ids: Array2<u32>,
    /// `[batch, seq]`, `true` for real (non-padding) tokens
    pub mask: Array2<bool>,
}

/// Tokenizer contract: batch encoding with padding, decoding, and a
/// designated end-of-sequence id
pub trait Tokenizer {
    /// Encode a batch of texts, truncating to `max_length` and padding to
    /// the longest remaining sequence.
    fn encode_batch(&self, texts: &[String], max_length: usize) -> Encoding;

    fn decode(&self, ids: &[u32]) -> String;

    fn eos_id(&self) -> u32;
}

/// Background batch producer feeding a bounded queue
///
/// Fire and forget: the thread runs until the split is exhausted or the
/// consumer goes away, whichever comes first. The main loop consumes it
/// synchronously as an iterator; there is no cancellation beyond drop.
pub struct BatchPrefetcher {
    rx: Option<Receiver<Vec<LabeledText>>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchPrefetcher {
    /// Spawn a producer over one pass of the dataset
    ///
    /// `depth` bounds the queue; the producer blocks once it is `depth`
    /// batches ahead of the consumer.
    pub fn spawn(
        dataset: ConditionalDataset,
        batch_size: usize,
        drop_last: bool,
        depth: usize,
    ) -> Self {
        let (tx, rx) = sync_channel(depth.max(1));
        let handle = std::thread::spawn(move || {
            for chunk in dataset.records.chunks(batch_size) {
                if drop_last && chunk.len() != batch_size {
                    continue;
                }
                if tx.send(chunk.to_vec()).is_err() {
                    // Consumer dropped; stop producing.
                    break;
                }
            }
        });
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

impl Iterator for BatchPrefetcher {
    type Item = Vec<LabeledText>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref().and_then(|rx| rx.recv().ok())
    }
}

impl Drop for BatchPrefetcher {
    fn drop(&mut self) {
        // Disconnect first so a blocked producer unblocks, then join.
        drop(self.rx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn records(n: usize) -> Vec<LabeledText> {
        (0..n)
            .map(|i| LabeledText {
                text: format!("sentence number {i}"),
                label: i % 2,
            })
            .collect()
    }

    #[test]
    fn test_from_file() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "0\tthe movie was terrible").unwrap();
        writeln!(f, "1\ta quiet little gem").unwrap();
        writeln!(f).unwrap();

        let ds = ConditionalDataset::from_file(f.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.records()[0].label, 0);
        assert_eq!(ds.records()[1].text, "a quiet little gem");
    }

    #[test]
    fn test_from_file_rejects_malformed_line() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "no tab separator here").unwrap();
        assert!(matches!(
            ConditionalDataset::from_file(f.path()),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn test_from_file_rejects_bad_label() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "positive\tgreat film").unwrap();
        assert!(matches!(
            ConditionalDataset::from_file(f.path()),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn test_batches_drop_last() {
        let ds = ConditionalDataset::new(records(7));
        let full: Vec<_> = ds.batches(3, true).collect();
        assert_eq!(full.len(), 2);
        assert!(full.iter().all(|b| b.len() == 3));

        let all: Vec<_> = ds.batches(3, false).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].len(), 1);
    }

    #[test]
    fn test_prefetcher_yields_same_batches_as_direct_iteration() {
        let ds = ConditionalDataset::new(records(10));
        let direct: Vec<_> = ds.batches(4, true).collect();
        let prefetched: Vec<_> = BatchPrefetcher::spawn(ds, 4, true, 2).collect();
        assert_eq!(direct, prefetched);
    }

    #[test]
    fn test_prefetcher_early_drop_does_not_hang() {
        let ds = ConditionalDataset::new(records(100));
        let mut pf = BatchPrefetcher::spawn(ds, 2, true, 1);
        assert!(pf.next().is_some());
        drop(pf); // producer must unblock and exit
    }
}
