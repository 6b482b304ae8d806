//! Keyword conditioning: vocabulary, prompt parsing and the keyword encoder.
//!
//! ```text
//! "deep, Punchy 808"  ─→ ["deep", "punchy", "808"] ─→ vocab lookup ─→ {2, 17}
//! {2, 17}  ─→ mean(embedding[2], embedding[17]) ─→ Linear(64→256) ─→ cond
//! {}       ─→ null_embedding (learned, never passed through the projection)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::Deserialize;

use crate::Result;

/// Minimum keyword frequency for inclusion in the vocabulary.
pub const DEFAULT_MIN_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Sorted, deduplicated keyword list with index lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct MetadataRow {
    filename: String,
    keywords: String,
}

/// Split a comma-separated keyword cell into normalized keywords.
fn split_keywords(cell: &str) -> impl Iterator<Item = String> + '_ {
    cell.split(',')
        .map(|kw| kw.trim().to_lowercase())
        .filter(|kw| !kw.is_empty())
}

impl Vocabulary {
    /// Use `words` in the given order; duplicates keep their first index.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::default();
        for word in words {
            let word = word.into();
            if !vocab.index.contains_key(&word) {
                vocab.index.insert(word.clone(), vocab.words.len());
                vocab.words.push(word);
            }
        }
        vocab
    }

    /// Count keywords across samples and keep those seen at least
    /// `min_count` times, sorted lexicographically.
    pub fn from_keyword_lists<I, S>(lists: I, min_count: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for cell in lists {
            for kw in split_keywords(cell.as_ref()) {
                *counts.entry(kw).or_default() += 1;
            }
        }
        Self::new(
            counts
                .into_iter()
                .filter(|(_, c)| *c >= min_count)
                .map(|(kw, _)| kw),
        )
    }

    /// Build from a CSV with `filename` and `keywords` columns.
    pub fn from_metadata_csv(path: &Path, min_count: usize) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut cells = Vec::new();
        for row in reader.deserialize::<MetadataRow>() {
            cells.push(row?.keywords);
        }
        Ok(Self::from_keyword_lists(cells, min_count))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn get(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    /// Indices of the known keywords in a comma-separated metadata cell,
    /// in cell order. Unknown keywords are skipped.
    pub fn indices_for_keywords(&self, cell: &str) -> Vec<usize> {
        split_keywords(cell).filter_map(|kw| self.get(&kw)).collect()
    }

    /// Parse a free-text prompt into sorted, deduplicated vocabulary
    /// indices. Tokens are split on whitespace and commas and lowercased;
    /// unmatched tokens are dropped.
    pub fn parse_prompt(&self, prompt: &str) -> Vec<usize> {
        let lowered = prompt.replace(',', " ").to_lowercase();
        let matched: BTreeSet<usize> = lowered
            .split_whitespace()
            .filter_map(|tok| self.get(tok))
            .collect();
        matched.into_iter().collect()
    }

    /// The words behind `indices`, skipping out-of-range entries.
    pub fn words_for(&self, indices: &[usize]) -> Vec<&str> {
        indices
            .iter()
            .filter_map(|&i| self.words.get(i).map(String::as_str))
            .collect()
    }
}

/// Map each metadata row's filename stem to its vocabulary indices.
pub fn keyword_index_by_stem(path: &Path, vocab: &Vocabulary) -> Result<HashMap<String, Vec<usize>>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut by_stem = HashMap::new();
    for row in reader.deserialize::<MetadataRow>() {
        let row = row?;
        let stem = Path::new(&row.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(row.filename.clone());
        by_stem.insert(stem, vocab.indices_for_keywords(&row.keywords));
    }
    Ok(by_stem)
}

// ---------------------------------------------------------------------------
// Keyword encoder
// ---------------------------------------------------------------------------

/// Keyword set → conditioning vector.
#[derive(Debug, Clone)]
pub struct KeywordEncoder {
    embedding: candle_nn::Embedding,
    proj: candle_nn::Linear,
    null_embedding: Tensor,
    vocab_size: usize,
}

impl KeywordEncoder {
    pub fn new(vocab_size: usize, embed_dim: usize, cond_dim: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, embed_dim, vb.pp("embedding"))?;
        let proj = candle_nn::linear(embed_dim, cond_dim, vb.pp("proj"))?;
        let null_embedding = vb.get_with_hints(
            cond_dim,
            "null_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            embedding,
            proj,
            null_embedding,
            vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The learned "no condition" vector, `[cond_dim]`.
    pub fn null_vector(&self) -> &Tensor {
        &self.null_embedding
    }

    /// Encode one keyword set to `[cond_dim]`. Indices outside the
    /// vocabulary are ignored; an empty set yields [`Self::null_vector`].
    pub fn encode_one(&self, indices: &[usize]) -> Result<Tensor> {
        let ids: Vec<u32> = indices
            .iter()
            .filter(|&&i| i < self.vocab_size)
            .map(|&i| i as u32)
            .collect();
        if ids.is_empty() {
            return Ok(self.null_embedding.clone());
        }
        let device: &Device = self.null_embedding.device();
        let ids = Tensor::new(ids.as_slice(), device)?;
        let mean = self.embedding.forward(&ids)?.mean_keepdim(0)?;
        Ok(self.proj.forward(&mean)?.squeeze(0)?)
    }

    /// Encode a batch of keyword sets to `[B, cond_dim]`.
    pub fn encode_batch(&self, batch: &[Vec<usize>]) -> Result<Tensor> {
        let rows = batch
            .iter()
            .map(|ids| self.encode_one(ids))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&rows, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;
    use std::io::Write;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn vec_of(t: &Tensor) -> Vec<f32> {
        t.to_vec1().unwrap()
    }

    #[test]
    fn vocabulary_filters_rare_and_sorts() {
        let rows = ["Deep, punchy", "deep,808", "punchy , deep", "deep", "DEEP", "808"];
        let vocab = Vocabulary::from_keyword_lists(rows, 2);
        assert_eq!(vocab.words(), &["808", "deep", "punchy"]);
        let vocab = Vocabulary::from_keyword_lists(rows, 5);
        assert_eq!(vocab.words(), &["deep"]);
    }

    #[test]
    fn prompt_indices_follow_vocab_order() {
        let vocab = Vocabulary::new(["a", "b", "c", "hit", "d", "e", "f", "house", "g"]);
        assert_eq!(vocab.get("hit"), Some(3));
        assert_eq!(vocab.get("house"), Some(7));
        assert_eq!(vocab.parse_prompt("hit house"), vec![3, 7]);
        assert_eq!(vocab.parse_prompt("House,HIT"), vec![3, 7]);
        assert_eq!(vocab.parse_prompt("house hit house unknown"), vec![3, 7]);
        assert!(vocab.parse_prompt("").is_empty());
        assert!(vocab.parse_prompt("nothing matches").is_empty());
    }

    #[test]
    fn metadata_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "filename,keywords").unwrap();
        writeln!(f, "a.wav,\"deep, punchy\"").unwrap();
        writeln!(f, "b.wav,deep").unwrap();
        writeln!(f, "c.wav,\"punchy,rare\"").unwrap();
        drop(f);

        let vocab = Vocabulary::from_metadata_csv(&path, 2).unwrap();
        assert_eq!(vocab.words(), &["deep", "punchy"]);
        let by_stem = keyword_index_by_stem(&path, &vocab).unwrap();
        assert_eq!(by_stem["a"], vec![0, 1]);
        assert_eq!(by_stem["c"], vec![1]);
    }

    #[test]
    fn null_vector_is_stable() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let enc = KeywordEncoder::new(10, 8, 16, vb).unwrap();

        let first = vec_of(&enc.encode_one(&[]).unwrap());
        let _ = enc.encode_one(&[1, 2]).unwrap();
        let second = vec_of(&enc.encode_one(&[]).unwrap());
        assert_eq!(first, second);
        assert_eq!(first, vec_of(enc.null_vector()));
        // Out-of-vocabulary indices collapse to the empty set.
        assert_eq!(first, vec_of(&enc.encode_one(&[10, 99]).unwrap()));

        // A different vocabulary size does not change what "no condition" is.
        let (mut vm2, vb2) = make_vb(&device);
        let enc2 = KeywordEncoder::new(3, 8, 16, vb2).unwrap();
        vm2.set_one("null_embedding", enc.null_vector()).unwrap();
        assert_eq!(first, vec_of(&enc2.encode_one(&[]).unwrap()));
    }

    #[test]
    fn encoding_is_order_independent() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let enc = KeywordEncoder::new(10, 8, 16, vb).unwrap();
        let a = vec_of(&enc.encode_one(&[1, 5, 7]).unwrap());
        let b = vec_of(&enc.encode_one(&[7, 1, 5]).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
        let batch = enc.encode_batch(&[vec![1, 5], vec![]]).unwrap();
        assert_eq!(batch.dims(), &[2, 16]);
    }
}
