//! Corpus loading for probing and SAE evaluation
//!
//! The bias-in-bios corpus is read as rows of `{hard_text, profession, gender}`
//! from JSON Lines, a JSON array or Parquet, one file per split. The
//! evaluation driver reads plain `{text}` rows.
//!
//! Hub datasets are fetched from the Parquet export every HuggingFace dataset
//! carries on the [`PARQUET_REVISION`] branch.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use hf_hub::{api::sync::Api, Repo, RepoType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classes::{class_name, gender_name, ClassId, FEMALE, MALE};
use crate::error::{ProbeError, Result};

/// Hub branch holding the Parquet export of a dataset
pub const PARQUET_REVISION: &str = "refs/convert/parquet";

/// Bias-in-bios dataset on the hub
pub const BIAS_IN_BIOS_DATASET: &str = "LabHC/bias_in_bios";

/// Plain-text corpus used for SAE evaluation
pub const PILE_10K_DATASET: &str = "NeelNanda/pile-10k";

/// Path of the first Parquet shard of `split` in the export
pub fn parquet_split_file(split: &str) -> String {
    format!("default/{split}/0000.parquet")
}

/// One labeled biography.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BioExample {
    pub hard_text: String,
    pub profession: ClassId,
    pub gender: u8,
}

/// Which split of the corpus to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Raw text row used by the SAE evaluation driver
#[derive(Debug, Deserialize)]
struct TextRow {
    text: String,
}

/// Bias-in-bios corpus with train and test splits
#[derive(Debug, Clone, Default)]
pub struct BiasInBios {
    train: Vec<BioExample>,
    test: Vec<BioExample>,
}

impl BiasInBios {
    /// Build a corpus from in-memory splits
    pub fn new(train: Vec<BioExample>, test: Vec<BioExample>) -> Self {
        Self { train, test }
    }

    /// Load both splits from local files
    pub fn load(train_path: &Path, test_path: &Path) -> Result<Self> {
        let train = read_rows(train_path)?;
        let test = read_rows(test_path)?;
        info!(
            "Loaded bias-in-bios: {} train, {} test examples",
            train.len(),
            test.len()
        );
        Ok(Self { train, test })
    }

    /// Fetch both splits from a Hugging Face dataset repository at `revision`
    pub fn from_hub(
        dataset_id: &str,
        revision: &str,
        train_file: &str,
        test_file: &str,
    ) -> Result<Self> {
        let train_path = fetch_dataset_file(dataset_id, revision, train_file)?;
        let test_path = fetch_dataset_file(dataset_id, revision, test_file)?;
        Self::load(&train_path, &test_path)
    }

    /// Examples of one split
    pub fn split(&self, split: Split) -> &[BioExample] {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }

    /// Number of examples per (profession, gender) cell
    pub fn label_counts(&self, split: Split) -> BTreeMap<(ClassId, u8), usize> {
        let mut counts = BTreeMap::new();
        for example in self.split(split) {
            *counts
                .entry((example.profession, example.gender))
                .or_insert(0) += 1;
        }
        counts
    }

    /// Log the (profession x gender) label distribution of a split
    pub fn log_label_distribution(&self, split: Split) {
        info!("Label distribution ({} split):", split.name());
        for ((profession, gender), count) in self.label_counts(split) {
            let name = class_name(profession).unwrap_or("unknown");
            info!("  {name} ({}): {count}", gender_name(gender));
        }
    }

    /// Total number of examples over both splits
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.test.is_empty()
    }
}

/// Read the first `n_inputs` texts of a `{text}` corpus, each cut to
/// `context_length` characters.
pub fn load_text_inputs(path: &Path, n_inputs: usize, context_length: usize) -> Result<Vec<String>> {
    let rows: Vec<TextRow> = read_rows(path)?;
    Ok(truncate_inputs(
        rows.into_iter().map(|row| row.text),
        n_inputs,
        context_length,
    ))
}

/// Keep the first `n_inputs` texts, each cut to `context_length` characters
pub fn truncate_inputs(
    texts: impl IntoIterator<Item = String>,
    n_inputs: usize,
    context_length: usize,
) -> Vec<String> {
    texts
        .into_iter()
        .take(n_inputs)
        .map(|text| text.chars().take(context_length).collect())
        .collect()
}

/// Download a file from a Hugging Face dataset repository
pub fn fetch_dataset_file(dataset_id: &str, revision: &str, filename: &str) -> Result<PathBuf> {
    let api = Api::new().map_err(|e| ProbeError::Hub(e.to_string()))?;
    let repo = api.repo(Repo::with_revision(
        dataset_id.to_string(),
        RepoType::Dataset,
        revision.to_string(),
    ));
    info!("Fetching {filename} from dataset {dataset_id}@{revision}");
    repo.get(filename)
        .map_err(|e| ProbeError::Hub(format!("failed to download {filename}: {e}")))
}

/// Read rows from a `.parquet` file, else a JSON array or JSON Lines file
fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if path.extension().is_some_and(|ext| ext == "parquet") {
        return read_parquet_rows(path);
    }
    let content = std::fs::read_to_string(path)?;
    parse_rows(&content)
}

/// Decode every record of a Parquet file through its JSON form.
/// Columns absent from `T` are ignored.
fn read_parquet_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let reader = SerializedFileReader::new(File::open(path)?)?;
    let n_rows = usize::try_from(reader.metadata().file_metadata().num_rows()).unwrap_or(0);
    let mut rows = Vec::with_capacity(n_rows);
    for record in reader.get_row_iter(None)? {
        rows.push(serde_json::from_value(record?.to_json_value())?);
    }
    Ok(rows)
}

fn parse_rows<T: for<'de> Deserialize<'de>>(content: &str) -> Result<Vec<T>> {
    if content.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(content)?);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

/// Both gender values, in the order groups are concatenated
pub(crate) const GENDERS: [u8; 2] = [MALE, FEMALE];
