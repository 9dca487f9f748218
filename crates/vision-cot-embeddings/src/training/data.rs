//! Reasoning samples and data loading.
//!
//! Samples are `(question, reasoning, answer)` triples stored one JSON
//! object per line.

use std::io::{BufRead, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{VisionCotError, VisionCotResult};

/// One training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningSample {
    /// Prompt given to the backbone.
    pub question: String,
    /// Reasoning trace that is rendered and encoded by the teacher.
    pub reasoning: String,
    /// Final answer decoded after the end marker.
    pub answer: String,
}

impl ReasoningSample {
    pub fn new(
        question: impl Into<String>,
        reasoning: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            reasoning: reasoning.into(),
            answer: answer.into(),
        }
    }
}

/// A group of samples processed in one optimiser pass.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub samples: Vec<ReasoningSample>,
    pub batch_idx: usize,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shuffling, batching loader over in-memory samples.
pub struct SampleLoader {
    samples: Vec<ReasoningSample>,
    batch_size: usize,
    indices: Vec<usize>,
    position: usize,
    rng: StdRng,
}

impl SampleLoader {
    /// `batch_size` is raised to 1 if zero.
    pub fn new(samples: Vec<ReasoningSample>, batch_size: usize, seed: u64) -> Self {
        let indices: Vec<usize> = (0..samples.len()).collect();
        Self {
            samples,
            batch_size: batch_size.max(1),
            indices,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Reshuffle and rewind for a new epoch.
    pub fn shuffle_epoch(&mut self) {
        self.indices.shuffle(&mut self.rng);
        self.position = 0;
    }

    /// Next batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self, batch_idx: usize) -> Option<SampleBatch> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let samples = self.indices[self.position..end]
            .iter()
            .map(|&i| self.samples[i].clone())
            .collect();
        self.position = end;
        Some(SampleBatch { samples, batch_idx })
    }

    /// Split off `eval_fraction` of the samples (at least one when
    /// non-empty) into a second loader.
    pub fn train_eval_split(mut self, eval_fraction: f32, seed: u64) -> (SampleLoader, SampleLoader) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
        let eval_count = ((self.samples.len() as f32 * eval_fraction).ceil() as usize)
            .min(self.samples.len());
        let eval = self.samples.split_off(self.samples.len() - eval_count);
        (
            SampleLoader::new(self.samples, self.batch_size, seed),
            SampleLoader::new(eval, self.batch_size, seed.wrapping_add(1)),
        )
    }

    pub fn samples(&self) -> &[ReasoningSample] {
        &self.samples
    }
}

/// Write samples as JSONL.
pub fn save_samples_jsonl(samples: &[ReasoningSample], path: &Path) -> VisionCotResult<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    for sample in samples {
        let json = serde_json::to_string(sample).map_err(|e| VisionCotError::SerializationError {
            message: e.to_string(),
        })?;
        writeln!(writer, "{}", json)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read JSONL samples; blank lines are skipped.
///
/// # Errors
/// - `VisionCotError::SerializationError` naming the first bad line
pub fn load_samples_jsonl(path: &Path) -> VisionCotResult<Vec<ReasoningSample>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut samples = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: ReasoningSample =
            serde_json::from_str(&line).map_err(|e| VisionCotError::SerializationError {
                message: format!("{}:{}: {}", path.display(), lineno + 1, e),
            })?;
        samples.push(sample);
    }
    Ok(samples)
}

/// Small arithmetic word problems with step-by-step reasoning.
pub fn arithmetic_samples() -> Vec<ReasoningSample> {
    vec![
        ReasoningSample::new(
            "Tom has 3 bags with 4 apples each and buys 6 more apples at $1 each. \
             He sells all apples for $1 each. How much money does he make?",
            "Step 1: 3 bags * 4 apples = 12 apples.\n\
             Step 2: 12 + 6 = 18 apples.\n\
             Step 3: Each apple sells for $1, so 18 * $1 = $18.\n\
             Step 4: Therefore, the answer is $18.",
            "$18",
        ),
        ReasoningSample::new(
            "A train travels 60 km per hour for 2 hours, then 40 km per hour for 1 hour. \
             How far does it travel?",
            "Step 1: 60 * 2 = 120 km.\n\
             Step 2: 40 * 1 = 40 km.\n\
             Step 3: 120 + 40 = 160 km.\n\
             Step 4: Therefore, the answer is 160 km.",
            "160 km",
        ),
        ReasoningSample::new(
            "Sara reads 15 pages a day for 4 days and 10 pages on the fifth day. \
             How many pages does she read?",
            "Step 1: 15 * 4 = 60 pages.\n\
             Step 2: 60 + 10 = 70 pages.\n\
             Step 3: Therefore, the answer is 70.",
            "70",
        ),
        ReasoningSample::new(
            "A box holds 12 eggs. How many eggs are in 5 boxes minus 7 broken eggs?",
            "Step 1: 12 * 5 = 60 eggs.\n\
             Step 2: 60 - 7 = 53 eggs.\n\
             Step 3: Therefore, the answer is 53.",
            "53",
        ),
    ]
}
