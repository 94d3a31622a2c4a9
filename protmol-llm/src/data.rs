use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::collate::{Collator, EncodedBatch};
use crate::error::DataError;
use crate::io::PairColumns;

/// A (protein, molecule) pair borrowed from the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample<'a> {
    pub protein: &'a str,
    pub molecule: &'a str,
}

/// Protein sequences and SMILES strings aligned by index.
#[derive(Debug, Clone, Default)]
pub struct PairedSequenceDataset {
    proteins: Vec<String>,
    molecules: Vec<String>,
}

impl PairedSequenceDataset {
    pub fn new(proteins: Vec<String>, molecules: Vec<String>) -> Result<Self, DataError> {
        if proteins.len() != molecules.len() {
            return Err(DataError::LengthMismatch {
                proteins: proteins.len(),
                molecules: molecules.len(),
            });
        }
        Ok(Self {
            proteins,
            molecules,
        })
    }

    pub fn len(&self) -> usize {
        self.proteins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proteins.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<Sample<'_>, DataError> {
        match (self.proteins.get(index), self.molecules.get(index)) {
            (Some(protein), Some(molecule)) => Ok(Sample { protein, molecule }),
            _ => Err(DataError::IndexOutOfRange {
                index,
                len: self.len(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample<'_>> {
        self.proteins
            .iter()
            .zip(&self.molecules)
            .map(|(protein, molecule)| Sample { protein, molecule })
    }

    /// Longest protein and molecule, in characters.
    pub fn max_lengths(&self) -> (usize, usize) {
        self.iter().fold((0, 0), |(p, m), s| {
            (
                p.max(s.protein.chars().count()),
                m.max(s.molecule.chars().count()),
            )
        })
    }

    /// Keeps `n` randomly chosen pairs, or everything when `n >= len`.
    pub fn subsample<R: Rng>(self, n: usize, rng: &mut R) -> Self {
        if n >= self.len() {
            return self;
        }
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices.truncate(n);

        let Self {
            mut proteins,
            mut molecules,
        } = self;
        let mut kept_proteins = Vec::with_capacity(n);
        let mut kept_molecules = Vec::with_capacity(n);
        for idx in indices {
            kept_proteins.push(std::mem::take(&mut proteins[idx]));
            kept_molecules.push(std::mem::take(&mut molecules[idx]));
        }
        Self {
            proteins: kept_proteins,
            molecules: kept_molecules,
        }
    }
}

impl TryFrom<PairColumns> for PairedSequenceDataset {
    type Error = DataError;

    fn try_from(columns: PairColumns) -> Result<Self, Self::Error> {
        Self::new(columns.proteins, columns.molecules)
    }
}

/// Disjoint train / validation index sets covering the whole dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

/// Randomly partitions `0..len` with `floor(validation_split * len)` indices held out.
pub fn random_split<R: Rng>(len: usize, validation_split: f64, rng: &mut R) -> Split {
    let val_size = ((validation_split * len as f64).floor() as usize).min(len);
    let train_size = len - val_size;

    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    let val = indices.split_off(train_size);
    Split {
        train: indices,
        val,
    }
}

/// RNG for subsampling and splitting, seeded when a seed is configured.
pub fn split_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Walks a fixed index order in batches, collating each one on demand.
///
/// The order never changes between epochs.
pub struct DataLoader {
    dataset: Arc<PairedSequenceDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    collator: Collator,
    current_pos: usize,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<PairedSequenceDataset>,
        indices: Vec<usize>,
        batch_size: usize,
        collator: Collator,
    ) -> Self {
        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            collator,
            current_pos: 0,
        }
    }

    /// Replaces the index order, e.g. with this rank's shard.
    pub fn with_indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = indices;
        self.current_pos = 0;
        self
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn reset(&mut self) {
        self.current_pos = 0;
    }

    /// Batches per pass; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn next_batch(&mut self) -> Result<Option<EncodedBatch>> {
        if self.current_pos >= self.indices.len() {
            return Ok(None);
        }

        let end = (self.current_pos + self.batch_size).min(self.indices.len());
        let samples = self.indices[self.current_pos..end]
            .iter()
            .map(|&idx| self.dataset.get(idx))
            .collect::<Result<Vec<_>, _>>()?;
        self.current_pos = end;

        Ok(Some(self.collator.collate(&samples)?))
    }

    pub fn iter(&mut self) -> DataLoaderIterator<'_> {
        self.reset();
        DataLoaderIterator { loader: self }
    }
}

pub struct DataLoaderIterator<'a> {
    loader: &'a mut DataLoader,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Result<EncodedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.loader.next_batch().transpose()
    }
}
