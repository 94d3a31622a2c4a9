use anyhow::{Result, ensure};
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

pub const PAD_TOKEN: &str = "<pad>";
pub const CLS_TOKEN: &str = "<cls>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";
pub const DELIM_TOKEN: &str = "<DELIM>";

const PAD_ID: u32 = 0;
const CLS_ID: u32 = 1;
const EOS_ID: u32 = 2;
const UNK_ID: u32 = 3;
const SHARED_SPECIALS: [&str; 4] = [PAD_TOKEN, CLS_TOKEN, EOS_TOKEN, UNK_TOKEN];

/// Built-in protein vocabulary name and alphabet (IUPAC one-letter codes).
pub const RESIDUES: &str = "residues";
const RESIDUE_ALPHABET: &str = "ACDEFGHIKLMNPQRSTVWYXBZUO";

/// Built-in SMILES vocabulary name and alphabet.
pub const SMILES_CHARS: &str = "smiles-chars";
const SMILES_ALPHABET: &str = "CNOSPFIBrlcnosphHeaiglK()[]=#@+-\\/.%:*0123456789";

/// Token ids and attention mask for a batch, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub rows: usize,
    pub cols: usize,
}

/// Turns (protein, molecule) pairs into one `[protein, DELIM, molecule]` sequence per row.
pub trait PairEncoder: Send + Sync {
    fn encode_pairs(
        &self,
        proteins: &[&str],
        molecules: &[&str],
        prot_max_length: usize,
        mol_max_length: usize,
    ) -> Result<Encoding>;

    fn vocab_size(&self) -> usize;

    fn pad_token_id(&self) -> u32;

    fn delim_token_id(&self) -> u32;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Label ids that are never scored by the shifted-labels objective:
    /// protein-side tokens and the start/end/unknown markers. The delimiter
    /// is not among them.
    fn ignored_label_ids(&self) -> Vec<u32>;

    /// Row length produced for the given field lengths.
    fn sequence_length(&self, prot_max_length: usize, mol_max_length: usize) -> usize;
}

/// Character-level vocabulary.
#[derive(Debug, Clone)]
pub struct CharVocab {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl CharVocab {
    pub fn new(alphabet: &str) -> Self {
        let mut chars = Vec::new();
        let mut index = HashMap::new();
        for c in alphabet.chars() {
            if !index.contains_key(&c) {
                index.insert(c, chars.len() as u32);
                chars.push(c);
            }
        }
        Self { chars, index }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// Tokenizer for one side of the pair. Ids are local to the segment.
pub enum SegmentTokenizer {
    Chars(CharVocab),
    Pretrained(HfTokenizer),
}

impl SegmentTokenizer {
    /// Resolves a tokenizer name: a built-in alphabet, a tokenizer.json path,
    /// or a hub identifier.
    pub fn load(name: &str) -> Result<Self> {
        match name {
            RESIDUES => Ok(Self::Chars(CharVocab::new(RESIDUE_ALPHABET))),
            SMILES_CHARS => Ok(Self::Chars(CharVocab::new(SMILES_ALPHABET))),
            path if Path::new(path).exists() => {
                let inner = HfTokenizer::from_file(path).map_err(|e| anyhow::anyhow!("{}", e))?;
                Ok(Self::Pretrained(inner))
            }
            identifier => {
                let inner = HfTokenizer::from_pretrained(identifier, None)
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                Ok(Self::Pretrained(inner))
            }
        }
    }

    /// Local ids, `None` for characters outside a built-in alphabet.
    fn encode(&self, text: &str) -> Result<Vec<Option<u32>>> {
        match self {
            Self::Chars(vocab) => Ok(text.chars().map(|c| vocab.index.get(&c).copied()).collect()),
            Self::Pretrained(inner) => {
                let encoding = inner
                    .encode(text, false)
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                Ok(encoding.get_ids().iter().map(|&id| Some(id)).collect())
            }
        }
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        match self {
            Self::Chars(vocab) => {
                let mut chars = token.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => vocab.index.get(&c).copied(),
                    _ => None,
                }
            }
            Self::Pretrained(inner) => inner.token_to_id(token),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Chars(vocab) => vocab.len(),
            Self::Pretrained(inner) => inner.get_vocab_size(true),
        }
    }
}

/// Combined vocabulary: shared specials, protein segment, `<DELIM>`, molecule segment.
pub struct CombinedTokenizer {
    protein: SegmentTokenizer,
    molecule: SegmentTokenizer,
    protein_offset: u32,
    delim_id: u32,
    molecule_offset: u32,
    vocab_size: usize,
}

impl CombinedTokenizer {
    pub fn new(protein: SegmentTokenizer, molecule: SegmentTokenizer) -> Self {
        let protein_offset = SHARED_SPECIALS.len() as u32;
        let delim_id = protein_offset + protein.vocab_size() as u32;
        let molecule_offset = delim_id + 1;
        let vocab_size = molecule_offset as usize + molecule.vocab_size();
        Self {
            protein,
            molecule,
            protein_offset,
            delim_id,
            molecule_offset,
            vocab_size,
        }
    }

    pub fn load(protein_tokenizer: &str, smiles_tokenizer: &str) -> Result<Self> {
        Ok(Self::new(
            SegmentTokenizer::load(protein_tokenizer)?,
            SegmentTokenizer::load(smiles_tokenizer)?,
        ))
    }

    /// Built-in residue and SMILES alphabets.
    pub fn builtin() -> Self {
        Self::new(
            SegmentTokenizer::Chars(CharVocab::new(RESIDUE_ALPHABET)),
            SegmentTokenizer::Chars(CharVocab::new(SMILES_ALPHABET)),
        )
    }

    fn encode_row(
        &self,
        protein: &str,
        molecule: &str,
        prot_max_length: usize,
        mol_max_length: usize,
        row: &mut Vec<u32>,
    ) -> Result<()> {
        let start = row.len();
        row.push(CLS_ID);
        row.extend(
            self.protein
                .encode(protein)?
                .into_iter()
                .take(prot_max_length)
                .map(|id| id.map_or(UNK_ID, |id| self.protein_offset + id)),
        );
        row.resize(start + 1 + prot_max_length, PAD_ID);
        row.push(self.delim_id);
        row.extend(
            self.molecule
                .encode(molecule)?
                .into_iter()
                .take(mol_max_length)
                .map(|id| id.map_or(UNK_ID, |id| self.molecule_offset + id)),
        );
        row.push(EOS_ID);
        row.resize(
            start + self.sequence_length(prot_max_length, mol_max_length),
            PAD_ID,
        );
        Ok(())
    }
}

impl PairEncoder for CombinedTokenizer {
    fn encode_pairs(
        &self,
        proteins: &[&str],
        molecules: &[&str],
        prot_max_length: usize,
        mol_max_length: usize,
    ) -> Result<Encoding> {
        ensure!(
            proteins.len() == molecules.len(),
            "got {} proteins but {} molecules",
            proteins.len(),
            molecules.len()
        );
        let cols = self.sequence_length(prot_max_length, mol_max_length);
        let mut input_ids = Vec::with_capacity(proteins.len() * cols);
        for (protein, molecule) in proteins.iter().zip(molecules) {
            self.encode_row(
                protein,
                molecule,
                prot_max_length,
                mol_max_length,
                &mut input_ids,
            )?;
        }
        let attention_mask = input_ids.iter().map(|&id| u32::from(id != PAD_ID)).collect();
        Ok(Encoding {
            input_ids,
            attention_mask,
            rows: proteins.len(),
            cols,
        })
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn pad_token_id(&self) -> u32 {
        PAD_ID
    }

    fn delim_token_id(&self) -> u32 {
        self.delim_id
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        if let Some(pos) = SHARED_SPECIALS.iter().position(|&s| s == token) {
            return Some(pos as u32);
        }
        if token == DELIM_TOKEN {
            return Some(self.delim_id);
        }
        self.molecule
            .token_to_id(token)
            .map(|id| self.molecule_offset + id)
            .or_else(|| {
                self.protein
                    .token_to_id(token)
                    .map(|id| self.protein_offset + id)
            })
    }

    fn ignored_label_ids(&self) -> Vec<u32> {
        let mut ids = vec![CLS_ID, EOS_ID, UNK_ID];
        ids.extend(self.protein_offset..self.delim_id);
        ids
    }

    fn sequence_length(&self, prot_max_length: usize, mol_max_length: usize) -> usize {
        prot_max_length + mol_max_length + 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_layout() {
        let tokenizer = CombinedTokenizer::builtin();
        let residues = CharVocab::new(RESIDUE_ALPHABET).len();
        let smiles = CharVocab::new(SMILES_ALPHABET).len();

        assert_eq!(tokenizer.pad_token_id(), 0);
        assert_eq!(tokenizer.token_to_id(PAD_TOKEN), Some(0));
        assert_eq!(tokenizer.delim_token_id(), 4 + residues as u32);
        assert_eq!(
            tokenizer.token_to_id(DELIM_TOKEN),
            Some(tokenizer.delim_token_id())
        );
        assert_eq!(tokenizer.vocab_size(), 5 + residues + smiles);
    }

    #[test]
    fn test_row_layout_and_padding() {
        let tokenizer = CombinedTokenizer::builtin();
        let encoding = tokenizer
            .encode_pairs(&["MK", "MKTA"], &["CCO", "C"], 4, 3)
            .unwrap();
        assert_eq!(encoding.rows, 2);
        assert_eq!(encoding.cols, 10);

        let delim = tokenizer.delim_token_id();
        let first = &encoding.input_ids[..10];
        assert_eq!(first[0], CLS_ID);
        assert_eq!(&first[3..5], &[PAD_ID, PAD_ID]);
        assert_eq!(first[5], delim);
        assert_eq!(first[9], EOS_ID);

        let second = &encoding.input_ids[10..];
        assert_eq!(second[5], delim);
        assert_eq!(second[7], EOS_ID);
        assert_eq!(&second[8..], &[PAD_ID, PAD_ID]);
        assert_eq!(&encoding.attention_mask[10..], &[1, 1, 1, 1, 1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_truncation_and_unknown_characters() {
        let tokenizer = CombinedTokenizer::builtin();
        let encoding = tokenizer.encode_pairs(&["MKJ"], &["CCCCC"], 3, 2).unwrap();
        assert_eq!(encoding.cols, 8);
        assert_eq!(encoding.input_ids[3], UNK_ID);
        assert_eq!(encoding.input_ids[4], tokenizer.delim_token_id());
        assert_eq!(encoding.input_ids[7], EOS_ID);
    }

    #[test]
    fn test_ignored_label_ids_keep_delimiter() {
        let tokenizer = CombinedTokenizer::builtin();
        let ignored = tokenizer.ignored_label_ids();
        assert!(!ignored.contains(&tokenizer.delim_token_id()));
        assert!(ignored.contains(&CLS_ID));
        assert!(ignored.contains(&EOS_ID));
        assert!(ignored.contains(&tokenizer.token_to_id("M").unwrap()));

        let encoding = tokenizer.encode_pairs(&["A"], &["c"], 1, 1).unwrap();
        let aromatic_carbon = encoding.input_ids[3];
        assert!(!ignored.contains(&aromatic_carbon));
    }

    #[test]
    fn test_mismatched_batch_is_rejected() {
        let tokenizer = CombinedTokenizer::builtin();
        assert!(tokenizer.encode_pairs(&["A", "C"], &["C"], 2, 2).is_err());
    }
}
