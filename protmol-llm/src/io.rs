use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::error::DataError;

/// Opens a file and returns a buffered reader, decompressing `.gz` and
/// `.zst`/`.zstd` files based on their extension.
pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Protein and molecule columns read from a CSV file, aligned by row.
#[derive(Debug, Default)]
pub struct PairColumns {
    pub proteins: Vec<String>,
    pub molecules: Vec<String>,
}

/// Reads the two named columns of a headed CSV file.
///
/// Rows where either field is empty are skipped.
pub fn read_pair_columns<P: AsRef<Path>>(
    path: P,
    col_prots: &str,
    col_mols: &str,
) -> Result<PairColumns, DataError> {
    let reader = open_file(path)?;
    read_pair_columns_from(reader, col_prots, col_mols)
}

pub fn read_pair_columns_from<R: Read>(
    reader: R,
    col_prots: &str,
    col_mols: &str,
) -> Result<PairColumns, DataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| DataError::MissingColumn(name.to_string()))
    };
    let prot_idx = column(col_prots)?;
    let mol_idx = column(col_mols)?;

    let mut columns = PairColumns::default();
    for record in csv_reader.records() {
        let record = record?;
        let protein = record.get(prot_idx).unwrap_or("").trim();
        let molecule = record.get(mol_idx).unwrap_or("").trim();
        if protein.is_empty() || molecule.is_empty() {
            continue;
        }
        columns.proteins.push(protein.to_string());
        columns.molecules.push(molecule.to_string());
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "id,Target Sequence,Ligand SMILES\n1,MKTAYIAK,CCO\n2,GAVL,c1ccccc1\n3,,CC\n";

    #[test]
    fn test_read_plain_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv");
        std::fs::write(&path, CSV).unwrap();

        let columns = read_pair_columns(&path, "Target Sequence", "Ligand SMILES").unwrap();
        assert_eq!(columns.proteins, vec!["MKTAYIAK", "GAVL"]);
        assert_eq!(columns.molecules, vec!["CCO", "c1ccccc1"]);
    }

    #[test]
    fn test_read_gzip_csv() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv.gz");

        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(CSV.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let columns = read_pair_columns(&path, "Target Sequence", "Ligand SMILES").unwrap();
        assert_eq!(columns.proteins.len(), 2);
    }

    #[test]
    fn test_read_zstd_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.csv.zst");

        let file = File::create(&path).unwrap();
        let mut encoder = zstd::Encoder::new(file, 0).unwrap();
        encoder.write_all(CSV.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let columns = read_pair_columns(&path, "Target Sequence", "Ligand SMILES").unwrap();
        assert_eq!(columns.molecules, vec!["CCO", "c1ccccc1"]);
    }

    #[test]
    fn test_missing_column() {
        let err = read_pair_columns_from(CSV.as_bytes(), "Target Sequence", "SMILES").unwrap_err();
        assert!(matches!(err, DataError::MissingColumn(ref c) if c == "SMILES"));
    }

    #[test]
    fn test_missing_file() {
        let err = read_pair_columns("/nonexistent/pairs.csv", "a", "b").unwrap_err();
        assert!(matches!(err, DataError::Io(_)));
    }
}
