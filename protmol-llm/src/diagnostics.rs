use anyhow::{Result, anyhow};
use candle_nn::VarMap;
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VariableSummary {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: &'static str,
    pub num_elements: usize,
    pub bytes: usize,
}

/// Parameter footprint of a model, sorted by variable name.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemorySnapshot {
    pub total_parameters: usize,
    pub total_bytes: usize,
    pub variables: Vec<VariableSummary>,
}

pub fn summarize(var_map: &VarMap) -> Result<MemorySnapshot> {
    let data = var_map
        .data()
        .lock()
        .map_err(|e| anyhow!("variable map lock poisoned: {}", e))?;

    let mut variables: Vec<VariableSummary> = data
        .iter()
        .map(|(name, var)| {
            let num_elements = var.elem_count();
            VariableSummary {
                name: name.clone(),
                shape: var.dims().to_vec(),
                dtype: var.dtype().as_str(),
                num_elements,
                bytes: num_elements * var.dtype().size_in_bytes(),
            }
        })
        .collect();
    variables.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(MemorySnapshot {
        total_parameters: variables.iter().map(|v| v.num_elements).sum(),
        total_bytes: variables.iter().map(|v| v.bytes).sum(),
        variables,
    })
}

pub fn log_model_summary(var_map: &VarMap) -> Result<()> {
    let snapshot = summarize(var_map)?;
    for var in &snapshot.variables {
        info!(shape = ?var.shape, dtype = var.dtype, "{}", var.name);
    }
    info!(
        "Total parameters: {} ({:.2}M, {:.1} MiB)",
        snapshot.total_parameters,
        snapshot.total_parameters as f64 / 1_000_000.0,
        snapshot.total_bytes as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

pub fn write_memory_snapshot<P: AsRef<Path>>(var_map: &VarMap, path: P) -> Result<MemorySnapshot> {
    let snapshot = summarize(var_map)?;
    std::fs::write(path.as_ref(), serde_json::to_string_pretty(&snapshot)?)?;
    info!(path = ?path.as_ref(), "Wrote memory snapshot");
    Ok(snapshot)
}
