//! Readers for Foundry build artifacts.
//!
//! The deployment descriptor is a `broadcast/.../run-latest.json` file; the contract
//! address is taken from its first transaction. The interface descriptor is a compiler
//! output file carrying the ABI under `abi`.

use std::path::{Path, PathBuf};

use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid deployment descriptor format in {}", path.display())]
    InvalidDeploymentFormat { path: PathBuf },
    #[error("invalid interface descriptor format in {}: {reason}", path.display())]
    InvalidInterfaceFormat { path: PathBuf, reason: String },
}

fn read_json(path: &Path) -> Result<Value, DescriptorError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| DescriptorError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Contract address recorded by the deployment script (`transactions[0].contractAddress`).
pub fn read_contract_address(path: &Path) -> Result<Address, DescriptorError> {
    let json = read_json(path)?;
    let invalid = || DescriptorError::InvalidDeploymentFormat {
        path: path.to_path_buf(),
    };
    let raw = json
        .get("transactions")
        .and_then(|txs| txs.get(0))
        .and_then(|tx| tx.get("contractAddress"))
        .and_then(Value::as_str)
        .ok_or_else(invalid)?;
    let address = raw.parse::<Address>().map_err(|_| invalid())?;
    tracing::debug!(path = %path.display(), %address, "Read contract address");
    Ok(address)
}

/// Contract interface from the compiler output's `abi` field.
///
/// Shielded parameter types (`suint256`, `saddress`, `sbool`, ...) are read as their
/// plain counterparts; they share the same encoding.
pub fn read_contract_interface(path: &Path) -> Result<JsonAbi, DescriptorError> {
    let json = read_json(path)?;
    let Some(mut abi) = json.get("abi").cloned() else {
        return Err(DescriptorError::InvalidInterfaceFormat {
            path: path.to_path_buf(),
            reason: "missing `abi` field".to_string(),
        });
    };
    normalize_shielded_types(&mut abi);
    let interface: JsonAbi =
        serde_json::from_value(abi).map_err(|e| DescriptorError::InvalidInterfaceFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    tracing::debug!(
        path = %path.display(),
        functions = interface.functions().count(),
        "Read contract interface"
    );
    Ok(interface)
}

fn normalize_shielded_types(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key == "type" || key == "internalType" {
                    if let Value::String(ty) = entry
                        && let Some(plain) = unshield(ty)
                    {
                        *ty = plain;
                    }
                } else {
                    normalize_shielded_types(entry);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_shielded_types),
        _ => {}
    }
}

fn unshield(ty: &str) -> Option<String> {
    let rest = ty.strip_prefix('s')?;
    ["uint", "int", "address", "bool", "bytes"]
        .iter()
        .any(|base| rest.starts_with(base))
        .then(|| rest.to_string())
}
