//! Compiler output consumed by the deployer and the verifier.
//!
//! Artifacts follow the Hardhat layout:
//!
//! ```text
//! artifacts/
//!   build-info/<id>.json                       solcLongVersion + standard JSON input
//!   contracts/Foo.sol/Foo.json                 contractName, sourceName, abi, bytecode
//!   contracts/Foo.sol/Foo.dbg.json             { "buildInfo": "../../build-info/<id>.json" }
//! ```

use std::path::{Path, PathBuf};

use alloy_core::{
    dyn_abi::{DynSolValue, JsonAbiExt, Specifier},
    json_abi::JsonAbi,
    primitives::Bytes,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::{DeployError, config::CompilerConfig};

/// A compiled contract: creation bytecode plus ABI.
#[derive(Debug, Clone)]
pub struct ContractArtifact {
    pub contract_name: String,
    pub source_name: String,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
    /// Path of the artifact JSON file.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardhatArtifact {
    contract_name: String,
    source_name: String,
    abi: JsonAbi,
    bytecode: Bytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    solc_long_version: String,
    input: Value,
}

impl ContractArtifact {
    /// `<sourceName>:<contractName>`, the name explorers expect.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }

    /// Coerce textual constructor arguments into ABI values using the constructor's input types.
    pub fn parse_constructor_args(&self, args: &[String]) -> Result<Vec<DynSolValue>, DeployError> {
        let inputs = self
            .abi
            .constructor
            .as_ref()
            .map(|c| c.inputs.as_slice())
            .unwrap_or_default();

        if inputs.len() != args.len() {
            return Err(DeployError::Artifact(format!(
                "{} constructor takes {} argument(s), got {}",
                self.contract_name,
                inputs.len(),
                args.len()
            )));
        }

        inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| {
                let ty = param.resolve().map_err(|e| {
                    DeployError::Artifact(format!("unsupported constructor type {}: {e}", param.ty))
                })?;
                ty.coerce_str(arg).map_err(|e| {
                    DeployError::Artifact(format!(
                        "argument '{}' is not a valid {}: {e}",
                        param.name, param.ty
                    ))
                })
            })
            .collect()
    }

    /// ABI-encode constructor arguments (without the bytecode prefix).
    pub fn encode_constructor_args(&self, args: &[DynSolValue]) -> Result<Bytes, DeployError> {
        match &self.abi.constructor {
            Some(constructor) => constructor
                .abi_encode_input(args)
                .map(Bytes::from)
                .map_err(|e| DeployError::Artifact(format!("failed to encode constructor args: {e}"))),
            None if args.is_empty() => Ok(Bytes::new()),
            None => Err(DeployError::Artifact(format!(
                "{} has no constructor but {} argument(s) were given",
                self.contract_name,
                args.len()
            ))),
        }
    }
}

/// Source and compiler information submitted to an explorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBundle {
    /// `<sourceName>:<contractName>`.
    pub contract_name: String,
    /// Solidity standard JSON input.
    pub standard_json_input: Value,
}

/// Compiler settings used for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Long compiler version, e.g. `0.8.24+commit.e11b9ed9`.
    pub version: String,
    pub optimizer: bool,
    pub runs: u32,
    pub evm_version: String,
    pub via_ir: bool,
}

impl CompilerSettings {
    /// Explorer-style version string (`v0.8.24+commit.e11b9ed9`).
    pub fn explorer_version(&self) -> String {
        if self.version.starts_with('v') {
            self.version.clone()
        } else {
            format!("v{}", self.version)
        }
    }

    /// Overwrite the optimizer/evm/viaIR section of a standard JSON input with these settings.
    pub fn apply_to(&self, standard_json_input: &mut Value) {
        let settings = &mut standard_json_input["settings"];
        settings["optimizer"]["enabled"] = Value::Bool(self.optimizer);
        settings["optimizer"]["runs"] = Value::from(self.runs);
        settings["evmVersion"] = Value::String(self.evm_version.clone());
        settings["viaIR"] = Value::Bool(self.via_ir);
    }
}

/// Lookup of artifacts under a compiler output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find and parse the artifact of `contract_name`.
    pub fn load(&self, contract_name: &str) -> Result<ContractArtifact, DeployError> {
        let file_name = format!("{contract_name}.json");
        let candidates: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == file_name.as_str())
            .filter(|entry| !entry.path().components().any(|c| c.as_os_str() == "build-info"))
            .map(|entry| entry.into_path())
            .collect();

        let path = match candidates.as_slice() {
            [path] => path.clone(),
            [] => {
                return Err(DeployError::Artifact(format!(
                    "no artifact for {contract_name} under {}",
                    self.root.display()
                )));
            }
            _ => {
                return Err(DeployError::Artifact(format!(
                    "{contract_name} is ambiguous: {} artifacts found",
                    candidates.len()
                )));
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let artifact: HardhatArtifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        if artifact.bytecode.is_empty() {
            return Err(DeployError::Artifact(format!(
                "{contract_name} has no creation bytecode (abstract contract or interface?)"
            )));
        }

        tracing::debug!(contract = %contract_name, path = %path.display(), "Artifact loaded");

        Ok(ContractArtifact {
            contract_name: artifact.contract_name,
            source_name: artifact.source_name,
            abi: artifact.abi,
            bytecode: artifact.bytecode,
            path,
        })
    }

    /// Load the verification inputs of `artifact` and the effective compiler settings.
    ///
    /// The configured version wins over the one recorded in the build info.
    pub fn source_bundle(
        &self,
        artifact: &ContractArtifact,
        compiler: &CompilerConfig,
    ) -> Result<(SourceBundle, CompilerSettings), DeployError> {
        let dbg_path = artifact.path.with_extension("dbg.json");
        let dbg: DebugFile = read_json(&dbg_path)?;
        let build_info_path = artifact
            .path
            .parent()
            .map(|dir| dir.join(&dbg.build_info))
            .unwrap_or(dbg.build_info);
        let build_info: BuildInfo = read_json(&build_info_path)?;

        let settings = CompilerSettings {
            version: compiler
                .version
                .clone()
                .unwrap_or(build_info.solc_long_version),
            optimizer: compiler.optimizer,
            runs: compiler.runs,
            evm_version: compiler.evm_version.clone(),
            via_ir: compiler.via_ir,
        };

        let mut standard_json_input = build_info.input;
        settings.apply_to(&mut standard_json_input);

        Ok((
            SourceBundle {
                contract_name: artifact.fully_qualified_name(),
                standard_json_input,
            },
            settings,
        ))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DeployError> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(value)
}
