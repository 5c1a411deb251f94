#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use veil_kernel_contracts::policy::{PolicyRecord, PrincipalId};
use veil_kernel_contracts::{ContractViolation, Validate};

const VAULT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum PolicyVaultError {
    Io(std::io::Error),
    Json(serde_json::Error),
    SchemaMismatch { found: u32 },
    Contract(ContractViolation),
}

impl std::fmt::Display for PolicyVaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::SchemaMismatch { found } => {
                write!(f, "vault schema version {found} is not supported")
            }
            Self::Contract(violation) => write!(f, "stored record is invalid: {violation:?}"),
        }
    }
}

impl std::error::Error for PolicyVaultError {}

impl From<std::io::Error> for PolicyVaultError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for PolicyVaultError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ContractViolation> for PolicyVaultError {
    fn from(value: ContractViolation) -> Self {
        Self::Contract(value)
    }
}

/// On-disk layout. Record keys are decimal principal ids; the boot flag is
/// document-level because it describes the device, not a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultDocument {
    schema_version: u32,
    boot_completed: bool,
    records: BTreeMap<String, PolicyRecord>,
}

impl VaultDocument {
    fn new_empty() -> Self {
        Self {
            schema_version: VAULT_SCHEMA_VERSION,
            boot_completed: false,
            records: BTreeMap::new(),
        }
    }
}

/// Plaintext JSON policy store restricted to owner-only file permissions,
/// matching the access model of the system settings database it replaces.
#[derive(Debug, Clone)]
pub struct PolicyVault {
    vault_path: PathBuf,
}

impl PolicyVault {
    pub fn default_local() -> Self {
        let vault_path = env::var("VEIL_POLICY_VAULT_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_vault_path);
        Self::for_path(vault_path)
    }

    pub fn for_path(vault_path: PathBuf) -> Self {
        Self { vault_path }
    }

    pub fn load_record(
        &self,
        principal: PrincipalId,
    ) -> Result<Option<PolicyRecord>, PolicyVaultError> {
        let Some(doc) = self.read_document()? else {
            return Ok(None);
        };
        let Some(record) = doc.records.get(&principal_key(principal)) else {
            return Ok(None);
        };
        record.validate()?;
        Ok(Some(record.clone()))
    }

    pub fn store_record(&self, record: &PolicyRecord) -> Result<(), PolicyVaultError> {
        record.validate()?;
        let mut doc = self.read_document()?.unwrap_or_else(VaultDocument::new_empty);
        doc.schema_version = VAULT_SCHEMA_VERSION;
        doc.records
            .insert(principal_key(record.principal), record.clone());
        self.write_document(&doc)
    }

    pub fn remove_record(&self, principal: PrincipalId) -> Result<bool, PolicyVaultError> {
        let Some(mut doc) = self.read_document()? else {
            return Ok(false);
        };
        let removed = doc.records.remove(&principal_key(principal)).is_some();
        if removed {
            self.write_document(&doc)?;
        }
        Ok(removed)
    }

    pub fn list_principals(&self) -> Result<Vec<PrincipalId>, PolicyVaultError> {
        let Some(doc) = self.read_document()? else {
            return Ok(Vec::new());
        };
        let mut principals: Vec<PrincipalId> = doc
            .records
            .keys()
            .filter_map(|key| key.parse::<u32>().ok())
            .map(PrincipalId)
            .collect();
        principals.sort();
        Ok(principals)
    }

    pub fn load_boot_completed(&self) -> Result<bool, PolicyVaultError> {
        let Some(doc) = self.read_document()? else {
            return Ok(false);
        };
        Ok(doc.boot_completed)
    }

    /// One-way latch, like the device state it mirrors. Cleared only by
    /// deleting the vault file.
    pub fn store_boot_completed(&self) -> Result<(), PolicyVaultError> {
        let mut doc = self.read_document()?.unwrap_or_else(VaultDocument::new_empty);
        doc.schema_version = VAULT_SCHEMA_VERSION;
        doc.boot_completed = true;
        self.write_document(&doc)
    }

    fn ensure_parent_dirs(&self) -> Result<(), PolicyVaultError> {
        if let Some(parent) = self.vault_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn read_document(&self) -> Result<Option<VaultDocument>, PolicyVaultError> {
        if !self.vault_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.vault_path)?;
        if raw.trim().is_empty() {
            return Ok(Some(VaultDocument::new_empty()));
        }
        let doc = serde_json::from_str::<VaultDocument>(&raw)?;
        if doc.schema_version != VAULT_SCHEMA_VERSION {
            return Err(PolicyVaultError::SchemaMismatch {
                found: doc.schema_version,
            });
        }
        Ok(Some(doc))
    }

    fn write_document(&self, doc: &VaultDocument) -> Result<(), PolicyVaultError> {
        self.ensure_parent_dirs()?;
        let serialized = serde_json::to_vec_pretty(doc)?;
        atomic_write_restricted(&self.vault_path, &serialized)?;
        Ok(())
    }
}

fn principal_key(principal: PrincipalId) -> String {
    principal.0.to_string()
}

fn default_vault_path() -> PathBuf {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home)
            .join("veil")
            .join("policy_vault.json");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("veil")
            .join("policy_vault.json");
    }
    PathBuf::from(".veil").join("policy_vault.json")
}

fn atomic_write_restricted(path: &Path, data: &[u8]) -> Result<(), PolicyVaultError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&tmp, perms)?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}
