//! Inventory files: resources and groups to seed the engine with.
//!
//! ```json
//! {
//!   "groups": [{ "id": "kernel-boards", "policy": { "max_concurrent_allocations": 2 } }],
//!   "resources": [{ "id": "B1", "connection": { "address": "10.0.1.5" }, ... }]
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Resource, ResourceGroup};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid inventory: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub groups: Vec<ResourceGroup>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Inventory {
    pub fn from_json(json: &str) -> Result<Self, InventoryError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let json = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testfarm_events::{ResourceKind, ResourceStatus};

    const SAMPLE: &str = r#"{
        "groups": [
            { "id": "kernel-boards", "policy": { "max_concurrent_allocations": 2, "reserved_for_teams": ["kernel"] } }
        ],
        "resources": [
            {
                "id": "S1",
                "connection": { "address": "build-1.lab", "port": 22 },
                "capacity": { "cpu_cores": 32, "memory_mb": 131072, "storage_gb": 2000, "architectures": ["x86_64", "arm64"] },
                "spec": { "kind": "build_server", "toolchains": ["gcc-13", "clang-18"], "max_concurrent_jobs": 4 }
            },
            {
                "id": "B1",
                "connection": { "address": "10.0.1.5" },
                "capacity": { "cpu_cores": 4, "memory_mb": 4096, "architectures": ["arm64"] },
                "spec": {
                    "kind": "board",
                    "board_type": "rpi4",
                    "peripherals": ["can", "gpio"],
                    "power_control": { "type": "pdu", "endpoint": "pdu-1.lab", "outlet": 3 }
                },
                "group_id": "kernel-boards",
                "labels": { "rack": "r2" }
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let inventory = Inventory::from_json(SAMPLE).unwrap();

        assert_eq!(inventory.groups.len(), 1);
        assert_eq!(inventory.groups[0].policy.max_concurrent_allocations, Some(2));
        assert_eq!(inventory.resources.len(), 2);

        let board = &inventory.resources[1];
        assert_eq!(board.kind(), ResourceKind::Board);
        assert_eq!(board.status, ResourceStatus::Unknown);
        assert!(board.power_control().is_some());
        assert_eq!(board.labels.get("rack").map(String::as_str), Some("r2"));
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(Inventory::from_json("{}").unwrap(), Inventory::default());
    }

    #[test]
    fn test_missing_file() {
        let err = Inventory::load(Path::new("/nonexistent/inventory.json")).unwrap_err();
        assert!(matches!(err, InventoryError::Read { .. }));
    }
}
