use testfarm_events::ResourceKind;

use super::{Constraints, Requirements, SelectionStrategy};
use crate::model::{Resource, ResourceSpec};

/// Picks build servers by target architecture and installed toolchains.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildServerStrategy;

impl SelectionStrategy for BuildServerStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BuildServer
    }

    fn check_constraints(&self, resource: &Resource, requirements: &Requirements) -> Result<(), String> {
        let (ResourceSpec::BuildServer(spec), Constraints::BuildServer(wanted)) =
            (&resource.spec, &requirements.constraints)
        else {
            return Err("not a build server request".to_string());
        };

        if !resource.capacity.supports(&wanted.architecture) {
            return Err(format!("architecture {} not supported", wanted.architecture));
        }

        let missing: Vec<&str> = wanted
            .toolchains
            .difference(&spec.toolchains)
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing toolchains {}", missing.join(", ")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildServerSpec, Capacity, ConnectionInfo};
    use testfarm_id::ResourceId;

    fn server(toolchains: &[&str]) -> Resource {
        Resource::new(
            ResourceId::parse("BS1").unwrap(),
            ResourceSpec::BuildServer(BuildServerSpec {
                toolchains: toolchains.iter().map(|t| t.to_string()).collect(),
                max_concurrent_jobs: 4,
            }),
            Capacity {
                cpu_cores: 32,
                memory_mb: 65_536,
                storage_gb: 500,
                architectures: ["x86_64".to_string(), "arm64".to_string()].into(),
            },
            ConnectionInfo::new("bs1"),
        )
    }

    #[test]
    fn test_toolchain_subset_required() {
        let bs = server(&["gcc-13", "clang-18"]);
        let ok = Requirements::build_server("arm64").with_toolchain("gcc-13");
        assert!(BuildServerStrategy.check_constraints(&bs, &ok).is_ok());

        let missing = Requirements::build_server("arm64").with_toolchain("rust-1.90");
        let err = BuildServerStrategy.check_constraints(&bs, &missing).unwrap_err();
        assert_eq!(err, "missing toolchains rust-1.90");
    }

    #[test]
    fn test_architecture_required() {
        let bs = server(&[]);
        let err = BuildServerStrategy
            .check_constraints(&bs, &Requirements::build_server("riscv64"))
            .unwrap_err();
        assert!(err.contains("riscv64"));
    }
}
