use testfarm_events::ResourceKind;

use super::{Constraints, Requirements, SelectionStrategy};
use crate::model::{Resource, ResourceSpec};

/// Picks QEMU hosts by architecture and virtualization features.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostStrategy;

impl SelectionStrategy for HostStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Host
    }

    fn check_constraints(&self, resource: &Resource, requirements: &Requirements) -> Result<(), String> {
        let (ResourceSpec::Host(spec), Constraints::Host(wanted)) =
            (&resource.spec, &requirements.constraints)
        else {
            return Err("not a host request".to_string());
        };

        if !resource.capacity.supports(&wanted.architecture) {
            return Err(format!("architecture {} not supported", wanted.architecture));
        }
        if wanted.kvm && !spec.kvm {
            return Err("kvm not available".to_string());
        }
        if wanted.nested_virt && !spec.nested_virt {
            return Err("nested virtualization not available".to_string());
        }

        Ok(())
    }
}
