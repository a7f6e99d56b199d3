use testfarm_events::ResourceKind;

use super::{Constraints, Requirements, SelectionStrategy};
use crate::model::{Resource, ResourceSpec};

/// Picks test boards by type, SoC, architecture and attached peripherals.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoardStrategy;

impl SelectionStrategy for BoardStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Board
    }

    fn check_constraints(&self, resource: &Resource, requirements: &Requirements) -> Result<(), String> {
        let (ResourceSpec::Board(spec), Constraints::Board(wanted)) =
            (&resource.spec, &requirements.constraints)
        else {
            return Err("not a board request".to_string());
        };

        if let Some(board_type) = &wanted.board_type {
            if &spec.board_type != board_type {
                return Err(format!("board type {} is not {}", spec.board_type, board_type));
            }
        }
        if let Some(architecture) = &wanted.architecture {
            if !resource.capacity.supports(architecture) {
                return Err(format!("architecture {architecture} not supported"));
            }
        }
        if let Some(soc) = &wanted.soc {
            if spec.soc.as_ref() != Some(soc) {
                return Err(format!("soc is not {soc}"));
            }
        }

        let missing: Vec<&str> = wanted
            .peripherals
            .difference(&spec.peripherals)
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing peripherals {}", missing.join(", ")));
        }

        if wanted.power_control && spec.power_control.is_none() {
            return Err("no power control".to_string());
        }

        Ok(())
    }
}
