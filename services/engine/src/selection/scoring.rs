//! Utilization score used to rank compatible resources.
//!
//! Score is in basis points (0 = idle, 10 000 = saturated). Each dimension
//! takes the larger of what the last probe measured and what reservations
//! already hold, so a freshly reserved but still idle host does not look
//! empty. Lower wins; equal scores fall back to resource id order.

use crate::config::ScoringWeights;
use crate::model::Resource;

pub const MAX_SCORE: u32 = 10_000;

pub fn utilization_score(resource: &Resource, weights: ScoringWeights) -> u32 {
    let (cpu_weight, memory_weight) = match (weights.cpu, weights.memory) {
        (0, 0) => (1, 1),
        (c, m) => (c, m),
    };

    let measured_cpu = percent_share(resource.utilization.cpu_percent);
    let reserved_cpu = share(
        u64::from(resource.allocated.cpu_cores),
        u64::from(resource.capacity.cpu_cores),
    );
    let measured_memory = percent_share(resource.utilization.memory_percent);
    let reserved_memory = share(resource.allocated.memory_mb, resource.capacity.memory_mb);

    let cpu = measured_cpu.max(reserved_cpu);
    let memory = measured_memory.max(reserved_memory);

    let total = f64::from(cpu_weight) + f64::from(memory_weight);
    let weighted = (f64::from(cpu_weight) * cpu + f64::from(memory_weight) * memory) / total;

    (weighted * f64::from(MAX_SCORE)).round().clamp(0.0, f64::from(MAX_SCORE)) as u32
}

fn percent_share(percent: f32) -> f64 {
    if percent.is_finite() {
        (f64::from(percent) / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn share(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capacity, ConnectionInfo, HostSpec, ResourceSlice, ResourceSpec, Utilization};
    use testfarm_id::ResourceId;

    fn host(cpu_percent: f32, memory_percent: f32, allocated_cores: u32) -> Resource {
        let mut r = Resource::new(
            ResourceId::parse("H1").unwrap(),
            ResourceSpec::Host(HostSpec {
                kvm: true,
                nested_virt: false,
                max_vms: 8,
            }),
            Capacity {
                cpu_cores: 8,
                memory_mb: 8192,
                storage_gb: 0,
                architectures: Default::default(),
            },
            ConnectionInfo::new("h1"),
        );
        r.utilization = Utilization {
            cpu_percent,
            memory_percent,
            ..Utilization::default()
        };
        r.allocated = ResourceSlice::cores(allocated_cores);
        r
    }

    #[test]
    fn test_idle_scores_zero_saturated_scores_max() {
        let w = ScoringWeights::default();
        assert_eq!(utilization_score(&host(0.0, 0.0, 0), w), 0);
        assert_eq!(utilization_score(&host(100.0, 100.0, 0), w), MAX_SCORE);
    }

    #[test]
    fn test_reserved_share_counts_when_higher_than_measured() {
        let w = ScoringWeights::default();
        // 4 of 8 cores reserved, probe says 10% busy: cpu share is 0.5.
        assert_eq!(utilization_score(&host(10.0, 0.0, 4), w), 2_500);
    }

    #[test]
    fn test_weights_shift_the_score() {
        let cpu_only = ScoringWeights { cpu: 1, memory: 0 };
        assert_eq!(utilization_score(&host(40.0, 90.0, 0), cpu_only), 4_000);
    }

    #[test]
    fn test_garbage_metrics_are_clamped() {
        let w = ScoringWeights::default();
        assert_eq!(utilization_score(&host(f32::NAN, 250.0, 0), w), 5_000);
    }
}
