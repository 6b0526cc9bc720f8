use crate::error::InsufficientGpu;
use crate::model::GpuRequirement;

/// A physical GPU present on a node, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDevice {
    pub device_id: i64,
    pub vram: u64,
}

/// First-fit match of `requirements` against `available`, both ordered by
/// descending VRAM: the biggest requirement claims the smallest device that
/// still satisfies it, so small devices aren't wasted on small requirements
/// at a big device's expense.
pub fn match_gpus(
    available: &[GpuDevice],
    requirements: &[GpuRequirement],
) -> Result<Vec<GpuDevice>, InsufficientGpu> {
    if requirements.is_empty() {
        return Ok(Vec::new());
    }

    let mut pool: Vec<GpuDevice> = available.to_vec();
    pool.sort_by_key(|d| std::cmp::Reverse(d.vram));

    let mut sorted_reqs: Vec<&GpuRequirement> = requirements.iter().collect();
    sorted_reqs.sort_by_key(|r| std::cmp::Reverse(r.vram));

    let mut matched = Vec::with_capacity(requirements.len());
    for req in sorted_reqs {
        let pick = pool
            .iter()
            .enumerate()
            .filter(|(_, d)| d.vram >= req.vram)
            .min_by_key(|(_, d)| d.vram)
            .map(|(i, _)| i);
        match pick {
            Some(i) => matched.push(pool.remove(i)),
            None => return Err(InsufficientGpu(requirements.len() - matched.len())),
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_single_device() {
        let available = vec![GpuDevice { device_id: 0, vram: 4096 }];
        let reqs = vec![GpuRequirement { vram: 2048 }];
        let matched = match_gpus(&available, &reqs).unwrap();
        assert_eq!(matched, vec![GpuDevice { device_id: 0, vram: 4096 }]);
    }

    #[test]
    fn leaves_big_device_for_big_requirement() {
        let available = vec![
            GpuDevice { device_id: 0, vram: 8192 },
            GpuDevice { device_id: 1, vram: 4096 },
        ];
        let reqs = vec![GpuRequirement { vram: 4096 }, GpuRequirement { vram: 8192 }];
        let matched = match_gpus(&available, &reqs).unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().any(|d| d.device_id == 0));
        assert!(matched.iter().any(|d| d.device_id == 1));
    }

    #[test]
    fn insufficient_when_no_device_fits() {
        let available = vec![GpuDevice { device_id: 0, vram: 2048 }];
        let reqs = vec![GpuRequirement { vram: 4096 }];
        assert!(match_gpus(&available, &reqs).is_err());
    }

    #[test]
    fn empty_requirements_need_no_devices() {
        assert_eq!(match_gpus(&[], &[]).unwrap(), Vec::new());
    }
}
