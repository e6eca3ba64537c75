//! Expansion of parameter ranges into concrete benchmark configurations.

use itertools::{iproduct, Itertools};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MAX_COMBINATIONS: usize = 100;

/// smallest problem size worth running
pub const MIN_PROBLEM_SIZE: u64 = 1000;
pub const MIN_BLOCK_SIZE: u64 = 32;
pub const MAX_BLOCK_SIZE: u64 = 512;

const RECOMMENDED_BLOCK_SIZES: [u64; 7] = [64, 96, 128, 160, 192, 224, 256];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("n_step must be positive")]
    ZeroStep,
}

/// Reasons the validator rejects a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidConfiguration {
    #[error("P*Q ({product}) must equal total processes ({processes})")]
    GridMismatch { product: u64, processes: u64 },
    #[error("N ({n}) must be divisible by NB ({nb})")]
    NotDivisible { n: u64, nb: u64 },
    #[error("N ({0}) is too small (< 1000)")]
    ProblemTooSmall(u64),
    #[error("NB ({0}) should be between 32 and 512")]
    BlockSizeOutOfRange(u64),
}

// The codes below are the ones the benchmark's input deck uses.

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Factorization {
    Left = 0,
    Crout = 1,
    Right = 2,
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Broadcast {
    IncreasingRing = 0,
    IncreasingRingModified = 1,
    IncreasingTwoRing = 2,
    IncreasingTwoRingModified = 3,
    Long = 4,
    LongModified = 5,
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Swap {
    BinaryExchange = 0,
    Long = 1,
    Mix = 2,
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Orientation {
    Transposed = 0,
    NoTransposed = 1,
}

/// Secondary tuning knobs, copied verbatim into every configuration
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct TuningKnobs {
    pub pfact: Factorization,
    /// recursion stopping criterion
    pub nbmin: u32,
    /// panels in recursion
    pub ndiv: u32,
    pub rfact: Factorization,
    pub bcast: Broadcast,
    /// lookahead depth
    pub depth: u32,
    pub swap: Swap,
    pub swap_threshold: u32,
    pub l1: Orientation,
    pub u: Orientation,
    pub equil: bool,
    /// memory alignment in doubles
    pub align: u32,
}

impl Default for TuningKnobs {
    fn default() -> Self {
        Self {
            pfact: Factorization::Right,
            nbmin: 4,
            ndiv: 2,
            rfact: Factorization::Right,
            bcast: Broadcast::IncreasingRingModified,
            depth: 1,
            swap: Swap::Mix,
            swap_threshold: 64,
            l1: Orientation::Transposed,
            u: Orientation::Transposed,
            equil: true,
            align: 8,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterRange {
    // problem sizes, inclusive arithmetic progression
    pub n_start: u64,
    pub n_end: u64,
    pub n_step: u64,
    pub nb_values: Vec<u64>,
    pub p_values: Vec<u64>,
    pub q_values: Vec<u64>,
    #[serde(default)]
    pub knobs: TuningKnobs,
}

impl ParameterRange {
    pub fn n_values(&self) -> Vec<u64> {
        if self.n_step == 0 {
            return Vec::new();
        }

        let step = usize::try_from(self.n_step).unwrap_or(usize::MAX);
        (self.n_start..=self.n_end).step_by(step).collect()
    }

    /// number of tuples in the full product
    pub fn product_size(&self) -> usize {
        self.n_values().len() * self.nb_values.len() * self.p_values.len() * self.q_values.len()
    }

    /// List every part of the range that produces no value
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.n_step == 0 {
            problems.push("n_step must be positive".to_owned());
        }
        if self.n_start > self.n_end {
            problems.push(format!(
                "n_start ({}) is larger than n_end ({})",
                self.n_start, self.n_end
            ));
        }
        for (name, values) in [
            ("nb_values", &self.nb_values),
            ("p_values", &self.p_values),
            ("q_values", &self.q_values),
        ] {
            if values.is_empty() {
                problems.push(format!("{name} must contain at least one value"));
            }
        }

        problems
    }
}

/// One concrete benchmark run
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    /// 1-based position within its generation batch
    pub ordinal: u32,
    pub n: u64,
    pub nb: u64,
    pub p: u64,
    pub q: u64,
    pub knobs: TuningKnobs,
}

impl Configuration {
    pub fn processes(&self) -> u64 {
        self.p * self.q
    }
}

/// Expand `range` into at most `max_combinations` configurations
///
/// Iteration order is N, NB, P, Q with Q innermost. If the product is larger
/// than the cap, every k-th tuple is taken with k = total / cap.
pub fn generate(
    range: &ParameterRange,
    max_combinations: usize,
) -> Result<Vec<Configuration>, GridError> {
    if range.n_step == 0 {
        return Err(GridError::ZeroStep);
    }

    let n_values = range.n_values();
    let total = range.product_size();

    if total == 0 || max_combinations == 0 {
        debug!(total, max_combinations, "Parameter range yields no configuration");
        return Ok(Vec::new());
    }

    let stride = if total > max_combinations {
        total / max_combinations
    } else {
        1
    };

    let configurations = iproduct!(
        n_values.iter(),
        range.nb_values.iter(),
        range.p_values.iter(),
        range.q_values.iter()
    )
    .enumerate()
    .filter(|(position, _)| (position + 1) % stride == 0)
    .take(max_combinations)
    // ordinals are u32, anything beyond that is dropped
    .zip(1..=u32::MAX)
    .map(|((_, (&n, &nb, &p, &q)), ordinal)| Configuration {
        ordinal,
        n,
        nb,
        p,
        q,
        knobs: range.knobs.clone(),
    })
    .collect_vec();

    info!(
        total,
        stride,
        generated = configurations.len(),
        "Generated configurations"
    );

    Ok(configurations)
}

/// Check `configuration` against the allocation it is going to run on
///
/// Advisory only, `generate` never calls this.
pub fn validate(
    configuration: &Configuration,
    nodes: u32,
    cores_per_node: u32,
) -> Result<(), InvalidConfiguration> {
    let processes = u64::from(nodes) * u64::from(cores_per_node);
    let product = configuration.processes();

    if product != processes {
        return Err(InvalidConfiguration::GridMismatch { product, processes });
    }
    if configuration.n.checked_rem(configuration.nb) != Some(0) {
        return Err(InvalidConfiguration::NotDivisible {
            n: configuration.n,
            nb: configuration.nb,
        });
    }
    if configuration.n < MIN_PROBLEM_SIZE {
        return Err(InvalidConfiguration::ProblemTooSmall(configuration.n));
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&configuration.nb) {
        return Err(InvalidConfiguration::BlockSizeOutOfRange(configuration.nb));
    }

    Ok(())
}

/// All process grids (p, q) with p <= q covering `processes`, most unbalanced first
pub fn recommended_grids(processes: u64) -> Vec<(u64, u64)> {
    (1..)
        .take_while(|&p| p <= processes / p)
        .filter(|p| processes % p == 0)
        .map(|p| (p, processes / p))
        .collect()
}

pub fn recommended_block_sizes() -> &'static [u64] {
    &RECOMMENDED_BLOCK_SIZES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(n: (u64, u64, u64), nb: &[u64], p: &[u64], q: &[u64]) -> ParameterRange {
        ParameterRange {
            n_start: n.0,
            n_end: n.1,
            n_step: n.2,
            nb_values: nb.to_vec(),
            p_values: p.to_vec(),
            q_values: q.to_vec(),
            knobs: TuningKnobs::default(),
        }
    }

    fn tuple(configuration: &Configuration) -> (u64, u64, u64, u64) {
        (
            configuration.n,
            configuration.nb,
            configuration.p,
            configuration.q,
        )
    }

    #[test]
    fn full_product_in_nesting_order() {
        let range = range((1000, 2000, 1000), &[64, 128], &[1, 2], &[2, 4]);
        let configurations = generate(&range, DEFAULT_MAX_COMBINATIONS).unwrap();

        assert_eq!(configurations.len(), 16);
        assert_eq!(tuple(&configurations[0]), (1000, 64, 1, 2));
        assert_eq!(tuple(&configurations[1]), (1000, 64, 1, 4));
        assert_eq!(tuple(&configurations[2]), (1000, 64, 2, 2));
        assert_eq!(tuple(&configurations[4]), (1000, 128, 1, 2));
        assert_eq!(tuple(&configurations[8]), (2000, 64, 1, 2));
        assert_eq!(tuple(&configurations[15]), (2000, 128, 2, 4));

        let ordinals = configurations.iter().map(|c| c.ordinal).collect_vec();
        assert_eq!(ordinals, (1..=16).collect_vec());
        assert!(configurations
            .iter()
            .all(|configuration| configuration.knobs == range.knobs));
    }

    #[test]
    fn inclusive_end_and_step() {
        let range = range((1000, 3500, 1000), &[128], &[1], &[1]);
        let n = generate(&range, 10)
            .unwrap()
            .iter()
            .map(|c| c.n)
            .collect_vec();

        assert_eq!(n, [1000, 2000, 3000]);
    }

    #[test]
    fn strides_over_large_products() {
        // 10 * 2 * 1 * 1 = 20 tuples, cap 6 -> every 3rd
        let range = range((1000, 10000, 1000), &[64, 128], &[1], &[1]);
        let configurations = generate(&range, 6).unwrap();

        assert_eq!(configurations.len(), 6);
        let expected = [
            (2000, 64),
            (3000, 128),
            (5000, 64),
            (6000, 128),
            (8000, 64),
            (9000, 128),
        ];
        for (configuration, (n, nb)) in configurations.iter().zip(expected) {
            assert_eq!((configuration.n, configuration.nb), (n, nb));
        }
    }

    #[test]
    fn capped_output_is_strictly_increasing_subsequence() {
        let range = range((1000, 50000, 1000), &[64, 128, 192], &[1, 2], &[2, 4, 8]);
        let everything = generate(&range, usize::MAX).unwrap();
        assert_eq!(everything.len(), range.product_size());

        for cap in [1, 7, 13, 100, 899] {
            let capped = generate(&range, cap).unwrap();
            assert_eq!(capped.len(), cap);

            let positions = capped
                .iter()
                .map(|c| {
                    everything
                        .iter()
                        .position(|candidate| tuple(candidate) == tuple(c))
                        .unwrap()
                })
                .collect_vec();
            assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn unbounded_cap_numbers_every_configuration() {
        let range = range((1000, 20000, 1000), &[64, 128], &[1, 2], &[2, 4]);
        let configurations = generate(&range, usize::MAX).unwrap();

        assert_eq!(configurations.len(), 160);
        assert!(configurations
            .iter()
            .zip(1u32..)
            .all(|(configuration, ordinal)| configuration.ordinal == ordinal));
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(generate(&range((2000, 1000, 1000), &[128], &[1], &[1]), 10)
            .unwrap()
            .is_empty());
        assert!(generate(&range((1000, 2000, 1000), &[], &[1], &[1]), 10)
            .unwrap()
            .is_empty());
        assert!(generate(&range((1000, 2000, 1000), &[128], &[1], &[1]), 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn zero_step_is_rejected() {
        assert_eq!(
            generate(&range((1000, 2000, 0), &[128], &[1], &[1]), 10),
            Err(GridError::ZeroStep)
        );
    }

    #[test]
    fn range_check_lists_problems() {
        assert!(range((1000, 2000, 1000), &[128], &[1], &[1]).check().is_empty());
        assert_eq!(range((2000, 1000, 0), &[], &[1], &[]).check().len(), 4);
    }

    fn configuration(n: u64, nb: u64, p: u64, q: u64) -> Configuration {
        Configuration {
            ordinal: 1,
            n,
            nb,
            p,
            q,
            knobs: TuningKnobs::default(),
        }
    }

    #[test]
    fn validator() {
        assert_eq!(validate(&configuration(10000, 125, 2, 2), 2, 2), Ok(()));
        assert_eq!(validate(&configuration(10240, 128, 2, 2), 2, 2), Ok(()));
        assert_eq!(
            validate(&configuration(10240, 128, 2, 2), 2, 4),
            Err(InvalidConfiguration::GridMismatch {
                product: 4,
                processes: 8
            })
        );
        assert_eq!(
            validate(&configuration(10001, 128, 2, 2), 2, 2),
            Err(InvalidConfiguration::NotDivisible { n: 10001, nb: 128 })
        );
        assert_eq!(
            validate(&configuration(512, 128, 2, 2), 2, 2),
            Err(InvalidConfiguration::ProblemTooSmall(512))
        );
        assert_eq!(
            validate(&configuration(16384, 1024, 2, 2), 2, 2),
            Err(InvalidConfiguration::BlockSizeOutOfRange(1024))
        );
        assert_eq!(
            validate(&configuration(10000, 0, 2, 2), 2, 2),
            Err(InvalidConfiguration::NotDivisible { n: 10000, nb: 0 })
        );
    }

    #[test]
    fn recommended_grids_cover_all_factorizations() {
        assert_eq!(recommended_grids(12), [(1, 12), (2, 6), (3, 4)]);
        assert_eq!(recommended_grids(16), [(1, 16), (2, 8), (4, 4)]);
        assert_eq!(recommended_grids(7), [(1, 7)]);
        assert!(recommended_grids(0).is_empty());

        for total in 1..200u64 {
            let grids = recommended_grids(total);
            assert!(grids.iter().all(|&(p, q)| p <= q && p * q == total));

            let expected = (1..=total)
                .filter(|p| total % p == 0 && p * p <= total)
                .count();
            assert_eq!(grids.len(), expected);
        }
    }

    #[test]
    fn recommended_grids_for_huge_allocations() {
        let grids = recommended_grids(1 << 40);

        assert_eq!(grids.len(), 21);
        assert_eq!(grids.first(), Some(&(1, 1 << 40)));
        assert_eq!(grids.last(), Some(&(1 << 20, 1 << 20)));
    }
}
