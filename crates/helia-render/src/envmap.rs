//! Environment map support: projection kinds and the importance-sampling
//! alias table.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// How the environment texture maps onto directions. The integer values are
/// what shaders receive in the `environment_proj` push constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentProjection {
    Equirectangular = 0,
    MirrorBall = 1,
}

/// One alias-table entry: sample slot `i`, compare a uniform variate
/// against `probability`, fall through to `alias` on failure. O(1) sampling
/// of the environment map's luminance distribution.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AliasEntry {
    pub probability: f32,
    pub alias: u32,
}

/// Alias table over a discrete distribution (Vose construction).
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<AliasEntry>,
    total_weight: f64,
}

impl AliasTable {
    /// Build from non-negative weights. Zero total weight yields a uniform
    /// table.
    pub fn build(weights: &[f32]) -> Self {
        let n = weights.len();
        if n == 0 {
            return Self {
                entries: Vec::new(),
                total_weight: 0.0,
            };
        }

        let total: f64 = weights.iter().map(|&w| w.max(0.0) as f64).sum();
        let scaled: Vec<f64> = if total > 0.0 {
            weights
                .iter()
                .map(|&w| w.max(0.0) as f64 * n as f64 / total)
                .collect()
        } else {
            vec![1.0; n]
        };

        let mut entries = vec![
            AliasEntry {
                probability: 1.0,
                alias: 0,
            };
            n
        ];
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        let mut remaining = scaled;

        for (i, &p) in remaining.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
            small.pop();
            large.pop();

            entries[s] = AliasEntry {
                probability: remaining[s] as f32,
                alias: l as u32,
            };
            remaining[l] = (remaining[l] + remaining[s]) - 1.0;
            if remaining[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        // Numerical leftovers resolve to probability one.
        for &i in small.iter().chain(large.iter()) {
            entries[i] = AliasEntry {
                probability: 1.0,
                alias: i as u32,
            };
        }

        Self {
            entries,
            total_weight: total,
        }
    }

    pub fn entries(&self) -> &[AliasEntry] {
        &self.entries
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Sample with two uniform variates in [0, 1). Returns the selected
    /// slot.
    pub fn sample(&self, u_select: f32, u_accept: f32) -> u32 {
        if self.entries.is_empty() {
            return 0;
        }
        let i = ((u_select * self.entries.len() as f32) as usize).min(self.entries.len() - 1);
        let entry = self.entries[i];
        if u_accept < entry.probability {
            i as u32
        } else {
            entry.alias
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_weights_accept_everywhere() {
        let table = AliasTable::build(&[1.0; 8]);
        for entry in table.entries() {
            assert!((entry.probability - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn sampling_matches_distribution() {
        // Deterministic grid sampling should reproduce the weights within
        // coarse tolerance.
        let weights = [1.0, 3.0, 0.0, 4.0];
        let table = AliasTable::build(&weights);

        let mut counts = [0u32; 4];
        let steps = 200;
        for a in 0..steps {
            for b in 0..steps {
                let u0 = (a as f32 + 0.5) / steps as f32;
                let u1 = (b as f32 + 0.5) / steps as f32;
                counts[table.sample(u0, u1) as usize] += 1;
            }
        }

        let total: u32 = counts.iter().sum();
        let weight_sum: f32 = weights.iter().sum();
        for (i, &w) in weights.iter().enumerate() {
            let expected = w / weight_sum;
            let observed = counts[i] as f32 / total as f32;
            assert!(
                (expected - observed).abs() < 0.01,
                "slot {i}: expected {expected}, observed {observed}"
            );
        }
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let table = AliasTable::build(&[0.0; 4]);
        assert_eq!(table.entries().len(), 4);
        assert_eq!(table.total_weight(), 0.0);
    }

    #[test]
    fn empty_table() {
        let table = AliasTable::build(&[]);
        assert!(table.entries().is_empty());
        assert_eq!(table.sample(0.3, 0.7), 0);
    }
}
