//! Expectation-Maximization over segment-coverage equivalence classes.
//!
//! Each equivalence class is a segment together with the set of paths that
//! traverse it; the observed count is the segment's projected k-mer
//! frequency per base. EM redistributes the counts across paths until the
//! per-path abundance estimates stop changing.

use anyhow::Result;
use rustc_hash::FxHashMap;

// convergence constants
const ALPHA_LIMIT: f64 = 1e-7;
const ALPHA_CHANGE: f64 = 1e-2;
const ALPHA_CHANGE_LIMIT: f64 = 1e-2;

/// Runs the EM algorithm for one graph.
pub struct EmRunner {
    num_paths: usize,
    min_iterations: usize,
    max_iterations: usize,
    ec_map: FxHashMap<u64, Vec<u32>>,
    counts: FxHashMap<u64, f64>,
    alpha: Vec<f64>,
    iterations_ran: usize,
}

impl EmRunner {
    /// Sets up an EM run.
    ///
    /// `ec_map` maps each equivalence class (segment ID) to the paths that
    /// traverse it, `counts` holds the observed count per class. Alpha is
    /// initialised uniformly at `1 / num_paths`.
    pub fn new(
        max_iterations: usize,
        min_iterations: usize,
        num_paths: usize,
        ec_map: FxHashMap<u64, Vec<u32>>,
        counts: FxHashMap<u64, f64>,
    ) -> Result<Self> {
        if max_iterations < min_iterations {
            anyhow::bail!(
                "number of EM iterations ({}) must be greater than minimum iterations ({})",
                max_iterations,
                min_iterations
            );
        }
        if num_paths == 0 {
            anyhow::bail!("EM requires at least one path");
        }
        let uniform = 1.0 / num_paths as f64;
        Ok(EmRunner {
            num_paths,
            min_iterations,
            max_iterations,
            ec_map,
            counts,
            alpha: vec![uniform; num_paths],
            iterations_ran: 0,
        })
    }

    /// Runs EM to convergence (or the iteration cap).
    ///
    /// Convergence: an iteration where no path with abundance above
    /// `ALPHA_CHANGE_LIMIT` moved by more than 1% relative, after the
    /// minimum iteration count. One final round is then taken with the
    /// near-zero entries cleared.
    pub fn run(&mut self) -> Result<()> {
        let tolerance = f64::EPSILON;
        let mut next_alpha = vec![0.0; self.num_paths];
        let mut final_round = false;
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration;

            for (ec, paths) in &self.ec_map {
                let count = match self.counts.get(ec) {
                    Some(&count) => count,
                    None => anyhow::bail!("could not look up count for equivalence class {}", ec),
                };
                if count == 0.0 {
                    continue;
                }
                let mut denom = 0.0;
                for &path in paths {
                    denom += self.alpha[path as usize];
                }
                if denom < tolerance {
                    continue;
                }
                let count_norm = count / denom;
                for &path in paths {
                    next_alpha[path as usize] += self.alpha[path as usize] * count_norm;
                }
            }

            let mut changed = 0usize;
            for path in 0..self.num_paths {
                if next_alpha[path] > ALPHA_CHANGE_LIMIT
                    && ((next_alpha[path] - self.alpha[path]).abs() / next_alpha[path])
                        > ALPHA_CHANGE
                {
                    changed += 1;
                }
                self.alpha[path] = next_alpha[path];
                next_alpha[path] = 0.0;
            }

            if final_round {
                break;
            }
            if changed == 0 && iteration > self.min_iterations {
                final_round = true;
                for value in &mut self.alpha {
                    if *value < ALPHA_LIMIT / 10.0 {
                        *value = 0.0;
                    }
                }
            }
        }

        if !final_round {
            iterations = self.max_iterations;
        }
        self.iterations_ran = iterations.max(1);
        Ok(())
    }

    /// Returns the iteration count and the final alpha estimates.
    pub fn results(&self) -> Result<(usize, &[f64])> {
        if self.iterations_ran < 1 {
            anyhow::bail!("no EM iterations were run");
        }
        Ok((self.iterations_ran, &self.alpha))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ec(entries: &[(u64, &[u32], f64)]) -> (FxHashMap<u64, Vec<u32>>, FxHashMap<u64, f64>) {
        let mut ec_map = FxHashMap::default();
        let mut counts = FxHashMap::default();
        for (segment, paths, count) in entries {
            ec_map.insert(*segment, paths.to_vec());
            counts.insert(*segment, *count);
        }
        (ec_map, counts)
    }

    #[test]
    fn test_em_rejects_bad_iteration_bounds() {
        let (ec_map, counts) = ec(&[(1, &[0], 1.0)]);
        assert!(EmRunner::new(10, 50, 1, ec_map, counts).is_err());
    }

    #[test]
    fn test_em_symmetric_classes_converge_to_equal_abundance() {
        // seg1 unique to p1, seg3 unique to p2, seg2 shared; counts 10/30/10
        let (ec_map, counts) = ec(&[(1, &[0], 10.0), (2, &[0, 1], 30.0), (3, &[1], 10.0)]);
        let mut em = EmRunner::new(10000, 50, 2, ec_map, counts).unwrap();
        em.run().unwrap();
        let (iterations, alpha) = em.results().unwrap();
        assert!(iterations >= 50);
        let ratio = alpha[0] / alpha[1];
        assert!((ratio - 1.0).abs() < 0.01, "ratio was {}", ratio);
    }

    #[test]
    fn test_em_idempotent_at_fixed_point() {
        // a single shared class with uniform alpha is already a fixed point
        let (ec_map, counts) = ec(&[(1, &[0, 1], 1.0)]);
        let mut em = EmRunner::new(1, 0, 2, ec_map, counts).unwrap();
        em.run().unwrap();
        let (_, alpha) = em.results().unwrap();
        for value in alpha {
            assert!((value - 0.5).abs() <= f64::EPSILON);
        }
    }

    #[test]
    fn test_em_unique_coverage_dominates() {
        // all the evidence sits on p1's unique segment
        let (ec_map, counts) = ec(&[(1, &[0], 100.0), (2, &[0, 1], 0.0)]);
        let mut em = EmRunner::new(10000, 50, 2, ec_map, counts).unwrap();
        em.run().unwrap();
        let (_, alpha) = em.results().unwrap();
        assert!(alpha[0] > 0.0);
        assert_eq!(alpha[1], 0.0);
    }
}
