use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, instrument};
use varisat::Lit;

use crate::formula::{Formula, Group};
use crate::muser::{Muser, MuserError};
use crate::oracle::{OracleError, SatOracle, VarisatOracle};
use crate::params::CHECK_RESULTS;
use crate::table::ClauseTable;

/// A minimal unsatisfiable subset of groups.
pub type Mus = BTreeSet<Group>;
/// A maximal satisfiable subset of groups, sorted.
pub type Mss = Vec<Group>;

#[derive(Error, Debug)]
pub enum SubsetError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Minimizer(#[from] MuserError),
}

/// How `shrink` reduces an unsatisfiable seed to a MUS.
#[derive(Clone, Debug, Default)]
pub enum MinimizationStrategy {
    /// Deletion search on the SAT oracle, skipping the groups left out of each unsat core.
    #[default]
    DeletionSearch,
    /// Delegate to an external MUSer2 process.
    ExternalDelegate(Muser),
}

enum Minimizer {
    DeletionSearch,
    External { muser: Muser, table: ClauseTable },
}

#[derive(Clone, Debug, Default)]
pub struct SubsetStats {
    pub checks: u64,
    pub shrinks: u64,
    pub grows: u64,
}

impl Display for SubsetStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "subset checks: {}", self.checks)?;
        writeln!(f, "shrinks:       {}", self.shrinks)?;
        writeln!(f, "grows:         {}", self.grows)
    }
}

/// Answers satisfiability queries on subsets of soft groups,
/// and shrinks (resp. grows) them to MUSes (resp. MSSes).
pub struct SubsetSolver<O: SatOracle = VarisatOracle> {
    oracle: O,
    minimizer: Minimizer,
    stats: SubsetStats,
}

impl SubsetSolver<VarisatOracle> {
    pub fn new(formula: &Formula) -> Self {
        Self::with_strategy(formula, MinimizationStrategy::DeletionSearch)
    }

    pub fn with_strategy(formula: &Formula, strategy: MinimizationStrategy) -> Self {
        Self::with_oracle(VarisatOracle::new(formula), formula, strategy)
    }
}

impl<O: SatOracle> SubsetSolver<O> {
    /// Builds a subset solver on an oracle already loaded with `formula`.
    pub fn with_oracle(oracle: O, formula: &Formula, strategy: MinimizationStrategy) -> Self {
        assert_eq!(oracle.num_vars(), formula.num_vars());
        assert_eq!(oracle.num_groups(), formula.num_groups());
        let minimizer = match strategy {
            MinimizationStrategy::DeletionSearch => Minimizer::DeletionSearch,
            MinimizationStrategy::ExternalDelegate(muser) => Minimizer::External {
                muser,
                table: ClauseTable::new(formula),
            },
        };
        SubsetSolver {
            oracle,
            minimizer,
            stats: SubsetStats::default(),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.oracle.num_groups()
    }

    pub fn stats(&self) -> &SubsetStats {
        &self.stats
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    fn assert_in_range(&self, groups: &[Group]) {
        let n = self.num_groups();
        assert!(
            groups.iter().all(|&g| g < n),
            "group index out of range [0, {n}) in {groups:?}"
        );
    }

    fn solve_subset(&mut self, subset: &[Group]) -> Result<bool, OracleError> {
        self.stats.checks += 1;
        self.oracle.solve_subset(subset)
    }

    /// Returns true if the hard clauses together with the groups of `seed` are satisfiable.
    pub fn check_subset(&mut self, seed: &[Group]) -> Result<bool, OracleError> {
        self.assert_in_range(seed);
        self.solve_subset(seed)
    }

    /// Same as `check_subset`, but also returns an improved seed:
    /// - if SAT: all groups satisfied by the model found (a superset of `seed`),
    /// - if UNSAT: an unsat core (a subset of `seed`).
    pub fn check_subset_improve(&mut self, seed: &[Group]) -> Result<(bool, Vec<Group>), OracleError> {
        let sat = self.check_subset(seed)?;
        let improved = if sat {
            self.oracle.sat_subset()
        } else {
            self.oracle.unsat_core()
        };
        Ok((sat, improved))
    }

    /// Groups of `[0, num_groups)` that are not in `seed`, in ascending order.
    pub fn complement(&self, seed: &[Group]) -> Vec<Group> {
        let mut present = vec![false; self.num_groups()];
        for &g in seed {
            present[g] = true;
        }
        present.iter().positions(|&p| !p).collect()
    }

    /// Returns true if some satisfiable subset strictly contains `seed`.
    ///
    /// A fresh selector `x` activates the temporary clause `(!x | r_g1 | r_g2 | ...)` over the
    /// relaxation literals of the complement, and is permanently disabled afterwards.
    /// When satisfiable, `oracle().sat_subset()` gives such a superset.
    pub fn check_above(&mut self, seed: &[Group]) -> Result<bool, OracleError> {
        self.assert_in_range(seed);
        let complement = self.complement(seed);
        if complement.is_empty() {
            return Ok(false);
        }
        let x = Lit::from_var(self.oracle.new_var(), true);

        let mut clause = Vec::with_capacity(complement.len() + 1);
        clause.push(!x);
        clause.extend(complement.iter().map(|&g| self.oracle.relaxation_lit(g)));
        self.oracle.add_clause(&clause);

        let mut assumptions = Vec::with_capacity(seed.len() + 1);
        assumptions.push(x);
        assumptions.extend(seed.iter().map(|&g| self.oracle.relaxation_lit(g)));
        self.stats.checks += 1;
        let result = self.oracle.solve(&assumptions);

        // retract the temporary clause
        self.oracle.add_clause(&[!x]);
        result
    }

    /// Reduces the unsatisfiable `seed` to a MUS, never removing the groups of `hard`.
    ///
    /// The result is a subset of `seed` that contains every member of `hard` present in `seed`.
    #[instrument(skip_all, fields(hard = hard.len()))]
    pub fn shrink(&mut self, seed: impl IntoIterator<Item = Group>, hard: &BTreeSet<Group>) -> Result<Mus, SubsetError> {
        let seed = seed.into_iter().collect_vec();
        self.assert_in_range(&seed);
        self.stats.shrinks += 1;

        let mus: Mus = if let Minimizer::External { muser, table } = &self.minimizer {
            muser.shrink(table, &seed, hard)?.into_iter().collect()
        } else {
            self.shrink_by_deletion(&seed, hard)?
        };
        debug!(seed = seed.len(), mus = mus.len(), "shrink done");

        if CHECK_RESULTS.get() {
            self.verify_mus(&mus, hard)?;
        }
        Ok(mus)
    }

    fn shrink_by_deletion(&mut self, seed: &[Group], hard: &BTreeSet<Group>) -> Result<Mus, OracleError> {
        let protected = seed.iter().copied().filter(|g| hard.contains(g)).collect_vec();
        let mut current: BTreeSet<Group> = seed.iter().copied().collect();

        for &g in seed {
            // already removed along with an earlier group, or protected
            if !current.contains(&g) || hard.contains(&g) {
                continue;
            }
            current.remove(&g);

            if self.solve_subset(&current.iter().copied().collect_vec())? {
                // necessary for unsatisfiability
                current.insert(g);
            } else {
                // every group outside the core is removed as well
                current = self.oracle.unsat_core().into_iter().collect();
                current.extend(&protected);
            }
        }
        Ok(current)
    }

    /// Extends the satisfiable `seed` to a MSS, working on a copy of it.
    pub fn grow(&mut self, seed: &[Group]) -> Result<Mss, OracleError> {
        let mut current = seed.to_vec();
        self.grow_in_place(&mut current)?;
        Ok(current)
    }

    /// Extends the satisfiable `seed` to a MSS.
    ///
    /// `seed` must be sorted and duplicate-free, and stays so.
    #[instrument(skip_all, fields(seed = seed.len()))]
    pub fn grow_in_place(&mut self, seed: &mut Vec<Group>) -> Result<(), OracleError> {
        self.assert_in_range(seed);
        assert!(seed.windows(2).all(|w| w[0] < w[1]), "seed must be sorted and duplicate-free");
        self.stats.grows += 1;

        for g in self.complement(seed) {
            // may have been enabled for free by an earlier model
            if seed.binary_search(&g).is_ok() {
                continue;
            }
            seed.push(g);
            if self.solve_subset(seed)? {
                *seed = self.oracle.sat_subset();
            } else {
                seed.pop();
            }
        }
        debug!(mss = seed.len(), "grow done");

        if CHECK_RESULTS.get() {
            self.verify_mss(seed)?;
        }
        Ok(())
    }

    /// Extends the satisfiable `seed` to a MSS by repeatedly jumping to a strictly larger
    /// satisfiable subset, until `check_above` reports that none exists.
    pub fn grow_above(&mut self, seed: &[Group]) -> Result<Mss, OracleError> {
        let mut current = seed.to_vec();
        while self.check_above(&current)? {
            current = self.oracle.sat_subset();
        }
        Ok(current)
    }

    fn verify_mus(&mut self, mus: &Mus, hard: &BTreeSet<Group>) -> Result<(), OracleError> {
        let groups = mus.iter().copied().collect_vec();
        assert!(!self.solve_subset(&groups)?, "shrink result is satisfiable: {groups:?}");
        for (i, g) in groups.iter().enumerate() {
            if hard.contains(g) {
                continue;
            }
            let mut smaller = groups.clone();
            smaller.remove(i);
            assert!(self.solve_subset(&smaller)?, "shrink result is not minimal, {g} is redundant");
        }
        Ok(())
    }

    fn verify_mss(&mut self, mss: &[Group]) -> Result<(), OracleError> {
        assert!(self.solve_subset(mss)?, "grow result is unsatisfiable: {mss:?}");
        for g in self.complement(mss) {
            let larger = mss.iter().copied().chain([g]).collect_vec();
            assert!(!self.solve_subset(&larger)?, "grow result is not maximal, {g} can be added");
        }
        Ok(())
    }
}
