use itertools::Itertools;
use thiserror::Error;
use tracing::trace;
use varisat::{ExtendFormula, Lit, Solver, Var};

use crate::formula::{Formula, Group};

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("SAT engine failure: {0}")]
    Engine(String),
}

/// An incremental SAT engine seen through the soft groups of a formula.
///
/// Each soft group `g` is guarded by a relaxation variable whose index is always
/// `num_vars() + g`: when it is assumed true, the clauses of the group are enforced,
/// otherwise the engine is free to disable them.
///
/// Calls are not reentrant: `sat_subset` and `unsat_core` describe the last solve call.
pub trait SatOracle {
    /// Number of problem variables, i.e. the index of the first relaxation variable.
    fn num_vars(&self) -> usize;

    fn num_groups(&self) -> usize;

    /// Decides the satisfiability of the hard clauses together with the groups of `seed`.
    fn solve_subset(&mut self, seed: &[Group]) -> Result<bool, OracleError> {
        let assumptions = seed.iter().map(|&g| self.relaxation_lit(g)).collect_vec();
        self.solve(&assumptions)
    }

    /// All groups enabled in the model of the last (satisfiable) solve call.
    /// This is a superset of the groups assumed by that call.
    fn sat_subset(&self) -> Vec<Group>;

    /// The assumed groups used to refute the last (unsatisfiable) solve call.
    /// This is a subset of the groups assumed by that call.
    fn unsat_core(&self) -> Vec<Group>;

    /// Solves under arbitrary assumption literals.
    fn solve(&mut self, assumptions: &[Lit]) -> Result<bool, OracleError>;

    /// Allocates a variable that is neither a problem nor a relaxation variable.
    fn new_var(&mut self) -> Var;

    /// Permanently adds a clause.
    fn add_clause(&mut self, lits: &[Lit]);

    fn relaxation_var(&self, group: Group) -> Var {
        debug_assert!(group < self.num_groups());
        Var::from_index(self.num_vars() + group)
    }

    fn relaxation_lit(&self, group: Group) -> Lit {
        Lit::from_var(self.relaxation_var(group), true)
    }

    /// Inverse of `relaxation_var`, `None` for variables that do not guard a group.
    fn group_of(&self, var: Var) -> Option<Group> {
        var.index()
            .checked_sub(self.num_vars())
            .filter(|&g| g < self.num_groups())
    }
}

/// [`SatOracle`] backed by the varisat CDCL solver.
///
/// The model (resp. core) of a solve call is copied out of the engine right away,
/// so that clauses added afterwards do not invalidate it.
pub struct VarisatOracle {
    solver: Solver<'static>,
    num_vars: usize,
    num_groups: usize,
    /// Clauses of each soft group, without their relaxation literal.
    groups: Vec<Vec<Vec<Lit>>>,
    /// Index of the next helper variable, after all problem and relaxation variables.
    next_var: usize,
    /// Assumptions of the last solve call.
    assumptions: Vec<Lit>,
    last_result: Option<bool>,
    /// Value of each problem and relaxation variable in the last model, `false` if unassigned.
    model: Vec<bool>,
    /// Groups of the last unsat core.
    core: Vec<Group>,
}

impl VarisatOracle {
    pub fn new(formula: &Formula) -> Self {
        let mut oracle = VarisatOracle {
            solver: Solver::new(),
            num_vars: formula.num_vars(),
            num_groups: formula.num_groups(),
            groups: vec![Vec::new(); formula.num_groups()],
            next_var: formula.num_vars() + formula.num_groups(),
            assumptions: Vec::new(),
            last_result: None,
            model: Vec::new(),
            core: Vec::new(),
        };
        for lits in formula.hard_clauses() {
            oracle.solver.add_clause(lits);
        }
        let mut buf = Vec::new();
        for clause in formula.clauses() {
            let Some(g) = clause.group else { continue };
            buf.clear();
            buf.extend_from_slice(&clause.lits);
            buf.push(!oracle.relaxation_lit(g));
            oracle.solver.add_clause(&buf);
            oracle.groups[g].push(clause.lits.clone());
        }
        oracle
    }

    fn holds(&self, lit: Lit) -> bool {
        self.model.get(lit.index()).copied().unwrap_or(false) == lit.is_positive()
    }
}

impl SatOracle for VarisatOracle {
    fn num_vars(&self) -> usize {
        self.num_vars
    }

    fn num_groups(&self) -> usize {
        self.num_groups
    }

    fn sat_subset(&self) -> Vec<Group> {
        assert_eq!(self.last_result, Some(true), "no model: the last solve call was not satisfiable");
        // A group is also enabled when the model happens to satisfy all of its clauses.
        // Unassigned variables are read as false, so one assignment satisfies every enabled group.
        let enabled = (0..self.num_groups)
            .filter(|&g| {
                self.model[self.relaxation_var(g).index()]
                    || self.groups[g].iter().all(|clause| clause.iter().any(|&l| self.holds(l)))
            })
            .collect_vec();
        debug_assert!(
            self.assumptions
                .iter()
                .filter(|l| l.is_positive())
                .filter_map(|l| self.group_of(l.var()))
                .all(|g| enabled.binary_search(&g).is_ok())
        );
        enabled
    }

    fn unsat_core(&self) -> Vec<Group> {
        assert_eq!(self.last_result, Some(false), "no core: the last solve call was not unsatisfiable");
        self.core.clone()
    }

    fn solve(&mut self, assumptions: &[Lit]) -> Result<bool, OracleError> {
        self.last_result = None;
        self.model.clear();
        self.core.clear();
        self.assumptions.clear();
        self.assumptions.extend_from_slice(assumptions);
        self.solver.assume(assumptions);
        let result = self
            .solver
            .solve()
            .map_err(|err| OracleError::Engine(err.to_string()))?;
        trace!(assumptions = assumptions.len(), sat = result, "oracle call");

        if result {
            self.model.resize(self.num_vars + self.num_groups, false);
            for lit in self.solver.model().unwrap_or_default() {
                if let Some(value) = self.model.get_mut(lit.index()) {
                    *value = lit.is_positive();
                }
            }
        } else {
            let core = self
                .solver
                .failed_core()
                .unwrap_or_default()
                .iter()
                .filter(|l| l.is_positive())
                .filter_map(|l| self.group_of(l.var()))
                .sorted_unstable()
                .dedup()
                .collect_vec();
            self.core = core;
        }
        self.last_result = Some(result);
        Ok(result)
    }

    fn new_var(&mut self) -> Var {
        let var = Var::from_index(self.next_var);
        self.next_var += 1;
        var
    }

    fn add_clause(&mut self, lits: &[Lit]) {
        self.solver.add_clause(lits);
    }
}

#[cfg(test)]
mod tests {
    use varisat::{Lit, Var};

    use crate::formula::Formula;

    use super::{SatOracle, VarisatOracle};

    fn oracle(input: &str) -> VarisatOracle {
        VarisatOracle::new(&Formula::parse(input.as_bytes()).unwrap())
    }

    #[test]
    fn test_relaxation_numbering() {
        let o = oracle("p gcnf 4 1 3\n{1} 1 0\n");
        assert_eq!(o.relaxation_var(0), Var::from_index(4));
        assert_eq!(o.relaxation_var(2), Var::from_index(6));
        assert_eq!(o.group_of(Var::from_index(5)), Some(1));
        assert_eq!(o.group_of(Var::from_index(3)), None);
        assert_eq!(o.group_of(Var::from_index(7)), None);
    }

    #[test]
    fn test_sat_subset_contains_seed() {
        // groups 0 and 1 conflict, group 2 is free
        let mut o = oracle("p gcnf 2 3 3\n{1} 1 0\n{2} -1 0\n{3} 2 0\n");
        assert!(o.solve_subset(&[0]).unwrap());
        let sat = o.sat_subset();
        assert!(sat.contains(&0));
        assert!(!sat.contains(&1));
    }

    #[test]
    fn test_sat_subset_widened_by_model() {
        // group 0 forces x1, which satisfies groups 1 and 2 whatever the other variables
        let mut o = oracle("p gcnf 3 4 4\n{1} 1 0\n{2} 1 2 0\n{3} -3 1 0\n{4} -1 0\n");
        assert!(o.solve_subset(&[0]).unwrap());
        assert_eq!(o.sat_subset(), vec![0, 1, 2]);
    }

    #[test]
    fn test_results_survive_added_clauses() {
        let mut o = oracle("p gcnf 2 3 3\n{1} 1 0\n{2} -1 0\n{3} 2 0\n");
        assert!(o.solve_subset(&[0, 2]).unwrap());
        let x = o.new_var();
        o.add_clause(&[Lit::from_var(x, false)]);
        assert_eq!(o.sat_subset(), vec![0, 2]);

        assert!(!o.solve_subset(&[0, 1]).unwrap());
        o.add_clause(&[Lit::from_var(x, false)]);
        assert_eq!(o.unsat_core(), vec![0, 1]);
    }

    #[test]
    fn test_unsat_core_subset_of_seed() {
        let mut o = oracle("p gcnf 2 3 3\n{1} 1 0\n{2} -1 0\n{3} 2 0\n");
        assert!(!o.solve_subset(&[0, 1, 2]).unwrap());
        assert_eq!(o.unsat_core(), vec![0, 1]);
    }

    #[test]
    fn test_hard_clauses_alone_unsat() {
        let mut o = oracle("p gcnf 1 3 1\n{0} 1 0\n{0} -1 0\n{1} 1 0\n");
        assert!(!o.solve_subset(&[0]).unwrap());
        assert!(o.unsat_core().is_empty());
    }

    #[test]
    fn test_helper_vars_after_relaxation_vars() {
        let mut o = oracle("p gcnf 3 1 2\n{1} 1 0\n");
        let x = o.new_var();
        assert_eq!(x.index(), 5);
        assert_eq!(o.new_var().index(), 6);
        o.add_clause(&[Lit::from_var(x, false)]);
        assert!(!o.solve(&[Lit::from_var(x, true)]).unwrap());
        assert!(o.unsat_core().is_empty());
    }
}
