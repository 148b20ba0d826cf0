//! Subset solver for MUS/MSS extraction on grouped CNF formulas.
//!
//! A [`Formula`] splits its clauses into hard clauses and soft groups.
//! The [`SubsetSolver`] decides the satisfiability of any subset of groups and
//! shrinks unsatisfiable subsets to minimal ones (MUS) or grows satisfiable subsets
//! to maximal ones (MSS). These are the building blocks of MARCO-style enumeration.
//!
//! ```
//! use std::collections::BTreeSet;
//! use marco_subsets::{Formula, SubsetSolver};
//!
//! // x1, !x1 and x2 as three soft groups
//! let formula = Formula::parse("p cnf 2 3\n1 0\n-1 0\n2 0\n".as_bytes()).unwrap();
//! let mut solver = SubsetSolver::new(&formula);
//!
//! assert!(!solver.check_subset(&[0, 1, 2]).unwrap());
//! assert_eq!(solver.shrink([0, 1, 2], &BTreeSet::new()).unwrap(), BTreeSet::from([0, 1]));
//! assert!(solver.grow(&[2]).unwrap().len() == 2);
//! ```

pub mod cleanup;
pub mod formula;
pub mod muser;
pub mod oracle;
pub mod params;
pub mod solver;
pub mod table;

pub use formula::{Formula, Group, ParseError};
pub use muser::{Muser, MuserError, SetupError};
pub use oracle::{OracleError, SatOracle, VarisatOracle};
pub use solver::{MinimizationStrategy, Mss, Mus, SubsetError, SubsetSolver};
pub use table::ClauseTable;
