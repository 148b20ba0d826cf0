use itertools::Itertools;

use crate::formula::{Formula, Group};

/// Textual DIMACS rendering of every clause of a formula, indexed by group.
///
/// Index `0` of the group table is the "don't care" group of hard clauses,
/// soft group `g` lives at index `g + 1`, as in the GCNF numbering.
#[derive(Clone, Debug)]
pub struct ClauseTable {
    /// One line per clause, `"l1 l2 ... 0\n"`, without any group prefix.
    lines: Vec<String>,
    groups: Vec<Vec<usize>>,
    num_vars: usize,
}

impl ClauseTable {
    pub fn new(formula: &Formula) -> Self {
        let mut groups = vec![Vec::new(); formula.num_groups() + 1];
        let lines = formula
            .clauses()
            .iter()
            .enumerate()
            .map(|(i, clause)| {
                groups[clause.group.map_or(0, |g| g + 1)].push(i);
                format!("{} 0\n", clause.lits.iter().map(|l| l.to_dimacs()).join(" "))
                    .trim_start()
                    .to_string()
            })
            .collect();
        ClauseTable {
            lines,
            groups,
            num_vars: formula.num_vars(),
        }
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn hard_lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups[0].iter().map(|&i| self.lines[i].as_str())
    }

    pub fn group_lines(&self, group: Group) -> impl Iterator<Item = &str> + '_ {
        self.groups[group + 1].iter().map(|&i| self.lines[i].as_str())
    }
}
