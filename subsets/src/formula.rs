use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;
use varisat::Lit;

/// Index of a soft constraint (group of clauses), in `[0, num_groups)`.
pub type Group = usize;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("could not read formula: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: clause found before the problem line")]
    MissingHeader { line: usize },
    #[error("line {line}: invalid problem line \"{content}\"")]
    InvalidHeader { line: usize, content: String },
    #[error("line {line}: second problem line")]
    DuplicateHeader { line: usize },
    #[error("line {line}: invalid token \"{token}\"")]
    InvalidToken { line: usize, token: String },
    #[error("line {line}: clause is not terminated by 0")]
    Unterminated { line: usize },
    #[error("line {line}: group {group} out of range [0, {num_groups}]")]
    GroupOutOfRange { line: usize, group: usize, num_groups: usize },
    #[error("line {line}: variable {var} out of range [1, {num_vars}]")]
    VariableOutOfRange { line: usize, var: usize, num_vars: usize },
    #[error("{found} clauses found but {declared} were declared")]
    ClauseCount { declared: usize, found: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    /// Soft group of the clause, `None` for hard clauses.
    pub group: Option<Group>,
    pub lits: Vec<Lit>,
}

/// Hard clauses and soft groups of a (G)CNF instance.
///
/// Built once when loading the instance and never modified afterwards.
#[derive(Clone, Debug, Default)]
pub struct Formula {
    num_vars: usize,
    num_groups: usize,
    /// All clauses, in the order of the input file.
    clauses: Vec<Clause>,
}

impl Formula {
    pub fn new(num_vars: usize, num_groups: usize) -> Self {
        Formula {
            num_vars,
            num_groups,
            clauses: Vec::new(),
        }
    }

    /// Adds a clause given as DIMACS literals.
    ///
    /// # Panic
    /// Panics if the group or one of the variables is out of range.
    pub fn add_clause(&mut self, group: Option<Group>, lits: impl IntoIterator<Item = isize>) {
        if let Some(g) = group {
            assert!(g < self.num_groups, "group {g} out of range [0, {})", self.num_groups);
        }
        let lits = lits
            .into_iter()
            .map(|l| {
                assert!(l != 0 && l.unsigned_abs() <= self.num_vars, "literal {l} out of range");
                Lit::from_dimacs(l)
            })
            .collect();
        self.clauses.push(Clause { group, lits });
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn hard_clauses(&self) -> impl Iterator<Item = &[Lit]> + '_ {
        self.clauses
            .iter()
            .filter(|c| c.group.is_none())
            .map(|c| c.lits.as_slice())
    }

    /// Loads a formula from a DIMACS CNF or GCNF file, decompressing it first if its name ends with `.gz`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Formula, ParseError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            Formula::parse(BufReader::new(GzDecoder::new(file)))
        } else {
            Formula::parse(BufReader::new(file))
        }
    }

    /// Parses a DIMACS CNF or GCNF formula.
    ///
    /// In CNF every clause is its own soft group. In GCNF, group `{0}` holds the hard clauses
    /// and group `{g}` is the soft group `g - 1`.
    pub fn parse(input: impl BufRead) -> Result<Formula, ParseError> {
        let mut header: Option<Header> = None;
        let mut formula = Formula::default();
        let mut lits = Vec::new();

        for (i, line) in input.lines().enumerate() {
            let line = line?;
            let line_num = i + 1;
            let content = line.trim();
            if content.is_empty() || content.starts_with('c') {
                continue;
            }
            if content.starts_with('p') {
                if header.is_some() {
                    return Err(ParseError::DuplicateHeader { line: line_num });
                }
                let h = Header::parse(content).ok_or_else(|| ParseError::InvalidHeader {
                    line: line_num,
                    content: content.to_string(),
                })?;
                formula = Formula::new(h.num_vars, h.num_groups);
                header = Some(h);
                continue;
            }

            let Some(h) = header.as_ref() else {
                return Err(ParseError::MissingHeader { line: line_num });
            };

            let mut tokens = content.split_whitespace().peekable();
            let group = if h.grouped {
                let token = tokens.next().unwrap_or_default();
                let id = token
                    .strip_prefix('{')
                    .and_then(|t| t.strip_suffix('}'))
                    .and_then(|t| t.parse::<usize>().ok())
                    .ok_or_else(|| ParseError::InvalidToken {
                        line: line_num,
                        token: token.to_string(),
                    })?;
                if id > h.num_groups {
                    return Err(ParseError::GroupOutOfRange {
                        line: line_num,
                        group: id,
                        num_groups: h.num_groups,
                    });
                }
                id.checked_sub(1)
            } else {
                Some(formula.clauses.len())
            };

            lits.clear();
            let mut terminated = false;
            while let Some(token) = tokens.next() {
                let lit: isize = token.parse().map_err(|_| ParseError::InvalidToken {
                    line: line_num,
                    token: token.to_string(),
                })?;
                if lit == 0 {
                    if tokens.peek().is_some() {
                        return Err(ParseError::InvalidToken {
                            line: line_num,
                            token: "0".to_string(),
                        });
                    }
                    terminated = true;
                    break;
                }
                if lit.unsigned_abs() > h.num_vars {
                    return Err(ParseError::VariableOutOfRange {
                        line: line_num,
                        var: lit.unsigned_abs(),
                        num_vars: h.num_vars,
                    });
                }
                lits.push(lit);
            }
            if !terminated {
                return Err(ParseError::Unterminated { line: line_num });
            }
            if !h.grouped && formula.clauses.len() >= h.num_clauses {
                return Err(ParseError::ClauseCount {
                    declared: h.num_clauses,
                    found: formula.clauses.len() + 1,
                });
            }
            formula.add_clause(group, lits.iter().copied());
        }

        let declared = header.map_or(0, |h| h.num_clauses);
        if formula.clauses.len() != declared {
            return Err(ParseError::ClauseCount {
                declared,
                found: formula.clauses.len(),
            });
        }
        Ok(formula)
    }
}

struct Header {
    grouped: bool,
    num_vars: usize,
    num_clauses: usize,
    num_groups: usize,
}

impl Header {
    /// `p cnf <vars> <clauses>` or `p gcnf <vars> <clauses> <groups>`
    fn parse(line: &str) -> Option<Header> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let num = |i: usize| tokens.get(i).and_then(|t| t.parse::<usize>().ok());
        match tokens.get(1).copied() {
            Some("cnf") if tokens.len() == 4 => Some(Header {
                grouped: false,
                num_vars: num(2)?,
                num_clauses: num(3)?,
                num_groups: num(3)?,
            }),
            Some("gcnf") if tokens.len() == 5 => Some(Header {
                grouped: true,
                num_vars: num(2)?,
                num_clauses: num(3)?,
                num_groups: num(4)?,
            }),
            _ => None,
        }
    }
}
