//! Model terms and design matrices
//!
//! Categorical terms use treatment coding against their first level.
//! Interaction columns are element-wise products of the coded columns of
//! their components, so a full factorial of categoricals is full rank.

use std::collections::HashMap;
use std::fmt;

use super::FitError;
use crate::table::{sort_labels, Cell, Table};

/// Level order of a categorical term
#[derive(Debug, Clone, PartialEq)]
pub enum Levels {
    /// Observed levels, numeric when every level is a number
    Sorted,
    /// Declared order; the first observed level is the reference
    Explicit(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Continuous(String),
    Categorical { column: String, levels: Levels },
    Interaction(Vec<Term>),
}

impl Term {
    pub fn continuous(column: &str) -> Self {
        Term::Continuous(column.to_string())
    }

    pub fn categorical(column: &str) -> Self {
        Term::Categorical {
            column: column.to_string(),
            levels: Levels::Sorted,
        }
    }

    pub fn categorical_in_order(column: &str, levels: Vec<String>) -> Self {
        Term::Categorical {
            column: column.to_string(),
            levels: Levels::Explicit(levels),
        }
    }

    /// Table columns the term reads
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Term::Continuous(c) => vec![c.as_str()],
            Term::Categorical { column, .. } => vec![column.as_str()],
            Term::Interaction(parts) => parts.iter().flat_map(Term::columns).collect(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Continuous(c) => f.write_str(c),
            Term::Categorical { column, .. } => write!(f, "C({column})"),
            Term::Interaction(parts) => {
                let labels: Vec<String> = parts.iter().map(Term::to_string).collect();
                f.write_str(&labels.join(":"))
            }
        }
    }
}

/// Main effects and every interaction of the given factors, lower orders
/// first: `a * b * c` expands to `a + b + c + a:b + a:c + b:c + a:b:c`.
pub fn full_factorial(factors: &[Term]) -> Vec<Term> {
    let mut terms = Vec::new();
    for order in 1..=factors.len() {
        for combo in combinations(factors.len(), order) {
            let mut parts: Vec<Term> = combo.iter().map(|&i| factors[i].clone()).collect();
            if parts.len() == 1 {
                terms.append(&mut parts);
            } else {
                terms.push(Term::Interaction(parts));
            }
        }
    }
    terms
}

fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    fn extend(
        start: usize,
        n: usize,
        k: usize,
        current: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            extend(i + 1, n, k, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    extend(0, n, k, &mut Vec::new(), &mut out);
    out
}

/// A named model: response, fixed-effect terms and the grouping column of
/// the random intercept
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub response: String,
    pub terms: Vec<Term>,
    pub group: String,
}

impl ModelSpec {
    pub fn new(name: &str, response: &str, terms: Vec<Term>, group: &str) -> Self {
        Self {
            name: name.to_string(),
            response: response.to_string(),
            terms,
            group: group.to_string(),
        }
    }

    /// Same model under another name without the terms whose labels are given
    pub fn without(&self, name: &str, labels: &[String]) -> Self {
        Self {
            name: name.to_string(),
            terms: self
                .terms
                .iter()
                .filter(|t| !labels.contains(&t.to_string()))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    pub fn term_labels(&self) -> Vec<String> {
        self.terms.iter().map(Term::to_string).collect()
    }

    /// Every table column the model reads
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = vec![self.response.as_str(), self.group.as_str()];
        for column in self.terms.iter().flat_map(Term::columns) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }

    pub fn formula(&self) -> String {
        let mut rhs = self.term_labels();
        rhs.push(format!("(1|{})", self.group));
        format!("{} ~ {}", self.response, rhs.join(" + "))
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formula())
    }
}

/// Numeric design of one model over its complete rows
#[derive(Debug, Clone)]
pub struct Design {
    pub response: Vec<f64>,
    /// Row-major fixed-effect design, intercept first
    pub x: Vec<Vec<f64>>,
    pub names: Vec<String>,
    /// Group index of every row
    pub groups: Vec<usize>,
    /// Group labels, in first-appearance order
    pub group_labels: Vec<String>,
    /// Source table row of every design row
    pub rows: Vec<usize>,
}

impl Design {
    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    pub fn n_params(&self) -> usize {
        self.names.len()
    }

    pub fn n_groups(&self) -> usize {
        self.group_labels.len()
    }
}

fn column<'a>(table: &'a Table, name: &str) -> Result<&'a [Cell], FitError> {
    table
        .column(name)
        .map_err(|_| FitError::MissingColumn(name.to_string()))
}

/// Coded columns of one term over the kept rows
struct Coded {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

fn code_term(table: &Table, term: &Term, rows: &[usize]) -> Result<Coded, FitError> {
    match term {
        Term::Continuous(name) => {
            let cells = column(table, name)?;
            Ok(Coded {
                names: vec![name.clone()],
                columns: vec![rows
                    .iter()
                    .map(|&r| cells[r].as_f64().unwrap_or(f64::NAN))
                    .collect()],
            })
        }
        Term::Categorical { column: name, levels } => {
            let labels: Vec<String> = column(table, name)?
                .iter()
                .enumerate()
                .filter(|(r, _)| rows.binary_search(r).is_ok())
                .filter_map(|(_, c)| c.as_label())
                .collect();
            let order = level_order(name, levels, &labels)?;
            let cells = column(table, name)?;
            let mut coded = Coded {
                names: Vec::new(),
                columns: Vec::new(),
            };
            for level in order.iter().skip(1) {
                coded.names.push(format!("C({name})[T.{level}]"));
                coded.columns.push(
                    rows.iter()
                        .map(|&r| {
                            if cells[r].as_label().as_deref() == Some(level.as_str()) {
                                1.0
                            } else {
                                0.0
                            }
                        })
                        .collect(),
                );
            }
            Ok(coded)
        }
        Term::Interaction(parts) => {
            let mut product = Coded {
                names: vec![String::new()],
                columns: vec![vec![1.0; rows.len()]],
            };
            for part in parts {
                let coded = code_term(table, part, rows)?;
                let mut next = Coded {
                    names: Vec::new(),
                    columns: Vec::new(),
                };
                for (left_name, left) in product.names.iter().zip(&product.columns) {
                    for (right_name, right) in coded.names.iter().zip(&coded.columns) {
                        next.names.push(if left_name.is_empty() {
                            right_name.clone()
                        } else {
                            format!("{left_name}:{right_name}")
                        });
                        next.columns
                            .push(left.iter().zip(right).map(|(a, b)| a * b).collect());
                    }
                }
                product = next;
            }
            Ok(product)
        }
    }
}

/// Observed levels in model order
fn level_order(
    column: &str,
    levels: &Levels,
    observed: &[String],
) -> Result<Vec<String>, FitError> {
    let mut distinct: Vec<String> = Vec::new();
    for label in observed {
        if !distinct.contains(label) {
            distinct.push(label.clone());
        }
    }
    match levels {
        Levels::Sorted => {
            sort_labels(&mut distinct);
            Ok(distinct)
        }
        Levels::Explicit(order) => {
            if let Some(unknown) = distinct.iter().find(|l| !order.contains(l)) {
                return Err(FitError::UnknownLevel {
                    column: column.to_string(),
                    level: unknown.clone(),
                });
            }
            Ok(order
                .iter()
                .filter(|l| distinct.contains(l))
                .cloned()
                .collect())
        }
    }
}

/// Build the design of a model. Rows missing any model column (or with a
/// non-numeric value in a continuous column) are left out.
pub fn build_design(table: &Table, spec: &ModelSpec) -> Result<Design, FitError> {
    let response = column(table, &spec.response)?;
    let groups = column(table, &spec.group)?;

    let mut keep = vec![true; table.n_rows()];
    let mut numeric: Vec<&str> = vec![spec.response.as_str()];
    collect_continuous(&spec.terms, &mut numeric);
    for name in spec.columns() {
        let cells = column(table, name)?;
        let needs_number = numeric.contains(&name);
        for (k, cell) in keep.iter_mut().zip(cells) {
            let present = if needs_number {
                cell.as_f64().is_some()
            } else {
                !cell.is_missing()
            };
            *k &= present;
        }
    }
    let rows: Vec<usize> = (0..table.n_rows()).filter(|&r| keep[r]).collect();
    if rows.is_empty() {
        return Err(FitError::NoObservations);
    }

    let mut names = vec!["Intercept".to_string()];
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; rows.len()]];
    for term in &spec.terms {
        let coded = code_term(table, term, &rows)?;
        names.extend(coded.names);
        columns.extend(coded.columns);
    }

    let x: Vec<Vec<f64>> = (0..rows.len())
        .map(|i| columns.iter().map(|c| c[i]).collect())
        .collect();

    let mut group_labels: Vec<String> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut group_of_row = Vec::with_capacity(rows.len());
    for &r in &rows {
        let label = groups[r].as_label().unwrap_or_default();
        let next = group_labels.len();
        let g = *group_index.entry(label.clone()).or_insert(next);
        if g == next {
            group_labels.push(label);
        }
        group_of_row.push(g);
    }

    Ok(Design {
        response: rows
            .iter()
            .map(|&r| response[r].as_f64().unwrap_or(f64::NAN))
            .collect(),
        x,
        names,
        groups: group_of_row,
        group_labels,
        rows,
    })
}

fn collect_continuous<'a>(terms: &'a [Term], out: &mut Vec<&'a str>) {
    for term in terms {
        match term {
            Term::Continuous(c) => out.push(c.as_str()),
            Term::Interaction(parts) => collect_continuous(parts, out),
            Term::Categorical { .. } => {}
        }
    }
}
