//! Flat view of a configured problem.
//!
//! Backends work on a single vector of design values and a single vector of
//! constraint rows. [`ProblemLayout`] fixes that ordering for a run and
//! converts between it and the named [`DesignPoint`] / [`Response`] values the
//! model sees.

use ndarray::{Array1, Array2, ArrayViewMut1};

use dt_optimizers::{Evaluation, ProblemShape};
use dt_types::{DesignPoint, DriverConfig, Jacobian, ObjectiveDirection, Response};

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlot {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// How one constraint element becomes a normalized row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowForm {
    /// `c - bound >= 0`
    Lower(f64),
    /// `bound - c >= 0`
    Upper(f64),
    /// `c - target = 0`
    Equals(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRow {
    pub name: String,
    pub element: usize,
    pub form: RowForm,
}

impl ConstraintRow {
    fn value(&self, c: f64) -> f64 {
        match self.form {
            RowForm::Lower(bound) => c - bound,
            RowForm::Upper(bound) => bound - c,
            RowForm::Equals(target) => c - target,
        }
    }

    fn derivative_sign(&self) -> f64 {
        match self.form {
            RowForm::Upper(_) => -1.0,
            RowForm::Lower(_) | RowForm::Equals(_) => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProblemLayout {
    variables: Vec<VariableSlot>,
    lower: Array1<f64>,
    upper: Array1<f64>,
    initial: Array1<f64>,
    objective: String,
    /// `1.0` to minimize, `-1.0` to maximize.
    sign: f64,
    /// Inequality rows first, then equality rows.
    rows: Vec<ConstraintRow>,
    n_inequality: usize,
}

impl ProblemLayout {
    /// Build the layout of a validated configuration.
    pub fn from_config(config: &DriverConfig) -> Self {
        let mut variables = Vec::with_capacity(config.design_variables.len());
        let (mut lower, mut upper, mut initial) = (Vec::new(), Vec::new(), Vec::new());
        for var in &config.design_variables {
            variables.push(VariableSlot {
                name: var.name.clone(),
                offset: initial.len(),
                size: var.size(),
            });
            lower.extend(std::iter::repeat(var.lower_bound()).take(var.size()));
            upper.extend(std::iter::repeat(var.upper_bound()).take(var.size()));
            initial.extend_from_slice(&var.initial);
        }

        let mut inequality = Vec::new();
        let mut equality = Vec::new();
        for constraint in &config.constraints {
            for element in 0..constraint.size {
                let row = |form| ConstraintRow {
                    name: constraint.name.clone(),
                    element,
                    form,
                };
                if let Some(target) = constraint.equals {
                    equality.push(row(RowForm::Equals(target)));
                    continue;
                }
                if let Some(bound) = constraint.lower {
                    inequality.push(row(RowForm::Lower(bound)));
                }
                if let Some(bound) = constraint.upper {
                    inequality.push(row(RowForm::Upper(bound)));
                }
            }
        }
        let n_inequality = inequality.len();
        inequality.extend(equality);

        let (objective, sign) = match config.objective() {
            Some(decl) => (
                decl.name.clone(),
                match decl.direction {
                    ObjectiveDirection::Minimize => 1.0,
                    ObjectiveDirection::Maximize => -1.0,
                },
            ),
            None => (String::new(), 1.0),
        };

        Self {
            variables,
            lower: Array1::from(lower),
            upper: Array1::from(upper),
            initial: Array1::from(initial),
            objective,
            sign,
            rows: inequality,
            n_inequality,
        }
    }

    pub fn dim(&self) -> usize {
        self.initial.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.rows.len()
    }

    pub fn variables(&self) -> &[VariableSlot] {
        &self.variables
    }

    pub fn rows(&self) -> &[ConstraintRow] {
        &self.rows
    }

    pub fn initial(&self) -> &Array1<f64> {
        &self.initial
    }

    pub fn objective_name(&self) -> &str {
        &self.objective
    }

    /// `1.0` for minimization, `-1.0` for maximization.
    pub fn sign(&self) -> f64 {
        self.sign
    }

    pub fn shape(&self) -> ProblemShape {
        ProblemShape {
            lower: self.lower.clone(),
            upper: self.upper.clone(),
            n_inequality: self.n_inequality,
            n_equality: self.rows.len() - self.n_inequality,
        }
    }

    /// Split a flat vector into named design variables.
    pub fn point(&self, x: &Array1<f64>) -> DesignPoint {
        let mut point = DesignPoint::new();
        for slot in &self.variables {
            let values = x
                .iter()
                .skip(slot.offset)
                .take(slot.size)
                .copied()
                .collect::<Vec<_>>();
            point.insert(slot.name.clone(), values);
        }
        point
    }

    /// Objective, normalized constraints and their derivatives, in the form a
    /// backend minimizes. Fails if the response lacks an output or derivatives.
    pub fn evaluation(&self, response: &Response) -> Result<Evaluation, String> {
        let objective = response
            .objective(&self.objective)
            .and_then(|v| v.first().copied())
            .ok_or_else(|| format!("response has no value for objective {}", self.objective))?;
        let derivatives = response
            .derivatives
            .as_ref()
            .ok_or_else(|| "response carries no derivatives".to_string())?;

        let n = self.dim();
        let mut gradient = Array1::<f64>::zeros(n);
        self.fill_row(derivatives, &self.objective, 0, gradient.view_mut());
        gradient *= self.sign;

        let m = self.rows.len();
        let mut constraints = Array1::<f64>::zeros(m);
        let mut jacobian = Array2::<f64>::zeros((m, n));
        for (i, row) in self.rows.iter().enumerate() {
            let value = response
                .constraint(&row.name)
                .and_then(|v| v.get(row.element).copied())
                .ok_or_else(|| format!("response has no value for {}[{}]", row.name, row.element))?;
            constraints[i] = row.value(value);

            let mut out = jacobian.row_mut(i);
            self.fill_row(derivatives, &row.name, row.element, out.view_mut());
            out *= row.derivative_sign();
        }

        Ok(Evaluation {
            objective: self.sign * objective,
            gradient,
            constraints,
            jacobian,
        })
    }

    /// Copy row `element` of every `d output / d variable` block into `out`.
    fn fill_row(
        &self,
        derivatives: &Jacobian,
        output: &str,
        element: usize,
        mut out: ArrayViewMut1<'_, f64>,
    ) {
        for slot in &self.variables {
            let Some(block) = derivatives.get(output, &slot.name) else {
                continue;
            };
            let start = element * slot.size;
            for j in 0..slot.size {
                if let Some(&value) = block.get(start + j) {
                    out[slot.offset + j] = value;
                }
            }
        }
    }
}
