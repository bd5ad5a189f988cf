use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Candidate assignment of values to every design variable.
///
/// Entries keep the order in which they were inserted, which is the order the
/// variables were declared in and the order they are flattened in when handed
/// to an optimizer backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesignPoint {
    entries: Vec<(String, Vec<f64>)>,
}

impl DesignPoint {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Vec<f64>>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_scalar(self, name: impl Into<String>, value: f64) -> Self {
        self.with(name, vec![value])
    }

    /// Insert or replace a variable. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<f64>>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Value of a size-1 variable.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some([value]) => Some(*value),
            _ => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Concatenate all values in declaration order.
    pub fn flatten(&self) -> Vec<f64> {
        self.entries.iter().flat_map(|(_, v)| v.iter().copied()).collect()
    }
}

impl fmt::Display for DesignPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, values)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}=[")?;
            for (j, v) in values.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v:.6}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Derivatives of one output with respect to one design variable, row-major
/// (`rows = size(of)`, `cols = size(wrt)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JacobianBlock {
    pub of: String,
    pub wrt: String,
    pub values: Vec<f64>,
}

/// Sparse collection of Jacobian blocks. Missing blocks are zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Jacobian {
    blocks: Vec<JacobianBlock>,
}

impl Jacobian {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn with(
        mut self,
        of: impl Into<String>,
        wrt: impl Into<String>,
        values: impl Into<Vec<f64>>,
    ) -> Self {
        self.insert(of, wrt, values);
        self
    }

    pub fn insert(
        &mut self,
        of: impl Into<String>,
        wrt: impl Into<String>,
        values: impl Into<Vec<f64>>,
    ) {
        let (of, wrt, values) = (of.into(), wrt.into(), values.into());
        match self
            .blocks
            .iter_mut()
            .find(|b| b.of == of && b.wrt == wrt)
        {
            Some(block) => block.values = values,
            None => self.blocks.push(JacobianBlock { of, wrt, values }),
        }
    }

    pub fn get(&self, of: &str, wrt: &str) -> Option<&[f64]> {
        self.blocks
            .iter()
            .find(|b| b.of == of && b.wrt == wrt)
            .map(|b| b.values.as_slice())
    }

    pub fn blocks(&self) -> &[JacobianBlock] {
        &self.blocks
    }

    pub fn is_finite(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.values.iter().all(|v| v.is_finite()))
    }
}

/// Values produced by one successful model evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub objectives: BTreeMap<String, Vec<f64>>,
    pub constraints: BTreeMap<String, Vec<f64>>,
    /// Total derivatives, when the model or the finite-difference pass supplied them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivatives: Option<Jacobian>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objective(mut self, name: impl Into<String>, value: impl Into<Vec<f64>>) -> Self {
        self.objectives.insert(name.into(), value.into());
        self
    }

    pub fn with_constraint(mut self, name: impl Into<String>, value: impl Into<Vec<f64>>) -> Self {
        self.constraints.insert(name.into(), value.into());
        self
    }

    pub fn with_derivatives(mut self, derivatives: Jacobian) -> Self {
        self.derivatives = Some(derivatives);
        self
    }

    pub fn objective(&self, name: &str) -> Option<&[f64]> {
        self.objectives.get(name).map(Vec::as_slice)
    }

    pub fn constraint(&self, name: &str) -> Option<&[f64]> {
        self.constraints.get(name).map(Vec::as_slice)
    }

    /// Look up an output by name, objectives first.
    pub fn output(&self, name: &str) -> Option<&[f64]> {
        self.objective(name).or_else(|| self.constraint(name))
    }

    /// True when every objective and constraint value is finite.
    pub fn values_are_finite(&self) -> bool {
        self.objectives
            .values()
            .chain(self.constraints.values())
            .all(|v| v.iter().all(|x| x.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn design_point_preserves_declaration_order() {
        let point = DesignPoint::new()
            .with_scalar("y", 2.0)
            .with("x", vec![1.0, 3.0])
            .with_scalar("y", 5.0);

        let names: Vec<&str> = point.names().collect();
        assert_eq!(names, vec!["y", "x"]);
        assert_eq!(point.flatten(), vec![5.0, 1.0, 3.0]);
        assert_eq!(point.scalar("y"), Some(5.0));
        assert_eq!(point.scalar("x"), None);
    }

    #[test]
    fn design_point_display() {
        let point = DesignPoint::new().with_scalar("x", 1.5).with("z", [0.0, -1.0]);
        assert_eq!(
            point.to_string(),
            "x=[1.500000], z=[0.000000, -1.000000]"
        );
    }

    #[test]
    fn jacobian_insert_replaces_block() {
        let mut jac = Jacobian::new().with("f", "x", [1.0]);
        jac.insert("f", "x", [2.0]);
        assert_eq!(jac.blocks().len(), 1);
        assert_eq!(jac.get("f", "x"), Some(&[2.0][..]));
        assert!(jac.get("f", "y").is_none());
    }

    #[test]
    fn response_lookup_and_finiteness() {
        let response = Response::new()
            .with_objective("f", [1.0])
            .with_constraint("c", [f64::NAN]);

        assert_eq!(response.output("f"), Some(&[1.0][..]));
        assert!(response.output("c").is_some());
        assert!(!response.values_are_finite());
    }

    #[test]
    fn response_serialization_skips_missing_derivatives() {
        let response = Response::new().with_objective("f", [1.0]);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("derivatives"));
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
