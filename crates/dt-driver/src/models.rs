//! Reference models for demos and tests.

use serde::{Deserialize, Serialize};

use dt_types::{ConstraintDecl, DesignPoint, DesignVariable, DriverConfig, Jacobian, ObjectiveDecl, Response};

use crate::model::{Model, ModelError};

/// Open box in the (x, y) plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: (f64, f64),
    pub y: (f64, f64),
}

impl Region {
    pub fn new(x: (f64, f64), y: (f64, f64)) -> Self {
        Self { x, y }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.x.0 < x && x < self.x.1 && self.y.0 < y && y < self.y.1
    }
}

/// `f = (x - 3)^2 + xy + (y + 4)^2 - 3` with the linear constraint `c = x - y`.
///
/// Points inside the invalid region are reported as domain-invalid. The
/// model can also be told to fail outright on its n-th evaluation.
#[derive(Debug, Clone, Default)]
pub struct Paraboloid {
    invalid_region: Option<Region>,
    fail_at: Option<u64>,
    evaluations: u64,
}

impl Paraboloid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invalid_region(mut self, region: Region) -> Self {
        self.invalid_region = Some(region);
        self
    }

    /// Fail with an internal error on the `n`-th evaluation (1-based).
    pub fn with_failure_at(mut self, n: u64) -> Self {
        self.fail_at = Some(n);
        self
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn objective(x: f64, y: f64) -> f64 {
        (x - 3.0).powi(2) + x * y + (y + 4.0).powi(2) - 3.0
    }

    /// Bounds `[-50, 50]` on both variables, start at `(50, 50)`, `c >= 15`.
    pub fn config(name: impl Into<String>) -> DriverConfig {
        Self::bounded_config(name).with_constraint(ConstraintDecl::lower("c", 15.0))
    }

    /// As [`Paraboloid::config`] without the constraint.
    pub fn bounded_config(name: impl Into<String>) -> DriverConfig {
        DriverConfig::new(name)
            .with_design_variable(DesignVariable::scalar("x", 50.0).with_bounds(-50.0, 50.0))
            .with_design_variable(DesignVariable::scalar("y", 50.0).with_bounds(-50.0, 50.0))
            .with_objective(ObjectiveDecl::minimize("f"))
    }

    fn coordinates(point: &DesignPoint) -> Result<(f64, f64), ModelError> {
        match (point.scalar("x"), point.scalar("y")) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(ModelError::failed("paraboloid needs scalar inputs x and y")),
        }
    }
}

impl Model for Paraboloid {
    fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
        self.evaluations += 1;
        if self.fail_at == Some(self.evaluations) {
            return Err(ModelError::failed("internal solver failure"));
        }

        let (x, y) = Self::coordinates(point)?;
        if let Some(region) = &self.invalid_region {
            if region.contains(x, y) {
                return Err(ModelError::domain_invalid(format!(
                    "({x}, {y}) lies in the invalid region"
                )));
            }
        }

        Ok(Response::new()
            .with_objective("f", [Self::objective(x, y)])
            .with_constraint("c", [x - y]))
    }

    fn linearize(&mut self, point: &DesignPoint) -> Result<Option<Jacobian>, ModelError> {
        let (x, y) = Self::coordinates(point)?;
        Ok(Some(
            Jacobian::new()
                .with("f", "x", [2.0 * (x - 3.0) + y])
                .with("f", "y", [x + 2.0 * (y + 4.0)])
                .with("c", "x", [1.0])
                .with("c", "y", [-1.0]),
        ))
    }
}
