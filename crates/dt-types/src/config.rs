//! Driver configuration.
//!
//! A [`DriverConfig`] is fixed for the duration of a run. It can be built in
//! code with the `with_*` methods or loaded from JSON; either way it is checked
//! by [`DriverConfig::validate`] before a run starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::errors::{ConfigError, DetourResult};

/// A design variable: name, starting value and optional bounds.
///
/// The length of `initial` is the size of the variable. Missing bounds mean
/// unbounded in that direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignVariable {
    pub name: String,
    pub initial: Vec<f64>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl DesignVariable {
    pub fn scalar(name: impl Into<String>, initial: f64) -> Self {
        Self::vector(name, vec![initial])
    }

    pub fn vector(name: impl Into<String>, initial: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            initial,
            lower: None,
            upper: None,
        }
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }

    pub fn size(&self) -> usize {
        self.initial.len()
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower.unwrap_or(f64::NEG_INFINITY)
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper.unwrap_or(f64::INFINITY)
    }
}

/// Whether the objective is minimized or maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    #[default]
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveDecl {
    pub name: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

impl ObjectiveDecl {
    pub fn minimize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ObjectiveDirection::Minimize,
        }
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ObjectiveDirection::Maximize,
        }
    }
}

/// A constraint on a model output: `equals`, or `lower` and/or `upper`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDecl {
    pub name: String,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub equals: Option<f64>,
}

fn default_size() -> usize {
    1
}

impl ConstraintDecl {
    fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 1,
            lower: None,
            upper: None,
            equals: None,
        }
    }

    pub fn lower(name: impl Into<String>, lower: f64) -> Self {
        Self {
            lower: Some(lower),
            ..Self::bare(name)
        }
    }

    pub fn upper(name: impl Into<String>, upper: f64) -> Self {
        Self {
            upper: Some(upper),
            ..Self::bare(name)
        }
    }

    pub fn between(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            ..Self::bare(name)
        }
    }

    pub fn equals(name: impl Into<String>, value: f64) -> Self {
        Self {
            equals: Some(value),
            ..Self::bare(name)
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn is_equality(&self) -> bool {
        self.equals.is_some()
    }
}

/// Options for the sequential quadratic programming backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqpSettings {
    pub max_iterations: usize,
    /// Step-size convergence tolerance, relative to the size of the iterate.
    pub tolerance: f64,
    /// Largest constraint violation accepted at convergence.
    pub feasibility_tolerance: f64,
    /// How many times a trial step may be halved before the line search gives up.
    pub max_step_halvings: usize,
    /// Diagonal of the starting Hessian model, one entry per flattened
    /// design variable element. Identity when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_hessian: Option<Vec<f64>>,
}

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            feasibility_tolerance: 1e-8,
            max_step_halvings: 30,
            initial_hessian: None,
        }
    }
}

impl SqpSettings {
    pub fn with_initial_hessian(mut self, diagonal: impl IntoIterator<Item = f64>) -> Self {
        self.initial_hessian = Some(diagonal.into_iter().collect());
        self
    }
}

/// Options for the bound-constrained projected BFGS backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectedBfgsSettings {
    pub max_iterations: usize,
    /// Infinity-norm tolerance on the projected gradient.
    pub tolerance: f64,
    pub max_step_halvings: usize,
}

impl Default for ProjectedBfgsSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
            max_step_halvings: 30,
        }
    }
}

/// Which optimizer backend drives the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSelection {
    /// Flag convention: failed evaluations come back with `fail = true`.
    Sqp(SqpSettings),
    /// Signal convention: failed evaluations raise a bad-point signal.
    ProjectedBfgs(ProjectedBfgsSettings),
}

impl BackendSelection {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqp(_) => "sqp",
            Self::ProjectedBfgs(_) => "projected_bfgs",
        }
    }

    /// Whether the backend can handle general (non-bound) constraints.
    pub fn supports_constraints(&self) -> bool {
        matches!(self, Self::Sqp(_))
    }
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self::Sqp(SqpSettings::default())
    }
}

/// How many recoverable failures a run tolerates, and what counts as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Consecutive recoverable failures absorbed before the next one is
    /// escalated to a fatal failure.
    pub max_consecutive_recoverable: usize,
    /// Treat NaN or infinite model outputs as a domain failure instead of a
    /// model defect.
    pub non_finite_is_recoverable: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_recoverable: 10,
            non_finite_is_recoverable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceForm {
    #[default]
    Forward,
    Central,
}

/// Finite-difference settings, used when a model provides no derivatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiniteDifference {
    pub step: f64,
    pub form: DifferenceForm,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self {
            step: 1e-6,
            form: DifferenceForm::Forward,
        }
    }
}

/// Top-level configuration for one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub design_variables: Vec<DesignVariable>,
    pub objectives: Vec<ObjectiveDecl>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDecl>,
    #[serde(default)]
    pub backend: BackendSelection,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub finite_difference: FiniteDifference,
    /// Upper bound on how long the backend may take to answer a request.
    #[serde(default)]
    pub backend_timeout_ms: Option<u64>,
}

impl DriverConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            design_variables: Vec::new(),
            objectives: Vec::new(),
            constraints: Vec::new(),
            backend: BackendSelection::default(),
            failure_policy: FailurePolicy::default(),
            finite_difference: FiniteDifference::default(),
            backend_timeout_ms: None,
        }
    }

    pub fn with_design_variable(mut self, variable: DesignVariable) -> Self {
        self.design_variables.push(variable);
        self
    }

    pub fn with_objective(mut self, objective: ObjectiveDecl) -> Self {
        self.objectives.push(objective);
        self
    }

    pub fn with_constraint(mut self, constraint: ConstraintDecl) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_backend(mut self, backend: BackendSelection) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_consecutive_recoverable(mut self, n: usize) -> Self {
        self.failure_policy.max_consecutive_recoverable = n;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_finite_difference(mut self, fd: FiniteDifference) -> Self {
        self.finite_difference = fd;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_ms.map(Duration::from_millis)
    }

    /// The single objective. Only meaningful after [`validate`](Self::validate).
    pub fn objective(&self) -> Option<&ObjectiveDecl> {
        self.objectives.first()
    }

    /// Total number of scalar design values.
    pub fn design_size(&self) -> usize {
        self.design_variables.iter().map(DesignVariable::size).sum()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> DetourResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> DetourResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> DetourResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.design_variables.is_empty() {
            return Err(ConfigError::NoDesignVariables);
        }

        let mut names = HashSet::new();
        for var in &self.design_variables {
            if !names.insert(var.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: var.name.clone(),
                });
            }
            if var.initial.is_empty() {
                return Err(ConfigError::EmptyVariable {
                    name: var.name.clone(),
                });
            }
            let (lower, upper) = (var.lower_bound(), var.upper_bound());
            if lower.is_nan() || upper.is_nan() || lower > upper {
                return Err(ConfigError::InvalidBounds {
                    name: var.name.clone(),
                    lower,
                    upper,
                });
            }
            for (index, &value) in var.initial.iter().enumerate() {
                if !value.is_finite() || value < lower || value > upper {
                    return Err(ConfigError::InitialOutOfBounds {
                        name: var.name.clone(),
                        index,
                        value,
                    });
                }
            }
        }

        match self.objectives.as_slice() {
            [_] => {}
            other => {
                return Err(ConfigError::ObjectiveCount { found: other.len() });
            }
        }

        let mut outputs = HashSet::new();
        for objective in &self.objectives {
            outputs.insert(objective.name.as_str());
        }
        for constraint in &self.constraints {
            if !outputs.insert(constraint.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    name: constraint.name.clone(),
                });
            }
            Self::validate_constraint(constraint)?;
        }

        if !self.constraints.is_empty() && !self.backend.supports_constraints() {
            return Err(ConfigError::Unsupported {
                backend: self.backend.name().to_string(),
                feature: "general constraints".to_string(),
            });
        }

        if let BackendSelection::Sqp(SqpSettings {
            initial_hessian: Some(diagonal),
            ..
        }) = &self.backend
        {
            let dim: usize = self.design_variables.iter().map(|v| v.initial.len()).sum();
            if diagonal.len() != dim {
                return Err(ConfigError::InvalidOption {
                    message: format!(
                        "initial hessian has {} entries, expected {dim}",
                        diagonal.len()
                    ),
                });
            }
            if let Some(bad) = diagonal.iter().find(|d| !(d.is_finite() && **d > 0.0)) {
                return Err(ConfigError::InvalidOption {
                    message: format!("initial hessian entries must be positive, got {bad}"),
                });
            }
        }

        if !(self.finite_difference.step > 0.0 && self.finite_difference.step.is_finite()) {
            return Err(ConfigError::InvalidOption {
                message: format!(
                    "finite difference step must be positive, got {}",
                    self.finite_difference.step
                ),
            });
        }

        Ok(())
    }

    fn validate_constraint(constraint: &ConstraintDecl) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidConstraint {
            name: constraint.name.clone(),
            message: message.to_string(),
        };

        if constraint.size == 0 {
            return Err(invalid("size must be at least 1"));
        }
        match (constraint.equals, constraint.lower, constraint.upper) {
            (Some(_), None, None) => Ok(()),
            (Some(_), _, _) => Err(invalid("`equals` cannot be combined with `lower`/`upper`")),
            (None, None, None) => Err(invalid("one of `equals`, `lower` or `upper` is required")),
            (None, Some(lower), Some(upper)) if lower > upper => {
                Err(invalid("`lower` is greater than `upper`"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paraboloid_config() -> DriverConfig {
        DriverConfig::new("paraboloid")
            .with_design_variable(DesignVariable::scalar("x", 50.0).with_bounds(-50.0, 50.0))
            .with_design_variable(DesignVariable::scalar("y", 50.0).with_bounds(-50.0, 50.0))
            .with_objective(ObjectiveDecl::minimize("f_xy"))
            .with_constraint(ConstraintDecl::lower("c", 15.0))
    }

    #[test]
    fn valid_config_passes() {
        let config = paraboloid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.design_size(), 2);
        assert_eq!(config.objective().map(|o| o.name.as_str()), Some("f_xy"));
    }

    #[test]
    fn initial_value_must_lie_within_bounds() {
        let config = DriverConfig::new("bad")
            .with_design_variable(DesignVariable::scalar("x", 60.0).with_bounds(-50.0, 50.0))
            .with_objective(ObjectiveDecl::minimize("f"));
        match config.validate() {
            Err(ConfigError::InitialOutOfBounds { name, index, value }) => {
                assert_eq!(name, "x");
                assert_eq!(index, 0);
                assert_eq!(value, 60.0);
            }
            other => panic!("expected InitialOutOfBounds, got {other:?}"),
        }
    }

    #[test]
    fn exactly_one_objective_required() {
        let config = DriverConfig::new("none")
            .with_design_variable(DesignVariable::scalar("x", 0.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ObjectiveCount { found: 0 })
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let config = paraboloid_config().with_constraint(ConstraintDecl::upper("c", 1.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn equality_cannot_have_bounds() {
        let mut constraint = ConstraintDecl::equals("h", 0.0);
        constraint.lower = Some(-1.0);
        let config = paraboloid_config().with_constraint(constraint);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConstraint { .. })
        ));
    }

    #[test]
    fn projected_bfgs_rejects_general_constraints() {
        let config = paraboloid_config()
            .with_backend(BackendSelection::ProjectedBfgs(ProjectedBfgsSettings::default()));
        match config.validate() {
            Err(ConfigError::Unsupported { backend, .. }) => assert_eq!(backend, "projected_bfgs"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let json = r#"{
            "name": "from_json",
            "design_variables": [
                {"name": "x", "initial": [1.0], "lower": -5.0, "upper": 5.0}
            ],
            "objectives": [{"name": "f"}],
            "backend": {"kind": "projected_bfgs", "max_iterations": 50}
        }"#;

        let config = DriverConfig::from_json_str(json).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::default());
        assert_eq!(config.objectives[0].direction, ObjectiveDirection::Minimize);
        match &config.backend {
            BackendSelection::ProjectedBfgs(settings) => {
                assert_eq!(settings.max_iterations, 50);
                assert_eq!(settings.tolerance, 1e-8);
            }
            other => panic!("unexpected backend {other:?}"),
        }

        let text = config.to_json_pretty().unwrap();
        let back = DriverConfig::from_json_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let err = DriverConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::errors::DetourError::Serialization(_)));
    }

    #[test]
    fn backend_timeout_saturates() {
        let config = paraboloid_config().with_backend_timeout(Duration::from_millis(1500));
        assert_eq!(config.backend_timeout_ms, Some(1500));
        assert_eq!(config.backend_timeout(), Some(Duration::from_millis(1500)));

        let config = paraboloid_config().with_backend_timeout(Duration::MAX);
        assert_eq!(config.backend_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn initial_hessian_must_match_the_design_vector() {
        let with = |diagonal: Vec<f64>| {
            paraboloid_config()
                .with_backend(BackendSelection::Sqp(
                    SqpSettings::default().with_initial_hessian(diagonal),
                ))
                .validate()
        };
        assert!(with(vec![3.5, 1.65]).is_ok());
        assert!(matches!(with(vec![1.0]), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(with(vec![1.0, 0.0]), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(with(vec![1.0, f64::NAN]), Err(ConfigError::InvalidOption { .. })));
    }
}
