//! Model interface.
//!
//! A [`Model`] answers one design point at a time with values, a
//! domain-invalid signal, or an error. Models that can only succeed or fail
//! implement [`BinaryModel`] and are wrapped in [`Classified`], which sorts
//! their errors into the two failure kinds.

use thiserror::Error;

use dt_types::{DesignPoint, Jacobian, Response};

/// Why a model could not produce values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The point lies outside the region the model can evaluate.
    #[error("Domain invalid: {0}")]
    DomainInvalid(String),

    /// Anything else. Never retried.
    #[error("Model error: {0}")]
    Failed(String),
}

impl ModelError {
    pub fn domain_invalid(reason: impl Into<String>) -> Self {
        Self::DomainInvalid(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::DomainInvalid(reason) | Self::Failed(reason) => reason,
        }
    }
}

pub trait Model {
    /// Evaluate objectives and constraints at `point`.
    fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError>;

    /// Total derivatives at `point`, which was just evaluated successfully.
    ///
    /// Return `Ok(None)` to have them computed by finite differences.
    fn linearize(&mut self, _point: &DesignPoint) -> Result<Option<Jacobian>, ModelError> {
        Ok(None)
    }
}

impl<M: Model + ?Sized> Model for &mut M {
    fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
        (**self).evaluate(point)
    }

    fn linearize(&mut self, point: &DesignPoint) -> Result<Option<Jacobian>, ModelError> {
        (**self).linearize(point)
    }
}

/// A model that only knows success or failure.
pub trait BinaryModel {
    fn evaluate(&mut self, point: &DesignPoint) -> anyhow::Result<Response>;
}

/// Error a [`BinaryModel`] can raise to mark a point as not evaluable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidInput(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    DomainInvalid,
    Fatal,
}

/// Adapts a [`BinaryModel`] to [`Model`] by classifying its errors.
pub struct Classified<M, C> {
    model: M,
    classify: C,
}

impl<M, C> Classified<M, C>
where
    M: BinaryModel,
    C: Fn(&anyhow::Error) -> FailureClass,
{
    pub fn new(model: M, classify: C) -> Self {
        Self { model, classify }
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

impl<M: BinaryModel> Classified<M, fn(&anyhow::Error) -> FailureClass> {
    /// Errors that are, or wrap, an [`InvalidInput`] are domain failures.
    pub fn by_invalid_input(model: M) -> Self {
        Self::new(model, classify_invalid_input)
    }
}

fn classify_invalid_input(err: &anyhow::Error) -> FailureClass {
    if err.chain().any(|cause| cause.is::<InvalidInput>()) {
        FailureClass::DomainInvalid
    } else {
        FailureClass::Fatal
    }
}

impl<M, C> Model for Classified<M, C>
where
    M: BinaryModel,
    C: Fn(&anyhow::Error) -> FailureClass,
{
    fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
        self.model.evaluate(point).map_err(|err| {
            let reason = format!("{err:#}");
            match (self.classify)(&err) {
                FailureClass::DomainInvalid => ModelError::DomainInvalid(reason),
                FailureClass::Fatal => ModelError::Failed(reason),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    struct Flaky {
        calls: usize,
    }

    impl BinaryModel for Flaky {
        fn evaluate(&mut self, _point: &DesignPoint) -> anyhow::Result<Response> {
            self.calls += 1;
            match self.calls {
                1 => Ok(Response::new().with_objective("f", [1.0])),
                2 => Err(InvalidInput("negative pressure".into())).context("state solve"),
                _ => Err(anyhow!("out of memory")),
            }
        }
    }

    #[test]
    fn invalid_input_is_a_domain_failure() {
        let mut model = Classified::by_invalid_input(Flaky { calls: 0 });
        let point = DesignPoint::new().with_scalar("x", 0.0);

        assert!(model.evaluate(&point).is_ok());
        match model.evaluate(&point) {
            Err(ModelError::DomainInvalid(reason)) => {
                assert_eq!(reason, "state solve: negative pressure")
            }
            other => panic!("expected domain failure, got {other:?}"),
        }
        assert_eq!(
            model.evaluate(&point),
            Err(ModelError::Failed("out of memory".into()))
        );
    }

    #[test]
    fn custom_classifier() {
        let mut model = Classified::new(Flaky { calls: 2 }, |_: &anyhow::Error| {
            FailureClass::DomainInvalid
        });
        let point = DesignPoint::new();
        assert!(matches!(
            model.evaluate(&point),
            Err(ModelError::DomainInvalid(_))
        ));
    }
}
