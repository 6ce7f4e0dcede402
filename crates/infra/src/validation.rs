//! Validation port and pipeline.
//!
//! Validators are registered per target type. The pipeline runs every
//! validator registered for a type in registration order and unions their
//! outcomes; whether faults become an error is the caller's choice
//! (`throw_on_faults`).

use core::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meridian_core::ValidationOutcome;

use crate::error::DispatchError;

pub const DEFAULT_RULE_SET: &str = "default";

/// Validates targets of type `T`.
#[async_trait]
pub trait Validator<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Rule group this validator belongs to; recorded in the outcome.
    fn rule_set(&self) -> &str {
        DEFAULT_RULE_SET
    }

    async fn validate(&self, target: &T, cancel: &CancellationToken) -> ValidationOutcome;
}

/// Validator backed by a synchronous closure.
pub struct FnValidator<F> {
    rule_set: String,
    rules: F,
}

impl<F> FnValidator<F> {
    pub fn new(rules: F) -> Self {
        Self {
            rule_set: DEFAULT_RULE_SET.to_string(),
            rules,
        }
    }

    pub fn in_rule_set(mut self, rule_set: impl Into<String>) -> Self {
        self.rule_set = rule_set.into();
        self
    }
}

#[async_trait]
impl<T, F> Validator<T> for FnValidator<F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> ValidationOutcome + Send + Sync,
{
    fn rule_set(&self) -> &str {
        &self.rule_set
    }

    async fn validate(&self, target: &T, _cancel: &CancellationToken) -> ValidationOutcome {
        (self.rules)(target)
    }
}

type Registered<T> = Arc<dyn Validator<T>>;

/// Validators keyed by target type.
#[derive(Default)]
pub struct ValidationPipeline {
    validators: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
}

impl core::fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("validators", &self.validators.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl ValidationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, V>(&mut self, validator: V) -> &mut Self
    where
        T: Send + Sync + 'static,
        V: Validator<T> + 'static,
    {
        let validator: Registered<T> = Arc::new(validator);
        self.validators
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Box::new(validator));
        self
    }

    pub fn validator_count<T: 'static>(&self) -> usize {
        self.validators.get(&TypeId::of::<T>()).map_or(0, Vec::len)
    }

    fn validators_for<T>(&self) -> Vec<Registered<T>>
    where
        T: Send + Sync + 'static,
    {
        self.validators
            .get(&TypeId::of::<T>())
            .map(|v| {
                v.iter()
                    .filter_map(|b| b.downcast_ref::<Registered<T>>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run every validator registered for `T` and union the outcomes.
    ///
    /// With `throw_on_faults`, a non-empty fault list fails with
    /// [`DispatchError::Validation`] carrying all faults. A target type with
    /// no validators is valid.
    pub async fn validate<T>(
        &self,
        target: &T,
        throw_on_faults: bool,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome, DispatchError>
    where
        T: Send + Sync + 'static,
    {
        let mut outcome = ValidationOutcome::valid();
        for validator in self.validators_for::<T>() {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled {
                    request: type_name::<T>(),
                });
            }
            let partial = validator
                .validate(target, cancel)
                .await
                .with_rule_set(validator.rule_set());
            outcome = outcome.merge(partial);
        }

        debug!(
            target = type_name::<T>(),
            faults = outcome.faults().len(),
            rule_sets = outcome.rule_sets_executed().len(),
            "validation finished"
        );

        if throw_on_faults {
            return Ok(outcome.into_result()?);
        }
        Ok(outcome)
    }
}
