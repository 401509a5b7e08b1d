// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// Copyright 2026-present the ctlplane authors.

use crate::manifest::InstanceDefinition;
use log::{debug, info};
use std::collections::BTreeMap;
use thiserror::Error;

/// Environment variables carrying this prefix feed the condition context.
pub const TOPOLOGY_ENV_PREFIX: &str = "CTLPLANE_TOPOLOGY_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("instance {instance:?}: malformed condition {expression:?}: {message}")]
    Syntax {
        instance: String,
        expression: String,
        message: String,
    },
    #[error("instance {instance:?}: condition {expression:?} could not be evaluated: {message}")]
    Evaluation {
        instance: String,
        expression: String,
        message: String,
    },
}

/// Evaluates a boolean condition against topology parameters.
pub trait ExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &ConditionContext,
    ) -> Result<bool, EvaluationError>;
}

/// Topology parameters visible to conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionContext {
    params: BTreeMap<String, String>,
}

impl ConditionContext {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self { params }
    }

    /// Keep only the pairs whose key starts with `prefix`, with the prefix
    /// stripped. Later pairs override earlier ones.
    pub fn from_namespace<I, K, V>(pairs: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let params = pairs
            .into_iter()
            .filter_map(|(k, v)| {
                let name = k.as_ref().strip_prefix(prefix)?;
                (!name.is_empty()).then(|| (name.to_string(), v.into()))
            })
            .collect();
        Self { params }
    }

    /// Configured parameters overlaid with `CTLPLANE_TOPOLOGY_*` variables.
    pub fn from_config_and_env(configured: &BTreeMap<String, String>) -> Self {
        let mut context = Self::new(configured.clone());
        context.extend(Self::from_namespace(std::env::vars(), TOPOLOGY_ENV_PREFIX));
        context
    }

    pub fn extend(&mut self, other: ConditionContext) {
        self.params.extend(other.params);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConditionContext {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            params: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Keep the entries whose condition holds, in their original order.
///
/// Entries without a condition always pass. A condition that does not parse
/// fails the whole filter instead of being treated as false.
pub fn filter(
    entries: &[InstanceDefinition],
    context: &ConditionContext,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<InstanceDefinition>, ConditionError> {
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(expression) = entry.condition.as_deref() else {
            kept.push(entry.clone());
            continue;
        };
        match evaluator.evaluate(expression, context) {
            Ok(true) => {
                debug!("[{}] condition {expression:?} holds", entry.name);
                kept.push(entry.clone());
            }
            Ok(false) => info!("[{}] condition {expression:?} not met, skipping", entry.name),
            Err(EvaluationError::Syntax(message)) => {
                return Err(ConditionError::Syntax {
                    instance: entry.name.clone(),
                    expression: expression.to_string(),
                    message,
                });
            }
            Err(EvaluationError::Evaluation(message)) => {
                return Err(ConditionError::Evaluation {
                    instance: entry.name.clone(),
                    expression: expression.to_string(),
                    message,
                });
            }
        }
    }
    Ok(kept)
}
