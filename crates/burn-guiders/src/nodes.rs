//! Node registration metadata
//!
//! Declarative description of the guider nodes for a node-graph host: input
//! schema with UI constraints, output type, and the factories that turn node
//! inputs into a configured [`AdaptiveGuider`].

use burn::prelude::*;
use serde::Serialize;

use crate::adaptive::{AdaptiveGuidanceConfig, AdaptiveGuider, PerpNegConfig};
use crate::backend::{Conditioning, GuidanceBackend};
use crate::error::ConfigError;

/// Node category shown in the host's menu
pub const CATEGORY: &str = "sampling/custom_sampling/guiders";

/// Output type produced by every guider node
pub const GUIDER: &str = "GUIDER";

/// Name of the factory function the host invokes
pub const FUNCTION: &str = "get_guider";

/// Type of a node input socket or widget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputKind {
    Model,
    Conditioning,
    Float,
    Int,
}

/// Widget constraints for a numeric input
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NumericConstraints {
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<f64>,
}

/// One node input
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InputSpec {
    pub name: &'static str,
    pub kind: InputKind,
    #[serde(flatten)]
    pub constraints: Option<NumericConstraints>,
}

impl InputSpec {
    pub const fn handle(name: &'static str, kind: InputKind) -> Self {
        Self {
            name,
            kind,
            constraints: None,
        }
    }

    pub const fn float(
        name: &'static str,
        default: f64,
        min: f64,
        max: f64,
        step: f64,
        round: Option<f64>,
    ) -> Self {
        Self {
            name,
            kind: InputKind::Float,
            constraints: Some(NumericConstraints {
                default,
                min,
                max,
                step,
                round,
            }),
        }
    }

    pub const fn int(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: InputKind::Int,
            constraints: Some(NumericConstraints {
                default,
                min,
                max,
                step: 1.0,
                round: None,
            }),
        }
    }

    /// Check a float value against this input's range
    ///
    /// Bounds are compared at `f32` precision so that e.g. `0.9_f32` is
    /// accepted by a `0.90` minimum.
    pub fn check_f32(&self, value: f32) -> Result<(), ConfigError> {
        if !value.is_finite() {
            return Err(ConfigError::NotFinite {
                field: self.name,
                value: value as f64,
            });
        }
        match self.constraints {
            Some(c) if value < c.min as f32 || value > c.max as f32 => Err(ConfigError::OutOfRange {
                field: self.name,
                value: value as f64,
                min: c.min,
                max: c.max,
            }),
            _ => Ok(()),
        }
    }

    /// Check an integer value against this input's range
    pub fn check_count(&self, value: usize) -> Result<(), ConfigError> {
        match self.constraints {
            Some(c) if (value as f64) < c.min || (value as f64) > c.max => {
                Err(ConfigError::OutOfRange {
                    field: self.name,
                    value: value as f64,
                    min: c.min,
                    max: c.max,
                })
            }
            _ => Ok(()),
        }
    }
}

pub const MODEL: InputSpec = InputSpec::handle("model", InputKind::Model);
pub const POSITIVE: InputSpec = InputSpec::handle("positive", InputKind::Conditioning);
pub const NEGATIVE: InputSpec = InputSpec::handle("negative", InputKind::Conditioning);
pub const EMPTY_CONDITIONING: InputSpec =
    InputSpec::handle("empty_conditioning", InputKind::Conditioning);
pub const THRESHOLD: InputSpec =
    InputSpec::float("threshold", 0.990, 0.90, 1.0, 0.001, Some(0.001));
pub const CFG: InputSpec = InputSpec::float("cfg", 8.0, 0.0, 100.0, 0.1, Some(0.01));
pub const NEG_SCALE: InputSpec = InputSpec::float("neg_scale", 1.0, 0.0, 100.0, 0.01, None);
pub const INITIAL_DISABLED_STEPS: InputSpec =
    InputSpec::int("initial_disabled_steps", 0.0, 0.0, 1000.0);
pub const UNCOND_ZERO_SCALE: InputSpec =
    InputSpec::float("uncond_zero_scale", 0.0, 0.0, 2.0, 0.01, None);

/// Input schema of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSchema {
    pub required: Vec<InputSpec>,
    pub optional: Vec<InputSpec>,
}

impl NodeSchema {
    /// Look up an input by name in either section
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.required
            .iter()
            .chain(&self.optional)
            .find(|spec| spec.name == name)
    }
}

/// Everything the host needs to list and instantiate a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRegistration {
    pub id: &'static str,
    pub display_name: &'static str,
    pub category: &'static str,
    pub function: &'static str,
    pub return_types: Vec<&'static str>,
    pub input: NodeSchema,
}

/// A guider node exposed to the host
pub trait GuiderNode {
    const ID: &'static str;
    const DISPLAY_NAME: &'static str;

    fn input_types() -> NodeSchema;

    fn registration() -> NodeRegistration {
        NodeRegistration {
            id: Self::ID,
            display_name: Self::DISPLAY_NAME,
            category: CATEGORY,
            function: FUNCTION,
            return_types: vec![GUIDER],
            input: Self::input_types(),
        }
    }
}

/// `AdaptiveGuidance` node
pub struct AdaptiveGuidanceNode;

impl GuiderNode for AdaptiveGuidanceNode {
    const ID: &'static str = "AdaptiveGuidance";
    const DISPLAY_NAME: &'static str = "AdaptiveGuider";

    fn input_types() -> NodeSchema {
        NodeSchema {
            required: vec![MODEL, POSITIVE, NEGATIVE, THRESHOLD, CFG, INITIAL_DISABLED_STEPS],
            optional: vec![UNCOND_ZERO_SCALE],
        }
    }
}

impl AdaptiveGuidanceNode {
    pub fn get_guider<B: Backend, G: GuidanceBackend<B>>(
        model: G,
        positive: Conditioning<B>,
        negative: Conditioning<B>,
        config: AdaptiveGuidanceConfig,
    ) -> Result<AdaptiveGuider<B, G>, ConfigError> {
        config.validate()?;
        Ok(AdaptiveGuider::new(model, positive, negative, config))
    }
}

/// `PerpNegAdaptiveGuidanceGuider` node
pub struct PerpNegAdaptiveGuidanceNode;

impl GuiderNode for PerpNegAdaptiveGuidanceNode {
    const ID: &'static str = "PerpNegAdaptiveGuidanceGuider";
    const DISPLAY_NAME: &'static str = "PerpNegAdaptiveGuider";

    fn input_types() -> NodeSchema {
        NodeSchema {
            required: vec![
                MODEL,
                POSITIVE,
                NEGATIVE,
                EMPTY_CONDITIONING,
                THRESHOLD,
                CFG,
                NEG_SCALE,
                INITIAL_DISABLED_STEPS,
            ],
            optional: vec![UNCOND_ZERO_SCALE],
        }
    }
}

impl PerpNegAdaptiveGuidanceNode {
    pub fn get_guider<B: Backend, G: GuidanceBackend<B>>(
        model: G,
        positive: Conditioning<B>,
        negative: Conditioning<B>,
        empty_conditioning: Conditioning<B>,
        config: AdaptiveGuidanceConfig,
        perp_neg: PerpNegConfig,
    ) -> Result<AdaptiveGuider<B, G>, ConfigError> {
        config.validate()?;
        perp_neg.validate()?;
        Ok(AdaptiveGuider::perp_neg(
            model,
            positive,
            negative,
            empty_conditioning,
            config,
            perp_neg,
        ))
    }
}

/// All nodes provided by this crate, in registration order
pub fn node_registrations() -> Vec<NodeRegistration> {
    vec![
        AdaptiveGuidanceNode::registration(),
        PerpNegAdaptiveGuidanceNode::registration(),
    ]
}

/// Display name for a node id
pub fn display_name(id: &str) -> Option<&'static str> {
    node_registrations()
        .into_iter()
        .find(|node| node.id == id)
        .map(|node| node.display_name)
}
