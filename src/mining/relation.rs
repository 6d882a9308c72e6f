//! This module contains the relation kinds the miner proposes and checks,
//! together with their evaluation against a normalized trace.
//!
//! A relation's rendered form is its identity: buckets key their candidate
//! pools by it, and the persisted key-invariant set reports it. Inference
//! relations wrap another relation together with one value-to-variable
//! substitution; their rendered and evaluated form is the substituted base.

use std::fmt::{Display, Formatter};

use ethnum::I256;
use serde::{Deserialize, Serialize};

use crate::{
    decoder::ScalarValue,
    mining::fit::nearly_equal,
    normalize::{Dtrace, TraceVal, VariableName},
    utility::{i256_to_f64, i256_to_u256},
};

/// The result of evaluating one relation against one trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Satisfied,
    Violated,

    /// A referenced variable is undefined in this trace.
    Indeterminate,
}

/// A candidate or kept relation over trace variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    /// The variable always carries this value.
    Constant { var: VariableName, value: TraceVal },

    /// Two variables always carry the same value.
    Equal { x: VariableName, y: VariableName },

    /// Two integers always carry negated values.
    Opposite { x: VariableName, y: VariableName },

    /// A scalar always appears within an aggregate list.
    Membership {
        element: VariableName,
        aggregate: VariableName,
    },

    /// A value's byte content always appears within another's.
    BytesMembership {
        element: VariableName,
        aggregate: VariableName,
    },

    /// A fitted line `y = slope * x + intercept` satisfied by every sample.
    Linear {
        x: VariableName,
        y: VariableName,
        slope: f64,
        intercept: f64,
    },

    /// A fitted constant product `x * y = product` satisfied by every
    /// sample.
    InverseProduct {
        x: VariableName,
        y: VariableName,
        product: f64,
    },

    /// A relation generalised by substituting a literal key with the
    /// variable that carried it.
    Inference {
        base: Box<Relation>,
        value: ScalarValue,
        replacement: VariableName,
    },
}

impl Relation {
    /// Constructs an equality with a canonical operand order.
    #[must_use]
    pub fn equal(a: VariableName, b: VariableName) -> Self {
        let (x, y) = sorted(a, b);
        Self::Equal { x, y }
    }

    /// Constructs an arithmetic opposite with a canonical operand order.
    #[must_use]
    pub fn opposite(a: VariableName, b: VariableName) -> Self {
        let (x, y) = sorted(a, b);
        Self::Opposite { x, y }
    }

    /// Resolves inference wrappers into the substituted base relation.
    #[must_use]
    pub fn concrete(&self) -> Relation {
        match self {
            Self::Inference {
                base,
                value,
                replacement,
            } => base.concrete().map_names(&|name| {
                name.substitute_value(value, replacement)
                    .unwrap_or_else(|| name.clone())
            }),
            other => other.clone(),
        }
    }

    /// The variables the (substituted) relation refers to.
    #[must_use]
    pub fn referenced(&self) -> Vec<VariableName> {
        match self.concrete() {
            Self::Constant { var, .. } => vec![var],
            Self::Equal { x, y }
            | Self::Opposite { x, y }
            | Self::Linear { x, y, .. }
            | Self::InverseProduct { x, y, .. } => vec![x, y],
            Self::Membership { element, aggregate }
            | Self::BytesMembership { element, aggregate } => vec![element, aggregate],
            Self::Inference { .. } => unreachable!("concrete() never yields an inference"),
        }
    }

    /// Checks whether any referenced name carries `target` as a literal key.
    #[must_use]
    pub fn mentions_value(&self, target: &ScalarValue) -> bool {
        self.referenced().iter().any(|name| name.contains_value(target))
    }

    /// Checks whether this relation was produced by numeric fitting rather
    /// than per-trace observation.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        matches!(
            self.concrete(),
            Self::Linear { .. } | Self::InverseProduct { .. }
        )
    }

    /// Evaluates the relation against one trace.
    ///
    /// With `change_defaults` set, an undefined `change` variable reads as
    /// zero: a slot the call never touched did not change.
    #[must_use]
    pub fn evaluate(&self, trace: &Dtrace, change_defaults: bool) -> Outcome {
        let concrete = self.concrete();

        let lookup = |name: &VariableName| lookup(trace, name, change_defaults);

        match &concrete {
            Relation::Constant { var, value } => {
                let Some(actual) = lookup(var) else {
                    return Outcome::Indeterminate;
                };
                satisfied_if(actual == *value)
            }
            Relation::Equal { x, y } => {
                let (Some(vx), Some(vy)) = (lookup(x), lookup(y)) else {
                    return Outcome::Indeterminate;
                };
                satisfied_if(vx == vy)
            }
            Relation::Opposite { x, y } => {
                let (Some(vx), Some(vy)) = (lookup(x), lookup(y)) else {
                    return Outcome::Indeterminate;
                };
                match (vx.as_int(), vy.as_int()) {
                    (Some(ix), Some(iy)) => satisfied_if(ix == iy.wrapping_neg()),
                    _ => Outcome::Violated,
                }
            }
            Relation::Membership { element, aggregate } => {
                let (Some(ve), Some(va)) = (lookup(element), lookup(aggregate)) else {
                    return Outcome::Indeterminate;
                };
                match (&ve, &va) {
                    (TraceVal::Scalar(scalar), TraceVal::List(values)) => {
                        satisfied_if(values.contains(scalar))
                    }
                    _ => Outcome::Violated,
                }
            }
            Relation::BytesMembership { element, aggregate } => {
                let (Some(ve), Some(va)) = (lookup(element), lookup(aggregate)) else {
                    return Outcome::Indeterminate;
                };
                satisfied_if(hex_content(&va).contains(&hex_content(&ve)))
            }
            Relation::Linear {
                x,
                y,
                slope,
                intercept,
            } => {
                let (Some(vx), Some(vy)) = (lookup(x), lookup(y)) else {
                    return Outcome::Indeterminate;
                };
                match (vx.as_int(), vy.as_int()) {
                    (Some(ix), Some(iy)) => {
                        let fx = i256_to_f64(ix);
                        let fy = i256_to_f64(iy);
                        satisfied_if(nearly_equal(fy, slope * fx + intercept))
                    }
                    _ => Outcome::Violated,
                }
            }
            Relation::InverseProduct { x, y, product } => {
                let (Some(vx), Some(vy)) = (lookup(x), lookup(y)) else {
                    return Outcome::Indeterminate;
                };
                match (vx.as_int(), vy.as_int()) {
                    (Some(ix), Some(iy)) => {
                        let fx = i256_to_f64(ix);
                        let fy = i256_to_f64(iy);
                        satisfied_if(nearly_equal(fx * fy, *product))
                    }
                    _ => Outcome::Violated,
                }
            }
            Relation::Inference { .. } => unreachable!("concrete() never yields an inference"),
        }
    }
}

impl Display for Relation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.concrete() {
            Relation::Constant { var, value } => write!(f, "{var} == {value}"),
            Relation::Equal { x, y } => write!(f, "{x} == {y}"),
            Relation::Opposite { x, y } => write!(f, "{x} == - ({y})"),
            Relation::Membership { element, aggregate } => write!(f, "{element} in {aggregate}"),
            Relation::BytesMembership { element, aggregate } => {
                write!(f, "{element} inByte {aggregate}")
            }
            Relation::Linear {
                x,
                y,
                slope,
                intercept,
            } => write!(f, "{y} = {slope} * {x} + {intercept}"),
            Relation::InverseProduct { x, y, product } => write!(f, "{x} * {y} = {product}"),
            Relation::Inference { .. } => unreachable!("concrete() never yields an inference"),
        }
    }
}

impl Relation {
    /// Applies `f` to every variable name in the relation.
    fn map_names(&self, f: &dyn Fn(&VariableName) -> VariableName) -> Relation {
        match self {
            Self::Constant { var, value } => Self::Constant {
                var: f(var),
                value: value.clone(),
            },
            Self::Equal { x, y } => Self::Equal { x: f(x), y: f(y) },
            Self::Opposite { x, y } => Self::Opposite { x: f(x), y: f(y) },
            Self::Membership { element, aggregate } => Self::Membership {
                element: f(element),
                aggregate: f(aggregate),
            },
            Self::BytesMembership { element, aggregate } => Self::BytesMembership {
                element: f(element),
                aggregate: f(aggregate),
            },
            Self::Linear {
                x,
                y,
                slope,
                intercept,
            } => Self::Linear {
                x: f(x),
                y: f(y),
                slope: *slope,
                intercept: *intercept,
            },
            Self::InverseProduct { x, y, product } => Self::InverseProduct {
                x: f(x),
                y: f(y),
                product: *product,
            },
            Self::Inference {
                base,
                value,
                replacement,
            } => Self::Inference {
                base: Box::new(base.map_names(f)),
                value: value.clone(),
                replacement: replacement.clone(),
            },
        }
    }
}

/// Looks a (possibly generalised) variable up in the trace.
fn lookup(trace: &Dtrace, name: &VariableName, change_defaults: bool) -> Option<TraceVal> {
    let concrete;
    let name = if name.is_generalised() {
        concrete = name.resolve(&|inner| {
            trace
                .value_of(inner)
                .and_then(|tv| tv.value.as_scalar().cloned())
        })?;
        &concrete
    } else {
        name
    };

    match trace.value_of(name) {
        Some(tv) => Some(tv.value.clone()),
        None if change_defaults && matches!(name, VariableName::Change { .. }) => {
            Some(TraceVal::Scalar(ScalarValue::Int(I256::ZERO)))
        }
        None => None,
    }
}

fn satisfied_if(condition: bool) -> Outcome {
    if condition {
        Outcome::Satisfied
    } else {
        Outcome::Violated
    }
}

fn sorted(a: VariableName, b: VariableName) -> (VariableName, VariableName) {
    if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    }
}

/// The canonical hex rendering used by byte-substring membership.
#[must_use]
pub fn hex_content(value: &TraceVal) -> String {
    fn scalar_hex(value: &ScalarValue) -> String {
        match value {
            ScalarValue::Int(int) => {
                if *int < I256::ZERO {
                    format!("-{:x}", i256_to_u256(-*int))
                } else {
                    format!("{:x}", i256_to_u256(*int))
                }
            }
            ScalarValue::Address(address) => hex::encode(address.0),
            ScalarValue::Bool(flag) => {
                if *flag {
                    "01".to_owned()
                } else {
                    "00".to_owned()
                }
            }
            ScalarValue::Bytes(bytes) => hex::encode(bytes),
            ScalarValue::Str(text) => hex::encode(text.as_bytes()),
        }
    }

    match value {
        TraceVal::Scalar(scalar) => scalar_hex(scalar),
        TraceVal::List(values) => values.iter().map(scalar_hex).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        normalize::{Level, Path, Point, TraceId, TraceValue},
        utility::Address,
    };

    fn trace(variables: Vec<(VariableName, TraceVal)>) -> Dtrace {
        let mut map = BTreeMap::new();
        for (name, value) in variables {
            map.insert(
                name.to_string(),
                TraceValue {
                    name,
                    value,
                    type_label: "uint256".into(),
                },
            );
        }
        Dtrace {
            id: TraceId {
                block_number: 1,
                position: 0,
                call_index: 0,
            },
            bucket: "b".into(),
            level: Level::Function,
            points: vec![Point::Pre, Point::Post],
            sender: Address::default(),
            origin: Address::default(),
            variables: map,
        }
    }

    fn state(name: &str) -> VariableName {
        VariableName::State {
            name: name.into(),
            path: Path::root(),
        }
    }

    fn int(value: i128) -> TraceVal {
        TraceVal::Scalar(ScalarValue::Int(I256::new(value)))
    }

    #[test]
    fn evaluates_equality_and_opposite() {
        let t = trace(vec![
            (state("a").at(Point::Pre), int(7)),
            (state("b").at(Point::Pre), int(7)),
            (state("c").at(Point::Pre), int(-7)),
        ]);

        let equal = Relation::equal(state("a").at(Point::Pre), state("b").at(Point::Pre));
        assert_eq!(equal.evaluate(&t, false), Outcome::Satisfied);

        let opposite = Relation::opposite(state("a").at(Point::Pre), state("c").at(Point::Pre));
        assert_eq!(opposite.evaluate(&t, false), Outcome::Satisfied);

        let broken = Relation::equal(state("a").at(Point::Pre), state("c").at(Point::Pre));
        assert_eq!(broken.evaluate(&t, false), Outcome::Violated);

        let missing = Relation::equal(state("a").at(Point::Pre), state("d").at(Point::Pre));
        assert_eq!(missing.evaluate(&t, false), Outcome::Indeterminate);
    }

    #[test]
    fn missing_change_variables_default_to_zero_when_asked() {
        let t = trace(vec![]);
        let change = Relation::Constant {
            var: state("total").change(Point::Post),
            value: int(0),
        };

        assert_eq!(change.evaluate(&t, false), Outcome::Indeterminate);
        assert_eq!(change.evaluate(&t, true), Outcome::Satisfied);
    }

    #[test]
    fn inference_resolves_through_the_current_trace() {
        let holder = ScalarValue::Address(
            Address::from_hex("0x00000000000000000000000000000000000000aa").unwrap(),
        );
        let from = VariableName::Method {
            path: Path::root().field("from"),
        };
        let entry = VariableName::State {
            name: "balances".into(),
            path: Path::root().key(holder.clone()),
        }
        .at(Point::Post);

        let base = Relation::Constant {
            var: entry.clone(),
            value: int(42),
        };
        let inference = Relation::Inference {
            base: Box::new(base),
            value: holder.clone(),
            replacement: from.clone(),
        };
        assert_eq!(
            inference.to_string(),
            "post(variable.balances[method.from]) == 42"
        );

        // The trace carries a different literal entry, reachable through the
        // current value of method.from.
        let other = ScalarValue::Address(
            Address::from_hex("0x00000000000000000000000000000000000000bb").unwrap(),
        );
        let t = trace(vec![
            (from.clone(), TraceVal::Scalar(other.clone())),
            (
                VariableName::State {
                    name: "balances".into(),
                    path: Path::root().key(other),
                }
                .at(Point::Post),
                int(42),
            ),
        ]);
        assert_eq!(inference.evaluate(&t, false), Outcome::Satisfied);
    }

    #[test]
    fn byte_membership_checks_hex_containment() {
        let t = trace(vec![
            (state("word").at(Point::Pre), int(0xdead)),
            (
                state("blob").at(Point::Pre),
                TraceVal::Scalar(ScalarValue::Bytes(vec![0xff, 0xde, 0xad, 0x01])),
            ),
        ]);

        let member = Relation::BytesMembership {
            element: state("word").at(Point::Pre),
            aggregate: state("blob").at(Point::Pre),
        };
        assert_eq!(member.evaluate(&t, false), Outcome::Satisfied);
    }

    #[test]
    fn fitted_relations_accept_exact_samples_only() {
        let t = trace(vec![
            (state("x").at(Point::Pre), int(3)),
            (state("y").at(Point::Pre), int(7)),
        ]);

        let line = Relation::Linear {
            x: state("x").at(Point::Pre),
            y: state("y").at(Point::Pre),
            slope: 2.0,
            intercept: 1.0,
        };
        assert_eq!(line.evaluate(&t, false), Outcome::Satisfied);

        let wrong = Relation::Linear {
            x: state("x").at(Point::Pre),
            y: state("y").at(Point::Pre),
            slope: 2.0,
            intercept: 0.0,
        };
        assert_eq!(wrong.evaluate(&t, false), Outcome::Violated);
    }
}
