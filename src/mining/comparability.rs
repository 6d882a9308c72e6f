//! This module contains the comparability filter that gates which variable
//! pairs may participate in a relation.
//!
//! Comparing arbitrary pairs floods the miner with coincidences; the filter
//! keeps the pairs whose relationship could mean something. It is symmetric
//! in its arguments.

use crate::normalize::{Point, VariableName};

/// The provenance class of a trace variable for comparability purposes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueClass {
    /// Decoded contract state, aggregates derived from it, and event
    /// payloads emitted by the contract.
    ContractState,

    /// Values supplied by the transaction environment: arguments, the
    /// sender, the callee, the attached value and the block context.
    UserSupplied,

    /// A token balance of one token at one observation point.
    TokenBalance {
        token: String,
        point: Option<Point>,
    },
}

/// Classifies a variable name, looking through point and change wrappers.
#[must_use]
pub fn classify(name: &VariableName) -> ValueClass {
    fn walk(name: &VariableName, point: Option<Point>) -> ValueClass {
        match name {
            VariableName::At { point, base } | VariableName::Change { point, base } => {
                walk(base, Some(*point))
            }
            VariableName::TokenBalance { token, .. } => ValueClass::TokenBalance {
                token: token.to_string(),
                point,
            },
            VariableName::Method { .. } | VariableName::Env(_) => ValueClass::UserSupplied,
            VariableName::Event { .. } | VariableName::State { .. } => ValueClass::ContractState,
        }
    }
    walk(name, None)
}

/// Checks whether two variables may be related to each other.
///
/// A pair is comparable when either side is contract state; two token
/// balances are comparable only for the same token across different
/// observation points; user-supplied values are never compared with each
/// other.
#[must_use]
pub fn comparable(a: &VariableName, b: &VariableName) -> bool {
    let class_a = classify(a);
    let class_b = classify(b);

    if class_a == ValueClass::ContractState || class_b == ValueClass::ContractState {
        return true;
    }

    match (&class_a, &class_b) {
        (
            ValueClass::TokenBalance { token: token_a, point: point_a },
            ValueClass::TokenBalance { token: token_b, point: point_b },
        ) => token_a == token_b && point_a != point_b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::ScalarValue,
        normalize::{EnvVar, KeyAtom, Path, Role},
        utility::Address,
    };

    fn state(name: &str) -> VariableName {
        VariableName::State {
            name: name.into(),
            path: Path::root(),
        }
    }

    fn method(field: &str) -> VariableName {
        VariableName::Method {
            path: Path::root().field(field),
        }
    }

    fn token_balance(token_low: u8, point: Point) -> VariableName {
        let mut bytes = [0u8; 20];
        bytes[19] = token_low;
        VariableName::TokenBalance {
            token: KeyAtom::Value(ScalarValue::Address(Address(bytes))),
            role: Role::All,
        }
        .at(point)
    }

    #[test]
    fn contract_state_compares_with_anything() {
        assert!(comparable(&state("total").at(Point::Pre), &method("amount")));
        assert!(comparable(&method("amount"), &state("total").at(Point::Post)));
        assert!(comparable(&state("total").at(Point::Pre), &token_balance(1, Point::Pre)));
    }

    #[test]
    fn user_supplied_pairs_are_rejected() {
        assert!(!comparable(&method("amount"), &method("shares")));
        assert!(!comparable(
            &method("amount"),
            &VariableName::Env(EnvVar::MsgValue)
        ));
        assert!(!comparable(
            &method("deadline"),
            &VariableName::Env(EnvVar::Timestamp)
        ));
        assert!(!comparable(
            &method("to"),
            &VariableName::Env(EnvVar::Callee)
        ));
        assert!(!comparable(
            &VariableName::Env(EnvVar::Sender),
            &VariableName::Env(EnvVar::BlockNumber)
        ));
    }

    #[test]
    fn provenance_classes_follow_the_name_role() {
        let event = VariableName::Event {
            name: "Transfer".into(),
            path: Path::root().field("value"),
        };
        assert_eq!(classify(&event), ValueClass::ContractState);
        assert_eq!(classify(&state("total").at(Point::Pre)), ValueClass::ContractState);
        assert_eq!(classify(&method("amount")), ValueClass::UserSupplied);
        for env in [
            EnvVar::Callee,
            EnvVar::Sender,
            EnvVar::MsgValue,
            EnvVar::Timestamp,
            EnvVar::BlockNumber,
        ] {
            assert_eq!(classify(&VariableName::Env(env)), ValueClass::UserSupplied);
        }
        assert!(comparable(&event, &method("amount")));
    }

    #[test]
    fn token_balances_compare_across_points_of_one_token() {
        assert!(comparable(
            &token_balance(1, Point::Pre),
            &token_balance(1, Point::Post)
        ));
        assert!(!comparable(
            &token_balance(1, Point::Pre),
            &token_balance(2, Point::Post)
        ));
        assert!(!comparable(
            &token_balance(1, Point::Pre),
            &token_balance(1, Point::Pre)
        ));
    }

    #[test]
    fn the_filter_is_symmetric() {
        let pairs = [
            (state("total").at(Point::Pre), method("amount")),
            (method("amount"), method("shares")),
            (token_balance(1, Point::Pre), token_balance(1, Point::Post)),
            (token_balance(1, Point::Pre), token_balance(2, Point::Pre)),
        ];
        for (a, b) in &pairs {
            assert_eq!(comparable(a, b), comparable(b, a));
        }
    }
}
