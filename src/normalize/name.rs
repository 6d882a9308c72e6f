//! This module contains the structural representation of trace variable
//! names.
//!
//! Names are an AST rather than strings: generalisation during mining
//! substitutes a witness key for the variable that carried it, and doing so
//! structurally keeps `variable.balances[method.from]` distinct from any
//! string that merely prints the same way. The dotted rendering is still the
//! canonical key for trace maps and reports.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::decoder::ScalarValue;

/// An observation point within one call.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Point {
    /// Immediately before the call body runs.
    Pre,

    /// Immediately after the call body finishes.
    Post,

    /// Immediately before the nested call at the given call site.
    SubCallPre(u64),

    /// Immediately after the nested call at the given call site.
    SubCallPost(u64),
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
            Self::SubCallPre(location) => write!(f, "subCall_{location}_pre"),
            Self::SubCallPost(location) => write!(f, "subCall_{location}_post"),
        }
    }
}

/// A lookup key within a name: either a literal scalar or, after
/// generalisation, another variable whose value supplies the key.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAtom {
    Value(ScalarValue),
    Variable(Box<VariableName>),
}

impl Display for KeyAtom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Variable(name) => write!(f, "{name}"),
        }
    }
}

/// One step into a structured variable.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSegment {
    /// A struct member or named argument.
    Field(String),

    /// A mapping or array lookup.
    Key(KeyAtom),

    /// The aggregate sum over a mapping's integer values.
    Sum,
}

/// A path of steps from a root variable to a leaf.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    /// An empty path.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Extends the path with a member access.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.0.push(PathSegment::Field(name.into()));
        self
    }

    /// Extends the path with a literal key lookup.
    #[must_use]
    pub fn key(mut self, value: ScalarValue) -> Self {
        self.0.push(PathSegment::Key(KeyAtom::Value(value)));
        self
    }

    /// Extends the path with the aggregate sum step.
    #[must_use]
    pub fn sum(mut self) -> Self {
        self.0.push(PathSegment::Sum);
        self
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Key(atom) => write!(f, "[{atom}]")?,
                PathSegment::Sum => write!(f, ".SUM")?,
            }
        }
        Ok(())
    }
}

/// A transaction-environment variable.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvVar {
    Callee,
    Sender,
    MsgValue,
    Timestamp,
    BlockNumber,
}

impl Display for EnvVar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callee => write!(f, "callee"),
            Self::Sender => write!(f, "msg.sender"),
            Self::MsgValue => write!(f, "msg.value"),
            Self::Timestamp => write!(f, "block.timestamp"),
            Self::BlockNumber => write!(f, "block.number"),
        }
    }
}

/// The holder attribution of a token balance.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The sum over every observed holder.
    All,

    /// The holder named by an address-valued variable.
    Var(Box<VariableName>),
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Var(name) => write!(f, "{name}"),
        }
    }
}

/// A trace variable name.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableName {
    /// A transaction-environment value.
    Env(EnvVar),

    /// A decoded call argument, e.g. `method.to`.
    Method { path: Path },

    /// A decoded event argument, e.g. `event.Transfer.value`.
    Event { name: String, path: Path },

    /// A decoded state variable, e.g. `variable.balances[0x..aa]`.
    State { name: String, path: Path },

    /// A token balance, e.g. `tokenBalance.[0x..11][msg.sender]`.
    TokenBalance { token: KeyAtom, role: Role },

    /// A variable observed at a specific point, e.g. `post(variable.total)`.
    At { point: Point, base: Box<VariableName> },

    /// The delta of a variable between `pre` and the given point, e.g.
    /// `change.post(variable.total)`.
    Change { point: Point, base: Box<VariableName> },
}

impl VariableName {
    /// Wraps this name in an observation point.
    #[must_use]
    pub fn at(self, point: Point) -> Self {
        Self::At {
            point,
            base: Box::new(self),
        }
    }

    /// Builds the delta name of this variable at the given point.
    #[must_use]
    pub fn change(self, point: Point) -> Self {
        Self::Change {
            point,
            base: Box::new(self),
        }
    }

    /// Substitutes every literal key equal to `target` with a reference to
    /// `replacement`, returning the rewritten name or `None` when nothing
    /// matched.
    #[must_use]
    pub fn substitute_value(
        &self,
        target: &ScalarValue,
        replacement: &VariableName,
    ) -> Option<VariableName> {
        let mut changed = false;
        let rewritten = self.rewrite_atoms(&mut changed, &mut |atom| match atom {
            KeyAtom::Value(value) if value == target => {
                Some(KeyAtom::Variable(Box::new(replacement.clone())))
            }
            _ => None,
        });
        changed.then_some(rewritten)
    }

    /// Replaces every variable-valued key with the literal value produced by
    /// `lookup`, yielding the concrete name to search a trace for.
    ///
    /// Returns `None` when any referenced variable has no value in the
    /// current trace.
    #[must_use]
    pub fn resolve(
        &self,
        lookup: &dyn Fn(&VariableName) -> Option<ScalarValue>,
    ) -> Option<VariableName> {
        let mut failed = false;
        let mut changed = false;
        let resolved = self.rewrite_atoms(&mut changed, &mut |atom| match atom {
            KeyAtom::Variable(name) => match lookup(name) {
                Some(value) => Some(KeyAtom::Value(value)),
                None => {
                    failed = true;
                    None
                }
            },
            KeyAtom::Value(_) => None,
        });
        if failed {
            return None;
        }
        Some(resolved)
    }

    /// Checks whether the name carries `target` as a literal key.
    #[must_use]
    pub fn contains_value(&self, target: &ScalarValue) -> bool {
        let mut found = false;
        self.rewrite_atoms(&mut false, &mut |atom| {
            if matches!(atom, KeyAtom::Value(value) if value == target) {
                found = true;
            }
            None
        });
        found
    }

    /// The literal key values carried by the name, outermost first.
    #[must_use]
    pub fn literal_keys(&self) -> Vec<ScalarValue> {
        let mut keys = Vec::new();
        self.rewrite_atoms(&mut false, &mut |atom| {
            if let KeyAtom::Value(value) = atom {
                keys.push(value.clone());
            }
            None
        });
        keys
    }

    /// Checks whether the name refers to any other variable through its keys.
    #[must_use]
    pub fn is_generalised(&self) -> bool {
        let mut found = false;
        self.rewrite_atoms(&mut false, &mut |atom| {
            if matches!(atom, KeyAtom::Variable(_)) {
                found = true;
            }
            None
        });
        found
    }

    /// Rewrites the name bottom-up, offering every key atom to `rewrite`.
    fn rewrite_atoms(
        &self,
        changed: &mut bool,
        rewrite: &mut dyn FnMut(&KeyAtom) -> Option<KeyAtom>,
    ) -> VariableName {
        fn apply(
            atom: &KeyAtom,
            changed: &mut bool,
            rewrite: &mut dyn FnMut(&KeyAtom) -> Option<KeyAtom>,
        ) -> KeyAtom {
            match rewrite(atom) {
                Some(replacement) => {
                    *changed = true;
                    replacement
                }
                None => atom.clone(),
            }
        }

        fn rewrite_path(
            path: &Path,
            changed: &mut bool,
            rewrite: &mut dyn FnMut(&KeyAtom) -> Option<KeyAtom>,
        ) -> Path {
            Path(
                path.0
                    .iter()
                    .map(|segment| match segment {
                        PathSegment::Key(atom) => PathSegment::Key(apply(atom, changed, rewrite)),
                        other => other.clone(),
                    })
                    .collect(),
            )
        }

        match self {
            Self::Env(env) => Self::Env(*env),
            Self::Method { path } => Self::Method {
                path: rewrite_path(path, changed, rewrite),
            },
            Self::Event { name, path } => Self::Event {
                name: name.clone(),
                path: rewrite_path(path, changed, rewrite),
            },
            Self::State { name, path } => Self::State {
                name: name.clone(),
                path: rewrite_path(path, changed, rewrite),
            },
            Self::TokenBalance { token, role } => Self::TokenBalance {
                token: apply(token, changed, rewrite),
                role: role.clone(),
            },
            Self::At { point, base } => Self::At {
                point: *point,
                base: Box::new(base.rewrite_atoms(changed, rewrite)),
            },
            Self::Change { point, base } => Self::Change {
                point: *point,
                base: Box::new(base.rewrite_atoms(changed, rewrite)),
            },
        }
    }
}

impl Display for VariableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(env) => write!(f, "{env}"),
            Self::Method { path } => write!(f, "method{path}"),
            Self::Event { name, path } => write!(f, "event.{name}{path}"),
            Self::State { name, path } => write!(f, "variable.{name}{path}"),
            Self::TokenBalance { token, role } => write!(f, "tokenBalance.[{token}][{role}]"),
            Self::At { point, base } => write!(f, "{point}({base})"),
            Self::Change { point, base } => write!(f, "change.{point}({base})"),
        }
    }
}
