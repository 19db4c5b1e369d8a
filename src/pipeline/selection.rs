//! Selection expressions and their resolution into particle objects.
//!
//! Grammar (comma separated, whitespace ignored):
//!
//! ```text
//! selection := item ("," item)*
//! item      := "all" | range | name | name "[" range "]"
//! range     := first [":" last [":" step]]      (inclusive)
//! name      := [A-Za-z_][A-Za-z0-9_.-]*
//! ```
//!
//! A plain `range` addresses snapshot indices directly; inside brackets it
//! addresses slots of the named component.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::snapshot::ComponentRange;

use super::objects::{DisplayProperties, ParticlesObject};

/// Selection errors. None of them change any pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("Invalid selection '{expression}': {reason}")]
    InvalidSelectionSyntax { expression: String, reason: String },
    #[error("Unknown component '{name}'")]
    UnknownComponentName { name: String },
    #[error("Index {index} out of range for {context} (limit {limit})")]
    IndexOutOfRange {
        index: usize,
        limit: usize,
        context: String,
    },
}

/// Inclusive, stepped index range (`first:last:step`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexRange {
    pub first: usize,
    pub last: usize,
    pub step: usize,
}

impl IndexRange {
    pub fn new(first: usize, last: usize, step: usize) -> Self {
        Self { first, last, step }
    }

    /// Number of indices covered.
    pub fn len(&self) -> usize {
        (self.last - self.first) / self.step + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + use<> {
        (self.first..=self.last).step_by(self.step)
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 1 {
            write!(f, "{}:{}", self.first, self.last)
        } else {
            write!(f, "{}:{}:{}", self.first, self.last, self.step)
        }
    }
}

/// Declared identity of a particle object; the property carryover key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectIdentity {
    /// Every particle of a snapshot that declares no components.
    All,
    /// A whole named component.
    Component(String),
    /// Slots of a named component.
    ComponentSlice { name: String, range: IndexRange },
    /// Explicit snapshot indices.
    Range(IndexRange),
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectIdentity::All => write!(f, "all"),
            ObjectIdentity::Component(name) => write!(f, "{}", name),
            ObjectIdentity::ComponentSlice { name, range } => write!(f, "{}[{}]", name, range),
            ObjectIdentity::Range(range) => write!(f, "{}", range),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    All,
    Component { name: String, slice: Option<IndexRange> },
    Range(IndexRange),
}

/// A parsed selection expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    expression: String,
    items: Vec<Item>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::all()
    }
}

impl Selection {
    /// The `all` selection.
    pub fn all() -> Self {
        Self {
            expression: "all".to_string(),
            items: vec![Item::All],
        }
    }

    /// Parse a selection expression.
    pub fn parse(expression: &str) -> Result<Self, SelectionError> {
        let fail = |reason: String| SelectionError::InvalidSelectionSyntax {
            expression: expression.to_string(),
            reason,
        };

        if expression.trim().is_empty() {
            return Err(fail("empty selection".into()));
        }

        let mut items = Vec::new();
        for (position, raw) in expression.split(',').enumerate() {
            let token = raw.trim();
            if token.is_empty() {
                return Err(fail(format!("empty item at position {}", position + 1)));
            }
            items.push(parse_item(token).map_err(fail)?);
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            items,
        })
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Resolve against one snapshot's component list.
    ///
    /// Objects come out in component declaration order (whole component
    /// first, then its slices by ascending first index), followed by explicit
    /// ranges in ascending order. Repeated identities collapse into one
    /// object. Every object starts with `defaults`.
    ///
    /// `all` expands to the declared components when there are any, so
    /// particles outside every component are not selected. Only a snapshot
    /// without components yields a single object covering every particle.
    pub fn resolve(
        &self,
        particle_count: usize,
        components: &[ComponentRange],
        defaults: &DisplayProperties,
    ) -> Result<Vec<ParticlesObject>, SelectionError> {
        let mut keyed: Vec<(SortKey, ObjectIdentity, Vec<u32>)> = Vec::new();
        let mut seen = HashSet::new();

        let mut push = |key: SortKey, identity: ObjectIdentity, table: Vec<u32>| {
            if seen.insert(identity.clone()) {
                keyed.push((key, identity, table));
            }
        };

        for item in &self.items {
            match item {
                Item::All if components.is_empty() => {
                    let table = (0..particle_count as u32).collect();
                    push(SortKey::All, ObjectIdentity::All, table);
                }
                Item::All => {
                    for (order, component) in components.iter().enumerate() {
                        let table = component_table(component, particle_count)?;
                        push(
                            SortKey::Component(order, None),
                            ObjectIdentity::Component(component.name.clone()),
                            table,
                        );
                    }
                }
                Item::Component { name, slice } => {
                    let (order, component) = components
                        .iter()
                        .enumerate()
                        .find(|(_, c)| &c.name == name)
                        .ok_or_else(|| SelectionError::UnknownComponentName { name: name.clone() })?;
                    match slice {
                        None => {
                            let table = component_table(component, particle_count)?;
                            push(
                                SortKey::Component(order, None),
                                ObjectIdentity::Component(name.clone()),
                                table,
                            );
                        }
                        Some(range) => {
                            let table = slice_table(component, *range, particle_count)?;
                            push(
                                SortKey::Component(order, Some(*range)),
                                ObjectIdentity::ComponentSlice {
                                    name: name.clone(),
                                    range: *range,
                                },
                                table,
                            );
                        }
                    }
                }
                Item::Range(range) => {
                    if range.last >= particle_count {
                        return Err(SelectionError::IndexOutOfRange {
                            index: range.last,
                            limit: particle_count,
                            context: format!("range {}", range),
                        });
                    }
                    let table = range.iter().map(|i| i as u32).collect();
                    push(SortKey::Range(*range), ObjectIdentity::Range(*range), table);
                }
            }
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(keyed
            .into_iter()
            .map(|(_, identity, table)| ParticlesObject::new(identity, table, defaults.clone()))
            .collect())
    }
}

impl FromStr for Selection {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Ordering of resolved objects. Variant order is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    All,
    /// Declaration position, then slice (`None` sorts before any slice).
    Component(usize, Option<IndexRange>),
    Range(IndexRange),
}

fn component_table(
    component: &ComponentRange,
    particle_count: usize,
) -> Result<Vec<u32>, SelectionError> {
    if !component.is_empty() {
        match component.max_index() {
            Some(max) if max < particle_count => {}
            // `None` here means the range wrapped past usize::MAX
            max => {
                return Err(SelectionError::IndexOutOfRange {
                    index: max.unwrap_or(usize::MAX),
                    limit: particle_count,
                    context: format!("component '{}'", component.name),
                });
            }
        }
    }
    Ok((0..component.len())
        .filter_map(|slot| component.index(slot))
        .map(|i| i as u32)
        .collect())
}

fn slice_table(
    component: &ComponentRange,
    range: IndexRange,
    particle_count: usize,
) -> Result<Vec<u32>, SelectionError> {
    if range.last >= component.len() {
        return Err(SelectionError::IndexOutOfRange {
            index: range.last,
            limit: component.len(),
            context: format!("component '{}'", component.name),
        });
    }
    range
        .iter()
        .map(|slot| {
            let index = component.index(slot).unwrap_or(usize::MAX);
            if index >= particle_count {
                Err(SelectionError::IndexOutOfRange {
                    index,
                    limit: particle_count,
                    context: format!("component '{}'", component.name),
                })
            } else {
                Ok(index as u32)
            }
        })
        .collect()
}

fn parse_item(token: &str) -> Result<Item, String> {
    if token.eq_ignore_ascii_case("all") {
        return Ok(Item::All);
    }
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_range(token).map(Item::Range);
    }

    let (name, slice) = match token.find('[') {
        None => (token, None),
        Some(open) => {
            let inner = token[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| format!("missing ']' in '{}'", token))?;
            (token[..open].trim_end(), Some(parse_range(inner.trim())?))
        }
    };

    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_start || !valid_rest {
        return Err(format!("'{}' is not a component name or index range", name));
    }

    Ok(Item::Component {
        name: name.to_string(),
        slice,
    })
}

fn parse_range(text: &str) -> Result<IndexRange, String> {
    let parts: Vec<&str> = text.split(':').map(str::trim).collect();
    if parts.len() > 3 {
        return Err(format!("range '{}' has more than three fields", text));
    }
    let number = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| format!("'{}' is not a non-negative integer", s))
    };

    let first = number(parts[0])?;
    let last = parts.get(1).map(|s| number(s)).transpose()?.unwrap_or(first);
    let step = parts.get(2).map(|s| number(s)).transpose()?.unwrap_or(1);

    if last < first {
        return Err(format!("range '{}' ends before it starts", text));
    }
    if step == 0 {
        return Err(format!("range '{}' has a zero step", text));
    }
    Ok(IndexRange::new(first, last, step))
}
