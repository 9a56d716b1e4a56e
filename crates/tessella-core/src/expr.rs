//! Field-projection expression grammar.
//!
//! Display layouts, search field selectors and filters all address graph data
//! through one small expression language:
//!
//! ```text
//! expr        ::= alt (" $||$ " alt)*
//! alt         ::= template with embedded paths
//! path        ::= segment ("->" segment)*
//! segment     ::= "$" name | "$r_" relname | "$ri_" relname | "$_source_"
//! leaf tail   ::= "$" name                 -- entity property
//!              |  "$r_" relname "." name   -- relation property
//!              |  "." name                 -- relation property on current relation
//! ```
//!
//! An alternative is a template: literal text with `$`-paths embedded, so
//! `[$r_cast->$id] $r_cast->$title` renders an id-prefixed title per relation
//! entry. `" $||$ "` separates alternatives whose renderings are unioned.
//! Reserved leaf names are `id`, `display_name` and `entity_type_name`.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CoreError, Result};

/// Separator between expression alternatives.
pub const ALTERNATIVE_SEPARATOR: &str = " $||$ ";

static RELATION_PROP_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.([A-Za-z_][A-Za-z0-9_]*)$").expect("hard-coded regex compiles"));

/// A traversal step through the graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationKey {
    /// Follow a relation from its domain side
    Forward(String),
    /// Follow a relation from its range side
    Inverse(String),
    /// Follow provenance edges
    Source,
}

impl RelationKey {
    /// Parses a path segment name into a traversal key. Plain names return
    /// `None` and denote properties.
    pub fn from_segment(name: &str) -> Option<Self> {
        if name == tessella_config::SOURCE_RELATION {
            Some(Self::Source)
        } else if let Some(rest) = name.strip_prefix("ri_") {
            Some(Self::Inverse(rest.to_string()))
        } else if let Some(rest) = name.strip_prefix("r_") {
            Some(Self::Forward(rest.to_string()))
        } else {
            None
        }
    }

    /// Relation type system name, if this is a typed traversal.
    pub fn relation_name(&self) -> Option<&str> {
        match self {
            Self::Forward(name) | Self::Inverse(name) => Some(name),
            Self::Source => None,
        }
    }

    pub fn is_inverse(&self) -> bool {
        matches!(self, Self::Inverse(_))
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward(name) => write!(f, "r_{name}"),
            Self::Inverse(name) => write!(f, "ri_{name}"),
            Self::Source => write!(f, "{}", tessella_config::SOURCE_RELATION),
        }
    }
}

/// Terminal step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    /// Property of the entity reached by the traversal chain
    EntityProp(String),
    /// Property of the relation reached by the traversal chain
    RelationProp(String),
}

impl Leaf {
    pub fn name(&self) -> &str {
        match self {
            Self::EntityProp(name) | Self::RelationProp(name) => name,
        }
    }
}

/// One embedded path: a traversal chain ending in a property leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub traversals: Vec<RelationKey>,
    pub leaf: Leaf,
}

/// Piece of an alternative template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Literal(String),
    Path(Path),
}

/// One alternative: literal text with embedded paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub spans: Vec<Span>,
}

impl Template {
    /// All embedded paths, in template order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.spans.iter().filter_map(|span| match span {
            Span::Path(path) => Some(path),
            Span::Literal(_) => None,
        })
    }
}

/// A parsed field-projection expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpression {
    pub raw: String,
    pub alternatives: Vec<Template>,
}

impl FieldExpression {
    pub fn parse(raw: &str) -> Result<Self> {
        let alternatives = raw
            .split(ALTERNATIVE_SEPARATOR)
            .map(|alt| parse_template(raw, alt))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// All paths across all alternatives.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.alternatives.iter().flat_map(Template::paths)
    }
}

/// Parses a traversal-only base path such as `$r_cast` or
/// `$r_cast->$ri_member_of`, used by nested search fields.
pub fn parse_base(raw: &str) -> Result<Vec<RelationKey>> {
    let mut traversals = Vec::new();
    for segment in raw.split("->") {
        let name = segment.strip_prefix('$').ok_or_else(|| {
            CoreError::expression(raw, "base segments must start with `$`")
        })?;
        let key = RelationKey::from_segment(name).ok_or_else(|| {
            CoreError::expression(raw, format!("`{name}` is not a traversal"))
        })?;
        traversals.push(key);
    }
    Ok(traversals)
}

fn parse_template(expr: &str, text: &str) -> Result<Template> {
    // A bare `.prop` selector addresses the current relation entry.
    if let Some(captures) = RELATION_PROP_ONLY.captures(text) {
        let name = captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| CoreError::expression(expr, "empty relation property"))?;
        return Ok(Template {
            spans: vec![Span::Path(Path {
                traversals: Vec::new(),
                leaf: Leaf::RelationProp(name),
            })],
        });
    }

    let mut spans = Vec::new();
    let mut literal = String::new();
    let mut rest = text;
    while let Some(dollar) = rest.find('$') {
        literal.push_str(&rest[..dollar]);
        let (path, consumed) = parse_path(expr, &rest[dollar..])?;
        if !literal.is_empty() {
            spans.push(Span::Literal(std::mem::take(&mut literal)));
        }
        spans.push(Span::Path(path));
        rest = &rest[dollar + consumed..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        spans.push(Span::Literal(literal));
    }
    if spans.iter().all(|span| matches!(span, Span::Literal(_))) {
        return Err(CoreError::expression(expr, "alternative contains no path"));
    }
    Ok(Template { spans })
}

fn parse_path(expr: &str, input: &str) -> Result<(Path, usize)> {
    let mut traversals = Vec::new();
    let mut pos = 0;
    loop {
        // Invariant: input[pos] is the `$` opening the next segment.
        pos += 1;
        let name = take_name(&input[pos..]);
        if name.is_empty() {
            return Err(CoreError::expression(expr, "expected a name after `$`"));
        }
        pos += name.len();
        let Some(key) = RelationKey::from_segment(name) else {
            let path = Path {
                traversals,
                leaf: Leaf::EntityProp(name.to_string()),
            };
            return Ok((path, pos));
        };
        traversals.push(key);
        let rest = &input[pos..];
        if rest.starts_with("->$") {
            pos += 2;
            continue;
        }
        if let Some(after_dot) = rest.strip_prefix('.') {
            let prop = take_name(after_dot);
            if prop.is_empty() {
                return Err(CoreError::expression(expr, "expected a name after `.`"));
            }
            pos += 1 + prop.len();
            let path = Path {
                traversals,
                leaf: Leaf::RelationProp(prop.to_string()),
            };
            return Ok((path, pos));
        }
        return Err(CoreError::expression(
            expr,
            format!("traversal `{name}` must be followed by `->` or a relation property"),
        ));
    }
}

fn take_name(input: &str) -> &str {
    let end = input
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(input.len());
    &input[..end]
}
