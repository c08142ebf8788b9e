//! The symbol catalogue: which symbols exist, what they do, and how their container slots become parameters.
//!
//! The catalogue is read-only configuration loaded from json. Hosts may reload it at any time;
//! every reload gets a higher version so that programs compiled against an older catalogue are recompiled.

use std::collections::BTreeMap;

use compact_str::CompactString;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use unicase::UniCase;

use crate::ast::{Category, BracketRole};
use crate::runtime::*;
use crate::util::{self, is_identifier};
use crate::vecmap::VecMap;

const STANDARD: &str = include_str!("assets/catalogue.json");

/// A failure to load a catalogue.
#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("malformed catalogue: {0}")]
    Json(#[from] serde_json::Error),
    #[error("symbol `{symbol}`: {msg}")]
    Invalid { symbol: CompactString, msg: CompactString },
}

/// One action a symbol can perform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Label texts that select this action, in addition to its id.
    #[serde(default)]
    pub names: Vec<CompactString>,
    /// The parameter each container slot is bound to; unused slots are `null`.
    /// A name bound to several slots collects those slots into a list.
    #[serde(default)]
    pub slots: Vec<Option<CompactString>>,
}
impl ActionSpec {
    /// Checks if the parameter name is bound to more than one slot.
    pub fn is_list_param(&self, name: &str) -> bool {
        self.slots.iter().flatten().filter(|x| x.as_str() == name).count() > 1
    }
}

/// What a symbol kind is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub category: Category,
    #[serde(default)]
    pub bracket: BracketRole,
    #[serde(default)]
    pub actions: VecMap<CompactString, ActionSpec, false>,
    /// Action used when the symbol has no label.
    #[serde(default)]
    pub default_action: Option<CompactString>,
}

/// How items of a material convert into values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialKind {
    /// The item's name as text (formulas are text starting with `=`).
    Text,
    /// The item's name parsed as a number, or its amount if unnamed.
    Number,
    /// The item's name parsed as a bool, or `true` if unnamed.
    Bool,
    /// The item's name parsed as `[world] x y z`.
    Location,
    /// The item's name as an actor identity.
    Actor,
    /// The item itself.
    Item,
}

/// The outcome of resolving a symbol's label against its actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Resolved(&'a str),
    /// No action could be chosen; `label` holds the unmatched label text, if there was one.
    Unset { label: Option<CompactString> },
}

/// A versioned symbol catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    version: u64,
    symbols: BTreeMap<CompactString, SymbolSpec>,
    #[serde(default)]
    materials: BTreeMap<CompactString, MaterialKind>,
}
impl Catalogue {
    /// Loads and validates a catalogue from json.
    pub fn from_json(src: &str) -> Result<Self, CatalogueError> {
        let res: Catalogue = serde_json::from_str(src)?;
        res.validate()?;
        Ok(res)
    }
    /// The catalogue bundled with the crate.
    pub fn standard() -> Result<Self, CatalogueError> {
        Self::from_json(STANDARD)
    }
    fn validate(&self) -> Result<(), CatalogueError> {
        for (symbol, spec) in self.symbols.iter() {
            let invalid = |msg: &str| CatalogueError::Invalid { symbol: symbol.clone(), msg: msg.into() };
            match (spec.category, spec.bracket) {
                (Category::Bracket, BracketRole::None) => return Err(invalid("bracket symbols need a bracket role")),
                (Category::Bracket, _) | (_, BracketRole::None) => (),
                _ => return Err(invalid("only bracket symbols can have a bracket role")),
            }
            if let Some(default) = &spec.default_action {
                if !spec.actions.contains_key(default.as_str()) {
                    return Err(invalid("default action is not one of its actions"));
                }
            }
            for (action, action_spec) in spec.actions.iter() {
                if !is_identifier(action) || action_spec.slots.iter().flatten().any(|x| !is_identifier(x)) {
                    return Err(invalid("action and parameter names must be identifiers"));
                }
            }
        }
        Ok(())
    }
    pub fn version(&self) -> u64 {
        self.version
    }
    /// Replaces the contents with `other`, moving to a version strictly greater than the current one.
    pub fn reload(&mut self, other: Catalogue) {
        let version = other.version.max(self.version + 1);
        *self = other;
        self.version = version;
    }
    pub fn symbol(&self, kind: &str) -> Option<&SymbolSpec> {
        self.symbols.get(kind)
    }
    pub fn material_kind(&self, material: &str) -> MaterialKind {
        self.materials.get(material).copied().unwrap_or(MaterialKind::Item)
    }

    /// Resolves the action of a symbol from its label lines.
    /// The first non-decorative line is matched case-insensitively against action ids and names
    /// (underscores and spaces are interchangeable).
    pub fn resolve_action<'a>(&self, spec: &'a SymbolSpec, label: Option<&[CompactString]>) -> Resolution<'a> {
        let line = label.and_then(|lines| lines.iter().find(|x| !util::is_decorative(x)));
        let line = match line {
            Some(line) => normalize(line),
            None => return match spec.default_action.as_deref().or_else(|| single_action(spec)) {
                Some(action) => Resolution::Resolved(action),
                None => Resolution::Unset { label: None },
            },
        };
        let wanted = UniCase::new(line.as_str());
        for (id, action) in spec.actions.iter() {
            if UniCase::new(normalize(id).as_str()) == wanted || action.names.iter().any(|x| UniCase::new(normalize(x).as_str()) == wanted) {
                return Resolution::Resolved(id);
            }
        }
        Resolution::Unset { label: Some(line) }
    }

    /// Converts the contents of a container slot into a value, according to the item's material.
    pub fn convert_slot(&self, item: &Item, world: &str) -> Result<Value, ErrorCause> {
        let name = item.name.as_deref().map(str::trim);
        let text_error = |expected| ErrorCause::ConversionError { got: ValueKind::Text, expected };
        Ok(match self.material_kind(&item.material) {
            MaterialKind::Text => Value::Text(name.unwrap_or_default().into()),
            MaterialKind::Number => match name {
                Some(name) => Value::Number(Number::parse(name).ok_or(text_error(ValueKind::Number))?),
                None => Value::Number(Number::from(item.amount)),
            }
            MaterialKind::Bool => match name {
                Some(name) => Value::Bool(Value::Text(name.into()).as_bool()?),
                None => Value::Bool(true),
            }
            MaterialKind::Location => Value::Location(parse_location(name.unwrap_or_default(), world).ok_or(text_error(ValueKind::Location))?),
            MaterialKind::Actor => match name {
                Some(name) if !name.is_empty() => Value::Actor(ActorId::new(name)),
                _ => return Err(text_error(ValueKind::Actor)),
            }
            MaterialKind::Item => Value::Item(item.clone()),
        })
    }
}

fn single_action(spec: &SymbolSpec) -> Option<&str> {
    match spec.actions.len() {
        1 => spec.actions.keys().next().map(|x| x.as_str()),
        _ => None,
    }
}

fn normalize(s: &str) -> CompactString {
    let stripped = util::strip_formatting(s).replace('_', " ");
    let mut res = CompactString::default();
    for word in stripped.split_whitespace() {
        if !res.is_empty() { res.push(' '); }
        res.push_str(word);
    }
    res
}

/// Parses `x y z` or `world x y z` (commas are also accepted as separators).
fn parse_location(s: &str, world: &str) -> Option<Location> {
    let parts = s.split(|c: char| c == ',' || c.is_whitespace()).filter(|x| !x.is_empty()).collect::<Vec<_>>();
    let (world, coords) = match parts.len() {
        3 => (world, &parts[..]),
        4 => (parts[0], &parts[1..]),
        _ => return None,
    };
    let coord = |x: &str| x.parse::<i32>().ok();
    Some(Location { world: world.into(), x: coord(coords[0])?, y: coord(coords[1])?, z: coord(coords[2])? })
}
