//! Typed protocol parameters.
//!
//! Every parameter is a list of one element type: strings, listen addresses
//! or booleans. A scalar in the config file is read as a one-element list.
//! Each parameter remembers where it was written so plugins can point at the
//! offending line when they reject it.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use toml::Spanned;

use crate::config::schema::ListenAddress;

/// Position of a parameter in its source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// File the parameter came from, once resolved.
    pub file: Option<String>,
    /// Byte range inside the source text.
    pub span: Range<usize>,
    /// 1-based line, 0 until resolved.
    pub line: usize,
    /// 1-based column, 0 until resolved.
    pub column: usize,
}

impl Location {
    /// Fill in file, line and column from the text the span points into.
    pub fn resolve(&mut self, file: &str, source: &str) {
        let start = self.span.start.min(source.len());
        let before = source.get(..start).unwrap_or("");
        self.file = Some(file.to_string());
        self.line = before.matches('\n').count() + 1;
        self.column = match before.rfind('\n') {
            Some(newline) => start - newline,
            None => start + 1,
        };
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file.as_deref().unwrap_or("<memory>");
        if self.line == 0 {
            write!(f, "{}@{}..{}", file, self.span.start, self.span.end)
        } else {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        }
    }
}

/// Value of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Strings(Vec<String>),
    Addresses(Vec<ListenAddress>),
    Booleans(Vec<bool>),
}

impl ParameterValue {
    fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Strings(_) => "string",
            ParameterValue::Addresses(_) => "address",
            ParameterValue::Booleans(_) => "boolean",
        }
    }
}

/// A named parameter with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: ParameterValue,
    pub location: Location,
}

/// Mapping from parameter name to a typed list of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: BTreeMap<String, Parameter>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by tests and programmatic configs.
    pub fn with_strings<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.insert(name, ParameterValue::Strings(values));
        self
    }

    pub fn with_addresses(mut self, name: &str, values: Vec<ListenAddress>) -> Self {
        self.insert(name, ParameterValue::Addresses(values));
        self
    }

    pub fn with_booleans(mut self, name: &str, values: Vec<bool>) -> Self {
        self.insert(name, ParameterValue::Booleans(values));
        self
    }

    pub fn insert(&mut self, name: &str, value: ParameterValue) {
        self.entries.insert(
            name.to_string(),
            Parameter {
                value,
                location: Location::default(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    pub fn strings(&self, name: &str) -> Option<&[String]> {
        match self.entries.get(name).map(|p| &p.value) {
            Some(ParameterValue::Strings(values)) => Some(values),
            _ => None,
        }
    }

    pub fn addresses(&self, name: &str) -> Option<&[ListenAddress]> {
        match self.entries.get(name).map(|p| &p.value) {
            Some(ParameterValue::Addresses(values)) => Some(values),
            _ => None,
        }
    }

    pub fn booleans(&self, name: &str) -> Option<&[bool]> {
        match self.entries.get(name).map(|p| &p.value) {
            Some(ParameterValue::Booleans(values)) => Some(values),
            _ => None,
        }
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.entries.get(name).map(|p| &p.location)
    }

    /// Names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every location against the source it was parsed from.
    pub fn resolve_locations(&mut self, file: &str, source: &str) {
        for parameter in self.entries.values_mut() {
            parameter.location.resolve(file, source);
        }
    }

    /// Describe a parameter for diagnostics, e.g. `'prefix' (string at a.toml:3:1)`.
    pub fn describe(&self, name: &str) -> String {
        match self.entries.get(name) {
            Some(p) => format!("'{}' ({} at {})", name, p.value.kind(), p.location),
            None => format!("'{}'", name),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Boolean(bool),
    Booleans(Vec<bool>),
    Text(String),
    Texts(Vec<String>),
    Address(ListenAddress),
    Addresses(Vec<ListenAddress>),
}

impl From<RawValue> for ParameterValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Boolean(b) => ParameterValue::Booleans(vec![b]),
            RawValue::Booleans(b) => ParameterValue::Booleans(b),
            RawValue::Text(s) => ParameterValue::Strings(vec![s]),
            RawValue::Texts(s) => ParameterValue::Strings(s),
            RawValue::Address(a) => ParameterValue::Addresses(vec![a]),
            RawValue::Addresses(a) => ParameterValue::Addresses(a),
        }
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, Spanned<RawValue>>::deserialize(deserializer)?;
        let entries = raw
            .into_iter()
            .map(|(name, spanned)| {
                let location = Location {
                    span: spanned.span(),
                    ..Location::default()
                };
                let parameter = Parameter {
                    value: spanned.into_inner().into(),
                    location,
                };
                (name, parameter)
            })
            .collect();
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        parameters: Parameters,
    }

    #[test]
    fn scalars_become_single_element_lists() {
        let text = r#"
[parameters]
prefix = "HELO"
flags = [true, false]
upstream = { host = "example.com", port = 25565 }
"#;
        let holder: Holder = toml::from_str(text).unwrap();
        let params = holder.parameters;

        assert_eq!(params.strings("prefix"), Some(&["HELO".to_string()][..]));
        assert_eq!(params.booleans("flags"), Some(&[true, false][..]));
        let upstream = params.addresses("upstream").unwrap();
        assert_eq!(upstream[0], ListenAddress::host("example.com", 25565));
        assert!(params.strings("flags").is_none());
    }

    #[test]
    fn locations_resolve_to_lines() {
        let text = "[parameters]\nfirst = \"a\"\nsecond = [\"b\", \"c\"]\n";
        let mut holder: Holder = toml::from_str(text).unwrap();
        holder.parameters.resolve_locations("mux.toml", text);

        let second = holder.parameters.location("second").unwrap();
        assert_eq!(second.line, 3);
        assert_eq!(second.file.as_deref(), Some("mux.toml"));
        assert!(second.to_string().starts_with("mux.toml:3:"));
    }

    #[test]
    fn builder_round_trips_names() {
        let params = Parameters::new()
            .with_strings("b", ["x"])
            .with_booleans("a", vec![true])
            .with_addresses("c", vec![ListenAddress::host("example.com", 25)]);
        let names: Vec<&str> = params.names().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(params.len(), 3);
        assert_eq!(params.addresses("c").unwrap()[0].port, 25);
    }
}
