//! Built-in protocol plugins.
//!
//! `echo` and `reject` are small reference implementations of the plugin
//! contract: sniff a configured prefix, claim the connection, then speak.

pub mod echo;
pub mod reject;

use std::sync::Arc;

use crate::config::{Parameter, ParameterValue, Parameters};
use crate::engine::{Connection, MuxError, Result, READ_BUFFER_SIZE};
use crate::framework::ProtocolRegistry;

pub use echo::Echo;
pub use reject::Reject;

/// Register every built-in protocol under its name.
pub fn register_builtin(registry: &mut ProtocolRegistry) {
    registry.register(echo::NAME, Arc::new(Echo));
    registry.register(reject::NAME, Arc::new(Reject));
}

/// Parameters of one remote entry, falling back to the protocol's globals.
pub(crate) struct Settings<'a> {
    protocol: &'static str,
    remote: &'a str,
    globals: &'a Parameters,
    local: &'a Parameters,
}

impl<'a> Settings<'a> {
    /// Fails if either set holds a name outside `known`.
    pub(crate) fn new(
        protocol: &'static str,
        remote: &'a str,
        globals: &'a Parameters,
        local: &'a Parameters,
        known: &[&str],
    ) -> Result<Self> {
        let settings = Self {
            protocol,
            remote,
            globals,
            local,
        };
        for params in [globals, local] {
            if let Some(name) = params.names().find(|name| !known.contains(name)) {
                return Err(settings.error(format!(
                    "unknown parameter {}",
                    params.describe(name)
                )));
            }
        }
        Ok(settings)
    }

    fn lookup(&self, name: &str) -> Option<(&'a Parameters, &'a Parameter)> {
        let local = self.local;
        let globals = self.globals;
        local
            .get(name)
            .map(|p| (local, p))
            .or_else(|| globals.get(name).map(|p| (globals, p)))
    }

    pub(crate) fn strings(&self, name: &str) -> Result<Option<&'a [String]>> {
        match self.lookup(name) {
            None => Ok(None),
            Some((_, Parameter { value: ParameterValue::Strings(values), .. })) => {
                Ok(Some(values.as_slice()))
            }
            Some((params, _)) => Err(self.error(format!(
                "parameter {} must be a string",
                params.describe(name)
            ))),
        }
    }

    pub(crate) fn required_strings(&self, name: &str) -> Result<&'a [String]> {
        self.strings(name)?
            .ok_or_else(|| self.error(format!("required parameter '{}' was not given", name)))
    }

    /// A parameter that must hold exactly one string.
    pub(crate) fn single_string(&self, name: &str) -> Result<Option<&'a str>> {
        match self.strings(name)? {
            None => Ok(None),
            Some([value]) => Ok(Some(value.as_str())),
            Some(_) => Err(self.error(format!("parameter '{}' takes exactly one value", name))),
        }
    }

    /// `priority`, a non-negative integer written as a string. Defaults to 0.
    pub(crate) fn priority(&self) -> Result<u32> {
        match self.single_string("priority")? {
            None => Ok(0),
            Some(text) => text.trim().parse().map_err(|_| {
                self.error(format!(
                    "parameter 'priority' must be a non-negative integer, got '{}'",
                    text
                ))
            }),
        }
    }

    pub(crate) fn error(&self, message: String) -> MuxError {
        MuxError::Configure {
            protocol: self.protocol.to_string(),
            remote: self.remote.to_string(),
            message,
        }
    }
}

/// Outcome of comparing the bytes seen so far against candidate prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefixMatch {
    /// `seen` starts with the prefix at this index.
    Matched(usize),
    /// Some prefix could still match once more bytes arrive.
    Partial,
    /// No prefix can match.
    Mismatch,
}

pub(crate) fn match_prefix(seen: &[u8], prefixes: &[String]) -> PrefixMatch {
    if let Some(index) = prefixes
        .iter()
        .position(|prefix| seen.starts_with(prefix.as_bytes()))
    {
        return PrefixMatch::Matched(index);
    }
    if prefixes
        .iter()
        .any(|prefix| prefix.as_bytes().starts_with(seen))
    {
        PrefixMatch::Partial
    } else {
        PrefixMatch::Mismatch
    }
}

/// Read until one of `prefixes` matches, returning everything consumed.
///
/// Fails as soon as the stream diverges from every prefix, or if it ends
/// first.
pub(crate) async fn read_prefix(conn: &Connection, prefixes: &[String]) -> Result<Vec<u8>> {
    let mut seen = Vec::new();
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match match_prefix(&seen, prefixes) {
            PrefixMatch::Matched(_) => return Ok(seen),
            PrefixMatch::Mismatch => {
                return Err(MuxError::Protocol(format!(
                    "{}: stream does not start with a configured prefix",
                    conn.protocol()
                )))
            }
            PrefixMatch::Partial => {}
        }
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(MuxError::Protocol(format!(
                "{}: stream ended before a prefix matched",
                conn.protocol()
            )));
        }
        seen.extend_from_slice(&chunk[..n]);
    }
}
