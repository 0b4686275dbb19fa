use serde::{Deserialize, Serialize};
use std::fmt;

/// The literal carried by a terminal symbol.
///
/// Text terminals render as UTF-8, byte terminals render verbatim. A tree that
/// contains at least one `Bytes` leaf reports `contains_bytes() == true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl TerminalValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TerminalValue::Text(s) => s.as_bytes(),
            TerminalValue::Bytes(b) => b,
        }
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, TerminalValue::Bytes(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TerminalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalValue::Text(s) => write!(f, "{s:?}"),
            TerminalValue::Bytes(b) => {
                write!(f, "b\"")?;
                for byte in b {
                    match byte {
                        b'"' => write!(f, "\\\"")?,
                        b'\\' => write!(f, "\\\\")?,
                        0x20..=0x7e => write!(f, "{}", *byte as char)?,
                        _ => write!(f, "\\x{byte:02x}")?,
                    }
                }
                write!(f, "\"")
            }
        }
    }
}

/// A grammar symbol.
///
/// Non-terminal names are stored without angle brackets; `Display` adds them
/// back. `Slice` is a content-free marker used when a tree is split into
/// pieces and never appears in grammar rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Symbol {
    Terminal(TerminalValue),
    NonTerminal(String),
    Slice,
}

impl Symbol {
    /// Creates a non-terminal symbol. Surrounding angle brackets are accepted and stripped.
    pub fn non_terminal(name: impl AsRef<str>) -> Self {
        Symbol::NonTerminal(strip_brackets(name.as_ref()).to_string())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Symbol::Terminal(TerminalValue::Text(value.into()))
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Symbol::Terminal(TerminalValue::Bytes(value.into()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Symbol::Terminal(_))
    }

    pub fn is_non_terminal(&self) -> bool {
        matches!(self, Symbol::NonTerminal(_))
    }

    /// The bare name of a non-terminal, `None` for every other kind.
    pub fn name(&self) -> Option<&str> {
        match self {
            Symbol::NonTerminal(name) => Some(name),
            _ => None,
        }
    }

    pub fn terminal_value(&self) -> Option<&TerminalValue> {
        match self {
            Symbol::Terminal(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Terminal(value) => write!(f, "{value}"),
            Symbol::NonTerminal(name) => write!(f, "<{name}>"),
            Symbol::Slice => write!(f, "<|slice|>"),
        }
    }
}

pub(crate) fn strip_brackets(name: &str) -> &str {
    name.strip_prefix('<')
        .and_then(|n| n.strip_suffix('>'))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn non_terminal_names_are_normalized_without_brackets() {
        let bracketed = Symbol::non_terminal("<digit>");
        let bare = Symbol::non_terminal("digit");
        assert_eq!(bracketed, bare, "Brackets should not be part of the identity");
        assert_eq!(bare.name(), Some("digit"));
        assert_eq!(bare.to_string(), "<digit>");
    }

    #[test]
    fn equality_and_hash_depend_on_kind_and_value() {
        let mut set = HashSet::new();
        set.insert(Symbol::text("a"));
        set.insert(Symbol::bytes(b"a".to_vec()));
        set.insert(Symbol::non_terminal("a"));
        set.insert(Symbol::text("a"));
        assert_eq!(
            set.len(),
            3,
            "Text, bytes and non-terminal with the same payload are distinct symbols: {set:?}"
        );
    }

    #[test]
    fn byte_terminals_render_escaped() {
        let value = TerminalValue::Bytes(vec![b'o', b'k', 0x00, b'"']);
        assert_eq!(value.to_string(), "b\"ok\\x00\\\"\"");
        assert!(value.is_bytes());
        assert_eq!(value.len(), 4);
    }
}
