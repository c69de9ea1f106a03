//! Shard routing: (kind, value) -> table identifier
//!
//! Every identifier that can ever reach a SQL statement is pre-registered
//! here at startup, one per (kind, shard token) pair. Routing only looks
//! identifiers up; it never formats input-derived text into a table name.
//!
//! Shard tokens:
//! - `0-9`, `a-z`, `_` for values whose first character is `[A-Za-z0-9_]`
//!   (uppercase collapses onto lowercase; unquoted SQL identifiers are
//!   case-insensitive anyway)
//! - `other` for every other first character (`.`, `/`, `:`, non-ASCII, ...)

use super::error::RoutingError;
use super::indicator::{Indicator, IndicatorKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const FALLBACK_TOKEN: &str = "other";

pub const SHARD_TOKENS: [&str; 38] = [
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "a", "b", "c", "d", "e", "f", "g", "h", "i",
    "j", "k", "l", "m", "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z", "_",
    FALLBACK_TOKEN,
];

/// Longest sanitized kind prefix kept in a table name
const MAX_KIND_LEN: usize = 48;

/// Schema family of a shard table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableFamily {
    /// `{ id, value VARCHAR(15) UNIQUE }`
    Address,
    /// `{ id, value TEXT UNIQUE, kind, created, persisted }`
    Match,
}

/// A registered, allow-list-safe table identifier.
///
/// Can only be obtained from a `TableRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    name: Arc<str>,
    kind: Arc<str>,
    token: &'static str,
    family: TableFamily,
    width: Option<usize>,
}

impl TableId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn token(&self) -> &'static str {
        self.token
    }

    pub fn family(&self) -> TableFamily {
        self.family
    }

    /// Column width filter applied before inserts (None = unbounded TEXT)
    pub fn width(&self) -> Option<usize> {
        self.width
    }

    /// Double-quoted form for SQL text
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Strip everything outside `[A-Za-z0-9_]`, lowercase, and bound the length
pub fn sanitize_kind(kind: &str) -> String {
    kind.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_KIND_LEN)
        .collect()
}

/// Shard token for a value, taken from its first character
pub fn shard_token(value: &str) -> Result<&'static str, RoutingError> {
    let first = value.chars().next().ok_or(RoutingError::EmptyValue)?;
    let lower = first.to_ascii_lowercase();
    Ok(SHARD_TOKENS
        .iter()
        .copied()
        .find(|token| token.len() == 1 && token.starts_with(lower))
        .unwrap_or(FALLBACK_TOKEN))
}

#[derive(Debug, Clone, Copy)]
struct KindEntry {
    family: TableFamily,
    width: Option<usize>,
}

/// Fixed mapping from (kind, shard token) to table identifier
#[derive(Debug, Clone)]
pub struct TableRegistry {
    kinds: HashMap<String, KindEntry>,
    tables: HashMap<(String, &'static str), TableId>,
}

impl TableRegistry {
    /// Registry holding every indicator kind plus the given match kinds.
    ///
    /// Match kinds that sanitize to nothing or collide with the address
    /// family are skipped with a warning.
    pub fn new<I, S>(match_kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self {
            kinds: HashMap::new(),
            tables: HashMap::new(),
        };

        for kind in IndicatorKind::ALL {
            let family = match kind {
                IndicatorKind::Ip4 => TableFamily::Address,
                _ => TableFamily::Match,
            };
            registry.insert_kind(
                kind.as_str().to_string(),
                KindEntry {
                    family,
                    width: Some(kind.value_width()),
                },
            );
        }

        for kind in match_kinds {
            if let Err(e) = registry.register_match_kind(kind.as_ref()) {
                log::warn!("⚠️  Skipping match kind '{}': {}", kind.as_ref(), e);
            }
        }

        registry
    }

    /// Register a free-text pattern kind; returns its sanitized name
    pub fn register_match_kind(&mut self, kind: &str) -> Result<String, RoutingError> {
        let sanitized = sanitize_kind(kind);
        if sanitized.is_empty() {
            return Err(RoutingError::EmptyKind(kind.to_string()));
        }
        match self.kinds.get(&sanitized) {
            Some(entry) if entry.family == TableFamily::Address => {
                Err(RoutingError::ReservedKind(kind.to_string()))
            }
            Some(_) => Ok(sanitized),
            None => {
                self.insert_kind(
                    sanitized.clone(),
                    KindEntry {
                        family: TableFamily::Match,
                        width: None,
                    },
                );
                Ok(sanitized)
            }
        }
    }

    fn insert_kind(&mut self, kind: String, entry: KindEntry) {
        let kind_arc: Arc<str> = Arc::from(kind.as_str());
        for token in SHARD_TOKENS {
            let table = TableId {
                name: Arc::from(format!("{}_{}", kind, token)),
                kind: kind_arc.clone(),
                token,
                family: entry.family,
                width: entry.width,
            };
            self.tables.insert((kind.clone(), token), table);
        }
        self.kinds.insert(kind, entry);
    }

    /// Deterministic routing of a (kind, value) pair
    pub fn route(&self, kind: &str, value: &str) -> Result<TableId, RoutingError> {
        let sanitized = sanitize_kind(kind);
        if sanitized.is_empty() {
            return Err(RoutingError::EmptyKind(kind.to_string()));
        }
        let token = shard_token(value)?;
        self.tables
            .get(&(sanitized, token))
            .cloned()
            .ok_or_else(|| RoutingError::UnknownKind(kind.to_string()))
    }

    pub fn route_indicator(&self, indicator: &Indicator) -> Result<TableId, RoutingError> {
        self.route(indicator.kind().as_str(), indicator.value())
    }

    /// Every registered table of a kind, in shard-token order
    pub fn tables_for(&self, kind: &str) -> Vec<TableId> {
        let sanitized = sanitize_kind(kind);
        SHARD_TOKENS
            .iter()
            .filter_map(|token| self.tables.get(&(sanitized.clone(), *token)).cloned())
            .collect()
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(&sanitize_kind(kind))
    }

    /// Registered kinds that use the match schema, sorted
    pub fn match_kinds(&self) -> Vec<String> {
        self.kinds
            .iter()
            .filter(|(_, entry)| entry.family == TableFamily::Match)
            .map(|(kind, _)| kind.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_ip4_by_first_character() {
        let registry = TableRegistry::default();
        let table = registry.route("ip4", "8.8.8.8").unwrap();
        assert_eq!(table.name(), "ip4_8");
        assert_eq!(table.family(), TableFamily::Address);
        assert_eq!(table.width(), Some(15));
        assert_eq!(table.quoted(), "\"ip4_8\"");
    }

    #[test]
    fn test_route_is_deterministic() {
        let a = TableRegistry::new(["url"]);
        let b = TableRegistry::new(["url"]);
        for _ in 0..3 {
            assert_eq!(
                a.route("url", "https://example.com").unwrap(),
                b.route("url", "https://example.com").unwrap()
            );
        }
    }

    #[test]
    fn test_unsafe_first_character_uses_fallback() {
        let registry = TableRegistry::new(["url", "path"]);
        assert_eq!(registry.route("path", "/etc/passwd").unwrap().name(), "path_other");
        assert_eq!(registry.route("url", ".hidden").unwrap().name(), "url_other");
        assert_eq!(registry.route("url", "ümlaut").unwrap().name(), "url_other");
        assert_eq!(registry.route("url", "_x").unwrap().name(), "url__");
    }

    #[test]
    fn test_uppercase_collapses() {
        let registry = TableRegistry::default();
        assert_eq!(
            registry.route("MD5", "D41D8CD98F00B204E9800998ECF8427E").unwrap().name(),
            "md5_d"
        );
    }

    #[test]
    fn test_kind_sanitization() {
        let registry = TableRegistry::new(["e-mail; DROP TABLE x"]);
        assert!(registry.is_registered("emaildroptablex"));
        assert_eq!(
            registry.route("e-mail; DROP TABLE x", "bob@example.com").unwrap().name(),
            "emaildroptablex_b"
        );
    }

    #[test]
    fn test_routing_errors() {
        let registry = TableRegistry::default();
        assert_eq!(registry.route("md5", ""), Err(RoutingError::EmptyValue));
        assert!(matches!(registry.route("!!", "abc"), Err(RoutingError::EmptyKind(_))));
        assert!(matches!(registry.route("url", "abc"), Err(RoutingError::UnknownKind(_))));
    }

    #[test]
    fn test_match_kind_cannot_shadow_address_family() {
        let mut registry = TableRegistry::default();
        assert!(matches!(
            registry.register_match_kind("IP4"),
            Err(RoutingError::ReservedKind(_))
        ));
        // Hash kinds already use the match schema
        assert_eq!(registry.register_match_kind("md5").unwrap(), "md5");
    }

    #[test]
    fn test_tables_for_covers_every_token() {
        let registry = TableRegistry::default();
        let tables = registry.tables_for("ip4");
        assert_eq!(tables.len(), SHARD_TOKENS.len());
        assert_eq!(tables[0].name(), "ip4_0");
        assert_eq!(tables.last().unwrap().name(), "ip4_other");
    }

    #[test]
    fn test_match_kinds_listing() {
        let registry = TableRegistry::new(["url"]);
        assert_eq!(
            registry.match_kinds(),
            vec!["md5", "sha1", "sha256", "sha512", "url"]
        );
    }
}
