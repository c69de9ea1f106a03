//! Indicator kinds, validity predicates and reserved-shard rules

use super::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Kinds of indicator accepted by the ingestion buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Ip4,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 5] = [
        IndicatorKind::Ip4,
        IndicatorKind::Md5,
        IndicatorKind::Sha1,
        IndicatorKind::Sha256,
        IndicatorKind::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Ip4 => "ip4",
            IndicatorKind::Md5 => "md5",
            IndicatorKind::Sha1 => "sha1",
            IndicatorKind::Sha256 => "sha256",
            IndicatorKind::Sha512 => "sha512",
        }
    }

    /// Map a request-layer kind name (case-insensitive) onto a kind
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ip4" | "ipv4" => Ok(IndicatorKind::Ip4),
            "md5" => Ok(IndicatorKind::Md5),
            "sha1" => Ok(IndicatorKind::Sha1),
            "sha256" => Ok(IndicatorKind::Sha256),
            "sha512" => Ok(IndicatorKind::Sha512),
            _ => Err(ValidationError::UnknownKind(name.to_string())),
        }
    }

    /// Maximum stored width of a value of this kind.
    ///
    /// For hashes this is also the exact length the predicate demands.
    pub fn value_width(&self) -> usize {
        match self {
            IndicatorKind::Ip4 => 15,
            IndicatorKind::Md5 => 32,
            IndicatorKind::Sha1 => 40,
            IndicatorKind::Sha256 => 64,
            IndicatorKind::Sha512 => 128,
        }
    }

    /// Kind-specific validity predicate.
    ///
    /// Ip4 accepts any parseable IP literal, IPv6 forms included.
    pub fn is_valid(&self, value: &str) -> bool {
        match self {
            IndicatorKind::Ip4 => value.parse::<IpAddr>().is_ok(),
            _ => value.len() == self.value_width(),
        }
    }

    /// Loopback and unspecified address space never reaches a shard.
    ///
    /// Shard `0` is excluded outright, whatever the literal's form.
    pub fn is_reserved(&self, value: &str) -> bool {
        match self {
            IndicatorKind::Ip4 => {
                let first_octet = value.split('.').next().unwrap_or_default();
                value.starts_with('0') || first_octet == "127"
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validated value of a given kind.
///
/// Only `Indicator::new` (validating) and the store loader construct one,
/// so holding an `Indicator` means the predicate already passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Indicator {
    kind: IndicatorKind,
    value: String,
    id: Option<i64>,
    persisted: bool,
}

impl Indicator {
    pub fn new(kind: IndicatorKind, value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if !kind.is_valid(&value) {
            return Err(ValidationError::InvalidValue {
                kind: kind.as_str(),
                value,
            });
        }
        Ok(Self {
            kind,
            value,
            id: None,
            persisted: false,
        })
    }

    /// Rebuild an indicator read back from its shard table
    pub(crate) fn stored(kind: IndicatorKind, id: i64, value: String) -> Self {
        Self {
            kind,
            value,
            id: Some(id),
            persisted: true,
        }
    }

    pub fn kind(&self) -> IndicatorKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn is_reserved(&self) -> bool {
        self.kind.is_reserved(&self.value)
    }
}
