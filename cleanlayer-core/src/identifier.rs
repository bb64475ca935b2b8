//! Security identifier normalization.
//!
//! Canonical form is `<6-digit code>.<EXCHANGE>`, e.g. `000001.SZ`. Sources
//! disagree on spelling (`sz000001`, `SH.600000`, `600000.XSHG`, bare
//! `000001`), so resolution walks fixed rule tables before falling back to an
//! optional security-master lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

pub const CODE_LEN: usize = 6;

/// Listing venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Shanghai,
    Shenzhen,
    Beijing,
}

/// Two-letter venue prefixes and canonical suffixes.
const VENUE_CODES: &[(&str, Exchange)] = &[
    ("SH", Exchange::Shanghai),
    ("SZ", Exchange::Shenzhen),
    ("BJ", Exchange::Beijing),
];

/// ISO 10383 market identifier codes used by some vendors as suffixes.
const MIC_CODES: &[(&str, Exchange)] = &[
    ("XSHG", Exchange::Shanghai),
    ("XSHE", Exchange::Shenzhen),
    ("BJSE", Exchange::Beijing),
];

/// Exchange implied by the first digit of a bare code.
const LEADING_DIGIT_RULES: &[(char, Exchange)] = &[
    ('6', Exchange::Shanghai),
    ('9', Exchange::Shanghai),
    ('0', Exchange::Shenzhen),
    ('2', Exchange::Shenzhen),
    ('3', Exchange::Shenzhen),
    ('4', Exchange::Beijing),
    ('8', Exchange::Beijing),
];

impl Exchange {
    pub fn suffix(self) -> &'static str {
        match self {
            Exchange::Shanghai => "SH",
            Exchange::Shenzhen => "SZ",
            Exchange::Beijing => "BJ",
        }
    }

    /// Case-insensitive two-letter venue code (`sh`, `SZ`, ...).
    pub fn from_venue_code(code: &str) -> Option<Self> {
        VENUE_CODES
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(code))
            .map(|&(_, ex)| ex)
    }

    pub fn from_mic(mic: &str) -> Option<Self> {
        MIC_CODES
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(mic))
            .map(|&(_, ex)| ex)
    }

    /// Infer the venue of a bare 6-digit code.
    pub fn infer_from_code(code: &str) -> Option<Self> {
        let first = code.chars().next()?;
        LEADING_DIGIT_RULES
            .iter()
            .find(|(d, _)| *d == first)
            .map(|&(_, ex)| ex)
    }
}

fn is_code(s: &str) -> bool {
    s.len() == CODE_LEN && s.bytes().all(|b| b.is_ascii_digit())
}

fn join(code: &str, exchange: Exchange) -> String {
    format!("{code}.{}", exchange.suffix())
}

/// Resolve `raw` with the fixed rule tables only.
///
/// Order: canonical or MIC-suffixed form, venue prefix, bare code.
pub fn canonicalize(raw: &str) -> Option<String> {
    let id = raw.trim();

    if let Some((left, right)) = id.split_once('.') {
        if is_code(left) {
            let exchange = Exchange::from_venue_code(right).or_else(|| Exchange::from_mic(right));
            return exchange.map(|ex| join(left, ex));
        }
        if is_code(right) {
            return Exchange::from_venue_code(left).map(|ex| join(right, ex));
        }
        return None;
    }

    if id.len() == CODE_LEN + 2 && id.is_char_boundary(2) {
        let (prefix, code) = id.split_at(2);
        if is_code(code) {
            return Exchange::from_venue_code(prefix).map(|ex| join(code, ex));
        }
    }

    if is_code(id) {
        return Exchange::infer_from_code(id).map(|ex| join(id, ex));
    }

    None
}

/// Read-only lookup from a raw identifier to its canonical code.
///
/// Supplied by the caller at aligner construction and never mutated.
pub trait IdentifierResolver: Send + Sync {
    fn resolve(&self, identifier: &str) -> Option<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityMasterError {
    #[error("security master I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("security master CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct MasterRow {
    identifier: String,
    canonical_code: String,
}

/// In-memory security master loaded once.
#[derive(Debug, Clone, Default)]
pub struct SecurityMaster {
    entries: HashMap<String, String>,
}

impl SecurityMaster {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (normalize_key(&k.into()), v.into()))
            .collect();
        Self { entries }
    }

    /// Load from CSV with headers `identifier,canonical_code`.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, SecurityMasterError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut entries = HashMap::new();
        for row in rdr.deserialize() {
            let row: MasterRow = row?;
            entries.insert(normalize_key(&row.identifier), row.canonical_code.trim().to_string());
        }
        Ok(Self { entries })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, SecurityMasterError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

impl IdentifierResolver for SecurityMaster {
    fn resolve(&self, identifier: &str) -> Option<String> {
        self.entries.get(&normalize_key(identifier)).cloned()
    }
}
