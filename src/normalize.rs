//! Address normalization.
//!
//! `normalize` is a total, idempotent canonicalizer: uppercase, collapsed
//! whitespace, expanded directional and street-type abbreviations, and
//! unit/apartment suffixes split into a separate field. Equality on the
//! normalized street string is what the address-based match strategies rely
//! on, so every reader and the verifier must go through this one function.

use std::sync::OnceLock;

use regex::Regex;

/// A canonicalized address: the street portion plus any unit designator that
/// was stripped from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    pub street: String,
    pub unit: Option<String>,
}

/// Directional abbreviations. Full words map to themselves so expansion is
/// idempotent.
const DIRECTIONALS: &[(&str, &str)] = &[
    ("N", "NORTH"),
    ("S", "SOUTH"),
    ("E", "EAST"),
    ("W", "WEST"),
    ("NE", "NORTHEAST"),
    ("NW", "NORTHWEST"),
    ("SE", "SOUTHEAST"),
    ("SW", "SOUTHWEST"),
];

/// Street-type abbreviations, expanded when they are not the first token
/// ("ST JOHN ROAD" keeps its saint).
const STREET_TYPES: &[(&str, &str)] = &[
    ("ST", "STREET"),
    ("AVE", "AVENUE"),
    ("AV", "AVENUE"),
    ("RD", "ROAD"),
    ("DR", "DRIVE"),
    ("LN", "LANE"),
    ("CT", "COURT"),
    ("PL", "PLACE"),
    ("TER", "TERRACE"),
    ("TERR", "TERRACE"),
    ("CIR", "CIRCLE"),
    ("BLVD", "BOULEVARD"),
    ("PKWY", "PARKWAY"),
    ("PKY", "PARKWAY"),
    ("HWY", "HIGHWAY"),
    ("SQ", "SQUARE"),
    ("TPKE", "TURNPIKE"),
    ("TRL", "TRAIL"),
    ("XING", "CROSSING"),
    ("EXT", "EXTENSION"),
    ("HTS", "HEIGHTS"),
    ("MTN", "MOUNTAIN"),
];

/// Tokens that introduce a unit designator.
const UNIT_MARKERS: &[&str] = &["APT", "APARTMENT", "UNIT", "STE", "SUITE", "FL", "FLOOR", "RM", "ROOM", "BLDG", "BUILDING"];

fn punctuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.,;:'()]").expect("static regex"))
}

fn expand_directional(token: &str) -> Option<&'static str> {
    DIRECTIONALS
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| *full)
}

fn expand_street_type(token: &str) -> Option<&'static str> {
    STREET_TYPES
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| *full)
}

/// Canonicalize a free-text address. Total (never fails) and idempotent:
/// `normalize(&normalize(x).street)` equals `normalize(x)` with no unit.
pub fn normalize(raw: &str) -> NormalizedAddress {
    let upper = raw.to_uppercase();
    let cleaned = punctuation_re().replace_all(&upper, " ");

    let mut street_tokens: Vec<String> = Vec::new();
    let mut unit_tokens: Vec<String> = Vec::new();
    let mut in_unit = false;

    for token in cleaned.split_whitespace() {
        if in_unit {
            unit_tokens.push(token.to_string());
            continue;
        }
        // "#4" and bare "#" both introduce a unit.
        if let Some(rest) = token.strip_prefix('#') {
            in_unit = true;
            if !rest.is_empty() {
                unit_tokens.push(rest.to_string());
            }
            continue;
        }
        if UNIT_MARKERS.contains(&token) {
            in_unit = true;
            continue;
        }
        let expanded = if let Some(full) = expand_directional(token) {
            full.to_string()
        } else if !street_tokens.is_empty() {
            expand_street_type(token)
                .map(|full| full.to_string())
                .unwrap_or_else(|| token.to_string())
        } else {
            token.to_string()
        };
        street_tokens.push(expanded);
    }

    let unit = if unit_tokens.is_empty() {
        None
    } else {
        Some(unit_tokens.join(" "))
    };

    NormalizedAddress {
        street: street_tokens.join(" "),
        unit,
    }
}

/// Convenience for callers that only need the comparable street string.
pub fn normalize_street(raw: &str) -> String {
    normalize(raw).street
}
