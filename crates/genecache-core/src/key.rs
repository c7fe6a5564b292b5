//! Structured cache keys.
//!
//! # Wire format
//!
//! ```text
//! gene.iobio^{session}^{relationship}^{sample}^{unit}^{variant}^{kind}[^{scheme}]
//! {relationship}^{sample}^{unit}^{variant}^{kind}[^{scheme}]          (portable)
//! ```
//!
//! Coverage keys never carry a scheme. Decoding is soft: anything that does not
//! look like one of our keys yields `None`, because the flat backend shares its
//! key space with unrelated data.

use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, CacheResult};

/// Application tag every full key starts with.
pub const APP_TAG: &str = "gene.iobio";

/// Field delimiter.
pub const KEY_DELIM: char = '^';

const FULL_MIN_TOKENS: usize = 7;
const PORTABLE_MIN_TOKENS: usize = 5;

/// Identifies one cache generation (one application launch), in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed between this session and `now` (negative if in the future).
    pub fn age_at(self, now: SessionId) -> i64 {
        now.0.saturating_sub(self.0)
    }

    /// Human-readable local timestamp, e.g. `2026-10-18 09:41:07`.
    pub fn label(self) -> String {
        match Local.timestamp_millis_opt(self.0).single() {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => self.0.to_string(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(SessionId)
    }
}

/// Category of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataKind {
    #[serde(rename = "vcfData")]
    RawVariants,
    #[serde(rename = "bamData")]
    AlignmentSummary,
    #[serde(rename = "fbData")]
    CalledVariants,
    #[serde(rename = "dangerSummary")]
    DangerSummary,
    #[serde(rename = "geneCoverage")]
    Coverage,
}

impl DataKind {
    pub const ALL: [DataKind; 5] = [
        DataKind::RawVariants,
        DataKind::AlignmentSummary,
        DataKind::CalledVariants,
        DataKind::DangerSummary,
        DataKind::Coverage,
    ];

    pub fn as_tag(self) -> &'static str {
        match self {
            DataKind::RawVariants => "vcfData",
            DataKind::AlignmentSummary => "bamData",
            DataKind::CalledVariants => "fbData",
            DataKind::DangerSummary => "dangerSummary",
            DataKind::Coverage => "geneCoverage",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        DataKind::ALL.into_iter().find(|k| k.as_tag() == tag)
    }

    /// Whether keys of this kind carry an annotation scheme.
    pub fn has_scheme(self) -> bool {
        self != DataKind::Coverage
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for DataKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::from_tag(s).ok_or_else(|| CacheError::Config {
            message: format!("unknown data kind '{s}'"),
        })
    }
}

/// Session-agnostic part of a key, shared by [`CacheKey`] and [`PortableKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyFields {
    pub relationship: String,
    pub sample_id: String,
    pub unit_name: String,
    pub variant_id: String,
    pub data_kind: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

impl KeyFields {
    pub fn new(
        relationship: impl Into<String>,
        sample_id: impl Into<String>,
        unit_name: impl Into<String>,
        variant_id: impl Into<String>,
        data_kind: DataKind,
        scheme: Option<String>,
    ) -> Self {
        // Coverage keys never carry a scheme, even when one is supplied.
        let scheme = if data_kind.has_scheme() { scheme } else { None };
        Self {
            relationship: relationship.into(),
            sample_id: sample_id.into(),
            unit_name: unit_name.into(),
            variant_id: variant_id.into(),
            data_kind,
            scheme,
        }
    }

    fn push_encoded(&self, out: &mut String) -> CacheResult<()> {
        let required: [(&'static str, &str); 4] = [
            ("relationship", &self.relationship),
            ("sample_id", &self.sample_id),
            ("unit_name", &self.unit_name),
            ("variant_id", &self.variant_id),
        ];
        for (i, (name, value)) in required.iter().enumerate() {
            check_token(name, value)?;
            if i > 0 {
                out.push(KEY_DELIM);
            }
            out.push_str(value);
        }
        out.push(KEY_DELIM);
        out.push_str(self.data_kind.as_tag());

        if self.data_kind.has_scheme() {
            let scheme = self
                .scheme
                .as_deref()
                .ok_or_else(|| CacheError::encoding("scheme", "is required for this data kind"))?;
            check_token("scheme", scheme)?;
            out.push(KEY_DELIM);
            out.push_str(scheme);
        }
        Ok(())
    }

    /// Parse the relationship..scheme tail. `tokens` must hold at least 5 entries.
    fn from_tokens(tokens: &[&str]) -> Option<Self> {
        let data_kind = DataKind::from_tag(tokens[4])?;
        let scheme = match tokens.get(5) {
            Some(s) if data_kind.has_scheme() => Some((*s).to_string()),
            _ => None,
        };
        Some(Self {
            relationship: tokens[0].to_string(),
            sample_id: tokens[1].to_string(),
            unit_name: tokens[2].to_string(),
            variant_id: tokens[3].to_string(),
            data_kind,
            scheme,
        })
    }
}

fn check_token(field: &'static str, value: &str) -> CacheResult<()> {
    if value.is_empty() {
        return Err(CacheError::encoding(field, "is missing"));
    }
    if value.contains(KEY_DELIM) {
        return Err(CacheError::encoding(
            field,
            format!("must not contain '{KEY_DELIM}'"),
        ));
    }
    Ok(())
}

/// Split a candidate key, rejecting strings without a delimiter past position 0.
fn split_tokens(raw: &str) -> Option<Vec<&str>> {
    match raw.find(KEY_DELIM) {
        Some(idx) if idx > 0 => Some(raw.split(KEY_DELIM).collect()),
        _ => None,
    }
}

/// Full cache key, bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub fields: KeyFields,
}

impl CacheKey {
    pub fn new(session_id: SessionId, fields: KeyFields) -> Self {
        Self { session_id, fields }
    }

    pub fn encode(&self) -> CacheResult<String> {
        let mut out = String::with_capacity(64);
        out.push_str(APP_TAG);
        out.push(KEY_DELIM);
        out.push_str(&self.session_id.to_string());
        out.push(KEY_DELIM);
        self.fields.push_encoded(&mut out)?;
        Ok(out)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let tokens = split_tokens(raw)?;
        if tokens.len() < FULL_MIN_TOKENS || tokens[0] != APP_TAG {
            return None;
        }
        let session_id = tokens[1].parse::<SessionId>().ok()?;
        let fields = KeyFields::from_tokens(&tokens[2..])?;
        Some(Self { session_id, fields })
    }

    /// Same key in another session.
    pub fn with_session(&self, session_id: SessionId) -> Self {
        Self {
            session_id,
            fields: self.fields.clone(),
        }
    }

    pub fn to_portable(&self) -> PortableKey {
        PortableKey(self.fields.clone())
    }

    pub fn data_kind(&self) -> DataKind {
        self.fields.data_kind
    }

    pub fn unit_name(&self) -> &str {
        &self.fields.unit_name
    }

    pub fn relationship(&self) -> &str {
        &self.fields.relationship
    }
}

/// Session-agnostic key used for export bundles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortableKey(pub KeyFields);

impl PortableKey {
    pub fn encode(&self) -> CacheResult<String> {
        let mut out = String::with_capacity(48);
        self.0.push_encoded(&mut out)?;
        Ok(out)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let tokens = split_tokens(raw)?;
        if tokens.len() < PORTABLE_MIN_TOKENS {
            return None;
        }
        KeyFields::from_tokens(&tokens).map(PortableKey)
    }

    pub fn into_session(self, session_id: SessionId) -> CacheKey {
        CacheKey::new(session_id, self.0)
    }
}

/// Convert a portable key string into a full key string for `session`.
pub fn convert_portable(raw: &str, session: SessionId) -> Option<String> {
    PortableKey::decode(raw)
        .map(|p| p.into_session(session))
        .and_then(|k| k.encode().ok())
}

/// Decode either form, binding portable keys to `session`.
pub fn decode_any(raw: &str, session: SessionId) -> Option<CacheKey> {
    CacheKey::decode(raw).or_else(|| PortableKey::decode(raw).map(|p| p.into_session(session)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vcf_key() -> CacheKey {
        CacheKey::new(
            SessionId(1_700_000_000_000),
            KeyFields::new(
                "proband",
                "NA12878",
                "BRCA1",
                "ENST00000357654",
                DataKind::RawVariants,
                Some("vep".into()),
            ),
        )
    }

    #[test]
    fn encodes_in_fixed_order() {
        assert_eq!(
            vcf_key().encode().unwrap(),
            "gene.iobio^1700000000000^proband^NA12878^BRCA1^ENST00000357654^vcfData^vep"
        );
    }

    #[test]
    fn coverage_drops_scheme() {
        let key = CacheKey::new(
            SessionId(5),
            KeyFields::new("mother", "s1", "TP53", "T1", DataKind::Coverage, Some("vep".into())),
        );
        let encoded = key.encode().unwrap();
        assert_eq!(encoded, "gene.iobio^5^mother^s1^TP53^T1^geneCoverage");
        assert_eq!(CacheKey::decode(&encoded).unwrap().fields.scheme, None);
    }

    #[test]
    fn coverage_scheme_ignored_on_decode() {
        let decoded = CacheKey::decode("gene.iobio^5^mother^s1^TP53^T1^geneCoverage^vep").unwrap();
        assert_eq!(decoded.fields.scheme, None);
    }

    #[test]
    fn missing_field_is_encoding_error() {
        let mut key = vcf_key();
        key.fields.sample_id.clear();
        let err = key.encode().unwrap_err();
        assert!(matches!(err, CacheError::Encoding { field: "sample_id", .. }));

        let mut key = vcf_key();
        key.fields.scheme = None;
        assert!(matches!(
            key.encode(),
            Err(CacheError::Encoding { field: "scheme", .. })
        ));
    }

    #[test]
    fn delimiter_inside_field_is_rejected() {
        let mut key = vcf_key();
        key.fields.unit_name = "BR^CA1".into();
        assert!(matches!(
            key.encode(),
            Err(CacheError::Encoding { field: "unit_name", .. })
        ));
    }

    #[test]
    fn soft_decode_rejects_foreign_strings() {
        for raw in [
            "",
            "gene.iobio",
            "^gene.iobio^1^a^b^c^d^vcfData",
            "theme^dark",
            "other.app^1^proband^s^g^t^vcfData^vep",
            "gene.iobio^1^proband^s^g^t",
            "gene.iobio^notanumber^proband^s^g^t^vcfData^vep",
            "gene.iobio^1^proband^s^g^t^unknownKind^vep",
        ] {
            assert!(CacheKey::decode(raw).is_none(), "{raw:?} should not decode");
        }
    }

    #[test]
    fn portable_roundtrip_and_rebind() {
        let key = vcf_key();
        let portable = key.to_portable().encode().unwrap();
        assert_eq!(portable, "proband^NA12878^BRCA1^ENST00000357654^vcfData^vep");

        let rebound = PortableKey::decode(&portable)
            .unwrap()
            .into_session(SessionId(42));
        assert_eq!(rebound, key.with_session(SessionId(42)));
        assert_eq!(
            convert_portable(&portable, SessionId(42)).unwrap(),
            rebound.encode().unwrap()
        );
    }

    #[test]
    fn decode_any_accepts_both_forms() {
        let key = vcf_key();
        let full = key.encode().unwrap();
        let portable = key.to_portable().encode().unwrap();
        assert_eq!(decode_any(&full, SessionId(9)).unwrap(), key);
        assert_eq!(
            decode_any(&portable, SessionId(9)).unwrap().session_id,
            SessionId(9)
        );
    }

    #[test]
    fn data_kind_tags_roundtrip() {
        for kind in DataKind::ALL {
            assert_eq!(DataKind::from_tag(kind.as_tag()), Some(kind));
        }
        assert!("nope".parse::<DataKind>().is_err());
    }

    fn token() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.:-]{1,12}"
    }

    fn kind() -> impl Strategy<Value = DataKind> {
        prop::sample::select(DataKind::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn full_key_roundtrips(
            session in 0i64..i64::MAX,
            rel in token(), sample in token(), unit in token(), variant in token(),
            kind in kind(), scheme in token(),
        ) {
            let key = CacheKey::new(
                SessionId(session),
                KeyFields::new(rel, sample, unit, variant, kind, Some(scheme)),
            );
            let decoded = CacheKey::decode(&key.encode().unwrap()).unwrap();
            prop_assert_eq!(&decoded, &key);
            if kind == DataKind::Coverage {
                prop_assert!(decoded.fields.scheme.is_none());
            }
        }

        #[test]
        fn decode_never_panics(raw in ".{0,64}") {
            let _ = CacheKey::decode(&raw);
            let _ = PortableKey::decode(&raw);
        }

        #[test]
        fn strings_without_delimiter_never_decode(raw in "[^^]{0,40}") {
            prop_assert!(CacheKey::decode(&raw).is_none());
            prop_assert!(PortableKey::decode(&raw).is_none());
        }
    }
}
