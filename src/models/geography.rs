//! Geography identifiers (county codes, census vintages)

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

/// Canonical area key: five-character county code (state FIPS + county FIPS,
/// zero-padded). Metro areas and states expand to sets of these at request
/// ingest time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct CountyCode(String);

impl CountyCode {
    /// Parse a county code, zero-padding to five characters.
    ///
    /// Accepts `5143` or `05143`; rejects non-digit input and codes longer
    /// than five characters.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > 5 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::Validation(format!(
                "invalid county code '{raw}': expected up to 5 digits"
            )));
        }
        Ok(Self(format!("{trimmed:0>5}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character state FIPS prefix.
    pub fn state_fips(&self) -> &str {
        &self.0[..2]
    }
}

impl std::fmt::Display for CountyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Census data edition used for demographic context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum Vintage {
    #[serde(rename = "2010-decennial")]
    Decennial2010,
    #[serde(rename = "2020-decennial")]
    Decennial2020,
    #[serde(rename = "latest-acs-5yr")]
    AcsLatest,
}

impl Vintage {
    /// All vintages in chronological order.
    pub const ALL: [Vintage; 3] = [Vintage::Decennial2010, Vintage::Decennial2020, Vintage::AcsLatest];

    pub fn label(&self) -> &'static str {
        match self {
            Vintage::Decennial2010 => "2010-decennial",
            Vintage::Decennial2020 => "2020-decennial",
            Vintage::AcsLatest => "latest-acs-5yr",
        }
    }
}

impl std::fmt::Display for Vintage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn county_code_zero_pads() {
        let code = CountyCode::parse("5143").unwrap();
        assert_eq!(code.as_str(), "05143");
        assert_eq!(code.state_fips(), "05");
    }

    #[test]
    fn county_code_accepts_canonical_form() {
        let code = CountyCode::parse("06037").unwrap();
        assert_eq!(code.as_str(), "06037");
    }

    #[test]
    fn county_code_rejects_garbage() {
        assert!(CountyCode::parse("").is_err());
        assert!(CountyCode::parse("06037X").is_err());
        assert!(CountyCode::parse("060371").is_err());
    }

    #[test]
    fn county_codes_sort_lexically() {
        let mut codes = vec![
            CountyCode::parse("06073").unwrap(),
            CountyCode::parse("05143").unwrap(),
            CountyCode::parse("06037").unwrap(),
        ];
        codes.sort();
        let sorted: Vec<&str> = codes.iter().map(|c| c.as_str()).collect();
        assert_eq!(sorted, ["05143", "06037", "06073"]);
    }
}
