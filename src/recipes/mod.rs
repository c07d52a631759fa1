//! Analysis recipes: one per application. A recipe is configuration, not
//! logic — it picks the query builder via the data domain, the narrative
//! sections, the share denominator, the concentration basis, the census
//! vintages and the supported download formats.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::engine::aggregate::AggregateOptions;
use crate::models::geography::Vintage;
use crate::models::report::{ConcentrationBasis, ShareDenominator};
use crate::models::request::{DataDomain, RecipeKind};

/// Downloadable file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DownloadFormat {
    Excel,
    Pdf,
    Csv,
    Json,
    Zip,
    Pptx,
}

impl DownloadFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "excel" | "xlsx" => Some(DownloadFormat::Excel),
            "pdf" => Some(DownloadFormat::Pdf),
            "csv" => Some(DownloadFormat::Csv),
            "json" => Some(DownloadFormat::Json),
            "zip" => Some(DownloadFormat::Zip),
            "pptx" => Some(DownloadFormat::Pptx),
            _ => None,
        }
    }
}

/// Static recipe configuration.
#[derive(Debug, Clone)]
pub struct RecipeSpec {
    pub kind: RecipeKind,
    /// Data domains this recipe accepts.
    pub allowed_domains: &'static [DataDomain],
    /// Narrative sections requested from the assembler, in order.
    pub narrative_sections: &'static [&'static str],
    pub aggregate: AggregateOptions,
    /// Census vintages fetched for demographic context.
    pub census_vintages: &'static [Vintage],
    /// Download formats this recipe serves.
    pub formats: &'static [DownloadFormat],
    /// Warehouse wall clock override; `None` uses the configured default.
    pub warehouse_timeout_secs: Option<u64>,
}

const ALL_VINTAGES: &[Vintage] = &[
    Vintage::Decennial2010,
    Vintage::Decennial2020,
    Vintage::AcsLatest,
];

const STANDARD_FORMATS: &[DownloadFormat] = &[DownloadFormat::Json, DownloadFormat::Csv];

impl RecipeSpec {
    pub fn for_kind(kind: RecipeKind) -> Self {
        match kind {
            RecipeKind::Mortgage => Self {
                kind,
                allowed_domains: &[DataDomain::Mortgage],
                narrative_sections: &[
                    crate::narrative::SECTION_EXECUTIVE_SUMMARY,
                    crate::narrative::SECTION_KEY_FINDINGS,
                    crate::narrative::SECTION_TRENDS,
                    crate::narrative::SECTION_BANK_STRATEGIES,
                    crate::narrative::SECTION_COMMUNITY_IMPACT,
                ],
                aggregate: AggregateOptions {
                    top_lenders: 10,
                    concentration_basis: ConcentrationBasis::Amounts,
                    denominator: ShareDenominator::TotalForYear,
                },
                census_vintages: ALL_VINTAGES,
                formats: STANDARD_FORMATS,
                warehouse_timeout_secs: None,
            },
            RecipeKind::SmallBusiness => Self {
                kind,
                allowed_domains: &[DataDomain::SmallBusiness],
                narrative_sections: &[
                    crate::narrative::SECTION_EXECUTIVE_SUMMARY,
                    crate::narrative::SECTION_KEY_FINDINGS,
                    crate::narrative::SECTION_TRENDS,
                    crate::narrative::SECTION_COMMUNITY_IMPACT,
                ],
                aggregate: AggregateOptions {
                    top_lenders: 10,
                    concentration_basis: ConcentrationBasis::Amounts,
                    // Loan-size group percents use the three-category sum.
                    denominator: ShareDenominator::LoanSizeCategories,
                },
                census_vintages: ALL_VINTAGES,
                formats: STANDARD_FORMATS,
                warehouse_timeout_secs: None,
            },
            RecipeKind::Branch => Self {
                kind,
                allowed_domains: &[DataDomain::Branch],
                narrative_sections: &[
                    crate::narrative::SECTION_EXECUTIVE_SUMMARY,
                    crate::narrative::SECTION_KEY_FINDINGS,
                    crate::narrative::SECTION_COMMUNITY_IMPACT,
                ],
                aggregate: AggregateOptions {
                    top_lenders: 10,
                    // Branch market shares are deposit-count based.
                    concentration_basis: ConcentrationBasis::Counts,
                    denominator: ShareDenominator::TotalForYear,
                },
                census_vintages: &[Vintage::Decennial2020, Vintage::AcsLatest],
                formats: STANDARD_FORMATS,
                warehouse_timeout_secs: None,
            },
            RecipeKind::BankMerger => Self {
                kind,
                allowed_domains: &[DataDomain::Mortgage, DataDomain::SmallBusiness],
                narrative_sections: &[
                    crate::narrative::SECTION_EXECUTIVE_SUMMARY,
                    crate::narrative::SECTION_KEY_FINDINGS,
                    crate::narrative::SECTION_BANK_STRATEGIES,
                ],
                aggregate: AggregateOptions {
                    top_lenders: 25,
                    concentration_basis: ConcentrationBasis::Amounts,
                    denominator: ShareDenominator::TotalForYear,
                },
                census_vintages: &[Vintage::Decennial2020, Vintage::AcsLatest],
                formats: STANDARD_FORMATS,
                // Merger sweeps cover wide geographies.
                warehouse_timeout_secs: Some(15 * 60),
            },
            RecipeKind::Explorer => Self {
                kind,
                allowed_domains: &[
                    DataDomain::Mortgage,
                    DataDomain::SmallBusiness,
                    DataDomain::Branch,
                ],
                // Interactive exploration renders tables only.
                narrative_sections: &[],
                aggregate: AggregateOptions {
                    top_lenders: 50,
                    concentration_basis: ConcentrationBasis::Amounts,
                    denominator: ShareDenominator::TotalForYear,
                },
                census_vintages: &[Vintage::AcsLatest],
                formats: STANDARD_FORMATS,
                // Interactive sessions expect answers well under the default.
                warehouse_timeout_secs: Some(5 * 60),
            },
            RecipeKind::BranchMap => Self {
                kind,
                allowed_domains: &[DataDomain::Branch],
                narrative_sections: &[],
                aggregate: AggregateOptions {
                    top_lenders: 100,
                    concentration_basis: ConcentrationBasis::Counts,
                    denominator: ShareDenominator::TotalForYear,
                },
                census_vintages: &[Vintage::AcsLatest],
                formats: &[DownloadFormat::Json],
                warehouse_timeout_secs: None,
            },
        }
    }

    pub fn supports_format(&self, format: DownloadFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn allows_domain(&self, domain: DataDomain) -> bool {
        self.allowed_domains.contains(&domain)
    }
}
