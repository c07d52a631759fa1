//! Narrative assembler: builds per-section prompts from the finalized
//! tables and attaches returned prose to the report.
//!
//! Narratives are attached after all tables are final and never alter
//! data. A failed section degrades to an absent entry plus a warning.

use serde_json::json;

use crate::ai::AiClient;
use crate::models::report::Report;

pub const SECTION_EXECUTIVE_SUMMARY: &str = "executive-summary";
pub const SECTION_KEY_FINDINGS: &str = "key-findings";
pub const SECTION_TRENDS: &str = "trends";
pub const SECTION_BANK_STRATEGIES: &str = "bank-strategies";
pub const SECTION_COMMUNITY_IMPACT: &str = "community-impact";

/// House style guide shared by every prompt.
const STYLE_GUIDE: &str = "Write in the third person, strictly factual, based only on the data \
provided. Do not speculate about institutional strategy or causes. \
For table annotation sections write exactly two paragraphs.";

/// Attach one section's prose to the report. Returns a warning instead of
/// an error when the provider fails; narratives never fail the job.
pub async fn attach_section(
    report: &mut Report,
    section: &str,
    client: &AiClient,
) -> Option<String> {
    let prompt = build_prompt(section, report);
    match client.ask_narrative(&prompt).await {
        Ok(prose) if !prose.trim().is_empty() => {
            report.narratives.insert(section.to_string(), prose);
            None
        }
        Ok(_) => Some(format!("narrative section {section}: empty response")),
        Err(e) => {
            tracing::warn!(section, error = %e, "narrative section failed");
            Some(format!("narrative section {section}: {e}"))
        }
    }
}

/// Build the structured prompt for one section: the section kind, a
/// compact JSON digest of the relevant tables, and the style guide.
pub fn build_prompt(section: &str, report: &Report) -> String {
    let digest = match section {
        SECTION_TRENDS => json!({
            "trends": report.trends,
            "concentration": report.concentration,
        }),
        SECTION_BANK_STRATEGIES => json!({
            "byLender": report.by_lender,
            "byLenderByYear": report.by_lender_by_year,
            "peerComparison": report.peer_comparison,
        }),
        SECTION_COMMUNITY_IMPACT => json!({
            "byDemographic": report.by_demographic,
            "byIncomeNeighborhood": report.by_income_neighborhood,
            "demographicContext": report.demographic_context,
        }),
        // Executive summary and key findings read the whole picture.
        _ => json!({
            "summary": report.summary,
            "byDemographic": report.by_demographic,
            "byLender": report.by_lender,
            "concentration": report.concentration,
            "trends": report.trends,
        }),
    };

    format!(
        "Section: {section}\n\
         Analysis: {domain} lending, {recipe} report, years {years:?}.\n\
         Data:\n{digest}\n\n{STYLE_GUIDE}",
        domain = report.metadata.data_domain,
        recipe = report.metadata.recipe,
        years = report.metadata.filter_set.years,
        digest = digest,
    )
}
