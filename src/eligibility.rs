use crate::schema::{CalculationBasis, Client, ObligationCatalog, ObligationDefinition, Periodicity};
use crate::utils::fold_ascii;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Firing months of well-known `OTHER` obligations, matched on whole words of the name.
const KNOWN_OBLIGATION_MONTHS: &[(&[&str], u32)] = &[
    (&["modelo", "10"], 1),
    (&["modelo", "22"], 4),
    (&["ies"], 6),
    (&["imi"], 4),
];

/// How a definition's required tags are compared with a client's fiscal tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatchMode {
    /// Eligible when the client carries at least one of the required tags.
    #[default]
    Any,
    /// Eligible only when the client carries every required tag.
    All,
}

/// Whether the period of `definition` that closes in `year`/`month` is considered at all.
pub fn period_applicable(definition: &ObligationDefinition, _year: i32, month: u32) -> bool {
    if definition.calculation_basis == CalculationBasis::EventDriven {
        return false;
    }

    match definition.periodicity {
        Periodicity::Monthly => true,
        Periodicity::Quarterly => matches!(month, 3 | 6 | 9 | 12),
        Periodicity::Biannual => matches!(month, 6 | 12),
        Periodicity::Annual => month == 12,
        Periodicity::Other => match definition.specific_month_reference {
            Some(reference) => reference == month,
            None => known_obligation_month(&definition.name) == Some(month),
        },
    }
}

/// Closing month hard-coded for known obligation names, if any.
pub fn known_obligation_month(name: &str) -> Option<u32> {
    let folded = fold_ascii(name);
    let words: Vec<&str> = folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    KNOWN_OBLIGATION_MONTHS
        .iter()
        .find(|(pattern, _)| words.windows(pattern.len()).any(|w| w == *pattern))
        .map(|(_, month)| *month)
}

/// A definition is in scope for an organization when it is active and either global
/// or owned by that organization. With no organization, every active definition is.
pub fn definition_in_scope(definition: &ObligationDefinition, organization: Option<Uuid>) -> bool {
    if !definition.is_active {
        return false;
    }

    match (definition.organization, organization) {
        (None, _) | (_, None) => true,
        (Some(owner), Some(requested)) => owner == requested,
    }
}

pub fn client_matches_tags(
    definition: &ObligationDefinition,
    client: &Client,
    mode: TagMatchMode,
) -> bool {
    if definition.applies_to_all_clients() {
        return true;
    }

    let required = &definition.applies_to_client_tags;
    match mode {
        TagMatchMode::Any => !required.is_disjoint(&client.fiscal_tags),
        TagMatchMode::All => required.is_subset(&client.fiscal_tags),
    }
}

/// Active clients of the definition's scope whose tags match it.
///
/// Organization-owned definitions only reach their own clients. Global definitions
/// reach the requested organization's clients, or every client when none is given.
pub fn eligible_clients<'a>(
    catalog: &'a ObligationCatalog,
    definition: &ObligationDefinition,
    organization: Option<Uuid>,
    mode: TagMatchMode,
) -> Vec<&'a Client> {
    let scope = match (definition.organization, organization) {
        (Some(owner), Some(requested)) if owner != requested => return Vec::new(),
        (Some(owner), _) => Some(owner),
        (None, requested) => requested,
    };

    catalog
        .clients
        .iter()
        .filter(|c| c.is_active)
        .filter(|c| scope.map_or(true, |org| c.organization == org))
        .filter(|c| client_matches_tags(definition, c, mode))
        .collect()
}
