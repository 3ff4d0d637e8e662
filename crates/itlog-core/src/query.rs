//! Ticket list filtering shared by listing and aggregation callers.

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};

use crate::taxonomy::{self, CategoryGroup};
use crate::Ticket;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TicketQuery {
    /// Case-insensitive substring over the ticket's text columns.
    #[serde(default, alias = "q")]
    pub search: Option<String>,
    /// Canonical category label.
    #[serde(default)]
    pub category: Option<String>,
    /// Canonical status label.
    #[serde(default)]
    pub status: Option<String>,
    /// Category group name, matched case-insensitively.
    #[serde(default, deserialize_with = "group_name")]
    pub group: Option<CategoryGroup>,
    #[serde(default)]
    pub created_from: Option<NaiveDate>,
    #[serde(default)]
    pub created_to: Option<NaiveDate>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn group_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<CategoryGroup>, D::Error> {
    let Some(name) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if name.trim().is_empty() {
        return Ok(None);
    }
    CategoryGroup::parse(&name)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("unknown category group `{}`", name.trim())))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl TicketQuery {
    pub fn matches(&self, ticket: &Ticket) -> bool {
        let fields = &ticket.fields;

        if let Some(needle) = non_empty(&self.search) {
            let needle = needle.to_lowercase();
            let haystack = [
                ticket.ticket_no.as_str(),
                fields.category.as_str(),
                fields.details.as_str(),
                fields.solution.as_deref().unwrap_or_default(),
                fields.reporter_name.as_str(),
                fields.reporter_dept.as_str(),
                fields.responsible_person.as_str(),
                fields.responsible_dept.as_str(),
                fields.status.as_str(),
            ];
            if !haystack.iter().any(|h| h.to_lowercase().contains(&needle)) {
                return false;
            }
        }

        let category_label = taxonomy::category_label(&fields.category);
        if let Some(category) = non_empty(&self.category) {
            if category_label != category {
                return false;
            }
        }
        if let Some(status) = non_empty(&self.status) {
            if taxonomy::status_label(&fields.status) != status {
                return false;
            }
        }
        if let Some(group) = self.group {
            if taxonomy::category_group(&category_label) != group {
                return false;
            }
        }

        if self.created_from.is_some() || self.created_to.is_some() {
            let Some(created) = fields.created_date.map(|ts| ts.date_naive()) else {
                return false;
            };
            if self.created_from.is_some_and(|from| created < from) {
                return false;
            }
            if self.created_to.is_some_and(|to| created > to) {
                return false;
            }
        }

        true
    }

    /// Matching tickets in input order, truncated to `limit`.
    pub fn apply<'a>(&self, tickets: impl IntoIterator<Item = &'a Ticket>) -> Vec<&'a Ticket> {
        tickets
            .into_iter()
            .filter(|t| self.matches(t))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
