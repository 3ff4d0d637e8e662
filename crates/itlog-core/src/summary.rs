//! Dashboard aggregation over a ticket collection.
//!
//! [`summarize`] is pure: it sees only the tickets it is handed, so callers can
//! pass the whole store or any pre-filtered subset and get consistent numbers.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::taxonomy::{self, CategoryGroup, StatusClass};
use crate::{Cost, Ticket};

/// Scope of an aggregation. Tickets without a `created_date` are never in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingWindow {
    Year(i32),
    AllTime,
}

impl ReportingWindow {
    pub fn current_year() -> Self {
        ReportingWindow::Year(Utc::now().year())
    }

    pub fn contains(&self, created_date: Option<DateTime<Utc>>) -> bool {
        match (self, created_date) {
            (_, None) => false,
            (ReportingWindow::Year(year), Some(ts)) => ts.year() == *year,
            (ReportingWindow::AllTime, Some(_)) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryShare {
    pub group: CategoryGroup,
    pub count: usize,
    /// Share of the window total, rounded to two decimals.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub window: ReportingWindow,
    pub total: usize,
    pub closed: usize,
    pub active: usize,
    /// Residual `total - closed - active`; absorbs cancelled and fix tickets.
    pub fix: usize,
    pub total_cost: Cost,
    pub monthly_counts: [usize; 12],
    pub monthly_costs: [Cost; 12],
    pub category_distribution: Vec<CategoryShare>,
    /// Raw statuses in the window with no taxonomy entry. They are counted as
    /// active; surfaced so the status table can be extended.
    pub unrecognized_statuses: Vec<String>,
}

fn round_percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 10_000.0).round() / 100.0
}

pub fn summarize<'a>(
    tickets: impl IntoIterator<Item = &'a Ticket>,
    window: ReportingWindow,
) -> DashboardSummary {
    let mut total = 0usize;
    let mut closed = 0usize;
    let mut active = 0usize;
    let mut total_cost = Cost::ZERO;
    let mut monthly_counts = [0usize; 12];
    let mut monthly_costs = [Cost::ZERO; 12];
    let mut group_counts = [0usize; CategoryGroup::ALL.len()];
    let mut unrecognized = BTreeSet::new();

    for ticket in tickets {
        let Some(created) = ticket.fields.created_date else {
            continue;
        };
        if !window.contains(Some(created)) {
            continue;
        }
        total += 1;

        match taxonomy::status_class(&ticket.fields.status) {
            StatusClass::Closed => closed += 1,
            StatusClass::Active => active += 1,
            StatusClass::Cancelled | StatusClass::Fix => {}
        }
        if !taxonomy::is_known_status(&ticket.fields.status) {
            unrecognized.insert(ticket.fields.status.trim().to_string());
        }

        let month = created.month0() as usize;
        monthly_counts[month] += 1;
        monthly_costs[month] += ticket.fields.cost;
        total_cost += ticket.fields.cost;

        let group = taxonomy::group_of_category(&ticket.fields.category);
        if let Some(slot) = CategoryGroup::ALL.iter().position(|g| *g == group) {
            group_counts[slot] += 1;
        }
    }

    let mut category_distribution = CategoryGroup::ALL
        .iter()
        .zip(group_counts)
        .filter(|(_, count)| *count > 0)
        .map(|(group, count)| CategoryShare {
            group: *group,
            count,
            percent: round_percent(count, total),
        })
        .collect::<Vec<_>>();
    // stable sort keeps declaration order for ties
    category_distribution.sort_by(|a, b| b.count.cmp(&a.count));

    DashboardSummary {
        window,
        total,
        closed,
        active,
        fix: total - closed - active,
        total_cost,
        monthly_counts,
        monthly_costs,
        category_distribution,
        unrecognized_statuses: unrecognized.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TicketDraft;
    use chrono::TimeZone;

    fn ticket(no: &str, category: &str, status: &str, cost: &str, created: Option<&str>) -> Ticket {
        let record = TicketDraft {
            ticket_no: Some(no.to_string()),
            category: Some(category.to_string()),
            status: Some(status.to_string()),
            cost: Some(cost.to_string()),
            created_date: created.map(str::to_string),
            ..Default::default()
        }
        .into_record()
        .unwrap();
        let stamp = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        Ticket {
            ticket_no: record.ticket_no,
            fields: record.fields,
            created_at: stamp,
            updated_at: stamp,
        }
    }

    fn sample() -> Vec<Ticket> {
        vec![
            ticket("H1", "Printer", "closed", "150.5", Some("2025-03-10")),
            ticket("R1", "VPN", "เรียบร้อย", "0", Some("2025-03-12")),
            ticket("H2", "Server", "fix", "1200", Some("2025-01-02")),
            ticket("H3", "Laptop", "claim", "80.25", Some("2025-07-20")),
            ticket("C1", "ขอดูย้อนหลัง", "ยกเลิก", "0", Some("2025-07-21")),
            ticket("C2", "CCTV", "รอเจ้าหน้าที่ IT ดำเนินการ", "0", Some("2025-12-31 23:00:00")),
            ticket("M1", "Meeting", "waiting vendor", "10", Some("2025-02-14")),
            ticket("X1", "Fax", "closed", "5", Some("2025-02-15")),
            ticket("OLD", "Printer", "closed", "999", Some("2024-11-01")),
            ticket("NODATE", "Printer", "closed", "999", None),
        ]
    }

    #[test]
    fn helpdesk_and_request_example_from_one_month() {
        let tickets = vec![
            ticket("H1", "Printer", "closed", "150.5", Some("2025-03-10")),
            ticket("R1", "VPN", "เรียบร้อย", "", Some("2025-03-12")),
        ];
        let s = summarize(&tickets, ReportingWindow::Year(2025));
        assert_eq!(s.total, 2);
        assert_eq!(s.closed, 2);
        assert_eq!(s.active, 0);
        assert_eq!(s.fix, 0);
        assert_eq!(s.total_cost, Cost::from_cents(15050));
        assert_eq!(s.monthly_counts[2], 2);
        assert_eq!(s.monthly_costs[2], Cost::from_cents(15050));
        assert_eq!(s.category_distribution.len(), 2);
        assert_eq!(s.category_distribution[0].group, CategoryGroup::Permission);
        assert_eq!(s.category_distribution[0].percent, 50.0);
        assert_eq!(s.category_distribution[1].group, CategoryGroup::Helpdesk);
    }

    #[test]
    fn window_excludes_other_years_and_undated_tickets() {
        let tickets = sample();
        let s = summarize(&tickets, ReportingWindow::Year(2025));
        assert_eq!(s.total, 8);
        let all = summarize(&tickets, ReportingWindow::AllTime);
        assert_eq!(all.total, 9);
        let empty = summarize(&tickets, ReportingWindow::Year(2019));
        assert_eq!(empty.total, 0);
        assert!(empty.category_distribution.is_empty());
        assert_eq!(empty.total_cost, Cost::ZERO);
    }

    #[test]
    fn residual_fix_absorbs_cancelled_and_fix() {
        let s = summarize(&sample(), ReportingWindow::Year(2025));
        assert_eq!(s.closed, 3);
        assert_eq!(s.active, 3);
        assert_eq!(s.fix, 2);
        assert_eq!(s.closed + s.active + s.fix, s.total);
        assert_eq!(s.unrecognized_statuses, vec!["waiting vendor".to_string()]);
    }

    #[test]
    fn monthly_buckets_add_up_to_totals() {
        let s = summarize(&sample(), ReportingWindow::Year(2025));
        assert_eq!(s.monthly_counts.iter().sum::<usize>(), s.total);
        assert_eq!(s.monthly_costs.iter().sum::<Cost>(), s.total_cost);
        assert_eq!(s.total_cost.to_string(), "1445.75");
        assert_eq!(s.monthly_counts[11], 1);
        assert_eq!(s.monthly_counts[1], 2);
    }

    #[test]
    fn distribution_covers_total_and_percentages_normalize() {
        let s = summarize(&sample(), ReportingWindow::Year(2025));
        let count_sum: usize = s.category_distribution.iter().map(|c| c.count).sum();
        assert_eq!(count_sum, s.total);
        let pct_sum: f64 = s.category_distribution.iter().map(|c| c.percent).sum();
        assert!((pct_sum - 100.0).abs() <= 0.1, "percent sum {pct_sum}");

        let groups = s
            .category_distribution
            .iter()
            .map(|c| (c.group, c.count))
            .collect::<Vec<_>>();
        assert_eq!(
            groups,
            vec![
                (CategoryGroup::Cctv, 2),
                (CategoryGroup::Helpdesk, 2),
                (CategoryGroup::ServerDev, 1),
                (CategoryGroup::Service, 1),
                (CategoryGroup::Permission, 1),
                (CategoryGroup::Other, 1),
            ]
        );
        assert_eq!(s.category_distribution[0].percent, 25.0);
        assert_eq!(s.category_distribution[2].percent, 12.5);
    }

    #[test]
    fn thirds_round_to_two_decimals() {
        let tickets = vec![
            ticket("A", "Printer", "closed", "0", Some("2025-01-01")),
            ticket("B", "VPN", "closed", "0", Some("2025-01-01")),
            ticket("C", "CCTV", "closed", "0", Some("2025-01-01")),
        ];
        let s = summarize(&tickets, ReportingWindow::Year(2025));
        assert!(s.category_distribution.iter().all(|c| c.percent == 33.33));
        let pct_sum: f64 = s.category_distribution.iter().map(|c| c.percent).sum();
        assert!((pct_sum - 100.0).abs() <= 0.1);
        let order = s.category_distribution.iter().map(|c| c.group).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![CategoryGroup::Cctv, CategoryGroup::Permission, CategoryGroup::Helpdesk]
        );
    }

    #[test]
    fn subset_and_full_set_use_the_same_rules() {
        let all = sample();
        let subset = all
            .iter()
            .filter(|t| t.ticket_no.starts_with('H'))
            .collect::<Vec<_>>();
        let s = summarize(subset, ReportingWindow::Year(2025));
        assert_eq!(s.total, 3);
        assert_eq!(s.closed + s.active + s.fix, s.total);
        assert_eq!(s.total_cost.to_string(), "1430.75");
    }
}
