//! Static status/category taxonomy and the lookups built on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One row of a taxonomy table: raw upstream text, canonical label, sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxonomyEntry {
    pub raw_key: &'static str,
    pub label: &'static str,
    pub order: u32,
}

const fn entry(raw_key: &'static str, label: &'static str, order: u32) -> TaxonomyEntry {
    TaxonomyEntry {
        raw_key,
        label,
        order,
    }
}

/// Order reported for values missing from a table.
pub const UNKNOWN_ORDER: u32 = 999;

pub static STATUS_TABLE: &[TaxonomyEntry] = &[
    entry("fix", "helpdesk.fix", 1),
    entry("claim", "helpdesk.claim", 2),
    entry("closed", "helpdesk.closed", 3),
    entry("cancel", "helpdesk.cancel", 4),
    entry("เรียบร้อย", "permission.success", 5),
    entry("ยกเลิก", "permission.cancel", 6),
    entry("รอเจ้าหน้าที่ IT ดำเนินการ", "cctv.pending_it", 7),
    entry("เสร็จสิ้น", "cctv.success", 8),
    entry("ดราฟ", "cctv.draft", 9),
];

pub static CATEGORY_TABLE: &[TaxonomyEntry] = &[
    // permission requests
    entry("ลงทะเบียนพนักงานใหม่", "permission.registerUser", 1),
    entry("Admin Social Media", "permission.social", 2),
    entry("Adobe", "permission.adobe", 3),
    entry("Express", "permission.express", 4),
    entry("Email", "permisssion.email", 5),
    entry("LINE", "permission.line", 6),
    entry("Drive Center", "permission.NasDrive", 7),
    entry("Cloud Drive Center (Shared drives)", "permission.Gdrive", 8),
    entry("SSH-KEY", "permission.ssh", 9),
    entry("Super User", "permission.ssh", 9),
    entry("VPN", "permission.vpn", 10),
    entry("Remote Desktop", "permission.remoteDesktop", 11),
    entry("WIFI", "permission.wifi", 12),
    entry("USB Thumdrive", "permission.thumbDrive", 13),
    entry("Vender Support", "permission.vender", 14),
    entry("VOIP", "permission.voip", 15),
    entry("Cyber Payroll", "permission.payroll", 16),
    // helpdesk
    entry("Computer", "helpdesk.computer", 17),
    entry("Computers", "helpdesk.computer", 17),
    entry("Laptops", "helpdesk.laptop", 18),
    entry("Laptop", "helpdesk.laptop", 18),
    entry("Server", "helpdesk.server", 19),
    entry("Monitor", "helpdesk.monitor", 20),
    entry("Projectors", "helpdesk.monitor", 20),
    entry("Printers", "helpdesk.printer", 21),
    entry("Printer", "helpdesk.printer", 21),
    entry("Scaner", "helpdesk.scaner", 22),
    entry("Scanner", "helpdesk.scaner", 22),
    entry("UPS", "helpdesk.ups", 23),
    entry("Telephone", "helpdesk.telephone", 24),
    entry("USB", "helpdesk.usb", 25),
    entry("Software", "helpdesk.software", 26),
    entry("BIC E-Office", "helpdesk.software", 26),
    entry("E-OFFICE", "helpdesk.software", 26),
    entry("Internal Software", "helpdesk.software", 26),
    entry("SAP", "helpdesk.sap", 27),
    entry("Recovery Data", "helpdesk.recoveryData", 28),
    entry("Internet", "helpdesk.internet", 29),
    entry("Network", "helpdesk.network", 30),
    entry("Other", "helpdesk.other", 31),
    // services
    entry("CCTV", "cctv.cctv", 32),
    entry("ขอดูย้อนหลัง", "cctv.playback", 33),
    entry("ขอติดตั้ง", "cctv.install", 34),
    entry("ขอย้ายจุดติดตั้ง", "cctv.move", 35),
    entry("Meeting", "meeting.service", 36),
    entry("Web Site", "dev.website", 37),
];

fn lookup(table: &'static [TaxonomyEntry], raw: &str) -> Option<&'static TaxonomyEntry> {
    let key = raw.trim();
    table.iter().find(|e| e.raw_key == key)
}

pub fn status_label(raw: &str) -> String {
    lookup(STATUS_TABLE, raw)
        .map(|e| e.label.to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

pub fn status_order(raw: &str) -> u32 {
    lookup(STATUS_TABLE, raw).map_or(UNKNOWN_ORDER, |e| e.order)
}

pub fn category_label(raw: &str) -> String {
    lookup(CATEGORY_TABLE, raw)
        .map(|e| e.label.to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

pub fn category_order(raw: &str) -> u32 {
    lookup(CATEGORY_TABLE, raw).map_or(UNKNOWN_ORDER, |e| e.order)
}

pub fn is_known_status(raw: &str) -> bool {
    lookup(STATUS_TABLE, raw).is_some()
}

/// Coarse aggregation bucket derived from a category label's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CategoryGroup {
    #[serde(rename = "Server/Dev")]
    ServerDev,
    Service,
    #[serde(rename = "CCTV")]
    Cctv,
    Permission,
    Helpdesk,
    Other,
}

impl CategoryGroup {
    /// Declaration order; also the tie-break order for distributions.
    pub const ALL: [CategoryGroup; 6] = [
        CategoryGroup::ServerDev,
        CategoryGroup::Service,
        CategoryGroup::Cctv,
        CategoryGroup::Permission,
        CategoryGroup::Helpdesk,
        CategoryGroup::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryGroup::ServerDev => "Server/Dev",
            CategoryGroup::Service => "Service",
            CategoryGroup::Cctv => "CCTV",
            CategoryGroup::Permission => "Permission",
            CategoryGroup::Helpdesk => "Helpdesk",
            CategoryGroup::Other => "Other",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for CategoryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const SERVER_HARDWARE_LABEL: &str = "helpdesk.server";

/// Maps a canonical category label to its group. Rules are checked in order
/// and the first match wins, so `helpdesk.server` lands in Server/Dev.
pub fn category_group(label: &str) -> CategoryGroup {
    let label = label.trim();
    if label == SERVER_HARDWARE_LABEL || label.starts_with("dev.") {
        CategoryGroup::ServerDev
    } else if label.starts_with("meeting.") {
        CategoryGroup::Service
    } else if label.starts_with("cctv.") {
        CategoryGroup::Cctv
    } else if label.starts_with("permission.") || label.starts_with("permisssion.") {
        CategoryGroup::Permission
    } else if label.starts_with("helpdesk.") {
        CategoryGroup::Helpdesk
    } else {
        CategoryGroup::Other
    }
}

/// Group of a raw upstream category string.
pub fn group_of_category(raw: &str) -> CategoryGroup {
    category_group(&category_label(raw))
}

/// How a status counts toward the dashboard totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Closed,
    Cancelled,
    Fix,
    Active,
}

const CLOSED_LABELS: &[&str] = &["helpdesk.closed", "cctv.success", "permission.success"];
const CANCELLED_LABELS: &[&str] = &["helpdesk.cancel", "permission.cancel", "cancelled"];
const FIX_LABEL: &str = "helpdesk.fix";

pub fn status_class(raw: &str) -> StatusClass {
    let label = status_label(raw);
    if CLOSED_LABELS.contains(&label.as_str()) {
        StatusClass::Closed
    } else if CANCELLED_LABELS.contains(&label.as_str()) {
        StatusClass::Cancelled
    } else if label == FIX_LABEL {
        StatusClass::Fix
    } else {
        StatusClass::Active
    }
}
