//! Diff-aware upsert of normalized drafts, plus the create-only bulk import.

use std::ops::AddAssign;
use std::sync::Arc;

use itlog_core::{TicketDraft, TicketRecord};
use itlog_storage::{StoreError, TicketStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    Updated { changed: Vec<&'static str> },
    Unchanged,
    /// Draft had no usable ticket number.
    Skipped,
}

impl ReconcileOutcome {
    pub fn is_change(&self) -> bool {
        matches!(self, ReconcileOutcome::Inserted | ReconcileOutcome::Updated { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileTally {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileTally {
    /// Records actually written: inserts plus updates.
    pub fn changes(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated { .. } => self.updated += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
            ReconcileOutcome::Skipped => self.skipped += 1,
        }
    }
}

impl AddAssign for ReconcileTally {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn TicketStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    /// Inserts a new ticket or rewrites an existing one whose columns differ.
    /// Identical input performs no write.
    pub async fn reconcile(&self, draft: TicketDraft) -> Result<ReconcileOutcome, StoreError> {
        let Some(record) = draft.into_record() else {
            return Ok(ReconcileOutcome::Skipped);
        };

        if self.store.find(&record.ticket_no).await?.is_none() {
            match self.store.insert(&record).await {
                Ok(()) => return Ok(ReconcileOutcome::Inserted),
                // created by another writer since the lookup
                Err(StoreError::Duplicate(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.update_if_changed(&record).await
    }

    async fn update_if_changed(&self, record: &TicketRecord) -> Result<ReconcileOutcome, StoreError> {
        let Some(existing) = self.store.find(&record.ticket_no).await? else {
            return Err(StoreError::NotFound(record.ticket_no.clone()));
        };
        let changed = existing.fields.diff(&record.fields);
        if changed.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.store.update(record).await?;
        debug!(ticket_no = %record.ticket_no, ?changed, "ticket updated");
        Ok(ReconcileOutcome::Updated { changed })
    }

    /// Sequential fold: each draft's lookup and write finish before the next
    /// draft starts. Store failures are logged and counted, never propagated.
    pub async fn reconcile_all(&self, drafts: impl IntoIterator<Item = TicketDraft>) -> ReconcileTally {
        let mut tally = ReconcileTally::default();
        for draft in drafts {
            let ticket_no = draft.key().map(str::to_string);
            match self.reconcile(draft).await {
                Ok(outcome) => tally.record(&outcome),
                Err(err) => {
                    warn!(ticket_no = ticket_no.as_deref().unwrap_or_default(), error = %err, "failed to persist ticket");
                    tally.failed += 1;
                }
            }
        }
        tally
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub received: usize,
    pub created: usize,
    pub existing: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Find-or-create by `ticket_no`. Existing tickets are never overwritten.
pub async fn import_tickets(store: &dyn TicketStore, records: Vec<JsonValue>) -> ImportReport {
    let mut report = ImportReport {
        received: records.len(),
        ..Default::default()
    };

    for value in records {
        // a struct also deserializes from a positional array
        if !value.is_object() {
            debug!("import entry is not a ticket object");
            report.skipped += 1;
            continue;
        }
        let record = match serde_json::from_value::<TicketDraft>(value) {
            Ok(draft) => draft.into_record(),
            Err(err) => {
                debug!(error = %err, "import entry is not a ticket object");
                None
            }
        };
        let Some(record) = record else {
            report.skipped += 1;
            continue;
        };

        match store.insert_if_absent(&record).await {
            Ok(true) => report.created += 1,
            Ok(false) => report.existing += 1,
            Err(err) => {
                warn!(ticket_no = %record.ticket_no, error = %err, "failed to import ticket");
                report.failed += 1;
            }
        }
    }

    info!(
        received = report.received,
        created = report.created,
        existing = report.existing,
        skipped = report.skipped,
        failed = report.failed,
        "bulk import finished"
    );
    report
}

/// Removes every ticket from the store.
pub async fn clear_all(store: &dyn TicketStore) -> Result<u64, StoreError> {
    let removed = store.clear().await?;
    info!(removed, "ticket store cleared");
    Ok(removed)
}
