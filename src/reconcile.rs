//! Guild roster reconciliation.
//!
//! One pass converges the local record store toward the remote roster:
//! fetch the roster, snapshot the store, fetch every member's profile,
//! write only records whose normalized fields changed, then delete records
//! for characters that left the guild.
//!
//! A member whose profile cannot be fetched is skipped but still counts as
//! present, so an outage never deletes data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::retry::{retry_transient, RetryError, RetryPolicy};
use crate::roster::{CharacterProfile, FetchError, MemberRef, RosterClient};
use crate::store::{CharacterRecord, RecordStore, StoreError};

/// Default number of profile fetches in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Errors that abort a pass before any store mutation.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The roster itself could not be fetched.
    #[error("failed to fetch guild roster: {0}")]
    Roster(#[source] FetchError),
    /// Existing records could not be loaded.
    #[error("failed to load existing records: {0}")]
    Store(#[source] StoreError),
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Distinct members in the roster.
    pub members: usize,
    /// Records created.
    pub created: usize,
    /// Records rewritten because a field changed.
    pub updated: usize,
    /// Records that already matched.
    pub unchanged: usize,
    /// Stale records removed.
    pub deleted: usize,
    /// Members whose profile could not be fetched.
    pub skipped: usize,
    /// Store writes or deletes that failed.
    pub write_failures: usize,
}

impl PassReport {
    /// Successful store mutations in this pass.
    pub fn writes(&self) -> usize {
        self.created
            .saturating_add(self.updated)
            .saturating_add(self.deleted)
    }
}

impl std::fmt::Display for PassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "members={} created={} updated={} unchanged={} deleted={} skipped={} write_failures={}",
            self.members,
            self.created,
            self.updated,
            self.unchanged,
            self.deleted,
            self.skipped,
            self.write_failures
        )
    }
}

/// Keeps the record store in step with one guild's roster.
pub struct RosterReconciler {
    client: Arc<dyn RosterClient>,
    store: Arc<dyn RecordStore>,
    guild_slug: String,
    realm_slug: String,
    retry: RetryPolicy,
    concurrency: usize,
}

impl std::fmt::Debug for RosterReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterReconciler")
            .field("guild_slug", &self.guild_slug)
            .field("realm_slug", &self.realm_slug)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl RosterReconciler {
    /// Create a reconciler with the default retry policy and concurrency.
    pub fn new(
        client: Arc<dyn RosterClient>,
        store: Arc<dyn RecordStore>,
        guild_slug: impl Into<String>,
        realm_slug: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            guild_slug: guild_slug.into(),
            realm_slug: realm_slug.into(),
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Replace the profile-fetch retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of concurrent profile fetches (minimum one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one reconciliation pass.
    ///
    /// Per-member fetch and write failures are logged and counted in the
    /// report; they never abort the pass.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the roster or the existing records
    /// cannot be loaded. The store is left untouched in that case.
    pub async fn reconcile(&self) -> Result<PassReport, ReconcileError> {
        info!(guild = %self.guild_slug, realm = %self.realm_slug, "starting roster pass");

        let mut members = self
            .client
            .fetch_roster(&self.guild_slug, &self.realm_slug)
            .await
            .map_err(ReconcileError::Roster)?;

        let mut unique = HashSet::new();
        members.retain(|m| unique.insert(m.id));

        let existing: HashMap<String, CharacterRecord> = self
            .store
            .list_all()
            .await
            .map_err(ReconcileError::Store)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut report = PassReport {
            members: members.len(),
            ..PassReport::default()
        };
        let mut seen: HashSet<String> = HashSet::with_capacity(members.len());

        let mut fetches = stream::iter(members.into_iter().map(|m| self.fetch_member(m)))
            .buffer_unordered(self.concurrency);

        while let Some((member, result)) = fetches.next().await {
            seen.insert(member.record_id());

            let profile = match result {
                Ok(profile) => profile,
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(
                        member = %member.name,
                        realm = %member.realm_slug,
                        attempts,
                        error = %last,
                        "no response for profile after retries, skipping member"
                    );
                    report.skipped = report.skipped.saturating_add(1);
                    continue;
                }
                Err(RetryError::Failed { attempt, error }) => {
                    warn!(
                        member = %member.name,
                        realm = %member.realm_slug,
                        attempt,
                        error = %error,
                        "profile fetch failed, skipping member"
                    );
                    report.skipped = report.skipped.saturating_add(1);
                    continue;
                }
            };

            let fresh = CharacterRecord::from_profile(&profile);
            seen.insert(fresh.id.clone());
            self.apply(&fresh, existing.get(&fresh.id), &mut report).await;
        }

        info!(members = report.members, "roster update finished, removing stale records");

        for (id, record) in &existing {
            if seen.contains(id) {
                continue;
            }
            match self.store.delete(id).await {
                Ok(()) => {
                    info!(id = %id, member = %record.name, realm = %record.realm_name, "deleted stale record");
                    report.deleted = report.deleted.saturating_add(1);
                }
                Err(e) => {
                    warn!(id = %id, member = %record.name, error = %e, "failed to delete stale record");
                    report.write_failures = report.write_failures.saturating_add(1);
                }
            }
        }

        info!(
            members = report.members,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            skipped = report.skipped,
            write_failures = report.write_failures,
            "roster pass complete"
        );
        Ok(report)
    }

    /// Fetch one member's profile under the retry policy.
    async fn fetch_member(
        &self,
        member: MemberRef,
    ) -> (MemberRef, Result<CharacterProfile, RetryError<FetchError>>) {
        let result = retry_transient(&self.retry, |attempt| {
            debug!(member = %member.name, realm = %member.realm_slug, attempt, "fetching profile");
            self.client.fetch_profile(&member.realm_slug, &member.name)
        })
        .await;
        (member, result)
    }

    /// Create or update `fresh` if it differs from `stored`.
    async fn apply(
        &self,
        fresh: &CharacterRecord,
        stored: Option<&CharacterRecord>,
        report: &mut PassReport,
    ) {
        let Some(stored) = stored else {
            match self.store.insert(fresh).await {
                Ok(()) => {
                    debug!(id = %fresh.id, member = %fresh.name, "inserted record");
                    report.created = report.created.saturating_add(1);
                }
                Err(e) => {
                    warn!(id = %fresh.id, member = %fresh.name, realm = %fresh.realm_name, error = %e, "failed to insert record");
                    report.write_failures = report.write_failures.saturating_add(1);
                }
            }
            return;
        };

        let Some(change) = fresh.first_difference(stored) else {
            report.unchanged = report.unchanged.saturating_add(1);
            return;
        };

        info!(
            id = %fresh.id,
            member = %stored.name,
            realm = %stored.realm_name,
            field = change.field,
            old = %change.old,
            new = %change.new,
            "field changed"
        );

        match self.store.update(fresh).await {
            Ok(()) => report.updated = report.updated.saturating_add(1),
            Err(e) => {
                warn!(id = %fresh.id, member = %fresh.name, realm = %fresh.realm_name, error = %e, "failed to update record");
                report.write_failures = report.write_failures.saturating_add(1);
            }
        }
    }
}
