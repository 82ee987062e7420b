//! Reconciliation of local article records against one remote wiki.
//!
//! A pass runs four steps in a fixed order:
//!
//! 1. look the batch up by page id, in chunks, and derive the synced and
//!    deleted page id sets;
//! 2. copy remote title and namespace onto synced articles;
//! 3. look the possibly deleted articles up by title to catch page ids that
//!    changed without a rename (history merges);
//! 4. flag deletions and undeletions, then clean up course links and
//!    revisions keyed by deleted page ids.
//!
//! Any failed remote call disables deletion for the whole pass: an incomplete
//! answer is never taken as evidence that a page is gone.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Article, ArticleUpdate, Catalog, Wiki};
use crate::cleanup::{remove_course_links, resolve_orphan_revisions};
use crate::remote::{RemoteLookup, RemoteRecord, TitleQuery};

/// Titles stored percent-encoded because they contain characters the catalog
/// could not hold verbatim. They are never overwritten from remote data.
pub const ESCAPED_TITLE_MARKER: char = '%';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub wiki_id: i64,
    pub input_articles: usize,
    pub synced_pages: usize,
    pub deleted_page_ids: usize,
    pub failed_requests: usize,
    pub metadata_updated: usize,
    pub ids_reassigned: usize,
    pub duplicates_superseded: usize,
    pub articles_deleted: usize,
    pub articles_undeleted: usize,
    pub course_links_removed: usize,
    pub revisions_moved: usize,
    pub revisions_dropped: usize,
    pub requests: usize,
}

impl PassReport {
    /// Number of local rows written by the pass.
    pub fn mutations(&self) -> usize {
        self.metadata_updated
            + self.ids_reassigned
            + self.duplicates_superseded
            + self.articles_deleted
            + self.articles_undeleted
            + self.course_links_removed
            + self.revisions_moved
            + self.revisions_dropped
    }

    pub fn deletion_suppressed(&self) -> bool {
        self.failed_requests > 0
    }
}

/// State owned by a single pass; nothing here outlives `update_status`.
struct PassContext<'a> {
    wiki: &'a Wiki,
    articles: &'a [Article],
    synced: Vec<RemoteRecord>,
    synced_ids: BTreeSet<i64>,
    deleted_ids: BTreeSet<i64>,
    failures: usize,
    reassigned: BTreeMap<i64, i64>,
    report: PassReport,
}

impl<'a> PassContext<'a> {
    fn new(wiki: &'a Wiki, articles: &'a [Article]) -> Self {
        Self {
            wiki,
            articles,
            synced: Vec::new(),
            synced_ids: BTreeSet::new(),
            deleted_ids: BTreeSet::new(),
            failures: 0,
            reassigned: BTreeMap::new(),
            report: PassReport {
                wiki_id: wiki.id,
                input_articles: articles.len(),
                ..PassReport::default()
            },
        }
    }

    fn record_failure(&mut self, call: &str, error: &anyhow::Error) {
        self.failures += 1;
        warn!(
            wiki = %self.wiki.domain,
            call,
            error = %format!("{error:#}"),
            "remote lookup failed; deletions disabled for this pass"
        );
    }
}

pub struct Reconciler<'a, L: RemoteLookup + ?Sized> {
    catalog: &'a mut Catalog,
    lookup: &'a mut L,
    chunk_size: usize,
}

impl<'a, L: RemoteLookup + ?Sized> Reconciler<'a, L> {
    pub fn new(catalog: &'a mut Catalog, lookup: &'a mut L, chunk_size: usize) -> Self {
        Self {
            catalog,
            lookup,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run one reconciliation pass for `articles`, all of which belong to `wiki`.
    ///
    /// Remote failures are absorbed into the report; only catalog errors are
    /// returned.
    pub fn update_status(&mut self, wiki: &Wiki, articles: &[Article]) -> Result<PassReport> {
        let mut pass = PassContext::new(wiki, articles);
        if articles.is_empty() {
            return Ok(pass.report);
        }
        let requests_before = self.lookup.request_count();

        self.identify(&mut pass);
        self.update_titles_and_namespaces(&mut pass)?;
        self.resolve_reassigned_ids(&mut pass)?;
        self.apply_deletions(&mut pass)?;

        pass.report.failed_requests = pass.failures;
        pass.report.requests = self.lookup.request_count().saturating_sub(requests_before);
        pass.report.deleted_page_ids = if pass.failures == 0 {
            pass.deleted_ids.len()
        } else {
            0
        };
        if pass.report.mutations() > 0 || pass.report.deletion_suppressed() {
            info!(
                wiki = %wiki.domain,
                articles = pass.report.input_articles,
                synced = pass.report.synced_pages,
                deleted_ids = pass.report.deleted_page_ids,
                failures = pass.report.failed_requests,
                mutations = pass.report.mutations(),
                "reconciliation pass complete"
            );
        } else {
            debug!(wiki = %wiki.domain, articles = articles.len(), "reconciliation pass unchanged");
        }
        Ok(pass.report)
    }

    fn identify(&mut self, pass: &mut PassContext<'_>) {
        let page_ids = pass
            .articles
            .iter()
            .map(|article| article.mw_page_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        for chunk in page_ids.chunks(self.chunk_size) {
            match self.lookup.get_by_page_ids(pass.wiki, chunk) {
                Ok(records) => pass.synced.extend(records),
                Err(error) => pass.record_failure("page ids", &error),
            }
        }

        pass.synced_ids = pass
            .synced
            .iter()
            .map(|record| record.mw_page_id)
            .collect();
        pass.report.synced_pages = pass.synced_ids.len();

        if pass.failures == 0 {
            pass.deleted_ids = page_ids
                .into_iter()
                .filter(|page_id| !pass.synced_ids.contains(page_id))
                .collect();
        }
    }

    fn update_titles_and_namespaces(&mut self, pass: &mut PassContext<'_>) -> Result<()> {
        let mut updates = Vec::new();
        let mut seen = BTreeSet::new();
        for record in &pass.synced {
            let Some(article) = self
                .catalog
                .article_by_page_id(pass.wiki.id, record.mw_page_id)?
            else {
                continue;
            };
            if !seen.insert(article.id) {
                continue;
            }
            if article.title == record.title
                && article.namespace == record.namespace
                && !article.deleted
            {
                continue;
            }
            if article.title.starts_with(ESCAPED_TITLE_MARKER) {
                continue;
            }
            debug!(
                wiki = %pass.wiki.domain,
                page_id = record.mw_page_id,
                from = %article.title,
                to = %record.title,
                "updating title and namespace"
            );
            updates.push(ArticleUpdate {
                title: Some(record.title.clone()),
                namespace: Some(record.namespace),
                deleted: Some(false),
                ..ArticleUpdate::new(article.id)
            });
        }
        pass.report.metadata_updated = self.catalog.apply_article_updates(&updates)?;
        Ok(())
    }

    fn resolve_reassigned_ids(&mut self, pass: &mut PassContext<'_>) -> Result<()> {
        if pass.deleted_ids.is_empty() {
            return Ok(());
        }
        let deleted = pass.deleted_ids.iter().copied().collect::<Vec<_>>();
        let maybe_deleted = self.catalog.articles_with_page_ids(pass.wiki.id, &deleted)?;
        if maybe_deleted.is_empty() {
            return Ok(());
        }

        let mut queries: Vec<TitleQuery> = Vec::with_capacity(maybe_deleted.len());
        for article in &maybe_deleted {
            let query = TitleQuery {
                title: article.title.clone(),
                namespace: article.namespace,
            };
            if !queries.contains(&query) {
                queries.push(query);
            }
        }

        let records = match self.lookup.get_by_titles(pass.wiki, &queries) {
            Ok(records) => records,
            Err(error) => {
                pass.record_failure("titles", &error);
                return Ok(());
            }
        };

        for record in records {
            let Some(article) = self.catalog.live_article_by_title(
                pass.wiki.id,
                &record.title,
                record.namespace,
            )?
            else {
                continue;
            };
            if !pass.deleted_ids.contains(&article.mw_page_id) {
                continue;
            }
            // Case-insensitive matches on the remote side can hand back a
            // different page than the one asked for.
            if article.title != record.title {
                continue;
            }

            let old_page_id = article.mw_page_id;
            if record.mw_page_id == old_page_id {
                // Nothing to reassign. The id stays in the deleted set.
                continue;
            }

            if self.catalog.page_id_taken(pass.wiki.id, record.mw_page_id)? {
                debug!(
                    wiki = %pass.wiki.domain,
                    title = %article.title,
                    old_page_id,
                    new_page_id = record.mw_page_id,
                    "page id already owned locally; retiring stale duplicate"
                );
                self.catalog.apply_article_updates(&[ArticleUpdate {
                    deleted: Some(true),
                    ..ArticleUpdate::new(article.id)
                }])?;
                pass.report.duplicates_superseded += 1;
            } else {
                debug!(
                    wiki = %pass.wiki.domain,
                    title = %article.title,
                    old_page_id,
                    new_page_id = record.mw_page_id,
                    "reassigning page id"
                );
                self.catalog.apply_article_updates(&[ArticleUpdate {
                    mw_page_id: Some(record.mw_page_id),
                    ..ArticleUpdate::new(article.id)
                }])?;
                pass.report.ids_reassigned += 1;
            }
            pass.reassigned.insert(old_page_id, record.mw_page_id);
        }
        Ok(())
    }

    fn apply_deletions(&mut self, pass: &mut PassContext<'_>) -> Result<()> {
        if pass.failures > 0 {
            return Ok(());
        }

        // Re-read the batch: the previous steps may have changed page ids and
        // deleted flags, and the checks below must see the current rows.
        let article_ids = pass
            .articles
            .iter()
            .map(|article| article.id)
            .collect::<Vec<_>>();
        let current = self.catalog.articles_by_ids(&article_ids)?;

        let mut updates = Vec::new();
        for article in &current {
            if pass.deleted_ids.contains(&article.mw_page_id) {
                if !article.deleted {
                    updates.push(ArticleUpdate {
                        deleted: Some(true),
                        ..ArticleUpdate::new(article.id)
                    });
                    pass.report.articles_deleted += 1;
                }
            } else if pass.synced_ids.contains(&article.mw_page_id) && article.deleted {
                updates.push(ArticleUpdate {
                    deleted: Some(false),
                    ..ArticleUpdate::new(article.id)
                });
                pass.report.articles_undeleted += 1;
            }
        }
        self.catalog.apply_article_updates(&updates)?;

        pass.report.course_links_removed =
            remove_course_links(self.catalog, pass.wiki.id, &pass.deleted_ids)?;
        let resolution = resolve_orphan_revisions(
            self.catalog,
            pass.wiki.id,
            &pass.deleted_ids,
            &pass.reassigned,
        )?;
        pass.report.revisions_moved = resolution.moved;
        pass.report.revisions_dropped = resolution.dropped;
        Ok(())
    }
}
