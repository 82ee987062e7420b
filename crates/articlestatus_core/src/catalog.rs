use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::migrate::migrate_connection;

// Stays well below SQLite's bound-parameter limit for IN (...) lists.
const SQL_IN_CHUNK: usize = 500;

const ARTICLE_COLUMNS: &str = "id, wiki_id, mw_page_id, title, namespace, deleted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wiki {
    pub id: i64,
    pub domain: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    pub id: i64,
    pub slug: String,
    pub start_unix: i64,
    pub end_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub id: i64,
    pub wiki_id: i64,
    pub mw_page_id: i64,
    pub title: String,
    pub namespace: i32,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub id: i64,
    pub mw_rev_id: i64,
    pub wiki_id: i64,
    pub mw_page_id: i64,
    pub article_id: Option<i64>,
}

/// Field-level patch for one article row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleUpdate {
    pub article_id: i64,
    pub title: Option<String>,
    pub namespace: Option<i32>,
    pub deleted: Option<bool>,
    pub mw_page_id: Option<i64>,
}

impl ArticleUpdate {
    pub fn new(article_id: i64) -> Self {
        Self {
            article_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionMove {
    pub revision_id: i64,
    pub mw_page_id: i64,
    pub article_id: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    pub wikis: usize,
    pub courses: usize,
    pub articles: usize,
    pub deleted_articles: usize,
    pub course_links: usize,
    pub revisions: usize,
}

/// SQLite-backed article catalog. One instance per worker thread.
pub struct Catalog {
    connection: Connection,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `db_path` and apply pending migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        migrate_connection(&connection)?;
        Ok(Self { connection })
    }

    pub fn insert_wiki(&self, domain: &str, api_url: &str) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO wikis (domain, api_url) VALUES (?1, ?2)",
                params![domain, api_url],
            )
            .with_context(|| format!("failed to insert wiki {domain}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn insert_course(&self, slug: &str, start_unix: i64, end_unix: i64) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO courses (slug, start_unix, end_unix) VALUES (?1, ?2, ?3)",
                params![slug, start_unix, end_unix],
            )
            .with_context(|| format!("failed to insert course {slug}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn add_course_wiki(&self, course_id: i64, wiki_id: i64) -> Result<()> {
        self.connection
            .execute(
                "INSERT OR IGNORE INTO courses_wikis (course_id, wiki_id) VALUES (?1, ?2)",
                params![course_id, wiki_id],
            )
            .context("failed to link course to wiki")?;
        Ok(())
    }

    pub fn insert_article(
        &self,
        wiki_id: i64,
        mw_page_id: i64,
        title: &str,
        namespace: i32,
        deleted: bool,
    ) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO articles (wiki_id, mw_page_id, title, namespace, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![wiki_id, mw_page_id, title, namespace, deleted],
            )
            .with_context(|| format!("failed to insert article {title}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn link_article_to_course(&self, article_id: i64, course_id: i64) -> Result<()> {
        self.connection
            .execute(
                "INSERT OR IGNORE INTO articles_courses (article_id, course_id) VALUES (?1, ?2)",
                params![article_id, course_id],
            )
            .context("failed to link article to course")?;
        Ok(())
    }

    pub fn insert_revision(
        &self,
        mw_rev_id: i64,
        wiki_id: i64,
        mw_page_id: i64,
        article_id: Option<i64>,
    ) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO revisions (mw_rev_id, wiki_id, mw_page_id, article_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![mw_rev_id, wiki_id, mw_page_id, article_id],
            )
            .with_context(|| format!("failed to insert revision {mw_rev_id}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn wiki(&self, wiki_id: i64) -> Result<Option<Wiki>> {
        self.connection
            .query_row(
                "SELECT id, domain, api_url FROM wikis WHERE id = ?1",
                [wiki_id],
                wiki_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load wiki {wiki_id}"))
    }

    /// Courses that have started and ended no more than `grace_days` before `now_unix`.
    pub fn current_courses(&self, now_unix: i64, grace_days: u64) -> Result<Vec<Course>> {
        let grace_seconds = i64::try_from(grace_days)
            .ok()
            .and_then(|days| days.checked_mul(86_400))
            .unwrap_or(i64::MAX);
        let cutoff = now_unix.saturating_sub(grace_seconds);
        let mut statement = self
            .connection
            .prepare(
                "SELECT id, slug, start_unix, end_unix
                 FROM courses
                 WHERE start_unix <= ?1 AND end_unix >= ?2
                 ORDER BY id ASC",
            )
            .context("failed to prepare current courses query")?;
        let rows = statement
            .query_map(params![now_unix, cutoff], course_from_row)
            .context("failed to run current courses query")?;
        collect_rows(rows, "course")
    }

    pub fn course_by_slug(&self, slug: &str) -> Result<Option<Course>> {
        self.connection
            .query_row(
                "SELECT id, slug, start_unix, end_unix FROM courses WHERE slug = ?1",
                [slug],
                course_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load course {slug}"))
    }

    pub fn course_wikis(&self, course_id: i64) -> Result<Vec<Wiki>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT DISTINCT w.id, w.domain, w.api_url
                 FROM wikis w
                 JOIN courses_wikis cw ON cw.wiki_id = w.id
                 WHERE cw.course_id = ?1
                 ORDER BY w.id ASC",
            )
            .context("failed to prepare course wikis query")?;
        let rows = statement
            .query_map([course_id], wiki_from_row)
            .context("failed to run course wikis query")?;
        collect_rows(rows, "wiki")
    }

    /// One page of a course's articles on a wiki, keyed by article id (`after_id` exclusive).
    pub fn course_articles_page(
        &self,
        course_id: i64,
        wiki_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Article>> {
        let limit = i64::try_from(limit).context("batch size does not fit into i64")?;
        let mut statement = self
            .connection
            .prepare(
                "SELECT a.id, a.wiki_id, a.mw_page_id, a.title, a.namespace, a.deleted
                 FROM articles a
                 JOIN articles_courses ac ON ac.article_id = a.id
                 WHERE ac.course_id = ?1 AND a.wiki_id = ?2 AND a.id > ?3
                 ORDER BY a.id ASC
                 LIMIT ?4",
            )
            .context("failed to prepare course articles query")?;
        let rows = statement
            .query_map(params![course_id, wiki_id, after_id, limit], article_from_row)
            .context("failed to run course articles query")?;
        collect_rows(rows, "article")
    }

    pub fn article(&self, article_id: i64) -> Result<Option<Article>> {
        self.connection
            .query_row(
                &format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1"),
                [article_id],
                article_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load article {article_id}"))
    }

    pub fn articles_by_ids(&self, article_ids: &[i64]) -> Result<Vec<Article>> {
        let mut out = Vec::with_capacity(article_ids.len());
        for chunk in article_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles WHERE id IN ({}) ORDER BY id ASC",
                placeholders(chunk.len())
            );
            let mut statement = self
                .connection
                .prepare(&sql)
                .context("failed to prepare articles-by-id query")?;
            let rows = statement
                .query_map(params_from_iter(chunk.iter()), article_from_row)
                .context("failed to run articles-by-id query")?;
            out.extend(collect_rows(rows, "article")?);
        }
        Ok(out)
    }

    /// Article carrying `mw_page_id` on the wiki; a live row wins over a deleted one.
    pub fn article_by_page_id(&self, wiki_id: i64, mw_page_id: i64) -> Result<Option<Article>> {
        self.connection
            .query_row(
                &format!(
                    "SELECT {ARTICLE_COLUMNS} FROM articles
                     WHERE wiki_id = ?1 AND mw_page_id = ?2
                     ORDER BY deleted ASC, id ASC
                     LIMIT 1"
                ),
                params![wiki_id, mw_page_id],
                article_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load article for page id {mw_page_id}"))
    }

    /// Non-deleted article by exact (title, namespace) on the wiki.
    pub fn live_article_by_title(
        &self,
        wiki_id: i64,
        title: &str,
        namespace: i32,
    ) -> Result<Option<Article>> {
        self.connection
            .query_row(
                &format!(
                    "SELECT {ARTICLE_COLUMNS} FROM articles
                     WHERE wiki_id = ?1 AND title = ?2 AND namespace = ?3 AND deleted = 0
                     ORDER BY id ASC
                     LIMIT 1"
                ),
                params![wiki_id, title, namespace],
                article_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load article titled {title}"))
    }

    pub fn page_id_taken(&self, wiki_id: i64, mw_page_id: i64) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM articles WHERE wiki_id = ?1 AND mw_page_id = ?2)",
                params![wiki_id, mw_page_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check page id {mw_page_id}"))?;
        Ok(exists == 1)
    }

    /// Every article of the wiki (deleted or not) whose page id is in `page_ids`.
    pub fn articles_with_page_ids(&self, wiki_id: i64, page_ids: &[i64]) -> Result<Vec<Article>> {
        let mut out = Vec::new();
        for chunk in page_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles
                 WHERE wiki_id = ? AND mw_page_id IN ({})
                 ORDER BY id ASC",
                placeholders(chunk.len())
            );
            let mut statement = self
                .connection
                .prepare(&sql)
                .context("failed to prepare articles-by-page-id query")?;
            let rows = statement
                .query_map(
                    params_from_iter(std::iter::once(&wiki_id).chain(chunk.iter())),
                    article_from_row,
                )
                .context("failed to run articles-by-page-id query")?;
            out.extend(collect_rows(rows, "article")?);
        }
        Ok(out)
    }

    /// Apply a batch of field patches in one transaction. Returns rows touched.
    pub fn apply_article_updates(&mut self, updates: &[ArticleUpdate]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let transaction = self
            .connection
            .transaction()
            .context("failed to start article update transaction")?;
        let mut touched = 0usize;
        {
            let mut statement = transaction
                .prepare(
                    "UPDATE articles SET
                        title = COALESCE(?2, title),
                        namespace = COALESCE(?3, namespace),
                        deleted = COALESCE(?4, deleted),
                        mw_page_id = COALESCE(?5, mw_page_id)
                     WHERE id = ?1",
                )
                .context("failed to prepare article update")?;
            for update in updates {
                touched += statement
                    .execute(params![
                        update.article_id,
                        update.title,
                        update.namespace,
                        update.deleted,
                        update.mw_page_id,
                    ])
                    .with_context(|| format!("failed to update article {}", update.article_id))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit article update transaction")?;
        Ok(touched)
    }

    /// Remove course links for the given articles. Returns rows deleted.
    pub fn delete_course_links(&mut self, article_ids: &[i64]) -> Result<usize> {
        if article_ids.is_empty() {
            return Ok(0);
        }
        let transaction = self
            .connection
            .transaction()
            .context("failed to start course link cleanup transaction")?;
        let mut removed = 0usize;
        for chunk in article_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "DELETE FROM articles_courses WHERE article_id IN ({})",
                placeholders(chunk.len())
            );
            removed += transaction
                .execute(&sql, params_from_iter(chunk.iter()))
                .context("failed to delete course links")?;
        }
        transaction
            .commit()
            .context("failed to commit course link cleanup transaction")?;
        Ok(removed)
    }

    pub fn revisions_with_page_ids(&self, wiki_id: i64, page_ids: &[i64]) -> Result<Vec<Revision>> {
        let mut out = Vec::new();
        for chunk in page_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "SELECT id, mw_rev_id, wiki_id, mw_page_id, article_id FROM revisions
                 WHERE wiki_id = ? AND mw_page_id IN ({})
                 ORDER BY id ASC",
                placeholders(chunk.len())
            );
            let mut statement = self
                .connection
                .prepare(&sql)
                .context("failed to prepare revisions-by-page-id query")?;
            let rows = statement
                .query_map(
                    params_from_iter(std::iter::once(&wiki_id).chain(chunk.iter())),
                    revision_from_row,
                )
                .context("failed to run revisions-by-page-id query")?;
            out.extend(collect_rows(rows, "revision")?);
        }
        Ok(out)
    }

    pub fn move_revisions(&mut self, moves: &[RevisionMove]) -> Result<usize> {
        if moves.is_empty() {
            return Ok(0);
        }
        let transaction = self
            .connection
            .transaction()
            .context("failed to start revision move transaction")?;
        let mut moved = 0usize;
        {
            let mut statement = transaction
                .prepare("UPDATE revisions SET mw_page_id = ?2, article_id = ?3 WHERE id = ?1")
                .context("failed to prepare revision move")?;
            for item in moves {
                moved += statement
                    .execute(params![item.revision_id, item.mw_page_id, item.article_id])
                    .with_context(|| format!("failed to move revision {}", item.revision_id))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit revision move transaction")?;
        Ok(moved)
    }

    pub fn delete_revisions(&mut self, revision_ids: &[i64]) -> Result<usize> {
        if revision_ids.is_empty() {
            return Ok(0);
        }
        let transaction = self
            .connection
            .transaction()
            .context("failed to start revision delete transaction")?;
        let mut removed = 0usize;
        for chunk in revision_ids.chunks(SQL_IN_CHUNK) {
            let sql = format!(
                "DELETE FROM revisions WHERE id IN ({})",
                placeholders(chunk.len())
            );
            removed += transaction
                .execute(&sql, params_from_iter(chunk.iter()))
                .context("failed to delete revisions")?;
        }
        transaction
            .commit()
            .context("failed to commit revision delete transaction")?;
        Ok(removed)
    }

    pub fn course_article_ids(&self, course_id: i64) -> Result<Vec<i64>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT article_id FROM articles_courses WHERE course_id = ?1 ORDER BY article_id",
            )
            .context("failed to prepare course article ids query")?;
        let rows = statement
            .query_map([course_id], |row| row.get::<_, i64>(0))
            .context("failed to run course article ids query")?;
        collect_rows(rows, "course link")
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        Ok(CatalogStats {
            wikis: self.count("SELECT COUNT(*) FROM wikis")?,
            courses: self.count("SELECT COUNT(*) FROM courses")?,
            articles: self.count("SELECT COUNT(*) FROM articles")?,
            deleted_articles: self.count("SELECT COUNT(*) FROM articles WHERE deleted = 1")?,
            course_links: self.count("SELECT COUNT(*) FROM articles_courses")?,
            revisions: self.count("SELECT COUNT(*) FROM revisions")?,
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let value: i64 = self
            .connection
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {sql}"))?;
        usize::try_from(value).context("row count does not fit into usize")
    }
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn unix_now() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn collect_rows<T, I>(rows: I, label: &str) -> Result<Vec<T>>
where
    I: Iterator<Item = rusqlite::Result<T>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("failed to decode {label} row"))?);
    }
    Ok(out)
}

fn wiki_from_row(row: &Row<'_>) -> rusqlite::Result<Wiki> {
    Ok(Wiki {
        id: row.get(0)?,
        domain: row.get(1)?,
        api_url: row.get(2)?,
    })
}

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        slug: row.get(1)?,
        start_unix: row.get(2)?,
        end_unix: row.get(3)?,
    })
}

fn article_from_row(row: &Row<'_>) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(0)?,
        wiki_id: row.get(1)?,
        mw_page_id: row.get(2)?,
        title: row.get(3)?,
        namespace: row.get(4)?,
        deleted: row.get(5)?,
    })
}

fn revision_from_row(row: &Row<'_>) -> rusqlite::Result<Revision> {
    Ok(Revision {
        id: row.get(0)?,
        mw_rev_id: row.get(1)?,
        wiki_id: row.get(2)?,
        mw_page_id: row.get(3)?,
        article_id: row.get(4)?,
    })
}
