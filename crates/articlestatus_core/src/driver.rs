use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::catalog::{Catalog, Course};
use crate::config::StatusSettings;
use crate::reconcile::{PassReport, Reconciler};
use crate::remote::RemoteLookup;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CourseReport {
    pub course_id: i64,
    pub slug: String,
    pub wikis: usize,
    pub articles: usize,
    pub failed_requests: usize,
    pub mutations: usize,
    pub requests: usize,
    pub passes: Vec<PassReport>,
}

impl CourseReport {
    fn absorb(&mut self, pass: PassReport) {
        self.articles += pass.input_articles;
        self.failed_requests += pass.failed_requests;
        self.mutations += pass.mutations();
        self.passes.push(pass);
    }
}

/// Something that stopped a worker or one of its courses.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub group: usize,
    pub course: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub groups: usize,
    pub courses_scheduled: usize,
    pub courses: Vec<CourseReport>,
    pub failures: Vec<RunFailure>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn articles(&self) -> usize {
        self.courses.iter().map(|course| course.articles).sum()
    }

    pub fn mutations(&self) -> usize {
        self.courses.iter().map(|course| course.mutations).sum()
    }

    pub fn failed_requests(&self) -> usize {
        self.courses.iter().map(|course| course.failed_requests).sum()
    }

    pub fn requests(&self) -> usize {
        self.courses.iter().map(|course| course.requests).sum()
    }
}

#[derive(Debug, Default)]
struct WorkerOutcome {
    courses: Vec<CourseReport>,
    failures: Vec<RunFailure>,
}

/// Split `items` into `min(len, groups)` groups whose sizes differ by at most one.
pub fn partition<T: Clone>(items: &[T], groups: usize) -> Vec<Vec<T>> {
    let count = groups.max(1).min(items.len());
    if count == 0 {
        return Vec::new();
    }
    let base = items.len() / count;
    let larger = items.len() % count;
    let mut out = Vec::with_capacity(count);
    let mut rest = items;
    for index in 0..count {
        let size = if index < larger { base + 1 } else { base };
        let (group, tail) = rest.split_at(size);
        out.push(group.to_vec());
        rest = tail;
    }
    out
}

/// Reconcile every article of `course`, one wiki at a time, in id-ordered
/// batches of `settings.course_batch_size`.
pub fn update_course<L: RemoteLookup + ?Sized>(
    catalog: &mut Catalog,
    lookup: &mut L,
    course: &Course,
    settings: &StatusSettings,
) -> Result<CourseReport> {
    let wikis = catalog.course_wikis(course.id)?;
    let requests_before = lookup.request_count();
    let mut report = CourseReport {
        course_id: course.id,
        slug: course.slug.clone(),
        wikis: wikis.len(),
        ..CourseReport::default()
    };

    for wiki in &wikis {
        let mut after_id = 0;
        loop {
            let batch = catalog.course_articles_page(
                course.id,
                wiki.id,
                after_id,
                settings.course_batch_size,
            )?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;
            debug!(
                course = %course.slug,
                wiki = %wiki.domain,
                articles = batch.len(),
                "reconciling batch"
            );
            let pass = Reconciler::new(catalog, lookup, settings.chunk_size)
                .update_status(wiki, &batch)
                .with_context(|| {
                    format!("failed to reconcile {} on {}", course.slug, wiki.domain)
                })?;
            report.absorb(pass);
            if batch.len() < settings.course_batch_size {
                break;
            }
        }
    }

    report.requests = lookup.request_count().saturating_sub(requests_before);
    Ok(report)
}

/// Reconcile all current courses, one worker thread per course group.
///
/// Each worker opens its own catalog connection and builds its own lookup
/// from `lookup_factory`. Failures of one course or one worker are recorded
/// in the report and do not stop the others.
pub fn update_all<L, F>(
    db_path: &Path,
    settings: &StatusSettings,
    now_unix: i64,
    lookup_factory: F,
) -> Result<RunReport>
where
    L: RemoteLookup,
    F: Fn() -> Result<L> + Sync,
{
    let started = Instant::now();
    let courses = Catalog::open(db_path)?.current_courses(now_unix, settings.update_grace_days)?;
    let groups = partition(&courses, settings.concurrency);
    info!(
        courses = courses.len(),
        groups = groups.len(),
        "starting article status update"
    );

    let factory = &lookup_factory;
    let outcomes: Vec<WorkerOutcome> = thread::scope(|scope| {
        let mut joins = Vec::with_capacity(groups.len());
        for (index, group) in groups.iter().enumerate() {
            joins.push(scope.spawn(move || run_worker(db_path, index, group, settings, factory)));
        }

        joins
            .into_iter()
            .enumerate()
            .map(|(index, join)| {
                join.join().unwrap_or_else(|_| WorkerOutcome {
                    courses: Vec::new(),
                    failures: vec![RunFailure {
                        group: index,
                        course: None,
                        error: "worker thread panicked".to_string(),
                    }],
                })
            })
            .collect()
    });

    let mut report = RunReport {
        groups: groups.len(),
        courses_scheduled: courses.len(),
        ..RunReport::default()
    };
    for outcome in outcomes {
        report.courses.extend(outcome.courses);
        report.failures.extend(outcome.failures);
    }
    report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        courses = report.courses.len(),
        articles = report.articles(),
        mutations = report.mutations(),
        failed_requests = report.failed_requests(),
        failures = report.failures.len(),
        duration_ms = report.duration_ms,
        "article status update finished"
    );
    Ok(report)
}

fn run_worker<L, F>(
    db_path: &Path,
    group: usize,
    courses: &[Course],
    settings: &StatusSettings,
    lookup_factory: &F,
) -> WorkerOutcome
where
    L: RemoteLookup,
    F: Fn() -> Result<L>,
{
    let mut outcome = WorkerOutcome::default();
    let setup = Catalog::open(db_path).and_then(|catalog| Ok((catalog, lookup_factory()?)));
    let (mut catalog, mut lookup) = match setup {
        Ok(pair) => pair,
        Err(err) => {
            error!(group, error = %format!("{err:#}"), "worker failed to start");
            outcome.failures.push(RunFailure {
                group,
                course: None,
                error: format!("{err:#}"),
            });
            return outcome;
        }
    };

    for course in courses {
        match update_course(&mut catalog, &mut lookup, course, settings) {
            Ok(report) => outcome.courses.push(report),
            Err(err) => {
                error!(
                    group,
                    course = %course.slug,
                    error = %format!("{err:#}"),
                    "course update failed"
                );
                outcome.failures.push(RunFailure {
                    group,
                    course: Some(course.slug.clone()),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::bail;
    use tempfile::tempdir;

    use super::{partition, update_all, update_course};
    use crate::catalog::{Catalog, Wiki};
    use crate::config::StatusSettings;
    use crate::remote::{RemoteLookup, RemoteRecord, TitleQuery};

    /// Every requested page exists with title "Page <id>".
    #[derive(Default)]
    struct EchoLookup {
        id_batches: Vec<usize>,
        title_calls: usize,
    }

    impl RemoteLookup for EchoLookup {
        fn get_by_page_ids(
            &mut self,
            _wiki: &Wiki,
            page_ids: &[i64],
        ) -> anyhow::Result<Vec<RemoteRecord>> {
            self.id_batches.push(page_ids.len());
            Ok(page_ids
                .iter()
                .map(|page_id| RemoteRecord {
                    mw_page_id: *page_id,
                    title: format!("Page {page_id}"),
                    namespace: 0,
                })
                .collect())
        }

        fn get_by_titles(
            &mut self,
            _wiki: &Wiki,
            _queries: &[TitleQuery],
        ) -> anyhow::Result<Vec<RemoteRecord>> {
            self.title_calls += 1;
            Ok(Vec::new())
        }

        fn request_count(&self) -> usize {
            self.id_batches.len() + self.title_calls
        }
    }

    struct PanickingLookup;

    impl RemoteLookup for PanickingLookup {
        fn get_by_page_ids(
            &mut self,
            _wiki: &Wiki,
            _page_ids: &[i64],
        ) -> anyhow::Result<Vec<RemoteRecord>> {
            panic!("lookup exploded");
        }

        fn get_by_titles(
            &mut self,
            _wiki: &Wiki,
            _queries: &[TitleQuery],
        ) -> anyhow::Result<Vec<RemoteRecord>> {
            panic!("lookup exploded");
        }

        fn request_count(&self) -> usize {
            0
        }
    }

    fn seed_course(catalog: &Catalog, slug: &str, wiki: i64, pages: std::ops::RangeInclusive<i64>) {
        let course = catalog.insert_course(slug, 0, 2_000_000_000).expect("course");
        catalog.add_course_wiki(course, wiki).expect("course wiki");
        for page_id in pages {
            let article = catalog
                .insert_article(wiki, page_id, &format!("Page {page_id}"), 0, false)
                .expect("article");
            catalog.link_article_to_course(article, course).expect("link");
        }
    }

    fn seeded_db(path: &Path, courses: usize) {
        let catalog = Catalog::open(path).expect("open");
        let wiki = catalog
            .insert_wiki("en.wikipedia.org", "https://en.wikipedia.org/w/api.php")
            .expect("wiki");
        for index in 0..courses {
            let first = i64::try_from(index).expect("index") * 10 + 1;
            seed_course(&catalog, &format!("course-{index}"), wiki, first..=first + 4);
        }
    }

    #[test]
    fn partition_fills_every_group_evenly() {
        let items = (1..=10).collect::<Vec<_>>();
        let groups = partition(&items, 4);
        let sizes = groups.iter().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_eq!(groups.concat(), items);

        let five = partition(&[1, 2, 3, 4, 5], 4);
        assert_eq!(five.len(), 4);
        assert_eq!(five.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1, 1, 1]);
    }

    #[test]
    fn partition_omits_empty_groups() {
        assert_eq!(partition(&[1, 2], 4), vec![vec![1], vec![2]]);
        assert!(partition::<i32>(&[], 4).is_empty());
        assert_eq!(partition(&[1, 2, 3], 0), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn update_course_pages_articles_by_batch_size() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("catalog.db");
        seeded_db(&db_path, 1);
        let mut catalog = Catalog::open(&db_path).expect("open");
        let course = catalog
            .course_by_slug("course-0")
            .expect("lookup")
            .expect("course");
        let settings = StatusSettings {
            course_batch_size: 2,
            ..StatusSettings::default()
        };
        let mut lookup = EchoLookup::default();

        let report = update_course(&mut catalog, &mut lookup, &course, &settings).expect("update");

        assert_eq!(report.passes.len(), 3);
        assert_eq!(lookup.id_batches, vec![2, 2, 1]);
        assert_eq!(report.articles, 5);
        assert_eq!(report.mutations, 0);
        assert_eq!(report.requests, 3);
        assert_eq!(report.wikis, 1);
    }

    #[test]
    fn update_all_runs_every_current_course() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("catalog.db");
        seeded_db(&db_path, 5);
        let settings = StatusSettings {
            concurrency: 4,
            ..StatusSettings::default()
        };

        let report = update_all(&db_path, &settings, 1_000_000_000, || {
            Ok(EchoLookup::default())
        })
        .expect("update_all");

        assert_eq!(report.groups, 4);
        assert_eq!(report.courses_scheduled, 5);
        assert_eq!(report.courses.len(), 5);
        assert!(report.failures.is_empty());
        assert_eq!(report.articles(), 25);
        assert_eq!(report.mutations(), 0);
    }

    #[test]
    fn lookup_factory_failure_is_recorded_per_worker() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("catalog.db");
        seeded_db(&db_path, 2);

        let report = update_all(
            &db_path,
            &StatusSettings::default(),
            1_000_000_000,
            || -> anyhow::Result<EchoLookup> { bail!("no credentials") },
        )
        .expect("update_all");

        assert!(report.courses.is_empty());
        assert_eq!(report.groups, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|failure| failure.course.is_none()));
        assert!(report.failures[0].error.contains("no credentials"));
    }

    #[test]
    fn panicking_worker_does_not_abort_the_run() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("catalog.db");
        seeded_db(&db_path, 1);

        let report = update_all(&db_path, &StatusSettings::default(), 1_000_000_000, || {
            Ok(PanickingLookup)
        })
        .expect("update_all");

        assert!(report.courses.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error, "worker thread panicked");
    }
}
