use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::Serialize;

use crate::catalog::{Article, Catalog, RevisionMove};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RevisionResolution {
    pub moved: usize,
    pub dropped: usize,
}

/// Drop course links of every article on the wiki still carrying a deleted page id.
pub fn remove_course_links(
    catalog: &mut Catalog,
    wiki_id: i64,
    deleted_page_ids: &BTreeSet<i64>,
) -> Result<usize> {
    if deleted_page_ids.is_empty() {
        return Ok(0);
    }
    let page_ids = deleted_page_ids.iter().copied().collect::<Vec<_>>();
    let article_ids = catalog
        .articles_with_page_ids(wiki_id, &page_ids)?
        .into_iter()
        .map(|article| article.id)
        .collect::<Vec<_>>();
    catalog.delete_course_links(&article_ids)
}

/// Relocate or discard revisions keyed by a deleted page id.
///
/// `reassigned` maps an old page id to the id the remote now reports for the
/// same title. Revisions follow the live article owning the new id; revisions of a
/// page id that was not reassigned, or whose new id has no local owner, are
/// removed.
pub fn resolve_orphan_revisions(
    catalog: &mut Catalog,
    wiki_id: i64,
    deleted_page_ids: &BTreeSet<i64>,
    reassigned: &BTreeMap<i64, i64>,
) -> Result<RevisionResolution> {
    if deleted_page_ids.is_empty() {
        return Ok(RevisionResolution::default());
    }
    let page_ids = deleted_page_ids.iter().copied().collect::<Vec<_>>();
    let revisions = catalog.revisions_with_page_ids(wiki_id, &page_ids)?;

    let mut owners: BTreeMap<i64, Option<Article>> = BTreeMap::new();
    let mut moves = Vec::new();
    let mut drops = Vec::new();
    for revision in revisions {
        let Some(&new_page_id) = reassigned.get(&revision.mw_page_id) else {
            drops.push(revision.id);
            continue;
        };
        if !owners.contains_key(&new_page_id) {
            let owner = catalog
                .article_by_page_id(wiki_id, new_page_id)?
                .filter(|article| !article.deleted);
            owners.insert(new_page_id, owner);
        }
        match owners.get(&new_page_id).and_then(Option::as_ref) {
            Some(owner) => moves.push(RevisionMove {
                revision_id: revision.id,
                mw_page_id: new_page_id,
                article_id: owner.id,
            }),
            None => drops.push(revision.id),
        }
    }

    Ok(RevisionResolution {
        moved: catalog.move_revisions(&moves)?,
        dropped: catalog.delete_revisions(&drops)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use tempfile::tempdir;

    use super::{remove_course_links, resolve_orphan_revisions};
    use crate::catalog::Catalog;

    #[test]
    fn revisions_follow_reassigned_page_or_are_dropped() {
        let temp = tempdir().expect("tempdir");
        let mut catalog = Catalog::open(&temp.path().join("catalog.db")).expect("open");
        let wiki = catalog
            .insert_wiki("en.wikipedia.org", "https://en.wikipedia.org/w/api.php")
            .expect("wiki");
        let moved_article = catalog.insert_article(wiki, 99, "Merged", 0, false).expect("article");
        let kept = catalog.insert_revision(1, wiki, 20, Some(moved_article)).expect("rev");
        catalog.insert_revision(2, wiki, 30, None).expect("rev");
        let unrelated = catalog.insert_revision(3, wiki, 40, None).expect("rev");

        let deleted = BTreeSet::from([20, 30]);
        let reassigned = BTreeMap::from([(20, 99)]);
        let resolution =
            resolve_orphan_revisions(&mut catalog, wiki, &deleted, &reassigned).expect("resolve");
        assert_eq!(resolution.moved, 1);
        assert_eq!(resolution.dropped, 1);

        let at_new = catalog.revisions_with_page_ids(wiki, &[99]).expect("revisions");
        assert_eq!(at_new.len(), 1);
        assert_eq!(at_new[0].id, kept);
        assert_eq!(at_new[0].article_id, Some(moved_article));
        assert!(catalog.revisions_with_page_ids(wiki, &[30]).expect("revisions").is_empty());
        let untouched = catalog.revisions_with_page_ids(wiki, &[40]).expect("revisions");
        assert_eq!(untouched[0].id, unrelated);
    }

    #[test]
    fn course_links_are_removed_only_for_deleted_page_ids() {
        let temp = tempdir().expect("tempdir");
        let mut catalog = Catalog::open(&temp.path().join("catalog.db")).expect("open");
        let wiki = catalog
            .insert_wiki("en.wikipedia.org", "https://en.wikipedia.org/w/api.php")
            .expect("wiki");
        let course = catalog.insert_course("course", 0, 10).expect("course");
        let gone = catalog.insert_article(wiki, 1, "Gone", 0, true).expect("gone");
        let alive = catalog.insert_article(wiki, 2, "Alive", 0, false).expect("alive");
        catalog.link_article_to_course(gone, course).expect("link");
        catalog.link_article_to_course(alive, course).expect("link");

        let removed =
            remove_course_links(&mut catalog, wiki, &BTreeSet::from([1])).expect("remove");
        assert_eq!(removed, 1);
        assert_eq!(catalog.course_article_ids(course).expect("ids"), vec![alive]);
    }
}
