//! Page reconciliation for `InitializeHost`.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::model::Page;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageDiff {
    pub inserted: Vec<Page>,
    pub updated: Vec<Page>,
    pub deleted: Vec<Uuid>,
}

impl PageDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Computes the writes that make `existing` mirror `declared`, matching pages by id.
pub fn diff_pages(existing: &[Page], declared: &[Page]) -> RelayResult<PageDiff> {
    let mut seen = HashSet::with_capacity(declared.len());
    for page in declared {
        if !seen.insert(page.id) {
            return Err(RelayError::protocol(format!(
                "page {} declared more than once",
                page.id
            )));
        }
    }

    let current: HashMap<Uuid, &Page> = existing.iter().map(|p| (p.id, p)).collect();
    let mut diff = PageDiff::default();
    for page in declared {
        match current.get(&page.id) {
            None => diff.inserted.push(page.clone()),
            Some(stored) if stored.differs_from(page) => diff.updated.push(page.clone()),
            Some(_) => {}
        }
    }
    diff.deleted = existing
        .iter()
        .filter(|p| !seen.contains(&p.id))
        .map(|p| p.id)
        .collect();
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use test_timeout::timeout;

    use super::*;

    fn page(id: Uuid, route: &str) -> Page {
        Page {
            id,
            organization_id: Uuid::nil(),
            environment_id: Uuid::nil(),
            api_key_id: Uuid::nil(),
            name: route.trim_start_matches('/').to_string(),
            route: route.to_string(),
            path: vec![0],
        }
    }

    #[timeout(5)]
    fn identical_declaration_is_a_no_op() {
        let pages = vec![page(Uuid::new_v4(), "/a"), page(Uuid::new_v4(), "/b")];
        assert!(diff_pages(&pages, &pages).unwrap().is_empty());
    }

    #[timeout(5)]
    fn route_change_is_one_update() {
        let id = Uuid::new_v4();
        let existing = vec![page(id, "/a")];
        let mut changed = page(id, "/a");
        changed.route = "/renamed".into();
        let diff = diff_pages(&existing, &[changed.clone()]).unwrap();
        assert_eq!(diff.updated, vec![changed]);
        assert!(diff.inserted.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[timeout(5)]
    fn omitted_page_is_one_delete_and_new_page_is_one_insert() {
        let kept = page(Uuid::new_v4(), "/kept");
        let dropped = page(Uuid::new_v4(), "/dropped");
        let added = page(Uuid::new_v4(), "/added");
        let diff = diff_pages(&[kept.clone(), dropped.clone()], &[kept, added.clone()]).unwrap();
        assert_eq!(diff.deleted, vec![dropped.id]);
        assert_eq!(diff.inserted, vec![added]);
        assert!(diff.updated.is_empty());
    }

    #[timeout(5)]
    fn duplicate_ids_are_rejected() {
        let id = Uuid::new_v4();
        let err = diff_pages(&[], &[page(id, "/a"), page(id, "/b")]).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
