//! Prepared statement / table inventory (spec §4.9).
//!
//! Every augmented table's column list and algorithm live here once
//! `init`/`commit_alter` populate it, so the per-row capture triggers and
//! the merge engine don't re-run catalog introspection queries on every
//! mutation. Connection-scoped and rebuilt wholesale on `commit_alter`,
//! the same discipline the teacher's `executor_cache.rs` uses for its own
//! statement cache.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::shadow::TableDescriptor;

thread_local! {
    static INVENTORY: RefCell<HashMap<String, TableDescriptor>> = RefCell::new(HashMap::new());
}

pub fn prepare_table(desc: &TableDescriptor) {
    INVENTORY.with(|inv| {
        inv.borrow_mut().insert(desc.name.clone(), desc.clone());
    });
}

pub fn lookup(table: &str) -> Option<TableDescriptor> {
    INVENTORY.with(|inv| inv.borrow().get(table).cloned())
}

pub fn drop_table(table: &str) {
    INVENTORY.with(|inv| {
        inv.borrow_mut().remove(table);
    });
}

pub fn known_tables() -> Vec<String> {
    INVENTORY.with(|inv| inv.borrow().keys().cloned().collect())
}

#[cfg(test)]
pub fn clear() {
    INVENTORY.with(|inv| inv.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Algo;

    fn sample(name: &str) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            algo: Algo::Cls,
            pk_cols: vec!["id".to_string()],
            non_pk_cols: vec!["note".to_string()],
        }
    }

    #[test]
    fn round_trips_through_the_inventory() {
        clear();
        prepare_table(&sample("widgets"));
        assert!(lookup("widgets").is_some());
        drop_table("widgets");
        assert!(lookup("widgets").is_none());
    }
}
