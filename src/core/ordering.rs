//! Ordering engine
//!
//! Keeps the `order` field of every rule in a scope dense: after any
//! successful operation the values are exactly `0..N` with no gaps and no
//! duplicates. A scope is a group's rule list or the global machine rule
//! list; both implement [`Ordered`].
//!
//! All operations work on a `Vec<T>` and either succeed completely or leave
//! the vector untouched. Duplicate order values are treated as corruption:
//! only a full [`reorder`] repairs them, every other mutation refuses to run
//! on such a scope.

use crate::core::error::{ConflictKind, Error, Result};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// An item with a stable identity and a position inside its scope
pub trait Ordered {
    fn id(&self) -> Uuid;
    fn order(&self) -> u32;
    fn set_order(&mut self, order: u32);
}

/// A violation of the dense-order invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DensityViolation {
    /// Two items share this order value
    Duplicate(u32),
    /// Values are unique but do not form `0..N`
    Gap { expected: u32, found: u32 },
}

/// Converts a scope length or index into an order value.
fn as_order(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Sorts by order; ties keep their current relative position.
pub fn sort_by_order<T: Ordered>(items: &mut [T]) {
    items.sort_by_key(Ordered::order);
}

/// Assigns `0..N` following the current vector positions.
fn renumber<T: Ordered>(items: &mut [T]) {
    for (index, item) in items.iter_mut().enumerate() {
        item.set_order(as_order(index));
    }
}

/// Checks the scope against the dense-order invariant.
///
/// # Errors
///
/// Returns the first [`DensityViolation`] found in ascending order.
pub fn check_dense<T: Ordered>(items: &[T]) -> std::result::Result<(), DensityViolation> {
    let mut orders: Vec<u32> = items.iter().map(Ordered::order).collect();
    orders.sort_unstable();

    if let Some(pair) = orders.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(DensityViolation::Duplicate(pair[0]));
    }
    for (index, &found) in orders.iter().enumerate() {
        let expected = as_order(index);
        if found != expected {
            return Err(DensityViolation::Gap { expected, found });
        }
    }
    Ok(())
}

/// Returns the first order value shared by two items, if any.
pub fn find_duplicate_order<T: Ordered>(items: &[T]) -> Option<u32> {
    match check_dense(items) {
        Err(DensityViolation::Duplicate(order)) => Some(order),
        _ => None,
    }
}

fn refuse_duplicates<T: Ordered>(items: &[T], scope: &str) -> Result<()> {
    match find_duplicate_order(items) {
        Some(order) => Err(Error::conflict(
            ConflictKind::DuplicateOrder,
            format!("{scope} has several rules at order {order}; submit a full reorder to repair it"),
        )),
        None => Ok(()),
    }
}

/// Inserts `item` into the scope and returns its assigned order.
///
/// Without an explicit position the item is appended. With one, items at or
/// after that position shift down by one; positions past the end append.
///
/// # Errors
///
/// Returns `Conflict(DuplicateOrder)` if the scope holds duplicate orders.
pub fn insert<T: Ordered>(items: &mut Vec<T>, mut item: T, at: Option<u32>, scope: &str) -> Result<u32> {
    refuse_duplicates(items, scope)?;
    sort_by_order(items);

    let index = at.map_or(items.len(), |pos| (pos as usize).min(items.len()));
    item.set_order(as_order(index));
    items.insert(index, item);
    renumber(items);

    Ok(as_order(index))
}

/// Removes the item with `id` and closes the gap it leaves.
///
/// # Errors
///
/// Returns `NotFound` if no such item exists, or `Conflict(DuplicateOrder)`
/// if the scope holds duplicate orders.
pub fn remove<T: Ordered>(items: &mut Vec<T>, id: Uuid, kind: &'static str, scope: &str) -> Result<T> {
    let Some(index) = items.iter().position(|item| item.id() == id) else {
        return Err(Error::not_found(kind, id));
    };
    refuse_duplicates(items, scope)?;

    let removed = items.remove(index);
    sort_by_order(items);
    renumber(items);
    Ok(removed)
}

/// Validates that `ids` is exactly a permutation of `expected`.
fn check_permutation(expected: &[Uuid], ids: &[Uuid], scope: &str) -> Result<()> {
    let expected_set: HashSet<Uuid> = expected.iter().copied().collect();
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(ids.len());

    for id in ids {
        if !expected_set.contains(id) {
            return Err(Error::conflict(
                ConflictKind::IncompleteSet,
                format!("rule {id} does not belong to {scope}"),
            ));
        }
        if !seen.insert(*id) {
            return Err(Error::conflict(
                ConflictKind::IncompleteSet,
                format!("rule {id} is listed more than once"),
            ));
        }
    }

    if seen.len() != expected_set.len() {
        return Err(Error::conflict(
            ConflictKind::IncompleteSet,
            format!(
                "reorder lists {} of {} rules in {scope}",
                seen.len(),
                expected_set.len()
            ),
        ));
    }
    Ok(())
}

/// Assigns `order = index in ids` for every item of the scope.
///
/// This is the only operation that accepts a scope with duplicate orders,
/// and it always leaves the scope dense.
///
/// # Errors
///
/// Returns `Conflict(IncompleteSet)` unless `ids` is a permutation of the
/// scope's ids. The scope is unchanged on error.
pub fn reorder<T: Ordered>(items: &mut Vec<T>, ids: &[Uuid], scope: &str) -> Result<()> {
    let current: Vec<Uuid> = items.iter().map(Ordered::id).collect();
    check_permutation(&current, ids, scope)?;

    let position: HashMap<Uuid, u32> = ids
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, as_order(index)))
        .collect();

    for item in items.iter_mut() {
        if let Some(&order) = position.get(&item.id()) {
            item.set_order(order);
        }
    }
    sort_by_order(items);
    Ok(())
}

/// Reorders the subset of items selected by `in_subset`, keeping the slots
/// the subset already occupies.
///
/// Items outside the subset keep their relative position; the subset's
/// members are written into its existing slots in the order given by `ids`.
/// The whole scope is renumbered densely afterwards.
///
/// # Errors
///
/// Returns `Conflict(IncompleteSet)` unless `ids` is a permutation of the
/// subset's ids, or `Conflict(DuplicateOrder)` if the scope holds duplicate
/// orders. The scope is unchanged on error.
pub fn reorder_subset<T, F>(items: &mut Vec<T>, ids: &[Uuid], in_subset: F, scope: &str) -> Result<()>
where
    T: Ordered,
    F: Fn(&T) -> bool,
{
    let members: Vec<Uuid> = items
        .iter()
        .filter(|item| in_subset(item))
        .map(Ordered::id)
        .collect();
    check_permutation(&members, ids, scope)?;
    refuse_duplicates(items, scope)?;

    sort_by_order(items);
    let mask: Vec<bool> = items.iter().map(|item| in_subset(item)).collect();

    let (mut subset, rest): (Vec<T>, Vec<T>) = std::mem::take(items)
        .into_iter()
        .partition(|item| in_subset(item));
    let slot_of: HashMap<Uuid, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    subset.sort_by_key(|item| slot_of.get(&item.id()).copied().unwrap_or(usize::MAX));

    // Subset members fill the slots the subset occupied before.
    let mut subset_iter = subset.into_iter();
    let mut rest_iter = rest.into_iter();
    *items = mask
        .into_iter()
        .filter_map(|was_subset| {
            if was_subset {
                subset_iter.next()
            } else {
                rest_iter.next()
            }
        })
        .collect();
    renumber(items);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: Uuid,
        order: u32,
        tag: char,
    }

    impl Ordered for Item {
        fn id(&self) -> Uuid {
            self.id
        }
        fn order(&self) -> u32 {
            self.order
        }
        fn set_order(&mut self, order: u32) {
            self.order = order;
        }
    }

    fn scope(tags: &str) -> Vec<Item> {
        tags.chars()
            .enumerate()
            .map(|(i, tag)| Item {
                id: Uuid::new_v4(),
                order: as_order(i),
                tag,
            })
            .collect()
    }

    fn tags(items: &[Item]) -> String {
        let mut sorted = items.to_vec();
        sort_by_order(&mut sorted);
        sorted.iter().map(|i| i.tag).collect()
    }

    fn item(tag: char) -> Item {
        Item {
            id: Uuid::new_v4(),
            order: 0,
            tag,
        }
    }

    #[test]
    fn test_insert_appends_by_default() {
        let mut items = scope("ab");
        let order = insert(&mut items, item('c'), None, "group g").unwrap();
        assert_eq!(order, 2);
        assert_eq!(tags(&items), "abc");
        assert!(check_dense(&items).is_ok());
    }

    #[test]
    fn test_insert_at_position_shifts_later_items() {
        let mut items = scope("abc");
        let order = insert(&mut items, item('x'), Some(1), "group g").unwrap();
        assert_eq!(order, 1);
        assert_eq!(tags(&items), "axbc");
        assert!(check_dense(&items).is_ok());
    }

    #[test]
    fn test_insert_past_end_clamps() {
        let mut items = scope("ab");
        assert_eq!(insert(&mut items, item('z'), Some(40), "group g").unwrap(), 2);
        assert_eq!(tags(&items), "abz");
    }

    #[test]
    fn test_remove_compacts() {
        let mut items = scope("abcd");
        let id = items[1].id;
        let removed = remove(&mut items, id, "rule", "group g").unwrap();
        assert_eq!(removed.tag, 'b');
        assert_eq!(tags(&items), "acd");
        assert!(check_dense(&items).is_ok());
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let mut items = scope("ab");
        let before = items.clone();
        let err = remove(&mut items, Uuid::new_v4(), "rule", "group g").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(items, before);
    }

    #[test]
    fn test_reorder_full_permutation() {
        let mut items = scope("abc");
        let ids = vec![items[2].id, items[0].id, items[1].id];
        reorder(&mut items, &ids, "group g").unwrap();
        assert_eq!(tags(&items), "cab");
        assert!(check_dense(&items).is_ok());
    }

    #[test]
    fn test_reorder_rejects_partial_duplicate_and_foreign_lists() {
        let mut items = scope("abc");
        let before = items.clone();

        let partial = vec![items[0].id, items[1].id];
        let repeated = vec![items[0].id, items[0].id, items[1].id];
        let foreign = vec![items[0].id, items[1].id, Uuid::new_v4()];

        for ids in [partial, repeated, foreign] {
            let err = reorder(&mut items, &ids, "group g").unwrap_err();
            assert_eq!(err.conflict_kind(), Some(&ConflictKind::IncompleteSet));
            assert_eq!(items, before);
        }
    }

    #[test]
    fn test_duplicates_block_insert_until_reorder() {
        let mut items = scope("ab");
        items[1].order = 0;
        assert_eq!(find_duplicate_order(&items), Some(0));

        let err = insert(&mut items, item('c'), None, "group g").unwrap_err();
        assert_eq!(err.conflict_kind(), Some(&ConflictKind::DuplicateOrder));

        let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        reorder(&mut items, &ids, "group g").unwrap();
        assert!(check_dense(&items).is_ok());
        insert(&mut items, item('c'), None, "group g").unwrap();
    }

    #[test]
    fn test_check_dense_reports_gap() {
        let mut items = scope("ab");
        items[1].order = 5;
        assert_eq!(
            check_dense(&items),
            Err(DensityViolation::Gap {
                expected: 1,
                found: 5
            })
        );
    }

    #[test]
    fn test_reorder_subset_keeps_other_slots() {
        // Upper-case items form the subset: slots 0, 2 and 3.
        let mut items = scope("AbCDe");
        let ids = vec![items[3].id, items[0].id, items[2].id];
        reorder_subset(&mut items, &ids, |i| i.tag.is_uppercase(), "machine rules").unwrap();
        assert_eq!(tags(&items), "DbACe");
        assert!(check_dense(&items).is_ok());
    }

    #[test]
    fn test_reorder_subset_requires_whole_subset() {
        let mut items = scope("AbC");
        let before = items.clone();
        let ids = vec![items[0].id];
        let err = reorder_subset(&mut items, &ids, |i| i.tag.is_uppercase(), "machine rules")
            .unwrap_err();
        assert_eq!(err.conflict_kind(), Some(&ConflictKind::IncompleteSet));
        assert_eq!(items, before);

        let with_outsider = vec![items[0].id, items[2].id, items[1].id];
        assert!(
            reorder_subset(&mut items, &with_outsider, |i| i.tag.is_uppercase(), "machine rules")
                .is_err()
        );
        assert_eq!(items, before);
    }
}
