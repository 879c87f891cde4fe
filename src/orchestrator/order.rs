//! Admission ordering.
//!
//! With smart scheduling on, small files jump the queue so users see
//! completions early ("quick wins"); within each size class, higher
//! priority first, then older submissions, then smaller files. With it
//! off, ordering is priority-only and otherwise preserves submission
//! order.

use crate::item::TransferItem;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Files below this many bytes count as quick wins.
pub const QUICK_WIN_THRESHOLD: u64 = 1_000_000;

fn quick_win_order(a: &TransferItem, b: &TransferItem) -> Ordering {
    let a_quick = a.total_bytes < QUICK_WIN_THRESHOLD;
    let b_quick = b.total_bytes < QUICK_WIN_THRESHOLD;
    b_quick
        .cmp(&a_quick)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.total_bytes.cmp(&b.total_bytes))
}

/// Remove and return up to `slots` items from `queue` in admission order.
/// The rest stay queued in sorted order.
pub(crate) fn select_next(
    queue: &mut VecDeque<TransferItem>,
    slots: usize,
    smart: bool,
) -> Vec<TransferItem> {
    if slots == 0 || queue.is_empty() {
        return Vec::new();
    }
    let mut items: Vec<TransferItem> = queue.drain(..).collect();
    if smart {
        items.sort_by(quick_win_order);
    } else {
        // Stable: equal priorities keep submission order.
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    let take = slots.min(items.len());
    let rest = items.split_off(take);
    queue.extend(rest);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemId, UploadRequest};

    fn item(id: u64, size: u64, priority: i32) -> TransferItem {
        let mut req = UploadRequest::new(format!("f{}", id), format!("ref://{}", id), size, "dest");
        req.priority = priority;
        TransferItem::from_request(ItemId(id), req)
    }

    fn names(items: &[TransferItem]) -> Vec<&str> {
        items.iter().map(|i| i.file_name.as_str()).collect()
    }

    #[test]
    fn quick_wins_run_before_large_files() {
        let mut queue: VecDeque<_> = vec![
            item(1, 5_000_000, 0),
            item(2, 10, 0),
            item(3, 2_000_000, 0),
        ]
        .into();
        let picked = select_next(&mut queue, 3, true);
        assert_eq!(names(&picked), vec!["f2", "f1", "f3"]);
    }

    #[test]
    fn priority_breaks_ties_within_a_size_class() {
        let mut queue: VecDeque<_> =
            vec![item(1, 100, 0), item(2, 100, 5), item(3, 9_000_000, 9)].into();
        let picked = select_next(&mut queue, 3, true);
        // Both small files beat the large one despite its higher priority.
        assert_eq!(names(&picked), vec!["f2", "f1", "f3"]);
    }

    #[test]
    fn smaller_quick_win_first_on_full_tie() {
        let mut queue: VecDeque<_> = vec![
            item(1, 500_000, 0),
            item(2, 1_000_000, 0),
            item(3, 10, 0),
        ]
        .into();
        let picked = select_next(&mut queue, 1, true);
        assert_eq!(picked[0].file_name, "f3");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn unselected_items_stay_queued() {
        let mut queue: VecDeque<_> = (0..5).map(|i| item(i, 10, 0)).collect();
        let picked = select_next(&mut queue, 2, true);
        assert_eq!(picked.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn plain_mode_is_priority_then_submission_order() {
        let mut queue: VecDeque<_> = vec![
            item(1, 9_000_000, 0),
            item(2, 10, 0),
            item(3, 10, 5),
        ]
        .into();
        let picked = select_next(&mut queue, 3, false);
        // No size preference: f3 by priority, then submission order.
        assert_eq!(names(&picked), vec!["f3", "f1", "f2"]);
    }

    #[test]
    fn zero_slots_selects_nothing() {
        let mut queue: VecDeque<_> = vec![item(1, 10, 0)].into();
        assert!(select_next(&mut queue, 0, true).is_empty());
        assert_eq!(queue.len(), 1);
    }
}
