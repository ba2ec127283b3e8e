//! Bounded top-K selection.
//!
//! Keeps a heap of at most `k` candidates while scanning the input once, so
//! selecting the K most relevant items out of N costs O(N log K) time and
//! O(K) memory regardless of N. Used for "most active pairs" and "most recent
//! conflicts" style reports over live sets.

use std::cmp::Ordering;

/// The `k` greatest items under `cmp`, greatest first
pub fn top_k_by<T, I, F>(items: I, k: usize, mut cmp: F) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T, &T) -> Ordering,
{
    // Heap root is the weakest kept candidate.
    select(items, k, |a, b| cmp(b, a))
}

/// The `k` least items under `cmp`, least first
pub fn bottom_k_by<T, I, F>(items: I, k: usize, cmp: F) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T, &T) -> Ordering,
{
    select(items, k, cmp)
}

pub fn top_k<T: Ord, I: IntoIterator<Item = T>>(items: I, k: usize) -> Vec<T> {
    top_k_by(items, k, T::cmp)
}

pub fn bottom_k<T: Ord, I: IntoIterator<Item = T>>(items: I, k: usize) -> Vec<T> {
    bottom_k_by(items, k, T::cmp)
}

/// Keep the `k` items that sort first under `rank`, returned in that order.
///
/// The heap is a max-heap under `rank`: its root is the kept item that sorts
/// last, and is the one replaced when a better candidate arrives.
fn select<T, I, F>(items: I, k: usize, mut rank: F) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T, &T) -> Ordering,
{
    if k == 0 {
        return Vec::new();
    }

    let mut heap: Vec<T> = Vec::with_capacity(k);
    for item in items {
        if heap.len() < k {
            heap.push(item);
            let last = heap.len() - 1;
            sift_up(&mut heap, last, &mut rank);
        } else if rank(&item, &heap[0]) == Ordering::Less {
            heap[0] = item;
            sift_down(&mut heap, 0, &mut rank);
        }
    }

    heap.sort_by(|a, b| rank(a, b));
    heap
}

fn sift_up<T, F>(heap: &mut [T], mut index: usize, rank: &mut F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    while index > 0 {
        let parent = (index - 1) / 2;
        if rank(&heap[index], &heap[parent]) == Ordering::Greater {
            heap.swap(index, parent);
            index = parent;
        } else {
            break;
        }
    }
}

fn sift_down<T, F>(heap: &mut [T], mut index: usize, rank: &mut F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    let len = heap.len();
    loop {
        let left = 2 * index + 1;
        let right = left + 1;
        let mut largest = index;

        if left < len && rank(&heap[left], &heap[largest]) == Ordering::Greater {
            largest = left;
        }
        if right < len && rank(&heap[right], &heap[largest]) == Ordering::Greater {
            largest = right;
        }
        if largest == index {
            break;
        }
        heap.swap(index, largest);
        index = largest;
    }
}
