//! Sparse order keys of ordered link views
//!
//! Members of an ordered view carry an `i32` order key. Keys are spread
//! with gaps so most list operations write a single key:
//!
//! - appending (or prepending) leaves [`ORDER_APPEND_GAP`]
//! - inserting between two members leaves [`ORDER_INSERT_GAP`]
//! - when two neighbours have no room left, the smallest window around the
//!   insertion point that does have room is renumbered
//!
//! Both planners are pure functions over the current keys; the view turns
//! their output into attribute writes.

use chronicle_core::{Error, Result};

/// Gap reserved after the last (or before the first) member
pub const ORDER_APPEND_GAP: i64 = 1024;

/// Gap reserved when inserting between two members
pub const ORDER_INSERT_GAP: i64 = 32;

const LOWER_BOUND: i64 = i32::MIN as i64 - 1;
const UPPER_BOUND: i64 = i32::MAX as i64 + 1;

/// Order keys for one insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    /// Key of the inserted member
    pub order: i32,
    /// Existing members (by position) that need a new key
    pub renumber: Vec<(usize, i32)>,
}

/// Spread `slots` keys strictly between `lower` and `upper`, or `None` if
/// they do not fit
fn spread(lower: i64, upper: i64, slots: usize) -> Option<Vec<i64>> {
    if slots == 0 {
        return Some(Vec::new());
    }
    let n = slots as i64;
    let room = (upper - lower) / (n + 1);
    if room < 1 {
        return None;
    }
    let open_low = lower == LOWER_BOUND;
    let open_high = upper == UPPER_BOUND;
    let gap = if open_low || open_high {
        ORDER_APPEND_GAP
    } else {
        ORDER_INSERT_GAP
    };
    let step = gap.min(room);
    let values = match (open_low, open_high) {
        (true, true) => {
            // An empty neighbourhood starts at zero whenever the keys fit.
            let first = if step * (n - 1) <= i64::from(i32::MAX) {
                0
            } else {
                lower + step
            };
            (0..n).map(|k| first + step * k).collect()
        }
        (true, false) => (0..n).map(|k| upper - step * (n - k)).collect(),
        _ => (1..=n).map(|k| lower + step * k).collect(),
    };
    Some(values)
}

/// Plan inserting a member at `index` of a view whose members have keys
/// `orders` (ascending)
///
/// # Errors
///
/// Returns `InvalidOperation` when `index` is out of range or the whole key
/// space is exhausted.
pub fn plan_insert(orders: &[i32], index: usize) -> Result<InsertPlan> {
    let len = orders.len();
    if index > len {
        return Err(Error::invalid_operation(format!(
            "insert position {} out of range for {} members",
            index, len
        )));
    }
    let (mut lo, mut hi) = (index, index);
    let mut grow_right = true;
    loop {
        let lower = if lo == 0 {
            LOWER_BOUND
        } else {
            i64::from(orders[lo - 1])
        };
        let upper = if hi == len {
            UPPER_BOUND
        } else {
            i64::from(orders[hi])
        };
        if let Some(values) = spread(lower, upper, hi - lo + 1) {
            let order = values[index - lo] as i32;
            let renumber = (lo..hi)
                .filter_map(|i| {
                    let slot = if i < index { i - lo } else { i - lo + 1 };
                    let value = values[slot] as i32;
                    (value != orders[i]).then_some((i, value))
                })
                .collect();
            return Ok(InsertPlan { order, renumber });
        }
        match (hi < len, lo > 0) {
            (false, false) => {
                return Err(Error::invalid_operation("order key space exhausted"));
            }
            (true, false) => hi += 1,
            (false, true) => lo -= 1,
            (true, true) => {
                if grow_right {
                    hi += 1;
                } else {
                    lo -= 1;
                }
                grow_right = !grow_right;
            }
        }
    }
}

/// Plan keys for replacing a view's content by a new sequence
///
/// `current[i]` is the present key of the i-th member of the new sequence,
/// `None` for members that are new to the view. The longest run of members
/// already in ascending order keeps its keys; everything else is placed
/// into the gaps between them, falling back to a full renumbering when a
/// gap is too small.
///
/// Returns `(position, key)` for every member whose key must be written.
pub fn plan_sequence(current: &[Option<i32>]) -> Vec<(usize, i32)> {
    let anchors = longest_ascending(current);
    let mut values: Vec<i64> = Vec::with_capacity(current.len());
    let mut run = 0usize;
    let mut lower = LOWER_BOUND;
    let mut fits = true;

    for (i, order) in current.iter().enumerate() {
        if !anchors[i] {
            run += 1;
            continue;
        }
        let upper = order.map(i64::from).unwrap_or(UPPER_BOUND);
        match spread(lower, upper, run) {
            Some(spread) => values.extend(spread),
            None => {
                fits = false;
                break;
            }
        }
        values.push(upper);
        lower = upper;
        run = 0;
    }
    if fits {
        match spread(lower, UPPER_BOUND, run) {
            Some(spread) => values.extend(spread),
            None => fits = false,
        }
    }
    if !fits {
        values = spread(LOWER_BOUND, UPPER_BOUND, current.len()).unwrap_or_default();
    }

    current
        .iter()
        .zip(values)
        .enumerate()
        .filter_map(|(i, (old, new))| {
            let new = new as i32;
            (*old != Some(new)).then_some((i, new))
        })
        .collect()
}

/// Marks the members of one longest strictly ascending subsequence
fn longest_ascending(current: &[Option<i32>]) -> Vec<bool> {
    let mut tails: Vec<(i32, usize)> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; current.len()];
    for (i, order) in current.iter().enumerate() {
        let Some(order) = *order else { continue };
        let pos = tails.partition_point(|&(tail, _)| tail < order);
        previous[i] = pos.checked_sub(1).map(|p| tails[p].1);
        if pos == tails.len() {
            tails.push((order, i));
        } else {
            tails[pos] = (order, i);
        }
    }
    let mut anchors = vec![false; current.len()];
    let mut cursor = tails.last().map(|&(_, i)| i);
    while let Some(i) = cursor {
        anchors[i] = true;
        cursor = previous[i];
    }
    anchors
}
