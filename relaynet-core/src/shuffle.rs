//! Weighted and uniform shuffle helpers.
//!
//! Used by the route manager to order routes for write attempts (weighted,
//! by transport-supplied priority/weight) and by the receive selector and
//! multi-client window (uniform). Expressed as plain functions over an
//! injected RNG rather than a stateful generator, so callers can restart
//! the ordering deterministically from the same input.

use rand::seq::SliceRandom;
use rand::Rng;

/// Shuffle `items` uniformly at random in place.
pub fn uniform_shuffle<T>(items: &mut [T], rng: &mut impl Rng) {
    items.shuffle(rng);
}

/// Order `items` by a weighted random permutation: at each step, pick the
/// next item with probability proportional to its remaining weight
/// (weighted sampling without replacement). Zero-weight items are still
/// included, ordered after all positive-weight items, in uniform-shuffled
/// order among themselves.
pub fn weighted_shuffle<T>(mut items: Vec<(T, f64)>, rng: &mut impl Rng) -> Vec<T> {
    let mut ordered = Vec::with_capacity(items.len());
    loop {
        let total: f64 = items.iter().map(|(_, w)| w.max(0.0)).sum();
        if total <= 0.0 {
            break;
        }
        let mut pick = rng.gen_range(0.0..total);
        let mut chosen = 0;
        for (idx, (_, w)) in items.iter().enumerate() {
            let w = w.max(0.0);
            if pick < w {
                chosen = idx;
                break;
            }
            pick -= w;
        }
        let (item, _) = items.remove(chosen);
        ordered.push(item);
    }
    // Remaining zero-weight items: append in uniform-shuffled order.
    let mut rest: Vec<T> = items.into_iter().map(|(item, _)| item).collect();
    rest.shuffle(rng);
    ordered.extend(rest);
    ordered
}

/// Stable shuffle of items sharing the same priority tier: groups items by
/// an ascending priority key and weighted-shuffles within each tier, so
/// lower-priority tiers are always fully ordered before the next tier
/// begins.
pub fn priority_weighted_order<T>(mut items: Vec<(T, i32, f64)>, rng: &mut impl Rng) -> Vec<T> {
    items.sort_by_key(|(_, priority, _)| *priority);

    let mut out = Vec::with_capacity(items.len());
    let mut tier: Vec<(T, f64)> = Vec::new();
    let mut current_priority = None;
    for (item, priority, weight) in items {
        if current_priority.is_some() && current_priority != Some(priority) {
            out.extend(weighted_shuffle(std::mem::take(&mut tier), rng));
        }
        current_priority = Some(priority);
        tier.push((item, weight));
    }
    out.extend(weighted_shuffle(tier, rng));
    out
}
