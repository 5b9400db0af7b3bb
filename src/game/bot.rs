//! Bot move selection.
//!
//! A pure function of (head, target, obstacles, mistake probability): greedy
//! Manhattan pathfinding toward the consumable over the safe cardinal moves,
//! with a tier-scaled chance of playing the second-best move instead.

use rand::Rng;
use std::collections::HashSet;

use super::grid::{Direction, Point};

/// Pick the bot's move for this tick. Returns `None` when no cardinal move
/// is safe (the bot is boxed in).
pub fn choose_move<R: Rng>(
    head: Point,
    target: Point,
    obstacles: &HashSet<Point>,
    grid_size: i32,
    mistake_prob: f64,
    rng: &mut R,
) -> Option<Direction> {
    // Candidates in fixed scan order; stable sort preserves that order among
    // equal distances, which is the tie-break rule.
    let mut candidates: Vec<(i32, Direction)> = Direction::SCAN_ORDER
        .iter()
        .filter_map(|&direction| {
            let (dx, dy) = direction.delta();
            let next = Point::new(head.x + dx, head.y + dy);
            let in_bounds =
                next.x >= 0 && next.y >= 0 && next.x < grid_size && next.y < grid_size;
            if in_bounds && !obstacles.contains(&next) {
                Some((next.manhattan(target), direction))
            } else {
                None
            }
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|(dist, _)| *dist);

    // Imperfect play: sometimes take the second-best option.
    if candidates.len() > 1 && rng.gen::<f64>() < mistake_prob {
        return Some(candidates[1].1);
    }
    Some(candidates[0].1)
}
