//! Grid simulator.
//!
//! Owns one match's spatial state and advances it one tick at a time.
//! Collision checks run in a fixed order: wall, self, bot body, hazard,
//! consumable. Suppression decisions (shield, ghost immunity) are passed in
//! by the session as flags; the grid reports what actually happened.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};

use super::bot;

/// A cell on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn manhattan(self, other: Point) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }
}

/// Cardinal movement direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Fixed scan order used for bot tie-breaking.
    pub const SCAN_ORDER: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
}

/// What ended the player's run this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    Wall,
    SelfBody,
    Bot,
    Hazard,
}

/// One agent on the board, head at the front.
#[derive(Debug, Clone)]
pub struct Agent {
    pub body: VecDeque<Point>,
    pub direction: Direction,
    pub apples_eaten: u32,
}

impl Agent {
    fn new(head: Point, direction: Direction, length: usize) -> Self {
        let (dx, dy) = direction.opposite().delta();
        let body = (0..length as i32)
            .map(|i| Point::new(head.x + dx * i, head.y + dy * i))
            .collect();
        Self {
            body,
            direction,
            apples_eaten: 0,
        }
    }

    pub fn head(&self) -> Point {
        *self.body.front().expect("agent body is never empty")
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    fn occupies(&self, cell: Point) -> bool {
        self.body.contains(&cell)
    }

    /// Body cells excluding the tail, which vacates on a non-eating tick.
    fn occupies_after_move(&self, cell: Point) -> bool {
        self.body.iter().take(self.body.len() - 1).any(|c| *c == cell)
    }

    fn advance(&mut self, new_head: Point, grow: bool) {
        self.body.push_front(new_head);
        if grow {
            self.apples_eaten += 1;
        } else {
            self.body.pop_back();
        }
    }
}

/// Static parameters for one match's board.
#[derive(Debug, Clone, Copy)]
pub struct GridParams {
    pub size: i32,
    pub initial_length: usize,
    pub bot_count: usize,
    pub bot_mistake_prob: f64,
    pub hazard_probability: f64,
    pub hazard_min_distance: i32,
    pub hazard_place_attempts: u32,
}

/// Per-tick suppression inputs decided by the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickFlags {
    pub magnet_active: bool,
    pub ghost_immunity: bool,
    pub shield_available: bool,
}

/// What one tick resolved to.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub fatal: Option<CollisionKind>,
    pub player_ate: bool,
    pub bot_ate: bool,
    pub shield_consumed: bool,
}

/// One match's spatial state.
pub struct Grid {
    params: GridParams,
    pub player: Agent,
    pub bots: Vec<Agent>,
    pub consumable: Point,
    pub hazard: Option<Point>,
    rng: StdRng,
}

impl Grid {
    /// Lay out a fresh board: player centered, bots at corner spawn points,
    /// one consumable on a free cell.
    pub fn new(params: GridParams, seed: u64) -> Self {
        let center = Point::new(params.size / 2, params.size / 2);
        let player = Agent::new(center, Direction::Right, params.initial_length);

        let margin = 2;
        let far = params.size - 1 - margin;
        let spawns = [
            (Point::new(margin, margin), Direction::Right),
            (Point::new(far, far), Direction::Left),
            (Point::new(far, margin), Direction::Down),
            (Point::new(margin, far), Direction::Up),
        ];
        let bots = spawns
            .iter()
            .take(params.bot_count)
            .map(|(p, d)| Agent::new(*p, *d, params.initial_length))
            .collect();

        let mut grid = Self {
            params,
            player,
            bots,
            consumable: Point::new(0, 0),
            hazard: None,
            rng: StdRng::seed_from_u64(seed),
        };
        grid.consumable = grid
            .random_free_cell()
            .unwrap_or_else(|| Point::new(0, 0));
        grid
    }

    pub fn size(&self) -> i32 {
        self.params.size
    }

    /// Change the player's held direction. Reversals are rejected so the
    /// player cannot fold into their own neck.
    pub fn set_player_direction(&mut self, direction: Direction) {
        if direction != self.player.direction.opposite() {
            self.player.direction = direction;
        }
    }

    fn in_bounds(&self, cell: Point) -> bool {
        cell.x >= 0 && cell.y >= 0 && cell.x < self.params.size && cell.y < self.params.size
    }

    fn occupied_by_any_agent(&self, cell: Point) -> bool {
        self.player.occupies(cell) || self.bots.iter().any(|b| b.occupies(cell))
    }

    fn random_free_cell(&mut self) -> Option<Point> {
        // Rejection sampling over a bounded number of draws, then a linear
        // scan as the fallback so a crowded board still gets a cell.
        for _ in 0..256 {
            let cell = Point::new(
                self.rng.gen_range(0..self.params.size),
                self.rng.gen_range(0..self.params.size),
            );
            if !self.occupied_by_any_agent(cell) && self.hazard != Some(cell) {
                return Some(cell);
            }
        }
        for x in 0..self.params.size {
            for y in 0..self.params.size {
                let cell = Point::new(x, y);
                if !self.occupied_by_any_agent(cell) && self.hazard != Some(cell) {
                    return Some(cell);
                }
            }
        }
        None
    }

    /// Advance the board one tick.
    pub fn tick(&mut self, flags: TickFlags) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        // 1. Magnet drag: consumable steps one cell toward the player's head
        //    along its dominant axis, blocked by occupancy.
        if flags.magnet_active {
            self.drag_consumable();
        }

        // 2. Player's next head cell from the held direction.
        let (dx, dy) = self.player.direction.delta();
        let head = self.player.head();
        let next = Point::new(head.x + dx, head.y + dy);

        let mut player_moved = true;

        // 3. Ordered collision checks.
        if !self.in_bounds(next) {
            if flags.ghost_immunity {
                // No out-of-bounds cell exists to pass through; hold position.
                player_moved = false;
            } else {
                outcome.fatal = Some(CollisionKind::Wall);
                return outcome;
            }
        } else if self.player.occupies_after_move(next) {
            if !flags.ghost_immunity {
                outcome.fatal = Some(CollisionKind::SelfBody);
                return outcome;
            }
        } else if self.bots.iter().any(|b| b.occupies(next)) {
            if !flags.ghost_immunity {
                outcome.fatal = Some(CollisionKind::Bot);
                return outcome;
            }
        } else if self.hazard == Some(next) {
            if flags.ghost_immunity {
                self.hazard = None;
            } else if flags.shield_available {
                self.hazard = None;
                outcome.shield_consumed = true;
            } else {
                outcome.fatal = Some(CollisionKind::Hazard);
                return outcome;
            }
        }

        if player_moved {
            let ate = next == self.consumable;
            self.player.advance(next, ate);
            outcome.player_ate = ate;
        }

        // 4. Bot moves, resolved in fixed index order so occupancy is
        //    consistent within the tick.
        let mut removed = Vec::new();
        for i in 0..self.bots.len() {
            let head = self.bots[i].head();
            let mut obstacles: HashSet<Point> = self.player.body.iter().copied().collect();
            for (j, other) in self.bots.iter().enumerate() {
                if j == i {
                    // Own tail vacates this tick unless the bot is eating.
                    for cell in other.body.iter().take(other.body.len() - 1) {
                        obstacles.insert(*cell);
                    }
                } else {
                    for cell in &other.body {
                        obstacles.insert(*cell);
                    }
                }
            }
            if let Some(hazard) = self.hazard {
                obstacles.insert(hazard);
            }

            let chosen = bot::choose_move(
                head,
                self.consumable,
                &obstacles,
                self.params.size,
                self.params.bot_mistake_prob,
                &mut self.rng,
            );

            match chosen {
                Some(direction) => {
                    let (dx, dy) = direction.delta();
                    let next = Point::new(head.x + dx, head.y + dy);
                    let ate = next == self.consumable;
                    self.bots[i].direction = direction;
                    self.bots[i].advance(next, ate);
                    if ate {
                        outcome.bot_ate = true;
                    }
                }
                // Boxed in: the bot dies and leaves the board.
                None => removed.push(i),
            }
        }
        for i in removed.into_iter().rev() {
            self.bots.remove(i);
        }

        // 5. Respawn consumable and maybe a hazard after any pickup.
        if outcome.player_ate || outcome.bot_ate {
            if let Some(cell) = self.random_free_cell() {
                self.consumable = cell;
            }
            if self.hazard.is_none() {
                self.maybe_place_hazard();
            }
        }

        outcome
    }

    fn drag_consumable(&mut self) {
        let head = self.player.head();
        let dx = head.x - self.consumable.x;
        let dy = head.y - self.consumable.y;
        if dx == 0 && dy == 0 {
            return;
        }
        let step = if dx.abs() >= dy.abs() {
            Point::new(self.consumable.x + dx.signum(), self.consumable.y)
        } else {
            Point::new(self.consumable.x, self.consumable.y + dy.signum())
        };
        if !self.occupied_by_any_agent(step) && self.hazard != Some(step) {
            self.consumable = step;
        }
    }

    fn maybe_place_hazard(&mut self) {
        if self.rng.gen::<f64>() >= self.params.hazard_probability {
            return;
        }
        let player_head = self.player.head();
        for _ in 0..self.params.hazard_place_attempts {
            let cell = Point::new(
                self.rng.gen_range(0..self.params.size),
                self.rng.gen_range(0..self.params.size),
            );
            if cell != self.consumable
                && !self.occupied_by_any_agent(cell)
                && cell.manhattan(player_head) > self.params.hazard_min_distance
            {
                self.hazard = Some(cell);
                return;
            }
        }
        // No valid cell within the attempt budget: no hazard this round.
    }

    /// Respawn the player at the board center with length preserved, laid out
    /// in a serpentine fold so any length fits.
    pub fn respawn_player(&mut self) {
        let length = self.player.len();
        let eaten = self.player.apples_eaten;
        let center = Point::new(self.params.size / 2, self.params.size / 2);

        let mut body = VecDeque::with_capacity(length);
        let mut x = center.x;
        let mut y = center.y;
        let mut dir = -1;
        for _ in 0..length {
            body.push_back(Point::new(x, y));
            let nx = x + dir;
            if nx < 0 || nx >= self.params.size {
                y = (y + 1).min(self.params.size - 1);
                dir = -dir;
            } else {
                x = nx;
            }
        }

        self.player = Agent {
            body,
            direction: Direction::Right,
            apples_eaten: eaten,
        };
        // Clear anything the respawned body now overlaps.
        if let Some(h) = self.hazard {
            if self.player.occupies(h) {
                self.hazard = None;
            }
        }
        if self.player.occupies(self.consumable) {
            if let Some(cell) = self.random_free_cell() {
                self.consumable = cell;
            }
        }
    }

    /// Post-tick structural check. Distinct agents sharing a cell without a
    /// collision event is a programming error that aborts the session.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, bot) in self.bots.iter().enumerate() {
            if bot.occupies(self.player.head()) || self.player.occupies(bot.head()) {
                return Err(format!("player and bot {} overlap", i));
            }
            for (j, other) in self.bots.iter().enumerate() {
                if j > i && other.occupies(bot.head()) {
                    return Err(format!("bots {} and {} overlap", i, j));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bots: usize) -> GridParams {
        GridParams {
            size: 21,
            initial_length: 3,
            bot_count: bots,
            bot_mistake_prob: 0.0,
            hazard_probability: 0.0,
            hazard_min_distance: 4,
            hazard_place_attempts: 32,
        }
    }

    #[test]
    fn initial_layout_centers_player() {
        let grid = Grid::new(params(2), 7);
        assert_eq!(grid.player.head(), Point::new(10, 10));
        assert_eq!(grid.player.len(), 3);
        assert_eq!(grid.bots.len(), 2);
        assert!(!grid.occupied_by_any_agent(grid.consumable));
    }

    #[test]
    fn length_is_three_plus_eaten_through_ticks() {
        let mut grid = Grid::new(params(0), 7);
        for _ in 0..20 {
            // Steer away from walls: bounce between Right and Down.
            let head = grid.player.head();
            if head.x >= grid.size() - 2 {
                grid.set_player_direction(Direction::Down);
            } else if head.y >= grid.size() - 2 {
                grid.set_player_direction(Direction::Right);
            }
            grid.tick(TickFlags::default());
            assert_eq!(
                grid.player.len() as u32,
                3 + grid.player.apples_eaten,
                "length invariant broken"
            );
        }
    }

    #[test]
    fn reversal_is_rejected() {
        let mut grid = Grid::new(params(0), 7);
        assert_eq!(grid.player.direction, Direction::Right);
        grid.set_player_direction(Direction::Left);
        assert_eq!(grid.player.direction, Direction::Right);
        grid.set_player_direction(Direction::Up);
        assert_eq!(grid.player.direction, Direction::Up);
    }

    #[test]
    fn wall_collision_is_fatal() {
        let mut grid = Grid::new(params(0), 7);
        let mut outcome = TickOutcome::default();
        for _ in 0..15 {
            outcome = grid.tick(TickFlags::default());
            if outcome.fatal.is_some() {
                break;
            }
        }
        assert_eq!(outcome.fatal, Some(CollisionKind::Wall));
    }

    #[test]
    fn ghost_immunity_holds_at_wall() {
        let mut grid = Grid::new(params(0), 7);
        let flags = TickFlags {
            ghost_immunity: true,
            ..Default::default()
        };
        for _ in 0..30 {
            let outcome = grid.tick(flags);
            assert!(outcome.fatal.is_none());
        }
        // Head never left the board.
        assert!(grid.in_bounds(grid.player.head()));
    }

    #[test]
    fn hazard_hit_consumes_shield_and_clears_hazard() {
        let mut grid = Grid::new(params(0), 7);
        let head = grid.player.head();
        grid.hazard = Some(Point::new(head.x + 1, head.y));
        // Keep the consumable elsewhere.
        grid.consumable = Point::new(0, 0);

        let outcome = grid.tick(TickFlags {
            shield_available: true,
            ..Default::default()
        });
        assert!(outcome.shield_consumed);
        assert!(outcome.fatal.is_none());
        assert_eq!(grid.hazard, None);
    }

    #[test]
    fn hazard_hit_without_shield_is_fatal() {
        let mut grid = Grid::new(params(0), 7);
        let head = grid.player.head();
        grid.hazard = Some(Point::new(head.x + 1, head.y));
        grid.consumable = Point::new(0, 0);

        let outcome = grid.tick(TickFlags::default());
        assert_eq!(outcome.fatal, Some(CollisionKind::Hazard));
    }

    #[test]
    fn eating_grows_player_and_respawns_consumable() {
        let mut grid = Grid::new(params(0), 7);
        let head = grid.player.head();
        grid.consumable = Point::new(head.x + 1, head.y);

        let outcome = grid.tick(TickFlags::default());
        assert!(outcome.player_ate);
        assert_eq!(grid.player.len(), 4);
        assert_ne!(grid.consumable, grid.player.head());
    }

    #[test]
    fn magnet_drags_consumable_along_dominant_axis() {
        let mut grid = Grid::new(params(0), 7);
        let head = grid.player.head();
        grid.consumable = Point::new(head.x + 6, head.y + 2);

        grid.tick(TickFlags {
            magnet_active: true,
            ..Default::default()
        });
        // Dominant axis is x; the drag and the player's own rightward step
        // close the gap by two.
        assert_eq!(grid.consumable.y, head.y + 2);
        assert_eq!(grid.consumable.x, head.x + 5);
    }

    #[test]
    fn respawn_preserves_length() {
        let mut grid = Grid::new(params(0), 7);
        let head = grid.player.head();
        grid.consumable = Point::new(head.x + 1, head.y);
        grid.tick(TickFlags::default());
        assert_eq!(grid.player.len(), 4);

        grid.respawn_player();
        assert_eq!(grid.player.len(), 4);
        assert_eq!(grid.player.apples_eaten, 1);
        assert_eq!(grid.player.head(), Point::new(10, 10));
    }

    #[test]
    fn hazard_respects_minimum_distance() {
        let mut p = params(0);
        p.hazard_probability = 1.0;
        let mut grid = Grid::new(p, 7);
        let head = grid.player.head();
        grid.consumable = Point::new(head.x + 1, head.y);

        grid.tick(TickFlags::default());
        if let Some(h) = grid.hazard {
            assert!(h.manhattan(grid.player.head()) > p.hazard_min_distance);
            assert_ne!(h, grid.consumable);
        }
    }

    #[test]
    fn bots_chase_and_eat_the_consumable() {
        let mut p = params(1);
        p.bot_mistake_prob = 0.0;
        let mut grid = Grid::new(p, 7);
        // Park the player against the far wall; under immunity it holds
        // position there, leaving the bot free to chase.
        grid.player = Agent::new(Point::new(20, 20), Direction::Right, 1);
        grid.consumable = Point::new(4, 4);

        let flags = TickFlags {
            ghost_immunity: true,
            ..Default::default()
        };
        let mut ate = false;
        for _ in 0..12 {
            let outcome = grid.tick(flags);
            if outcome.bot_ate {
                ate = true;
                break;
            }
        }
        assert!(ate, "greedy bot should reach a nearby consumable");
    }

    #[test]
    fn invariant_check_passes_on_fresh_board() {
        let grid = Grid::new(params(3), 7);
        assert!(grid.check_invariants().is_ok());
    }
}
