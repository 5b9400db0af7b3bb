//! Match simulation: grid state, bot strategy, and the session state machine.

pub mod bot;
pub mod grid;
pub mod session;

pub use grid::{CollisionKind, Direction, Grid, GridParams, Point, TickFlags, TickOutcome};
pub use session::{Session, SessionError, SettleReason, TickEffect};
