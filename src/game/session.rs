//! Session state machine.
//!
//! One session owns one grid and walks LOBBY -> PLAYING -> (REVIVING) ->
//! SETTLED. Money only moves at the edges: the bet is reserved before the
//! session exists and the payout is credited exactly once at settlement;
//! nothing here touches the ledger.

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use super::grid::{Grid, GridParams, TickFlags};
use super::Direction;
use crate::config::ConfigSnapshot;
use crate::models::{BetSource, Difficulty, Loadout, Phase, SessionView};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not in {0} phase")]
    InvalidPhase(&'static str),
    #[error("cash out requires at least one consumable eaten")]
    NothingEaten,
    #[error("no revival item available")]
    NoRevivalItem,
}

/// Why a session reached SETTLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    CashOut,
    Death,
    Forfeit,
    ReviveTimeout,
    Canceled,
    InvariantViolation,
}

/// What a tick resolved to, from the driver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickEffect {
    Continue,
    EnteredReviving,
    Settled(SettleReason),
}

/// One live match.
pub struct Session {
    pub id: Uuid,
    pub account_id: i64,
    pub bet: f64,
    pub source: BetSource,
    pub difficulty: Difficulty,
    pub phase: Phase,
    pub accrued_payout: f64,
    pub apples_eaten: u32,

    grid: Grid,

    shield_equipped: bool,
    shield_charges: u32,
    magnet_equipped: bool,
    magnet_until_ms: u64,
    ghost_until_ms: u64,

    combo_count: u32,
    combo_deadline_ms: u64,

    /// Session-internal clock; advances by one tick interval per tick.
    elapsed_ms: u64,
    revive_deadline_ms: u64,

    tier_multiplier: f64,
    combo_bonus: f64,
    combo_window_ms: u64,
    ghost_immunity_ms: u64,
    revive_window_ms: u64,
    min_tick_ms: u64,
    base_tick_ms: u64,
    tick_shrink_ms: u64,
}

impl Session {
    /// Build a new session in LOBBY. Called only after the bet reservation
    /// succeeded and the loadout was validated against inventory.
    pub fn new(
        account_id: i64,
        bet: f64,
        source: BetSource,
        difficulty: Difficulty,
        loadout: Loadout,
        cfg: &ConfigSnapshot,
        seed: u64,
    ) -> Self {
        let tier = cfg.tier(difficulty);
        let grid = Grid::new(
            GridParams {
                size: cfg.grid_size,
                initial_length: cfg.initial_length,
                bot_count: tier.bot_count,
                bot_mistake_prob: tier.bot_mistake_prob,
                hazard_probability: cfg.hazard_probability,
                hazard_min_distance: cfg.hazard_min_distance,
                hazard_place_attempts: cfg.hazard_place_attempts,
            },
            seed,
        );

        Self {
            id: Uuid::new_v4(),
            account_id,
            bet,
            source,
            difficulty,
            phase: Phase::Lobby,
            accrued_payout: 0.0,
            apples_eaten: 0,
            grid,
            shield_equipped: loadout.shield,
            shield_charges: if loadout.shield { cfg.shield_charges } else { 0 },
            magnet_equipped: loadout.magnet,
            magnet_until_ms: if loadout.magnet { cfg.magnet_duration_ms } else { 0 },
            ghost_until_ms: 0,
            combo_count: 0,
            combo_deadline_ms: 0,
            elapsed_ms: 0,
            revive_deadline_ms: 0,
            tier_multiplier: tier.tier_multiplier,
            combo_bonus: cfg.combo_bonus,
            combo_window_ms: cfg.combo_window_ms,
            ghost_immunity_ms: cfg.ghost_immunity_ms,
            revive_window_ms: cfg.revive_window_ms,
            min_tick_ms: cfg.min_tick_ms,
            base_tick_ms: tier.base_tick_ms,
            tick_shrink_ms: cfg.tick_shrink_ms_per_apple,
        }
    }

    /// Current tick interval; shrinks with pickups, floored at the minimum.
    pub fn tick_interval_ms(&self) -> u64 {
        self.base_tick_ms
            .saturating_sub(u64::from(self.apples_eaten) * self.tick_shrink_ms)
            .max(self.min_tick_ms)
    }

    /// LOBBY countdown expired; loadout is now locked and play begins.
    pub fn begin_play(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Lobby {
            return Err(SessionError::InvalidPhase("LOBBY"));
        }
        self.phase = Phase::Playing;
        info!(session = %self.id, "Session entered PLAYING");
        Ok(())
    }

    /// Client aborts in LOBBY, before the first tick. The caller refunds the
    /// reserved bet exactly once.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Lobby {
            return Err(SessionError::InvalidPhase("LOBBY"));
        }
        self.phase = Phase::Settled;
        Ok(())
    }

    pub fn set_direction(&mut self, direction: Direction) {
        if self.phase == Phase::Playing {
            self.grid.set_player_direction(direction);
        }
    }

    /// Advance the session by one tick. Valid in PLAYING (runs the simulator)
    /// and REVIVING (counts down the revive window).
    pub fn tick(&mut self) -> TickEffect {
        let interval = self.tick_interval_ms();
        match self.phase {
            Phase::Playing => {}
            Phase::Reviving => {
                self.elapsed_ms += interval;
                if self.elapsed_ms >= self.revive_deadline_ms {
                    self.phase = Phase::Settled;
                    self.accrued_payout = 0.0;
                    info!(session = %self.id, "Revive window expired, settling at zero");
                    return TickEffect::Settled(SettleReason::ReviveTimeout);
                }
                return TickEffect::Continue;
            }
            _ => return TickEffect::Continue,
        }

        self.elapsed_ms += interval;
        let ghost_immunity = self.elapsed_ms < self.ghost_until_ms;
        let flags = TickFlags {
            magnet_active: self.magnet_equipped && self.elapsed_ms < self.magnet_until_ms,
            ghost_immunity,
            shield_available: self.shield_equipped && self.shield_charges > 0,
        };

        let outcome = self.grid.tick(flags);

        if outcome.shield_consumed {
            self.shield_charges -= 1;
            info!(
                session = %self.id,
                remaining = self.shield_charges,
                "Shield absorbed a hazard"
            );
        }

        if outcome.player_ate {
            self.apples_eaten += 1;
            if self.elapsed_ms <= self.combo_deadline_ms {
                self.combo_count += 1;
            } else {
                self.combo_count = 1;
            }
            self.combo_deadline_ms = self.elapsed_ms + self.combo_window_ms;

            let bonus = if self.combo_count > 1 { self.combo_bonus } else { 0.0 };
            self.accrued_payout += self.bet * (self.tier_multiplier + bonus);
        }

        if let Some(kind) = outcome.fatal {
            return if self.accrued_payout > 0.0 {
                self.phase = Phase::Reviving;
                self.revive_deadline_ms = self.elapsed_ms + self.revive_window_ms;
                info!(session = %self.id, collision = ?kind, "Fatal collision, entering REVIVING");
                TickEffect::EnteredReviving
            } else {
                self.phase = Phase::Settled;
                info!(session = %self.id, collision = ?kind, "Fatal collision with no accrual, settling");
                TickEffect::Settled(SettleReason::Death)
            };
        }

        // Overlap while immune is expected; anything else is a bug that
        // aborts this session only.
        if !ghost_immunity {
            if let Err(violation) = self.grid.check_invariants() {
                error!(session = %self.id, %violation, "Simulation invariant violated");
                self.phase = Phase::Settled;
                self.accrued_payout = 0.0;
                return TickEffect::Settled(SettleReason::InvariantViolation);
            }
        }

        TickEffect::Continue
    }

    /// Payout a cash-out would credit right now: accrued plus the returned
    /// stake. Validates phase and pickup count without settling, so the
    /// caller can make the credit durable before the phase flips.
    pub fn cash_out_quote(&self) -> Result<f64, SessionError> {
        if self.phase != Phase::Playing {
            return Err(SessionError::InvalidPhase("PLAYING"));
        }
        if self.apples_eaten == 0 {
            return Err(SessionError::NothingEaten);
        }
        Ok(self.accrued_payout + self.bet)
    }

    /// Player-initiated cash-out. Requires PLAYING and at least one pickup.
    /// Returns the payout to credit: accrued plus the returned stake.
    pub fn cash_out(&mut self) -> Result<f64, SessionError> {
        let payout = self.cash_out_quote()?;
        self.phase = Phase::Settled;
        let multiplier = payout / self.bet;
        info!(
            session = %self.id,
            payout,
            multiplier,
            "Cash out"
        );
        Ok(payout)
    }

    /// Spend a revive: 75% payout penalty, respawn at center, ghost-immunity
    /// window. The caller has already consumed the extra-life item.
    pub fn revive(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Reviving {
            return Err(SessionError::InvalidPhase("REVIVING"));
        }
        self.accrued_payout *= 0.25;
        self.grid.respawn_player();
        self.ghost_until_ms = self.elapsed_ms + self.ghost_immunity_ms;
        self.combo_count = 0;
        self.combo_deadline_ms = 0;
        self.phase = Phase::Playing;
        info!(session = %self.id, accrued = self.accrued_payout, "Revived");
        Ok(())
    }

    /// Give up from REVIVING; settles at zero.
    pub fn forfeit(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Reviving {
            return Err(SessionError::InvalidPhase("REVIVING"));
        }
        self.phase = Phase::Settled;
        self.accrued_payout = 0.0;
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            phase: self.phase,
            accrued_payout: self.accrued_payout,
            apples_eaten: self.apples_eaten,
            shield_charges: self.shield_charges,
            ghost_immunity_active: self.elapsed_ms < self.ghost_until_ms,
            combo_count: self.combo_count,
            player: self.grid.player.body.iter().map(|p| (p.x, p.y)).collect(),
            bots: self
                .grid
                .bots
                .iter()
                .map(|b| b.body.iter().map(|p| (p.x, p.y)).collect())
                .collect(),
            consumable: (self.grid.consumable.x, self.grid.consumable.y),
            hazard: self.grid.hazard.map(|h| (h.x, h.y)),
        }
    }
}
