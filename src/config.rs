//! Versioned configuration snapshots.
//!
//! Every operation reads one immutable snapshot; updates publish a new
//! snapshot through `ArcSwap` instead of mutating shared state.

use arc_swap::ArcSwap;
use std::env;
use std::sync::Arc;

use crate::models::{Difficulty, Item};

/// Per-tier simulation and payout parameters.
#[derive(Debug, Clone, Copy)]
pub struct TierParams {
    pub bot_count: usize,
    pub base_tick_ms: u64,
    pub tier_multiplier: f64,
    /// Probability that a bot plays its second-best move instead of the best.
    pub bot_mistake_prob: f64,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,

    // Economy
    pub min_deposit: f64,
    pub min_withdrawal: f64,
    pub min_bet: f64,
    pub item_prices: [(Item, f64); 3],
    pub mystery_box_price: f64,

    // Referral program
    pub cpa_threshold: f64,
    pub cpa_amount: f64,
    pub revshare_pct: f64,

    // Simulation
    pub grid_size: i32,
    pub initial_length: usize,
    pub min_tick_ms: u64,
    pub tick_shrink_ms_per_apple: u64,
    pub lobby_countdown_ms: u64,
    pub revive_window_ms: u64,
    pub ghost_immunity_ms: u64,
    pub magnet_duration_ms: u64,
    pub combo_window_ms: u64,
    pub combo_bonus: f64,
    pub shield_charges: u32,
    pub hazard_probability: f64,
    pub hazard_min_distance: i32,
    pub hazard_place_attempts: u32,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            version: 1,
            min_deposit: 10.0,
            min_withdrawal: 20.0,
            min_bet: 1.0,
            item_prices: [
                (Item::Shield, 5.0),
                (Item::Magnet, 4.0),
                (Item::ExtraLife, 8.0),
            ],
            mystery_box_price: 3.0,
            cpa_threshold: 50.0,
            cpa_amount: 10.0,
            revshare_pct: 0.05,
            grid_size: 21,
            initial_length: 3,
            min_tick_ms: 80,
            tick_shrink_ms_per_apple: 4,
            lobby_countdown_ms: 3_000,
            revive_window_ms: 10_000,
            ghost_immunity_ms: 5_000,
            magnet_duration_ms: 6_000,
            combo_window_ms: 5_000,
            combo_bonus: 0.1,
            shield_charges: 2,
            hazard_probability: 0.3,
            hazard_min_distance: 4,
            hazard_place_attempts: 32,
        }
    }
}

impl ConfigSnapshot {
    /// Build a snapshot from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.min_deposit = env_f64("VG_MIN_DEPOSIT", cfg.min_deposit);
        cfg.min_withdrawal = env_f64("VG_MIN_WITHDRAWAL", cfg.min_withdrawal);
        cfg.min_bet = env_f64("VG_MIN_BET", cfg.min_bet);
        cfg.cpa_threshold = env_f64("VG_CPA_THRESHOLD", cfg.cpa_threshold);
        cfg.cpa_amount = env_f64("VG_CPA_AMOUNT", cfg.cpa_amount);
        cfg.revshare_pct = env_f64("VG_REVSHARE_PCT", cfg.revshare_pct);
        cfg
    }

    pub fn item_price(&self, item: Item) -> f64 {
        self.item_prices
            .iter()
            .find(|(i, _)| *i == item)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    pub fn tier(&self, difficulty: Difficulty) -> TierParams {
        match difficulty {
            Difficulty::Easy => TierParams {
                bot_count: 1,
                base_tick_ms: 220,
                tier_multiplier: 0.25,
                bot_mistake_prob: 0.35,
            },
            Difficulty::Medium => TierParams {
                bot_count: 2,
                base_tick_ms: 170,
                tier_multiplier: 0.5,
                bot_mistake_prob: 0.20,
            },
            Difficulty::Hard => TierParams {
                bot_count: 3,
                base_tick_ms: 130,
                tier_multiplier: 1.0,
                bot_mistake_prob: 0.08,
            },
        }
    }

    /// Tick interval after `apples_eaten` pickups, floored at the minimum.
    pub fn tick_interval_ms(&self, difficulty: Difficulty, apples_eaten: u32) -> u64 {
        let base = self.tier(difficulty).base_tick_ms;
        base.saturating_sub(u64::from(apples_eaten) * self.tick_shrink_ms_per_apple)
            .max(self.min_tick_ms)
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared handle that always yields the current snapshot.
pub struct ConfigHandle {
    inner: ArcSwap<ConfigSnapshot>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Publish a new snapshot with a bumped version.
    pub fn publish(&self, mut snapshot: ConfigSnapshot) {
        snapshot.version = self.inner.load().version + 1;
        self.inner.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_interval_shrinks_and_floors() {
        let cfg = ConfigSnapshot::default();
        let base = cfg.tick_interval_ms(Difficulty::Medium, 0);
        assert_eq!(base, 170);
        assert_eq!(cfg.tick_interval_ms(Difficulty::Medium, 5), 150);
        // Far past the floor
        assert_eq!(cfg.tick_interval_ms(Difficulty::Medium, 100), 80);
    }

    #[test]
    fn publish_bumps_version() {
        let handle = ConfigHandle::new(ConfigSnapshot::default());
        assert_eq!(handle.current().version, 1);
        handle.publish(ConfigSnapshot::default());
        assert_eq!(handle.current().version, 2);
    }

    #[test]
    fn tier_table_monotone() {
        let cfg = ConfigSnapshot::default();
        let easy = cfg.tier(Difficulty::Easy);
        let hard = cfg.tier(Difficulty::Hard);
        assert!(easy.bot_count < hard.bot_count);
        assert!(easy.tier_multiplier < hard.tier_multiplier);
        assert!(easy.bot_mistake_prob > hard.bot_mistake_prob);
    }
}
