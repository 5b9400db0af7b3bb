//! Shared domain enums and wire models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which balance pool a bet draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BetSource {
    Real,
    Bonus,
}

impl BetSource {
    pub fn as_str(&self) -> &str {
        match self {
            BetSource::Real => "REAL",
            BetSource::Bonus => "BONUS",
        }
    }
}

/// Difficulty tier selected at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

/// Consumable items a player can own and equip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Item {
    Shield,
    Magnet,
    ExtraLife,
}

impl Item {
    pub fn as_str(&self) -> &str {
        match self {
            Item::Shield => "shield",
            Item::Magnet => "magnet",
            Item::ExtraLife => "extra_life",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "shield" => Some(Item::Shield),
            "magnet" => Some(Item::Magnet),
            "extra_life" => Some(Item::ExtraLife),
            _ => None,
        }
    }
}

/// Ledger transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxType {
    Deposit,
    Withdraw,
    Bet,
    Win,
    AffiliateClaim,
}

impl TxType {
    pub fn as_str(&self) -> &str {
        match self {
            TxType::Deposit => "DEPOSIT",
            TxType::Withdraw => "WITHDRAW",
            TxType::Bet => "BET",
            TxType::Win => "WIN",
            TxType::AffiliateClaim => "AFFILIATE_CLAIM",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(TxType::Deposit),
            "WITHDRAW" => Some(TxType::Withdraw),
            "BET" => Some(TxType::Bet),
            "WIN" => Some(TxType::Win),
            "AFFILIATE_CLAIM" => Some(TxType::AffiliateClaim),
            _ => None,
        }
    }
}

/// Ledger transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Pending,
    Completed,
    Rejected,
}

impl TxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Completed => "COMPLETED",
            TxStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TxStatus::Pending),
            "COMPLETED" => Some(TxStatus::Completed),
            "REJECTED" => Some(TxStatus::Rejected),
            _ => None,
        }
    }
}

/// A recorded ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: i64,
    pub tx_type: TxType,
    pub amount: f64,
    pub status: TxStatus,
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Items selected for a session at start.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Loadout {
    #[serde(default)]
    pub shield: bool,
    #[serde(default)]
    pub magnet: bool,
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Lobby,
    Playing,
    Reviving,
    Settled,
}

/// Read-only session view returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub phase: Phase,
    pub accrued_payout: f64,
    pub apples_eaten: u32,
    pub shield_charges: u32,
    pub ghost_immunity_active: bool,
    pub combo_count: u32,
    pub player: Vec<(i32, i32)>,
    pub bots: Vec<Vec<(i32, i32)>>,
    pub consumable: (i32, i32),
    pub hazard: Option<(i32, i32)>,
}
