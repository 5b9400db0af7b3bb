//! Live session registry.
//!
//! Each session gets its own cooperative tick loop; sessions share nothing
//! but the ledger. Client-issued transitions (`cash_out`, `revive`,
//! `forfeit`, `cancel`) lock the same session mutex as the tick loop, so no
//! tick can straddle a transition.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::game::{Direction, Session, SessionError, SettleReason, TickEffect};
use crate::ledger::LedgerError;
use crate::models::{BetSource, Difficulty, Item, Loadout, Phase, SessionView};
use crate::settlement::{SettlementCoordinator, SettlementError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session not found")]
    SessionNotFound,
    #[error("equipped item not in inventory")]
    InvalidLoadout,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Owns every live session and its driving task.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    coordinator: Arc<SettlementCoordinator>,
    config: Arc<ConfigHandle>,
}

impl SessionManager {
    pub fn new(coordinator: Arc<SettlementCoordinator>, config: Arc<ConfigHandle>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            coordinator,
            config,
        }
    }

    fn session(&self, session_id: Uuid) -> ManagerResult<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(ManagerError::SessionNotFound)
    }

    /// Start a session: consume the equipped items, reserve the bet, build
    /// the grid, and spawn the tick loop. Partial consumption rolls back.
    pub async fn start_session(
        self: &Arc<Self>,
        account_id: i64,
        bet: f64,
        source: BetSource,
        difficulty: Difficulty,
        loadout: Loadout,
    ) -> ManagerResult<SessionView> {
        let ledger = self.coordinator.ledger();
        let mut consumed: Vec<Item> = Vec::new();
        let equipped = [
            (loadout.shield, Item::Shield),
            (loadout.magnet, Item::Magnet),
        ];
        for (wanted, item) in equipped {
            if !wanted {
                continue;
            }
            match ledger.try_consume_item(account_id, item).await {
                Ok(()) => consumed.push(item),
                Err(LedgerError::NoItem(_)) => {
                    self.restore_items(account_id, &consumed).await;
                    return Err(ManagerError::InvalidLoadout);
                }
                Err(other) => {
                    self.restore_items(account_id, &consumed).await;
                    return Err(SettlementError::from(other).into());
                }
            }
        }

        let cfg = self.config.current();
        let session = Session::new(
            account_id,
            bet,
            source,
            difficulty,
            loadout,
            &cfg,
            rand::random(),
        );
        let session_id = session.id;

        if let Err(err) = self
            .coordinator
            .reserve_bet(account_id, session_id, bet, source)
            .await
        {
            self.restore_items(account_id, &consumed).await;
            return Err(err.into());
        }

        let view = session.view();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().insert(session_id, handle.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_session(session_id, handle).await;
        });

        info!(account_id, %session_id, bet, difficulty = difficulty.as_str(), "Session started");
        Ok(view)
    }

    /// Put back items consumed for a loadout that never reached play. A
    /// restore that fails leaves the player short an item, so it is logged
    /// loudly rather than dropped.
    async fn restore_items(&self, account_id: i64, items: &[Item]) {
        for item in items {
            if let Err(err) = self
                .coordinator
                .ledger()
                .grant_item(account_id, *item, 1)
                .await
            {
                warn!(account_id, item = item.as_str(), %err, "Failed to restore consumed item");
            }
        }
    }

    /// Per-session driver: LOBBY countdown, then ticks at the session's own
    /// cadence until it settles.
    async fn run_session(self: Arc<Self>, session_id: Uuid, handle: Arc<Mutex<Session>>) {
        let lobby_ms = self.config.current().lobby_countdown_ms;
        tokio::time::sleep(Duration::from_millis(lobby_ms)).await;

        {
            let mut session = handle.lock().await;
            match session.phase {
                Phase::Lobby => {
                    // Loadout is locked from here on.
                    if session.begin_play().is_err() {
                        return;
                    }
                }
                // Canceled during the countdown.
                _ => {
                    drop(session);
                    self.sessions.write().remove(&session_id);
                    return;
                }
            }
        }

        loop {
            let interval = {
                let session = handle.lock().await;
                if session.phase == Phase::Settled {
                    break;
                }
                session.tick_interval_ms()
            };
            tokio::time::sleep(Duration::from_millis(interval)).await;

            let mut session = handle.lock().await;
            match session.tick() {
                TickEffect::Continue | TickEffect::EnteredReviving => {}
                TickEffect::Settled(reason) => {
                    self.settle(&mut session, reason).await;
                    break;
                }
            }
        }

        self.sessions.write().remove(&session_id);
    }

    /// Zero-payout settlements decided by the loop itself (death with no
    /// accrual, revive timeout, invariant abort).
    async fn settle(&self, session: &mut Session, reason: SettleReason) {
        let result = self
            .coordinator
            .settle_session(
                session.account_id,
                session.id,
                session.bet,
                session.source,
                session.accrued_payout,
            )
            .await;
        match result {
            Ok(_) => info!(session = %session.id, ?reason, "Session settled"),
            Err(err) => {
                error!(session = %session.id, %err, "Settlement failed");
            }
        }
    }

    /// Player-initiated cash-out. Returns (credited payout, new balance).
    /// The credit lands before the phase flips: a settlement failure leaves
    /// the session PLAYING and the cash-out retryable, instead of consuming
    /// the session with nothing durably owed.
    pub async fn cash_out(&self, session_id: Uuid) -> ManagerResult<(f64, f64)> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        let payout = session.cash_out_quote()?;
        let balance = self
            .coordinator
            .settle_session(
                session.account_id,
                session.id,
                session.bet,
                session.source,
                payout,
            )
            .await?;
        session.cash_out()?;
        Ok((payout, balance))
    }

    /// Spend an extra-life item to continue from REVIVING.
    pub async fn revive(&self, session_id: Uuid) -> ManagerResult<SessionView> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        if session.phase != Phase::Reviving {
            return Err(SessionError::InvalidPhase("REVIVING").into());
        }
        match self
            .coordinator
            .ledger()
            .try_consume_item(session.account_id, Item::ExtraLife)
            .await
        {
            Ok(()) => {}
            Err(LedgerError::NoItem(_)) => return Err(SessionError::NoRevivalItem.into()),
            Err(other) => return Err(SettlementError::from(other).into()),
        }
        session.revive()?;
        Ok(session.view())
    }

    /// Give up from REVIVING; settles at zero payout.
    pub async fn forfeit(&self, session_id: Uuid) -> ManagerResult<()> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        session.forfeit()?;
        self.settle(&mut session, SettleReason::Forfeit).await;
        Ok(())
    }

    /// Abort in LOBBY before the first tick; refunds the reserved bet.
    pub async fn cancel(&self, session_id: Uuid) -> ManagerResult<()> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        session.cancel()?;
        self.coordinator
            .refund_bet(
                session.account_id,
                session.id,
                session.bet,
                session.source,
            )
            .await?;
        Ok(())
    }

    pub async fn set_direction(&self, session_id: Uuid, direction: Direction) -> ManagerResult<()> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        session.set_direction(direction);
        Ok(())
    }

    pub async fn view(&self, session_id: Uuid) -> ManagerResult<SessionView> {
        let handle = self.session(session_id)?;
        let session = handle.lock().await;
        Ok(session.view())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }
}
