//! The per-room negotiation state machine.
//!
//! One non-terminal negotiation exists per room at a time. Rounds are
//! appended from bus traffic; two timers (per-round and total) expire the
//! negotiation when either side stalls. Terminal states are sticky: once
//! accepted, rejected or expired, nothing moves the negotiation again and no
//! event is re-emitted.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::AgentMessage;
use crate::domain::ids::{NegotiationId, RoomId, UserId};
use crate::domain::negotiation::{
    ExpiryReason, Negotiation, NegotiationStatus, Round, RoundAction,
};
use crate::domain::now_ms;
use crate::domain::proposal::Proposal;
use crate::error::{AccordResult, NegotiationError};

/// Which of the two timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Round,
    Total,
}

/// Posted back to the room mailbox when a timer elapses. Stale epochs are
/// discarded: any reset or terminal transition bumps the epoch.
#[derive(Debug, Clone)]
pub struct TimerFired {
    pub negotiation_id: NegotiationId,
    pub kind: TimerKind,
    pub epoch: u64,
}

/// State-machine outcomes the room supervisor reacts to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RoundAdded(Negotiation),
    Agreed(Negotiation),
    Rejected(Negotiation),
    Expired(Negotiation, ExpiryReason),
}

struct Timers {
    round: Option<JoinHandle<()>>,
    round_epoch: u64,
    total: Option<JoinHandle<()>>,
    total_epoch: u64,
    next_epoch: u64,
}

impl Timers {
    fn new() -> Self {
        Self {
            round: None,
            round_epoch: 0,
            total: None,
            total_epoch: 0,
            next_epoch: 1,
        }
    }

    fn clear(&mut self) {
        if let Some(handle) = self.round.take() {
            handle.abort();
        }
        if let Some(handle) = self.total.take() {
            handle.abort();
        }
        // Invalidate anything already in flight.
        self.round_epoch = 0;
        self.total_epoch = 0;
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct NegotiationEngine {
    room_id: RoomId,
    active: Option<Negotiation>,
    /// Terminal negotiations, kept for late-message lookups.
    archive: HashMap<NegotiationId, Negotiation>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timers: Timers,
}

impl NegotiationEngine {
    /// `timer_tx` is the room mailbox path timer firings come back on.
    pub fn new(room_id: RoomId, timer_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            room_id,
            active: None,
            archive: HashMap::new(),
            timer_tx,
            timers: Timers::new(),
        }
    }

    pub fn active(&self) -> Option<&Negotiation> {
        self.active.as_ref()
    }

    pub fn get(&self, id: &NegotiationId) -> Option<&Negotiation> {
        self.active
            .as_ref()
            .filter(|n| &n.id == id)
            .or_else(|| self.archive.get(id))
    }

    /// Create the negotiation from the opening proposal. Fails while a
    /// non-terminal negotiation exists (first write wins).
    pub fn create(
        &mut self,
        initiator: UserId,
        responder: UserId,
        proposal: Proposal,
    ) -> AccordResult<Negotiation> {
        proposal.validate()?;
        if let Some(existing) = &self.active {
            return Err(NegotiationError::AlreadyActive(existing.id.to_string()).into());
        }

        let negotiation = Negotiation::new(
            self.room_id.clone(),
            initiator,
            responder,
            proposal,
            now_ms(),
        );
        info!(room = %self.room_id, negotiation = %negotiation.id, "negotiation created");

        self.arm_round_timer(&negotiation.id, negotiation.round_timeout_ms);
        self.arm_total_timer(&negotiation.id, negotiation.total_timeout_ms);
        self.active = Some(negotiation.clone());
        Ok(negotiation)
    }

    /// Drive the state machine on one bus message. Messages naming an
    /// unknown or terminal negotiation are ignored.
    pub fn handle_message(&mut self, message: &AgentMessage) -> Option<EngineEvent> {
        let id = message.negotiation_id().clone();
        let is_active = self.active.as_ref().is_some_and(|n| n.id == id);
        if !is_active {
            debug!(negotiation = %id, "message for unknown or terminal negotiation ignored");
            return None;
        }

        match message {
            // The opening proposal already created the negotiation; the
            // bus copy is for the responder, not the engine.
            AgentMessage::AgentProposal { .. } => None,
            AgentMessage::AgentCounter {
                from_agent,
                proposal,
                reason,
                ..
            } => self.on_counter(from_agent.clone(), proposal.clone(), reason.clone()),
            AgentMessage::AgentAccept { from_agent, .. } => {
                self.terminate(RoundAction::Accept, from_agent.clone(), None)
            }
            AgentMessage::AgentReject {
                from_agent, reason, ..
            } => self.terminate(RoundAction::Reject, from_agent.clone(), reason.clone()),
        }
    }

    /// Apply a timer firing. Stale epochs (from timers reset or cleared
    /// after the firing was queued) are discarded.
    pub fn handle_timer(&mut self, fired: &TimerFired) -> Option<EngineEvent> {
        let current = match fired.kind {
            TimerKind::Round => self.timers.round_epoch,
            TimerKind::Total => self.timers.total_epoch,
        };
        if fired.epoch != current || current == 0 {
            return None;
        }
        if !self.active.as_ref().is_some_and(|n| n.id == fired.negotiation_id) {
            return None;
        }

        let reason = match fired.kind {
            TimerKind::Round => ExpiryReason::RoundTimeout,
            TimerKind::Total => ExpiryReason::TotalTimeout,
        };
        Some(self.expire(reason))
    }

    /// Expire the active negotiation out-of-band (e.g. the peer left).
    pub fn cancel(&mut self, reason: ExpiryReason) -> Option<EngineEvent> {
        self.active.as_ref()?;
        Some(self.expire(reason))
    }

    /// Abort timers. Called on room teardown.
    pub fn destroy(&mut self) {
        self.timers.clear();
    }

    // ============================================================================================
    // Transitions
    // ============================================================================================

    fn on_counter(
        &mut self,
        by: UserId,
        proposal: Proposal,
        reason: Option<String>,
    ) -> Option<EngineEvent> {
        if proposal.validate().is_err() {
            debug!(room = %self.room_id, "counter with invalid proposal ignored");
            return None;
        }

        let at_limit = {
            let negotiation = self.active.as_ref()?;
            negotiation.rounds.len() >= negotiation.max_rounds
        };
        if at_limit {
            return Some(self.expire(ExpiryReason::RoundLimit));
        }

        let negotiation = self.active.as_mut()?;
        negotiation.rounds.push(Round {
            action: RoundAction::Counter,
            by,
            proposal: Some(proposal.clone()),
            reason,
            at: now_ms(),
        });
        negotiation.current_proposal = proposal;
        negotiation.status = NegotiationStatus::Countering;
        negotiation.updated_at = now_ms();

        let id = negotiation.id.clone();
        let round_timeout = negotiation.round_timeout_ms;
        let snapshot = negotiation.clone();
        self.arm_round_timer(&id, round_timeout);
        Some(EngineEvent::RoundAdded(snapshot))
    }

    fn terminate(
        &mut self,
        action: RoundAction,
        by: UserId,
        reason: Option<String>,
    ) -> Option<EngineEvent> {
        let mut negotiation = self.active.take()?;
        negotiation.rounds.push(Round {
            action,
            by,
            proposal: None,
            reason,
            at: now_ms(),
        });
        negotiation.status = match action {
            RoundAction::Accept => NegotiationStatus::Accepted,
            _ => NegotiationStatus::Rejected,
        };
        negotiation.updated_at = now_ms();
        self.timers.clear();

        info!(
            room = %self.room_id,
            negotiation = %negotiation.id,
            status = %negotiation.status,
            rounds = negotiation.rounds.len(),
            "negotiation terminal"
        );
        self.archive
            .insert(negotiation.id.clone(), negotiation.clone());
        match action {
            RoundAction::Accept => Some(EngineEvent::Agreed(negotiation)),
            _ => Some(EngineEvent::Rejected(negotiation)),
        }
    }

    fn expire(&mut self, reason: ExpiryReason) -> EngineEvent {
        let mut negotiation = self.active.take().expect("expire requires an active negotiation");
        negotiation.status = NegotiationStatus::Expired;
        negotiation.expiry_reason = Some(reason);
        negotiation.updated_at = now_ms();
        self.timers.clear();

        info!(
            room = %self.room_id,
            negotiation = %negotiation.id,
            ?reason,
            "negotiation expired"
        );
        self.archive
            .insert(negotiation.id.clone(), negotiation.clone());
        EngineEvent::Expired(negotiation, reason)
    }

    // ============================================================================================
    // Timers
    // ============================================================================================

    fn arm_round_timer(&mut self, id: &NegotiationId, timeout_ms: u64) {
        if let Some(handle) = self.timers.round.take() {
            handle.abort();
        }
        let epoch = self.timers.next_epoch;
        self.timers.next_epoch += 1;
        self.timers.round_epoch = epoch;
        self.timers.round = Some(self.spawn_timer(id.clone(), TimerKind::Round, epoch, timeout_ms));
    }

    fn arm_total_timer(&mut self, id: &NegotiationId, timeout_ms: u64) {
        if let Some(handle) = self.timers.total.take() {
            handle.abort();
        }
        let epoch = self.timers.next_epoch;
        self.timers.next_epoch += 1;
        self.timers.total_epoch = epoch;
        self.timers.total = Some(self.spawn_timer(id.clone(), TimerKind::Total, epoch, timeout_ms));
    }

    fn spawn_timer(
        &self,
        negotiation_id: NegotiationId,
        kind: TimerKind,
        epoch: u64,
        timeout_ms: u64,
    ) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = tx.send(TimerFired {
                negotiation_id,
                kind,
                epoch,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::proposal::{LineItem, LineItemKind};

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn proposal(total: i64) -> Proposal {
        Proposal {
            summary: "work".to_string(),
            line_items: vec![LineItem {
                description: "Labour".to_string(),
                amount: Amount(total),
                kind: LineItemKind::Immediate,
                condition: None,
                min_amount: None,
                max_amount: None,
                factors: Vec::new(),
            }],
            total_amount: Amount(total),
            currency: Currency::gbp(),
            conditions: Vec::new(),
            expires_at: 0,
            factor_summary: None,
            milestone_specs: Vec::new(),
        }
    }

    fn engine() -> (NegotiationEngine, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NegotiationEngine::new(RoomId::parse("room-1").unwrap(), tx), rx)
    }

    fn counter(id: &NegotiationId, by: &str, total: i64) -> AgentMessage {
        AgentMessage::AgentCounter {
            negotiation_id: id.clone(),
            from_agent: user(by),
            proposal: proposal(total),
            reason: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_second_active_negotiation() {
        let (mut engine, _rx) = engine();
        engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap();
        let err = engine
            .create(user("bob"), user("alice"), proposal(200))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AccordError::Negotiation(NegotiationError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn counter_then_accept_keeps_last_proposal() {
        let (mut engine, _rx) = engine();
        let negotiation = engine
            .create(user("alice"), user("bob"), proposal(20_000))
            .unwrap();
        let id = negotiation.id;

        engine.handle_message(&counter(&id, "bob", 15_000));
        let event = engine.handle_message(&AgentMessage::AgentAccept {
            negotiation_id: id.clone(),
            from_agent: user("alice"),
        });

        match event {
            Some(EngineEvent::Agreed(n)) => {
                assert_eq!(n.status, NegotiationStatus::Accepted);
                assert_eq!(n.rounds.len(), 3);
                assert_eq!(n.current_proposal.total_amount, Amount(15_000));
            }
            other => panic!("expected Agreed, got {other:?}"),
        }
        assert!(engine.active().is_none());
    }

    #[tokio::test]
    async fn round_limit_expires_without_appending() {
        let (mut engine, _rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        // Counters alternate until the history holds max_rounds entries.
        let mut event = None;
        for i in 0..5 {
            let by = if i % 2 == 0 { "bob" } else { "alice" };
            event = engine.handle_message(&counter(&id, by, 100 + i));
        }

        match event {
            Some(EngineEvent::Expired(n, ExpiryReason::RoundLimit)) => {
                assert_eq!(n.rounds.len(), 5);
                assert_eq!(n.status, NegotiationStatus::Expired);
            }
            other => panic!("expected round-limit expiry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let (mut engine, _rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        engine.handle_message(&AgentMessage::AgentReject {
            negotiation_id: id.clone(),
            from_agent: user("bob"),
            reason: Some("no".to_string()),
        });

        // A late accept neither transitions nor re-emits.
        let event = engine.handle_message(&AgentMessage::AgentAccept {
            negotiation_id: id.clone(),
            from_agent: user("alice"),
        });
        assert!(event.is_none());
        assert_eq!(
            engine.get(&id).unwrap().status,
            NegotiationStatus::Rejected
        );
    }

    #[tokio::test]
    async fn unknown_negotiation_id_is_ignored() {
        let (mut engine, _rx) = engine();
        engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap();
        let event = engine.handle_message(&counter(&NegotiationId::generate(), "bob", 50));
        assert!(event.is_none());
        assert!(engine.active().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn round_timer_expires_idle_negotiation() {
        let (mut engine, mut rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        tokio::time::sleep(Duration::from_millis(90_001)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Round);

        match engine.handle_timer(&fired) {
            Some(EngineEvent::Expired(n, ExpiryReason::RoundTimeout)) => {
                assert_eq!(n.id, id);
            }
            other => panic!("expected round timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_round_timer() {
        let (mut engine, mut rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        engine.handle_message(&counter(&id, "bob", 90));

        // The original round timer would have fired at t=90s; it was reset.
        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(30_001)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Round);
        assert!(engine.handle_timer(&fired).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_epoch_is_discarded() {
        let (mut engine, mut rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        tokio::time::sleep(Duration::from_millis(90_001)).await;
        let fired = rx.recv().await.unwrap();

        // A counter lands between the firing and its processing.
        engine.handle_message(&counter(&id, "bob", 90));
        assert!(engine.handle_timer(&fired).is_none());
        assert!(engine.active().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_fires_despite_activity() {
        let (mut engine, mut rx) = engine();
        let id = engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap()
            .id;

        // Keep countering every minute so the round timer never fires.
        for i in 0..4 {
            tokio::time::sleep(Duration::from_millis(60_000)).await;
            let by = if i % 2 == 0 { "bob" } else { "alice" };
            engine.handle_message(&counter(&id, by, 100 + i));
        }
        tokio::time::sleep(Duration::from_millis(60_001)).await;

        // Total timer fired at t=300s.
        let mut expired = None;
        while let Ok(fired) = rx.try_recv() {
            if let Some(event) = engine.handle_timer(&fired) {
                expired = Some(event);
            }
        }
        match expired {
            Some(EngineEvent::Expired(_, ExpiryReason::TotalTimeout)) => {}
            other => panic!("expected total timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_left_cancels_active_negotiation() {
        let (mut engine, _rx) = engine();
        engine
            .create(user("alice"), user("bob"), proposal(100))
            .unwrap();
        match engine.cancel(ExpiryReason::PeerLeft) {
            Some(EngineEvent::Expired(_, ExpiryReason::PeerLeft)) => {}
            other => panic!("expected peer-left expiry, got {other:?}"),
        }
        assert!(engine.cancel(ExpiryReason::PeerLeft).is_none());
    }
}
