//! The per-room supervising task.
//!
//! One task owns the room aggregate: members and their agents, the bus, the
//! negotiation engine, the trigger detector, the document store, and the
//! transcript log. Every mutation arrives as a [`RoomEvent`] through the
//! mailbox, which makes state transitions atomic relative to the room.
//! External I/O (LLM, STT, payments, phone) is offloaded to spawned tasks
//! that post their results back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::{self, AgentCommand, AgentHandle};
use crate::agent::tools::ToolContext;
use crate::audio::AudioRelay;
use crate::bus::{AgentMessage, InterAgentBus};
use crate::document::{self, DocumentStore, Party, SignOutcome};
use crate::domain::document::Document;
use crate::domain::ids::{DocumentId, MilestoneId, RoomId, UserId};
use crate::domain::milestone::{MilestoneStatus, VerificationResult};
use crate::domain::money::Amount;
use crate::domain::negotiation::{ExpiryReason, Negotiation};
use crate::domain::now_ms;
use crate::domain::profile::UserProfile;
use crate::domain::proposal::Proposal;
use crate::domain::transcript::TranscriptEntry;
use crate::domain::trigger::TriggerEvent;
use crate::error::{AccordResult, DocumentError, PaymentError, RoomError, VerificationError};
use crate::llm::LlmProvider;
use crate::negotiation::{EngineEvent, NegotiationEngine};
use crate::panel::{ClientPanelMessage, PanelEmitter, ServerPanelMessage};
use crate::payment::bank::BankClient;
use crate::payment::{PaymentExecutor, PaymentRequest};
use crate::phone::PhoneVerifier;
use crate::room::event::{AudioAttachment, EscrowAction, RoomEvent, RoomHandle};
use crate::stt::{self, SpeechToText, SttEvent, SttStreamHandle};
use crate::trigger::{self, SEMANTIC_INTERVAL_MS, TriggerDetector};
use crate::verification::{self, SessionParams};

/// Process-wide collaborators injected into every room.
#[derive(Clone)]
pub struct RoomDeps {
    pub llm: Arc<dyn LlmProvider>,
    pub stt: Arc<dyn SpeechToText>,
    pub payments: Arc<PaymentExecutor>,
    pub phone: Arc<dyn PhoneVerifier>,
    pub bank: Arc<dyn BankClient>,
    pub panels: Arc<PanelEmitter>,
    pub trigger_keyword: String,
    pub semantic_detection: bool,
}

struct Member {
    profile: UserProfile,
    agent: Option<AgentHandle>,
    stt: Option<SttStreamHandle>,
}

/// Spawn a room's supervising task and return its handle.
pub fn spawn(room_id: RoomId, deps: RoomDeps) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle::new(room_id.clone(), tx);

    // Bus observer and negotiation timers feed back through the mailbox.
    let (bus, mut bus_observer) = InterAgentBus::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(message) = bus_observer.recv().await {
                handle.post(RoomEvent::Bus(message));
            }
        });
    }

    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(fired) = timer_rx.recv().await {
                handle.post(RoomEvent::NegotiationTimer(fired));
            }
        });
    }

    let (stt_events_tx, mut stt_events_rx) = mpsc::channel(256);
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some((speaker, event)) = stt_events_rx.recv().await {
                handle.post(RoomEvent::Stt { speaker, event });
            }
        });
    }

    // Semantic classifier heartbeat; dies with the room.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(SEMANTIC_INTERVAL_MS)).await;
                if !handle.try_post(RoomEvent::SemanticTick) {
                    break;
                }
            }
        });
    }

    let supervisor = Supervisor {
        detector: TriggerDetector::new(&deps.trigger_keyword, deps.semantic_detection),
        engine: NegotiationEngine::new(room_id.clone(), timer_tx),
        documents: DocumentStore::new(),
        relay: Arc::new(AudioRelay::new()),
        bus: Arc::new(bus),
        members: HashMap::new(),
        transcripts: Vec::new(),
        verifying: HashSet::new(),
        stt_events_tx,
        handle: handle.clone(),
        room_id,
        deps,
    };
    tokio::spawn(supervisor.run(rx));
    handle
}

struct Supervisor {
    room_id: RoomId,
    deps: RoomDeps,
    handle: RoomHandle,
    bus: Arc<InterAgentBus>,
    engine: NegotiationEngine,
    documents: DocumentStore,
    detector: TriggerDetector,
    relay: Arc<AudioRelay>,
    members: HashMap<UserId, Member>,
    /// Final transcript entries, in emission order.
    transcripts: Vec<TranscriptEntry>,
    /// Milestones with a verification session in flight.
    verifying: HashSet<MilestoneId>,
    stt_events_tx: mpsc::Sender<(UserId, SttEvent)>,
}

impl Supervisor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<RoomEvent>) {
        info!(room = %self.room_id, "room started");
        while let Some(event) = mailbox.recv().await {
            match event {
                RoomEvent::Join {
                    user,
                    profile,
                    reply,
                } => {
                    let _ = reply.send(self.on_join(user, profile));
                }
                RoomEvent::Leave { user } => {
                    self.on_leave(&user);
                    if self.members.is_empty() {
                        break;
                    }
                }
                RoomEvent::Panel { user, message } => self.on_panel(user, message),
                RoomEvent::AttachAudio { user, reply } => {
                    let _ = reply.send(self.on_attach_audio(user));
                }
                RoomEvent::DetachAudio { user } => {
                    self.relay.detach(&user);
                    if let Some(member) = self.members.get_mut(&user) {
                        member.stt = None;
                    }
                }
                RoomEvent::Stt { speaker, event } => self.on_stt(speaker, event),
                RoomEvent::SemanticTick => self.on_semantic_tick(),
                RoomEvent::SemanticResult { batch, outcome } => {
                    if let Some(event) = self.detector.complete_semantic_check(&batch, outcome) {
                        self.fire_trigger(event);
                    }
                }
                RoomEvent::Bus(message) => self.on_bus(message),
                RoomEvent::NegotiationTimer(fired) => {
                    if let Some(event) = self.engine.handle_timer(&fired) {
                        self.on_engine_event(event);
                    }
                }
                RoomEvent::CreateNegotiation {
                    initiator,
                    proposal,
                    reply,
                } => {
                    let _ = reply.send(self.on_create_negotiation(initiator, proposal));
                }
                RoomEvent::DocumentRendered {
                    negotiation,
                    content,
                } => self.on_document_rendered(negotiation, content),
                RoomEvent::HoldPlaced {
                    document_id,
                    milestone_id,
                    outcome,
                } => self.on_hold_placed(document_id, milestone_id, outcome),
                RoomEvent::EscrowSettled {
                    document_id,
                    milestone_id,
                    action,
                    outcome,
                } => self.on_escrow_settled(document_id, milestone_id, action, outcome),
                RoomEvent::VerificationFinished {
                    document_id,
                    milestone_id,
                    result,
                    captured_amount,
                } => self.on_verification_finished(
                    document_id,
                    milestone_id,
                    result,
                    captured_amount,
                ),
                RoomEvent::Shutdown => break,
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        info!(room = %self.room_id, "room tearing down");
        self.engine.destroy();
        for (user, member) in self.members.drain() {
            if let Some(agent) = member.agent {
                agent.stop();
            }
            self.bus.unregister(&user);
            self.deps.panels.unsubscribe(&self.room_id, &user);
        }
    }

    // ============================================================================================
    // Membership
    // ============================================================================================

    fn on_join(&mut self, user: UserId, profile: UserProfile) -> AccordResult<()> {
        if self.members.contains_key(&user) {
            // Reconnect: membership and the profile copied at first join
            // stand; just re-announce.
            self.broadcast_status(None);
            return Ok(());
        }
        if self.members.len() >= 2 {
            return Err(RoomError::RoomFull(self.room_id.to_string()).into());
        }

        info!(room = %self.room_id, %user, "member joined");
        self.deps.panels.subscribe(&self.room_id, &user);
        self.members.insert(
            user,
            Member {
                profile: profile.validated(),
                agent: None,
                stt: None,
            },
        );

        if self.members.len() == 2 {
            self.pair_agents();
        }
        self.broadcast_status(None);
        Ok(())
    }

    /// Build both agent drivers and wire them into the bus. Runs once the
    /// room has its two members; agents live exactly as long as the pairing.
    fn pair_agents(&mut self) {
        let profiles: Vec<UserProfile> =
            self.members.values().map(|m| m.profile.clone()).collect();
        debug_assert_eq!(profiles.len(), 2);

        for own in &profiles {
            let peer = profiles
                .iter()
                .find(|p| p.user_id != own.user_id)
                .expect("two distinct members");
            let inbox = self.bus.register(own.user_id.clone());
            let ctx = ToolContext {
                room: self.handle.clone(),
                bus: self.bus.clone(),
                payments: self.deps.payments.clone(),
                bank: self.deps.bank.clone(),
                panels: self.deps.panels.clone(),
                profile: own.clone(),
                peer_profile: peer.clone(),
            };
            let handle = agent::spawn(self.deps.llm.clone(), ctx, inbox);
            if let Some(member) = self.members.get_mut(&own.user_id) {
                member.agent = Some(handle);
            }
        }
    }

    fn on_leave(&mut self, user: &UserId) {
        let Some(member) = self.members.remove(user) else {
            return;
        };
        info!(room = %self.room_id, %user, "member left");

        if let Some(agent) = member.agent {
            agent.stop();
        }
        drop(member.stt);
        self.bus.unregister(user);
        self.relay.detach(user);
        self.deps.panels.unsubscribe(&self.room_id, user);

        // The remaining agent has no peer; stop it until the room re-pairs.
        for (uid, remaining) in self.members.iter_mut() {
            if let Some(agent) = remaining.agent.take() {
                agent.stop();
            }
            self.bus.unregister(uid);
        }

        if let Some(event) = self.engine.cancel(ExpiryReason::PeerLeft) {
            self.on_engine_event(event);
        }
        self.detector.reset();
        self.broadcast_status(None);
    }

    fn on_attach_audio(&mut self, user: UserId) -> AccordResult<AudioAttachment> {
        let Some(member) = self.members.get_mut(&user) else {
            return Err(RoomError::NotAMember(user.to_string()).into());
        };

        if member.stt.is_none() {
            member.stt = Some(stt::spawn_stream(
                self.deps.stt.clone(),
                user.clone(),
                self.stt_events_tx.clone(),
            ));
        }
        let stt_tx = member
            .stt
            .as_ref()
            .expect("just started")
            .audio_tx
            .clone();
        let speaker_rx = self.relay.attach(user);
        Ok(AudioAttachment {
            stt_tx,
            speaker_rx,
            relay: self.relay.clone(),
        })
    }

    // ============================================================================================
    // Transcription & trigger
    // ============================================================================================

    fn on_stt(&mut self, speaker: UserId, event: SttEvent) {
        let mut entry = if event.is_final {
            TranscriptEntry::final_utterance(speaker, event.text, now_ms())
        } else {
            TranscriptEntry::partial(speaker, event.text, now_ms())
        };
        entry.words = event.words;

        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Transcript {
                entry: entry.clone(),
            },
        );
        if !entry.is_final {
            return;
        }

        self.transcripts.push(entry.clone());

        if let Some(trigger) = self.detector.ingest(&entry) {
            self.fire_trigger(trigger);
            return;
        }
        for member in self.members.values() {
            if let Some(agent) = &member.agent {
                agent.send(AgentCommand::Transcript(entry.clone()));
            }
        }
    }

    fn on_semantic_tick(&mut self) {
        let Some(batch) = self.detector.begin_semantic_check() else {
            return;
        };
        let llm = self.deps.llm.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let outcome = match trigger::classify(llm.as_ref(), &batch).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!(%err, "semantic trigger check failed");
                    None
                }
            };
            handle.post(RoomEvent::SemanticResult { batch, outcome });
        });
    }

    fn fire_trigger(&mut self, event: TriggerEvent) {
        info!(room = %self.room_id, kind = %event.kind, confidence = event.confidence, "trigger fired");
        self.broadcast_status(Some(event.clone()));

        let conversation = self.conversation_text();
        for member in self.members.values() {
            if let Some(agent) = &member.agent {
                agent.send(AgentCommand::Trigger {
                    event: event.clone(),
                    conversation: conversation.clone(),
                });
            }
        }
    }

    // ============================================================================================
    // Negotiation
    // ============================================================================================

    fn on_create_negotiation(
        &mut self,
        initiator: UserId,
        proposal: Proposal,
    ) -> AccordResult<Negotiation> {
        let responder = self
            .members
            .keys()
            .find(|u| **u != initiator)
            .cloned()
            .ok_or_else(|| RoomError::NotAMember("no counterparty present".to_string()))?;

        let negotiation = self.engine.create(initiator, responder, proposal)?;
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Negotiation {
                event: "proposed".to_string(),
                negotiation: negotiation.clone(),
            },
        );
        Ok(negotiation)
    }

    fn on_bus(&mut self, message: AgentMessage) {
        if let Some(event) = self.engine.handle_message(&message) {
            self.on_engine_event(event);
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RoundAdded(negotiation) => {
                self.broadcast_negotiation("countered", negotiation);
            }
            EngineEvent::Agreed(negotiation) => {
                self.broadcast_negotiation("agreed", negotiation.clone());
                self.start_document_generation(negotiation);
            }
            EngineEvent::Rejected(negotiation) => {
                self.broadcast_negotiation("rejected", negotiation);
            }
            EngineEvent::Expired(negotiation, reason) => {
                debug!(room = %self.room_id, ?reason, "negotiation expired");
                self.broadcast_negotiation("expired", negotiation);
            }
        }
    }

    fn broadcast_negotiation(&self, event: &str, negotiation: Negotiation) {
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Negotiation {
                event: event.to_string(),
                negotiation,
            },
        );
    }

    // ============================================================================================
    // Documents
    // ============================================================================================

    fn parties(&self) -> Vec<Party> {
        self.members
            .values()
            .map(|m| Party {
                user_id: m.profile.user_id.clone(),
                display_name: m.profile.display_name.clone(),
            })
            .collect()
    }

    fn start_document_generation(&self, negotiation: Negotiation) {
        let llm = self.deps.llm.clone();
        let handle = self.handle.clone();
        let parties = self.parties();
        let conversation = self.conversation_text();
        tokio::spawn(async move {
            let content =
                document::render_content(llm.as_ref(), &negotiation, &parties, &conversation)
                    .await;
            handle.post(RoomEvent::DocumentRendered {
                negotiation,
                content,
            });
        });
    }

    fn on_document_rendered(&mut self, negotiation: Negotiation, content: AccordResult<String>) {
        let content = match content {
            Ok(content) => content,
            Err(err) => {
                error!(room = %self.room_id, %err, "document generation failed");
                self.broadcast_error("The agreement document could not be generated.");
                return;
            }
        };

        let (provider_id, client_id) = self.provider_client_split(&negotiation);
        let parties = self.parties();
        let document = self
            .documents
            .create(&negotiation, &parties, provider_id, client_id, content)
            .clone();
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Document {
                event: "generated".to_string(),
                document,
            },
        );
    }

    /// Provider is the member whose profile reads as a provider; the
    /// negotiation initiator breaks ties (proposers are providers).
    fn provider_client_split(&self, negotiation: &Negotiation) -> (UserId, UserId) {
        let provider = self
            .members
            .values()
            .find(|m| m.profile.is_provider_role())
            .map(|m| m.profile.user_id.clone())
            .unwrap_or_else(|| negotiation.initiator.clone());
        let client = if provider == negotiation.initiator {
            negotiation.responder.clone()
        } else {
            negotiation.initiator.clone()
        };
        (provider, client)
    }

    // ============================================================================================
    // Panel dispatch
    // ============================================================================================

    fn on_panel(&mut self, user: UserId, message: ClientPanelMessage) {
        let result = match message {
            ClientPanelMessage::SignDocument { document_id } => {
                self.on_sign_document(&user, &document_id)
            }
            ClientPanelMessage::ConfirmMilestone {
                milestone_id,
                document_id,
            } => self.on_confirm_milestone(&user, &document_id, &milestone_id),
            ClientPanelMessage::ProposeMilestoneAmount {
                milestone_id,
                document_id,
                amount,
            } => self.on_propose_amount(&user, &document_id, &milestone_id, amount),
            ClientPanelMessage::ApproveMilestoneAmount {
                milestone_id,
                document_id,
            } => self.on_approve_amount(&user, &document_id, &milestone_id),
            ClientPanelMessage::ReleaseEscrow {
                milestone_id,
                document_id,
            } => self.on_release_escrow(&user, &document_id, &milestone_id),
            ClientPanelMessage::VerifyMilestone {
                document_id,
                milestone_id,
                phone,
                contact_name,
            } => self.on_verify_milestone(&user, document_id, milestone_id, phone, contact_name),
            ClientPanelMessage::SetTriggerKeyword { keyword } => {
                // The latch is untouched: one trigger per room lifetime.
                self.detector.set_keyword(&keyword);
                Ok(())
            }
            // Pre-join messages never reach a room; anything else landing
            // here is a client bug.
            ClientPanelMessage::SetProfile { .. } | ClientPanelMessage::JoinRoom { .. } => {
                debug!(room = %self.room_id, %user, "pre-join message ignored");
                Ok(())
            }
        };

        if let Err(err) = result {
            self.deps.panels.send(
                &user,
                ServerPanelMessage::Error {
                    message: err.to_string(),
                },
            );
        }
    }

    fn on_sign_document(&mut self, user: &UserId, document_id: &DocumentId) -> AccordResult<()> {
        match self.documents.sign(document_id, user)? {
            SignOutcome::FullySigned(document) => {
                self.deps.panels.broadcast(
                    &self.room_id,
                    ServerPanelMessage::Document {
                        event: "completed".to_string(),
                        document: document.clone(),
                    },
                );
                self.execute_signed_document(document);
            }
            SignOutcome::Signed(document) | SignOutcome::AlreadyRecorded(document) => {
                self.deps.panels.broadcast(
                    &self.room_id,
                    ServerPanelMessage::Document {
                        event: "signed".to_string(),
                        document,
                    },
                );
            }
        }
        Ok(())
    }

    /// All parties signed: pay the immediate line items and place one
    /// escrow hold per milestone. Provider calls run offloaded; holds come
    /// back through the mailbox because they mutate milestones.
    fn execute_signed_document(&mut self, document: Document) {
        let Some(payout_account) = self
            .members
            .get(&document.provider_id)
            .and_then(|m| m.profile.payout_account_id.clone())
        else {
            self.broadcast_error("Provider has no payout account; payments skipped.");
            return;
        };

        let currency = document.terms.currency.clone();
        for item in document
            .terms
            .line_items
            .iter()
            .filter(|item| !item.needs_milestone())
        {
            let request = PaymentRequest {
                amount: item.amount,
                currency: currency.clone(),
                recipient_account_id: payout_account.clone(),
                description: item.description.clone(),
            };
            let payments = self.deps.payments.clone();
            let panels = self.deps.panels.clone();
            let room_id = self.room_id.clone();
            tokio::spawn(async move {
                let description = request.description.clone();
                let amount = request.amount;
                let currency = request.currency.to_string();
                let result = payments.execute_payment(request).await;
                let message = if result.success {
                    ServerPanelMessage::PaymentReceipt {
                        description,
                        amount,
                        currency,
                        payment_intent_id: result.payment_intent_id,
                    }
                } else {
                    ServerPanelMessage::Error {
                        message: format!(
                            "Payment '{description}' failed: {}",
                            result.error.unwrap_or_default()
                        ),
                    }
                };
                panels.broadcast(&room_id, message);
            });
        }

        for milestone in &document.milestones {
            let request = PaymentRequest {
                amount: milestone.amount,
                currency: currency.clone(),
                recipient_account_id: payout_account.clone(),
                description: milestone.description.clone(),
            };
            let payments = self.deps.payments.clone();
            let handle = self.handle.clone();
            let document_id = document.id.clone();
            let milestone_id = milestone.id.clone();
            tokio::spawn(async move {
                let outcome = payments.create_escrow_hold(request).await;
                handle.post(RoomEvent::HoldPlaced {
                    document_id,
                    milestone_id,
                    outcome,
                });
            });
        }
    }

    fn on_hold_placed(
        &mut self,
        document_id: DocumentId,
        milestone_id: MilestoneId,
        outcome: AccordResult<crate::domain::escrow::EscrowHold>,
    ) {
        match outcome {
            Ok(hold) => {
                if let Ok(milestone) = self.documents.milestone_mut(&document_id, &milestone_id) {
                    milestone.escrow_hold_id = Some(hold.hold_id.clone());
                    let snapshot = milestone.clone();
                    self.broadcast_milestone("escrow_held", snapshot);
                }
            }
            Err(err) => {
                error!(room = %self.room_id, %err, "escrow hold failed");
                self.broadcast_error(&format!("Escrow hold failed: {err}"));
            }
        }
    }

    fn on_confirm_milestone(
        &mut self,
        user: &UserId,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
    ) -> AccordResult<()> {
        let is_party = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?
            .is_party(user);
        if !is_party {
            return Err(DocumentError::NotAParty(user.to_string()).into());
        }

        let milestone = self.documents.milestone_mut(document_id, milestone_id)?;
        if !milestone.confirmations.contains(user) {
            milestone.confirmations.push(user.clone());
        }
        let snapshot = milestone.clone();
        self.broadcast_milestone("confirmed", snapshot);
        Ok(())
    }

    fn on_propose_amount(
        &mut self,
        user: &UserId,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
        amount: Amount,
    ) -> AccordResult<()> {
        let document = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        if &document.provider_id != user {
            return Err(DocumentError::NotAParty(format!(
                "{user} is not the provider on this document"
            ))
            .into());
        }

        let milestone = self.documents.milestone_mut(document_id, milestone_id)?;
        let (min, max) = milestone.capture_range();
        if amount < min || amount > max {
            return Err(VerificationError::AmountOutOfRange {
                amount: amount.into(),
                min: min.into(),
                max: max.into(),
            }
            .into());
        }
        milestone.proposed_amount = Some(amount);
        let snapshot = milestone.clone();
        self.broadcast_milestone("amount_proposed", snapshot);
        Ok(())
    }

    fn on_approve_amount(
        &mut self,
        user: &UserId,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
    ) -> AccordResult<()> {
        let document = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        if &document.client_id != user {
            return Err(DocumentError::NotAParty(format!(
                "{user} is not the client on this document"
            ))
            .into());
        }

        let milestone = self.documents.milestone(document_id, milestone_id)?;
        let amount = milestone.proposed_amount.ok_or_else(|| {
            PaymentError::InvalidRequest("no proposed amount to approve".to_string())
        })?;
        let hold_id = milestone
            .escrow_hold_id
            .clone()
            .ok_or_else(|| PaymentError::HoldNotFound("milestone has no escrow".to_string()))?;

        let payments = self.deps.payments.clone();
        let handle = self.handle.clone();
        let document_id = document_id.clone();
        let milestone_id = milestone_id.clone();
        tokio::spawn(async move {
            let outcome = payments.capture_escrow(&hold_id, Some(amount)).await;
            handle.post(RoomEvent::EscrowSettled {
                document_id,
                milestone_id,
                action: EscrowAction::CapturedByApproval,
                outcome,
            });
        });
        Ok(())
    }

    fn on_release_escrow(
        &mut self,
        user: &UserId,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
    ) -> AccordResult<()> {
        let document = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        // Voluntary release needs no verification, but only the funds'
        // beneficiary may waive them.
        if &document.provider_id != user {
            return Err(DocumentError::NotAParty(format!(
                "{user} is not the provider on this document"
            ))
            .into());
        }

        let milestone = self.documents.milestone(document_id, milestone_id)?;
        let hold_id = milestone
            .escrow_hold_id
            .clone()
            .ok_or_else(|| PaymentError::HoldNotFound("milestone has no escrow".to_string()))?;

        let payments = self.deps.payments.clone();
        let handle = self.handle.clone();
        let document_id = document_id.clone();
        let milestone_id = milestone_id.clone();
        tokio::spawn(async move {
            let outcome = payments.release_escrow(&hold_id).await;
            handle.post(RoomEvent::EscrowSettled {
                document_id,
                milestone_id,
                action: EscrowAction::ReleasedByProvider,
                outcome,
            });
        });
        Ok(())
    }

    fn on_escrow_settled(
        &mut self,
        document_id: DocumentId,
        milestone_id: MilestoneId,
        action: EscrowAction,
        outcome: AccordResult<crate::domain::escrow::EscrowHold>,
    ) {
        let hold = match outcome {
            Ok(hold) => hold,
            Err(err) => {
                warn!(room = %self.room_id, %err, ?action, "escrow action failed");
                self.broadcast_error(&format!("Escrow action failed: {err}"));
                return;
            }
        };

        let Ok(milestone) = self.documents.milestone_mut(&document_id, &milestone_id) else {
            return;
        };
        match action {
            EscrowAction::CapturedByApproval => {
                // Both parties agreed on the amount; that bilateral approval
                // plays the role of verification for this milestone.
                milestone.status = MilestoneStatus::Completed;
                milestone.captured_amount = hold.captured_amount;
                let snapshot = milestone.clone();
                self.broadcast_milestone("completed", snapshot);
            }
            EscrowAction::ReleasedByProvider => {
                milestone.status = MilestoneStatus::Failed;
                let snapshot = milestone.clone();
                self.broadcast_milestone("released", snapshot);
            }
        }
    }

    // ============================================================================================
    // Verification
    // ============================================================================================

    fn on_verify_milestone(
        &mut self,
        user: &UserId,
        document_id: DocumentId,
        milestone_id: MilestoneId,
        phone: Option<String>,
        contact_name: Option<String>,
    ) -> AccordResult<()> {
        if self.verifying.contains(&milestone_id) {
            return Err(VerificationError::AlreadyRunning(milestone_id.to_string()).into());
        }
        let document = self
            .documents
            .get(&document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        if !document.is_party(user) {
            return Err(DocumentError::NotAParty(user.to_string()).into());
        }
        let notify = document.parties.clone();
        let milestone = self
            .documents
            .milestone(&document_id, &milestone_id)?
            .clone();

        let bank_token = self
            .members
            .get(user)
            .and_then(|m| m.profile.bank_token.clone());

        self.verifying.insert(milestone_id.clone());
        let params = SessionParams {
            document_id: document_id.clone(),
            milestone,
            requested_by: user.clone(),
            notify,
            phone,
            contact_name,
            bank_token,
        };
        let llm = self.deps.llm.clone();
        let payments = self.deps.payments.clone();
        let phone_verifier = self.deps.phone.clone();
        let bank = self.deps.bank.clone();
        let panels = self.deps.panels.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let outcome =
                verification::run_session(llm, payments, phone_verifier, bank, panels, params)
                    .await;
            handle.post(RoomEvent::VerificationFinished {
                document_id,
                milestone_id,
                result: outcome.result,
                captured_amount: outcome.captured_amount,
            });
        });
        Ok(())
    }

    fn on_verification_finished(
        &mut self,
        document_id: DocumentId,
        milestone_id: MilestoneId,
        result: VerificationResult,
        captured_amount: Option<Amount>,
    ) {
        self.verifying.remove(&milestone_id);
        let Ok(milestone) = self.documents.milestone_mut(&document_id, &milestone_id) else {
            return;
        };
        milestone.status = result.status.milestone_status();
        milestone.captured_amount = captured_amount;
        milestone.verification = Some(result);
        let snapshot = milestone.clone();
        self.broadcast_milestone("verified", snapshot);
    }

    // ============================================================================================
    // Helpers
    // ============================================================================================

    fn broadcast_milestone(&self, event: &str, milestone: crate::domain::milestone::Milestone) {
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Milestone {
                event: event.to_string(),
                milestone,
            },
        );
    }

    fn broadcast_error(&self, message: &str) {
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Error {
                message: message.to_string(),
            },
        );
    }

    fn broadcast_status(&self, trigger: Option<TriggerEvent>) {
        self.deps.panels.broadcast(
            &self.room_id,
            ServerPanelMessage::Status {
                room_id: self.room_id.clone(),
                members: self.members.keys().cloned().collect(),
                trigger,
            },
        );
    }

    fn conversation_text(&self) -> String {
        self.transcripts
            .iter()
            .map(|entry| {
                let name = self
                    .members
                    .get(&entry.speaker)
                    .map(|m| m.profile.display_name.clone())
                    .unwrap_or_else(|| entry.speaker.to_string());
                format!("{name}: {}", entry.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
