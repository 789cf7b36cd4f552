//! Room-level scenarios: keyword trigger, agent-driven proposal flow,
//! document generation, signing, and the payments that follow.

mod common;

use std::sync::Arc;

use serde_json::json;

use accord::domain::ids::RoomId;
use accord::domain::money::Amount;
use accord::panel::{ClientPanelMessage, PanelEmitter, ServerPanelMessage};
use accord::payment::PaymentExecutor;
use accord::payment::bank::UnconfiguredBank;
use accord::phone::SimulatedPhone;
use accord::room::{RoomEvent, supervisor};
use accord::stt::{SttEvent, UnconfiguredStt};
use accord::{ChatRequest, ChatResponse, LlmProvider};

use common::*;

fn deps(
    llm: Arc<dyn LlmProvider>,
    provider: Arc<FakePaymentProvider>,
    panels: Arc<PanelEmitter>,
) -> supervisor::RoomDeps {
    supervisor::RoomDeps {
        llm,
        stt: Arc::new(UnconfiguredStt),
        payments: Arc::new(PaymentExecutor::new(provider)),
        phone: Arc::new(SimulatedPhone),
        bank: Arc::new(UnconfiguredBank),
        panels,
        trigger_keyword: "handshake".to_string(),
        semantic_detection: true,
    }
}

fn final_utterance(text: &str) -> SttEvent {
    SttEvent {
        text: text.to_string(),
        is_final: true,
        words: Vec::new(),
    }
}

/// Router for the happy path: Alice's agent proposes labour + escrowed
/// parts, Bob's agent accepts, the document model renders Markdown.
fn happy_path_router(request: &ChatRequest) -> ChatResponse {
    if request.system.contains("legally-styled") {
        return end_turn("# Boiler Repair Agreement\n\nParties agree as follows.");
    }
    if request.system.contains("strict JSON") {
        return end_turn(r#"{"triggered": false, "confidence": 0.0}"#);
    }
    if last_is_tool_result(request) {
        return end_turn("done");
    }

    let last = last_text(request);
    if request.system.contains("provides the work") && last.contains("AGREEMENT DETECTED") {
        return tool_use(
            "analyze_and_propose",
            json!({
                "summary": "Boiler repair",
                "lineItems": [
                    {"description": "Labour", "amount": 15000, "type": "immediate"},
                    {"description": "Parts", "amount": 5000, "type": "escrow",
                     "condition": "parts installed and working"}
                ],
                "currency": "GBP"
            }),
        );
    }
    if request.system.contains("pays for the work") && last.contains("agent_proposal") {
        let payload = embedded_json(&last).expect("proposal payload");
        return tool_use(
            "evaluate_proposal",
            json!({
                "negotiationId": payload["negotiation_id"],
                "decision": "accept"
            }),
        );
    }
    end_turn("listening")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_negotiation_to_payments() {
    let panels = Arc::new(PanelEmitter::new());
    let provider = FakePaymentProvider::new();
    let llm = ScriptedLlm::new(happy_path_router);
    let room = supervisor::spawn(
        RoomId::parse("room-1").unwrap(),
        deps(llm, provider.clone(), panels.clone()),
    );

    let mut alice_rx = panels.register(user("alice"));
    let mut bob_rx = panels.register(user("bob"));

    room.join(user("alice"), provider_profile("alice", "Alice"))
        .await
        .unwrap();
    room.join(user("bob"), client_profile("bob", "Bob"))
        .await
        .unwrap();

    // Some context, then the keyword.
    room.post(RoomEvent::Stt {
        speaker: user("bob"),
        event: final_utterance("my boiler is broken, can you fix it for 200 quid"),
    });
    room.post(RoomEvent::Stt {
        speaker: user("alice"),
        event: final_utterance("deal, let's handshake on it"),
    });

    // Negotiation: proposed, then accepted without counters.
    let agreed = await_panel(&mut alice_rx, |m| {
        matches!(m, ServerPanelMessage::Negotiation { event, .. } if event == "agreed")
    })
    .await;
    let negotiation = match agreed {
        ServerPanelMessage::Negotiation { negotiation, .. } => negotiation,
        _ => unreachable!(),
    };
    assert_eq!(negotiation.current_proposal.total_amount, Amount(20_000));
    assert_eq!(negotiation.rounds.len(), 2);

    // Document generated with one milestone, for the escrowed parts.
    let generated = await_panel(&mut bob_rx, |m| {
        matches!(m, ServerPanelMessage::Document { event, .. } if event == "generated")
    })
    .await;
    let document = match generated {
        ServerPanelMessage::Document { document, .. } => document,
        _ => unreachable!(),
    };
    assert_eq!(document.milestones.len(), 1);
    assert_eq!(document.milestones[0].description, "Parts");
    assert_eq!(document.milestones[0].amount, Amount(5_000));
    assert_eq!(document.provider_id, user("alice"));
    assert_eq!(document.client_id, user("bob"));

    // Both sign; the quorum completes.
    room.post(RoomEvent::Panel {
        user: user("alice"),
        message: ClientPanelMessage::SignDocument {
            document_id: document.id.clone(),
        },
    });
    room.post(RoomEvent::Panel {
        user: user("bob"),
        message: ClientPanelMessage::SignDocument {
            document_id: document.id.clone(),
        },
    });
    await_panel(&mut alice_rx, |m| {
        matches!(m, ServerPanelMessage::Document { event, .. } if event == "completed")
    })
    .await;

    // One immediate payment and one escrow hold follow. The two broadcasts
    // race, so each is awaited on its own receiver.
    let receipt = await_panel(&mut bob_rx, |m| {
        matches!(m, ServerPanelMessage::PaymentReceipt { .. })
    })
    .await;
    match receipt {
        ServerPanelMessage::PaymentReceipt { amount, .. } => assert_eq!(amount, Amount(15_000)),
        _ => unreachable!(),
    }
    let held = await_panel(&mut alice_rx, |m| {
        matches!(m, ServerPanelMessage::Milestone { event, .. } if event == "escrow_held")
    })
    .await;
    match held {
        ServerPanelMessage::Milestone { milestone, .. } => {
            assert!(milestone.escrow_hold_id.is_some());
        }
        _ => unreachable!(),
    }

    let calls = provider.calls();
    assert!(calls.contains(&ProviderCall::Confirmed { amount: 15_000 }));
    assert!(calls.contains(&ProviderCall::ManualCapture { amount: 5_000 }));
}

/// Router for counter-then-accept: Alice opens at 20 000, Bob counters at
/// 15 000 with a reason, Alice accepts the counter.
fn counter_router(request: &ChatRequest) -> ChatResponse {
    if request.system.contains("legally-styled") {
        return end_turn("# Agreement");
    }
    if request.system.contains("strict JSON") {
        return end_turn(r#"{"triggered": false, "confidence": 0.0}"#);
    }
    if last_is_tool_result(request) {
        return end_turn("done");
    }

    let last = last_text(request);
    if request.system.contains("provides the work") {
        if last.contains("AGREEMENT DETECTED") {
            return tool_use(
                "analyze_and_propose",
                json!({
                    "summary": "Garden wall",
                    "lineItems": [{"description": "Build wall", "amount": 20000, "type": "immediate"}],
                    "currency": "GBP"
                }),
            );
        }
        if last.contains("agent_counter") {
            let payload = embedded_json(&last).expect("counter payload");
            return tool_use(
                "evaluate_proposal",
                json!({
                    "negotiationId": payload["negotiation_id"],
                    "decision": "accept"
                }),
            );
        }
    }
    if request.system.contains("pays for the work") && last.contains("agent_proposal") {
        let payload = embedded_json(&last).expect("proposal payload");
        return tool_use(
            "evaluate_proposal",
            json!({
                "negotiationId": payload["negotiation_id"],
                "decision": "counter",
                "reason": "Too high",
                "counterProposal": {
                    "summary": "Garden wall",
                    "lineItems": [{"description": "Build wall", "amount": 15000, "type": "immediate"}],
                    "currency": "GBP"
                }
            }),
        );
    }
    end_turn("listening")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counter_then_accept_settles_on_countered_amount() {
    let panels = Arc::new(PanelEmitter::new());
    let provider = FakePaymentProvider::new();
    let llm = ScriptedLlm::new(counter_router);
    let room = supervisor::spawn(
        RoomId::parse("room-2").unwrap(),
        deps(llm, provider, panels.clone()),
    );

    let mut alice_rx = panels.register(user("alice"));

    room.join(user("alice"), provider_profile("alice", "Alice"))
        .await
        .unwrap();
    room.join(user("bob"), client_profile("bob", "Bob"))
        .await
        .unwrap();

    room.post(RoomEvent::Stt {
        speaker: user("alice"),
        event: final_utterance("handshake"),
    });

    let agreed = await_panel(&mut alice_rx, |m| {
        matches!(m, ServerPanelMessage::Negotiation { event, .. } if event == "agreed")
    })
    .await;
    let negotiation = match agreed {
        ServerPanelMessage::Negotiation { negotiation, .. } => negotiation,
        _ => unreachable!(),
    };

    // propose, counter, accept.
    assert_eq!(negotiation.rounds.len(), 3);
    assert_eq!(negotiation.current_proposal.total_amount, Amount(15_000));
    assert_eq!(
        negotiation.rounds[1].reason.as_deref(),
        Some("Too high")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn third_member_is_refused() {
    let panels = Arc::new(PanelEmitter::new());
    let llm = ScriptedLlm::new(|_| end_turn("idle"));
    let room = supervisor::spawn(
        RoomId::parse("room-3").unwrap(),
        deps(llm, FakePaymentProvider::new(), panels),
    );

    room.join(user("alice"), provider_profile("alice", "Alice"))
        .await
        .unwrap();
    room.join(user("bob"), client_profile("bob", "Bob"))
        .await
        .unwrap();
    let err = room
        .join(user("mallory"), client_profile("mallory", "Mallory"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("full"));
}
