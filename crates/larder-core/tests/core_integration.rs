#![allow(clippy::unwrap_used, clippy::expect_used)]

use larder_core::wire::{check_payload, to_payload};
use larder_core::*;
use serde_json::{json, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Invocation records survive the wire
// ---------------------------------------------------------------------------

#[test]
fn invocation_serialization_roundtrip() {
    let input = to_payload(&json!({"text": "what can I cook with leeks?"})).unwrap();
    let mut inv = AgentInvocation::new("recipe", input).with_session("S1");
    inv.mark_running();
    inv.succeed(to_payload(&json!({"dishes": ["soup", "tart"]})).unwrap());

    let text = serde_json::to_string(&inv).unwrap();
    let back: AgentInvocation = serde_json::from_str(&text).unwrap();
    assert_eq!(back, inv);
    assert_eq!(back.status, InvocationStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// 2. Errors reduce to descriptors that rebuild the same kind
// ---------------------------------------------------------------------------

#[test]
fn errors_reduce_to_wire_descriptors() {
    let errors = vec![
        LarderError::NotFound("agent 'x'".into()),
        LarderError::Timeout("100ms".into()),
        LarderError::QueueUnavailable("broker down".into()),
        LarderError::Cancelled("session closed".into()),
        LarderError::Agent("no recipes".into()),
    ];
    for err in errors {
        let desc = err.to_descriptor();
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["kind"], err.kind().as_str());
        check_payload(json.as_object().unwrap()).unwrap();
        assert_eq!(desc.into_error().kind(), err.kind());
    }
}

// ---------------------------------------------------------------------------
// 3. Every envelope a server produces is wire-safe
// ---------------------------------------------------------------------------

#[test]
fn server_envelopes_are_wire_safe() {
    let id = Uuid::new_v4();
    let events = vec![
        Envelope::status("S1", id, InvocationStatus::Queued),
        Envelope::status("S1", id, InvocationStatus::Running),
        Envelope::result("S1", id, to_payload(&json!({"text": "ok"})).unwrap()),
        Envelope::error("S1", Some(id), &ErrorDescriptor::new(ErrorKind::Timeout, "slow")),
        Envelope::heartbeat("S1"),
    ];
    for event in events {
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        check_payload(value.as_object().unwrap()).unwrap();
    }
}

// ---------------------------------------------------------------------------
// 4. Delivery reports count every attempt
// ---------------------------------------------------------------------------

#[test]
fn delivery_report_counts() {
    let mut report = DeliveryReport::new("S1");
    report.delivered.push(Uuid::new_v4());
    report.failed.push(FailedDelivery {
        connection_id: Uuid::new_v4(),
        reason: "closed".into(),
    });
    assert_eq!(report.attempted(), 2);
    assert!(!report.all_delivered());
}
