//! Call router: validates and forwards every message a registered device sends.
//!
//! `call_device` checks run in a fixed order: caller registered, then
//! whitelist, then receiver presence. An unauthorized call to an offline
//! device therefore reports `Unauthorized`, never `ReceiverOffline`.
//!
//! Offer, answer and ICE candidates are relayed verbatim, but only between the
//! two participants of a call record (see [`crate::calls`]). Both that binding
//! and the error on an unknown target can be switched off in configuration to
//! get the old unauthenticated, silent-drop behavior.

use crate::RelayState;
use crate::calls::RelaySignal;
use crate::connection::ConnectionHandle;
use crate::lifecycle;
use crate::protocol::{
    CallDevice, CallEndReason, ClientEvent, EndCall, IceCandidate, ServerEvent, WebrtcAnswer,
    WebrtcOffer,
};
use callrelay_common::{RelayError, RelayResult};
use chrono::Utc;

/// Route one parsed client event. Errors are meant for the sender only.
pub async fn dispatch(
    state: &RelayState,
    from: &ConnectionHandle,
    event: ClientEvent,
) -> RelayResult<()> {
    match event {
        ClientEvent::RegisterDevice(req) => lifecycle::on_register(state, from, req).await,
        ClientEvent::CallDevice(req) => call_device(state, from, req).await,
        ClientEvent::WebrtcOffer(req) => relay_offer(state, from, req).await,
        ClientEvent::WebrtcAnswer(req) => relay_answer(state, from, req).await,
        ClientEvent::IceCandidate(req) => relay_ice_candidate(state, from, req).await,
        ClientEvent::EndCall(req) => end_call(state, from, req).await,
    }
}

/// Ring `receiver_id` on behalf of the device registered on `from`.
pub async fn call_device(
    state: &RelayState,
    from: &ConnectionHandle,
    req: CallDevice,
) -> RelayResult<()> {
    let caller_id = state
        .registry
        .lookup_by_connection(from.id())
        .await
        .ok_or(RelayError::CallerNotRegistered)?;

    // A missing receiver id is never on anyone's whitelist
    let receiver_id = req.receiver_id.unwrap_or_default();
    if !state.policy.is_authorized(&caller_id, &receiver_id) {
        tracing::info!(caller = %caller_id, receiver = %receiver_id, "Call request denied");
        return Err(RelayError::Unauthorized);
    }

    let receiver = state
        .registry
        .lookup_by_id(&receiver_id)
        .await
        .ok_or(RelayError::ReceiverOffline)?;

    open_call(state, from, &caller_id, &receiver, &receiver_id).await?;

    // Whitelisted pairs are auto-accepted; the relay never asks for consent
    receiver.send(ServerEvent::IncomingCall {
        caller_id: caller_id.clone(),
        auto_accept: true,
    });

    tracing::info!(caller = %caller_id, receiver = %receiver_id, "Call initiated");
    Ok(())
}

pub async fn relay_offer(
    state: &RelayState,
    from: &ConnectionHandle,
    req: WebrtcOffer,
) -> RelayResult<()> {
    let sender_id = state.registry.lookup_by_connection(from.id()).await;

    // The forwarded caller id is the sender's own registration, not whatever it claims
    if let (Some(sender), Some(claimed)) = (&sender_id, &req.caller_id) {
        if sender != claimed {
            tracing::warn!(sender = %sender, claimed = %claimed, "Offer with spoofed caller id");
            return Err(RelayError::Unauthorized);
        }
    }

    let Some(target) =
        route_relay(state, sender_id.as_deref(), &req.target_id, RelaySignal::Offer).await?
    else {
        return Ok(());
    };

    target.send(ServerEvent::WebrtcOffer {
        offer: req.offer,
        caller_id: sender_id.or(req.caller_id),
    });
    Ok(())
}

pub async fn relay_answer(
    state: &RelayState,
    from: &ConnectionHandle,
    req: WebrtcAnswer,
) -> RelayResult<()> {
    let sender_id = state.registry.lookup_by_connection(from.id()).await;
    let Some(target) =
        route_relay(state, sender_id.as_deref(), &req.target_id, RelaySignal::Answer).await?
    else {
        return Ok(());
    };

    target.send(ServerEvent::WebrtcAnswer { answer: req.answer });
    Ok(())
}

pub async fn relay_ice_candidate(
    state: &RelayState,
    from: &ConnectionHandle,
    req: IceCandidate,
) -> RelayResult<()> {
    let sender_id = state.registry.lookup_by_connection(from.id()).await;
    let Some(target) = route_relay(
        state,
        sender_id.as_deref(),
        &req.target_id,
        RelaySignal::IceCandidate,
    )
    .await?
    else {
        return Ok(());
    };

    target.send(ServerEvent::IceCandidate {
        candidate: req.candidate,
    });
    Ok(())
}

/// Hang up: destroy the call record and tell the peer.
pub async fn end_call(state: &RelayState, from: &ConnectionHandle, req: EndCall) -> RelayResult<()> {
    let sender_id = state
        .registry
        .lookup_by_connection(from.id())
        .await
        .ok_or(RelayError::CallerNotRegistered)?;

    let record = state
        .calls
        .end(&sender_id, &req.peer_id)
        .await
        .ok_or_else(|| RelayError::NoActiveCall {
            peer_id: req.peer_id.clone(),
        })?;

    tracing::info!(device = %sender_id, peer = %req.peer_id, state = %record.state, "Call ended");

    if let Some(peer) = state.registry.lookup_by_id(&req.peer_id).await {
        peer.send(ServerEvent::CallEnded {
            peer_id: sender_id,
            reason: CallEndReason::Hangup,
        });
    }
    Ok(())
}

/// Open the call record, then confirm both endpoints are still the ones looked up.
///
/// Registry and call table are locked separately, so a disconnect can finish
/// between the presence check and `open`. Its `end_all_for` would then have
/// missed the new record; the re-check after `open` removes it instead.
async fn open_call(
    state: &RelayState,
    from: &ConnectionHandle,
    caller_id: &str,
    receiver: &ConnectionHandle,
    receiver_id: &str,
) -> RelayResult<()> {
    if let Some(previous) = state.calls.open(caller_id, receiver_id, Utc::now()).await {
        tracing::debug!(
            caller = %caller_id,
            receiver = %receiver_id,
            previous_state = %previous.state,
            "Replacing earlier call record"
        );
    }

    let caller_present =
        state.registry.lookup_by_connection(from.id()).await.as_deref() == Some(caller_id);
    let receiver_present =
        state.registry.lookup_by_id(receiver_id).await.as_ref() == Some(receiver);
    if caller_present && receiver_present {
        return Ok(());
    }

    state.calls.end(caller_id, receiver_id).await;
    tracing::debug!(
        caller = %caller_id,
        receiver = %receiver_id,
        "Participant left while the call was being opened"
    );
    if caller_present {
        Err(RelayError::ReceiverOffline)
    } else {
        Err(RelayError::CallerNotRegistered)
    }
}

/// Resolve where a relay message goes and whether it may go there at all.
///
/// `Ok(None)` means the message is dropped without telling the sender.
async fn route_relay(
    state: &RelayState,
    sender_id: Option<&str>,
    target_id: &str,
    signal: RelaySignal,
) -> RelayResult<Option<ConnectionHandle>> {
    let settings = &state.settings;

    let bound_sender = match (settings.require_call_record, sender_id) {
        (true, None) => return Err(RelayError::CallerNotRegistered),
        (true, Some(sender)) => Some(sender),
        (false, _) => None,
    };

    let Some(target) = state.registry.lookup_by_id(target_id).await else {
        if settings.report_unknown_target {
            return Err(RelayError::UnknownRelayTarget {
                target_id: target_id.to_string(),
            });
        }
        tracing::debug!(target_id = %target_id, ?signal, "Dropping relay to unknown target");
        return Ok(None);
    };

    if let Some(sender) = bound_sender {
        state.calls.apply_signal(sender, target_id, signal).await?;
    }

    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallState;
    use crate::policy::Whitelist;
    use crate::protocol::RegisterDevice;
    use callrelay_common::config::{AllowRule, RelaySettings};
    use serde_json::value::RawValue;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Inbox = UnboundedReceiver<ServerEvent>;

    fn relay(settings: RelaySettings) -> RelayState {
        let rules = vec![
            AllowRule {
                caller: "A".into(),
                receivers: vec!["B".into()],
            },
            AllowRule {
                caller: "B".into(),
                receivers: vec!["A".into()],
            },
        ];
        RelayState::new(Whitelist::from_rules(&rules, false), settings).unwrap()
    }

    async fn device(state: &RelayState, id: &str) -> (ConnectionHandle, Inbox) {
        let (conn, mut rx) = ConnectionHandle::open();
        lifecycle::on_register(
            state,
            &conn,
            RegisterDevice {
                device_id: Some(id.into()),
            },
        )
        .await
        .unwrap();
        rx.try_recv().unwrap();
        (conn, rx)
    }

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    fn call(receiver: &str) -> CallDevice {
        CallDevice {
            receiver_id: Some(receiver.into()),
        }
    }

    fn offer(target: &str, caller: Option<&str>) -> WebrtcOffer {
        WebrtcOffer {
            target_id: target.into(),
            caller_id: caller.map(str::to_string),
            offer: raw(r#"{"sdp":"v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n","type":"offer"}"#),
        }
    }

    fn answer(target: &str, json: &str) -> WebrtcAnswer {
        WebrtcAnswer {
            target_id: target.into(),
            answer: raw(json),
        }
    }

    fn candidate(target: &str) -> IceCandidate {
        IceCandidate {
            target_id: target.into(),
            candidate: raw(r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host"}"#),
        }
    }

    #[tokio::test]
    async fn unregistered_caller_is_rejected_first() {
        let state = relay(RelaySettings::default());
        let (_b, mut rb) = device(&state, "B").await;
        let (anon, _ra) = ConnectionHandle::open();

        let err = call_device(&state, &anon, call("B")).await.unwrap_err();
        assert!(matches!(err, RelayError::CallerNotRegistered));

        // Same answer when the target is neither whitelisted nor online
        let err = call_device(&state, &anon, call("nobody")).await.unwrap_err();
        assert!(matches!(err, RelayError::CallerNotRegistered));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn unauthorized_wins_over_offline() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (_c, mut rc) = device(&state, "C").await;

        // C is online but not whitelisted
        let err = call_device(&state, &a, call("C")).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));
        assert!(rc.try_recv().is_err());

        // D is offline and not whitelisted
        let err = call_device(&state, &a, call("D")).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));

        // Missing receiver id
        let err = call_device(&state, &a, CallDevice { receiver_id: None })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));
    }

    #[tokio::test]
    async fn whitelisted_offline_receiver_is_offline() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;

        let err = call_device(&state, &a, call("B")).await.unwrap_err();
        assert!(matches!(err, RelayError::ReceiverOffline));
        assert!(state.calls.is_empty().await);
    }

    #[tokio::test]
    async fn receiver_leaving_while_call_opens_leaves_no_record() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (b, _rb) = device(&state, "B").await;

        // B is looked up, then disconnects before the record exists
        lifecycle::on_disconnect(&state, &b).await;

        let err = open_call(&state, &a, "A", &b, "B").await.unwrap_err();
        assert!(matches!(err, RelayError::ReceiverOffline));
        assert!(state.calls.is_empty().await);
    }

    #[tokio::test]
    async fn replaced_receiver_connection_is_not_rung() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (stale_b, _rb) = device(&state, "B").await;
        let (_fresh_b, _rb2) = device(&state, "B").await;

        let err = open_call(&state, &a, "A", &stale_b, "B").await.unwrap_err();
        assert!(matches!(err, RelayError::ReceiverOffline));
        assert!(state.calls.get("A", "B").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_disconnect_never_strands_a_call_record() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;

        for _ in 0..200 {
            let (b, _rb) = device(&state, "B").await;

            let ring = tokio::spawn({
                let state = state.clone();
                let a = a.clone();
                async move { call_device(&state, &a, call("B")).await }
            });
            let hang_up = tokio::spawn({
                let state = state.clone();
                async move { lifecycle::on_disconnect(&state, &b).await }
            });
            let _ = ring.await.unwrap();
            hang_up.await.unwrap();

            assert!(state.registry.lookup_by_id("B").await.is_none());
            assert!(state.calls.get("A", "B").await.is_none());
        }
    }

    #[tokio::test]
    async fn whitelisted_call_rings_receiver_once() {
        let state = relay(RelaySettings::default());
        let (a, mut ra) = device(&state, "A").await;
        let (_b, mut rb) = device(&state, "B").await;

        call_device(&state, &a, call("B")).await.unwrap();

        match rb.try_recv() {
            Ok(ServerEvent::IncomingCall {
                caller_id,
                auto_accept,
            }) => {
                assert_eq!(caller_id, "A");
                assert!(auto_accept);
            }
            other => panic!("expected IncomingCall, got {other:?}"),
        }
        assert!(rb.try_recv().is_err());
        assert!(ra.try_recv().is_err());
        assert_eq!(
            state.calls.get("A", "B").await.unwrap().state,
            CallState::CallRequested
        );
    }

    #[tokio::test]
    async fn offer_answer_round_trip_is_byte_identical() {
        let state = relay(RelaySettings::default());
        let (a, mut ra) = device(&state, "A").await;
        let (b, mut rb) = device(&state, "B").await;
        call_device(&state, &a, call("B")).await.unwrap();
        rb.try_recv().unwrap();

        relay_offer(&state, &a, offer("B", Some("A"))).await.unwrap();
        match rb.try_recv() {
            Ok(ServerEvent::WebrtcOffer { offer, caller_id }) => {
                assert_eq!(caller_id.as_deref(), Some("A"));
                assert_eq!(
                    offer.get(),
                    r#"{"sdp":"v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n","type":"offer"}"#
                );
            }
            other => panic!("expected WebrtcOffer, got {other:?}"),
        }

        let sent = r#"{ "type" : "answer", "sdp" : "v=0\r\na=ice-ufrag:Xy9" }"#;
        relay_answer(&state, &b, answer("A", sent)).await.unwrap();
        match ra.try_recv() {
            Ok(ServerEvent::WebrtcAnswer { answer }) => assert_eq!(answer.get(), sent),
            other => panic!("expected WebrtcAnswer, got {other:?}"),
        }

        relay_ice_candidate(&state, &a, candidate("B")).await.unwrap();
        assert!(matches!(rb.try_recv(), Ok(ServerEvent::IceCandidate { .. })));
        assert_eq!(state.calls.get("A", "B").await.unwrap().state, CallState::Active);
    }

    #[tokio::test]
    async fn unknown_target_is_reported() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;

        let err = relay_offer(&state, &a, offer("ghost", None)).await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownRelayTarget { ref target_id } if target_id == "ghost"));
    }

    #[tokio::test]
    async fn unknown_target_can_be_dropped_silently() {
        let state = relay(RelaySettings {
            report_unknown_target: false,
            ..RelaySettings::default()
        });
        let (a, mut ra) = device(&state, "A").await;

        relay_offer(&state, &a, offer("ghost", None)).await.unwrap();
        relay_answer(&state, &a, answer("ghost", "{}")).await.unwrap();
        relay_ice_candidate(&state, &a, candidate("ghost")).await.unwrap();
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_outside_call_record_is_rejected() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (_b, mut rb) = device(&state, "B").await;
        let (c, _rc) = device(&state, "C").await;
        call_device(&state, &a, call("B")).await.unwrap();
        rb.try_recv().unwrap();

        // C is not part of the A/B call
        let err = relay_ice_candidate(&state, &c, candidate("B")).await.unwrap_err();
        assert!(matches!(err, RelayError::NoActiveCall { .. }));
        let err = relay_offer(&state, &c, offer("B", None)).await.unwrap_err();
        assert!(matches!(err, RelayError::NoActiveCall { .. }));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_sender_cannot_relay() {
        let state = relay(RelaySettings::default());
        let (_b, mut rb) = device(&state, "B").await;
        let (anon, _rx) = ConnectionHandle::open();

        let err = relay_offer(&state, &anon, offer("B", Some("A"))).await.unwrap_err();
        assert!(matches!(err, RelayError::CallerNotRegistered));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn legacy_mode_relays_without_call_record() {
        let state = relay(RelaySettings {
            require_call_record: false,
            ..RelaySettings::default()
        });
        let (_b, mut rb) = device(&state, "B").await;
        let (anon, _rx) = ConnectionHandle::open();

        relay_offer(&state, &anon, offer("B", Some("A"))).await.unwrap();
        match rb.try_recv() {
            Ok(ServerEvent::WebrtcOffer { caller_id, .. }) => {
                assert_eq!(caller_id.as_deref(), Some("A"));
            }
            other => panic!("expected WebrtcOffer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spoofed_caller_id_is_rejected() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (_b, mut rb) = device(&state, "B").await;
        call_device(&state, &a, call("B")).await.unwrap();
        rb.try_recv().unwrap();

        let err = relay_offer(&state, &a, offer("B", Some("B"))).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn answer_before_offer_is_out_of_order() {
        let state = relay(RelaySettings::default());
        let (a, mut ra) = device(&state, "A").await;
        let (b, mut rb) = device(&state, "B").await;
        call_device(&state, &a, call("B")).await.unwrap();
        rb.try_recv().unwrap();

        let err = relay_answer(&state, &b, answer("A", "{}")).await.unwrap_err();
        assert!(matches!(err, RelayError::UnexpectedSignal { .. }));
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_call_notifies_peer_and_closes_record() {
        let state = relay(RelaySettings::default());
        let (a, _ra) = device(&state, "A").await;
        let (b, mut rb) = device(&state, "B").await;
        call_device(&state, &a, call("B")).await.unwrap();
        rb.try_recv().unwrap();

        end_call(&state, &a, EndCall { peer_id: "B".into() }).await.unwrap();
        match rb.try_recv() {
            Ok(ServerEvent::CallEnded { peer_id, reason }) => {
                assert_eq!(peer_id, "A");
                assert_eq!(reason, CallEndReason::Hangup);
            }
            other => panic!("expected CallEnded, got {other:?}"),
        }

        let err = relay_ice_candidate(&state, &b, candidate("A")).await.unwrap_err();
        assert!(matches!(err, RelayError::NoActiveCall { .. }));

        let err = end_call(&state, &a, EndCall { peer_id: "B".into() }).await.unwrap_err();
        assert!(matches!(err, RelayError::NoActiveCall { .. }));
    }

    #[tokio::test]
    async fn dispatch_routes_registration() {
        let state = relay(RelaySettings::default());
        let (conn, mut rx) = ConnectionHandle::open();
        let event =
            ClientEvent::parse(r#"{"event":"register_device","data":{"device_id":"A"}}"#).unwrap();

        dispatch(&state, &conn, event).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Registered { .. })));
        assert_eq!(state.registry.lookup_by_connection(conn.id()).await.as_deref(), Some("A"));
    }
}
