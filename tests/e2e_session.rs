//! End-to-end session negotiation tests.
//!
//! Two sessions exchange real requests and responses through the `Pair`
//! fixture, covering the offer/answer flow, batching, transport replacement,
//! termination and the error paths.

mod common;

use std::sync::Arc;

use common::{context, context_with, Pair, Side, ECHO_NS, SID};
use jingle::application::file_transfer::sha256_base64;
use jingle::application::{ApplicationRegistry, FileMeta, FileTransfer, FileTransferFactory};
use jingle::config::{IbbConfig, SessionConfig};
use jingle::driver::Envelope;
use jingle::protocol::{
    Action, ApplicationState, Condition, ContentElement, ContentKey, DescriptionElement,
    ErrorCondition, JingleRequest, Origin, PendingTransportReplace, Reason, SessionContext,
    SessionEvent, SessionState, TransportElement, TransportState,
};
use jingle::transport::{IbbTransportFactory, TransportRegistry, IBB_NS};
use jingle::{Description, JingleError};
use proptest::prelude::*;
use serde_json::json;

fn ibb_offer(sid: &str) -> TransportElement {
    TransportElement::new(IBB_NS, json!({ "sid": sid, "block-size": 4096 }))
}

fn peer_content(name: &str, description: DescriptionElement, transport: TransportElement) -> ContentElement {
    ContentElement::new(&ContentKey::new(name, Origin::Initiator))
        .with_senders(Origin::Initiator)
        .with_description(description)
        .with_transport(transport)
}

#[test]
fn test_initiate_sends_single_session_initiate() {
    let mut pair = Pair::new(&context());
    let key = pair.offer_file("ft", b"payload");
    pair.alice.initiate().unwrap();
    assert_eq!(pair.alice.state(), SessionState::ApprovedToSend);

    pair.flush();
    assert_eq!(pair.actions(Side::Alice), vec![Action::SessionInitiate]);
    let request = &pair.log[0].1;
    assert_eq!(request.contents.len(), 1);
    assert_eq!(request.contents[0].key(), key);
    assert!(request.contents[0].description.is_some());
    assert_eq!(request.contents[0].transport.as_ref().map(|t| t.namespace.as_str()), Some(IBB_NS));
    assert_eq!(pair.alice.state(), SessionState::Unacked);

    assert!(pair.deliver(Side::Bob));
    assert!(pair.deliver(Side::Alice));
    assert_eq!(pair.alice.state(), SessionState::Pending);
    assert_eq!(
        pair.alice.content_by_key(&key).map(|c| c.state()),
        Some(ApplicationState::Pending)
    );
    assert!(pair.events(Side::Alice).contains(&SessionEvent::Initiated));
}

#[test]
fn test_accept_sends_single_session_accept_and_starts_content() {
    let mut pair = Pair::new(&context());
    pair.offer_file("ft", b"payload");
    pair.alice.initiate().unwrap();
    pair.run();

    let key = ContentKey::new("ft", Origin::Initiator);
    assert_eq!(pair.bob.state(), SessionState::Created);
    assert_eq!(
        pair.bob.content("ft", Origin::Initiator).map(|c| c.state()),
        Some(ApplicationState::Pending)
    );
    assert!(pair
        .events(Side::Bob)
        .contains(&SessionEvent::NewContentReceived(vec![key.clone()])));

    pair.bob.accept().unwrap();
    pair.flush();
    assert_eq!(pair.actions(Side::Bob), vec![Action::SessionAccept]);
    let accept = &pair.log.last().unwrap().1;
    assert_eq!(accept.contents.len(), 1);
    assert_eq!(accept.contents[0].key(), key);

    assert!(pair.deliver(Side::Alice));
    assert!(pair.deliver(Side::Bob));
    assert_eq!(pair.bob.state(), SessionState::Active);
    let content = pair.bob.content_by_key(&key).unwrap();
    assert!(content.state() >= ApplicationState::Connecting);
    assert_eq!(content.transport().map(|t| t.state()), Some(TransportState::Active));

    pair.run();
    assert_eq!(pair.alice.state(), SessionState::Active);
    for session in [&pair.alice, &pair.bob] {
        assert_eq!(session.content_by_key(&key).map(|c| c.state()), Some(ApplicationState::Active));
    }
    assert!(pair.events(Side::Bob).contains(&SessionEvent::ContentActive(key.clone())));
    assert!(pair.events(Side::Alice).contains(&SessionEvent::Activated));
    assert!(pair.errors.is_empty());
}

#[test]
fn test_checksum_delivered_as_description_info() {
    let (pair, keys) = Pair::establish(&context(), &["ft"]);
    assert!(pair.actions(Side::Alice).contains(&Action::DescriptionInfo));

    let received = pair
        .bob
        .content_by_key(&keys[0])
        .and_then(|c| c.description_as::<FileTransfer>())
        .and_then(|ft| ft.received_checksum().map(str::to_string));
    assert_eq!(received, Some(sha256_base64(b"ft")));
    assert_eq!(pair.bob.content_by_key(&keys[0]).and_then(|c| c.block_size()), Some(4096));
}

#[test]
fn test_failed_transport_is_replaced_by_next_candidate() {
    let (mut pair, keys) = Pair::establish(&context(), &["ft"]);
    let key = &keys[0];

    let app = pair.alice.content_mut(key).unwrap();
    app.transport_mut().unwrap().stop(Some(Reason::new(Condition::Success)));
    assert_eq!(app.evaluate_outgoing_update().action, Action::TransportReplace);
    app.notify_updated();

    let before = pair.log.len();
    pair.flush();
    let (side, replace) = &pair.log[before];
    assert_eq!(*side, Side::Alice);
    assert_eq!(replace.action, Action::TransportReplace);
    assert_eq!(replace.reason.as_ref().map(|r| r.condition), Some(Condition::Success));
    assert_eq!(replace.contents[0].transport.as_ref().map(|t| t.namespace.as_str()), Some(ECHO_NS));

    assert!(pair.deliver(Side::Bob));
    assert!(pair.deliver(Side::Alice));
    let app = pair.alice.content_by_key(key).unwrap();
    assert_eq!(app.pending_transport_replace(), PendingTransportReplace::InProgress);
    let transport = app.transport().unwrap();
    assert_eq!(transport.namespace(), ECHO_NS);
    // Pending already, not Created: the replacement is prepared when it is
    // installed, before the transport-replace is acknowledged, because the
    // offer carries its parameters.
    assert_eq!(transport.state(), TransportState::Pending);

    pair.run();
    assert!(pair.actions(Side::Bob).contains(&Action::TransportAccept));
    for session in [&pair.alice, &pair.bob] {
        let app = session.content_by_key(key).unwrap();
        assert_eq!(app.state(), ApplicationState::Active);
        assert_eq!(app.pending_transport_replace(), PendingTransportReplace::None);
        assert_eq!(app.transport().map(|t| t.namespace()), Some(ECHO_NS));
        assert_eq!(app.transport().map(|t| t.creator()), Some(Origin::Initiator));
    }
    assert!(pair.errors.is_empty());
}

#[test]
fn test_terminate_waits_for_in_flight_request() {
    let (mut pair, keys) = Pair::establish(&context(), &["ft", "more"]);
    pair.alice.send_ping().unwrap();
    pair.flush();
    assert_eq!(pair.log.last().map(|(_, r)| r.action), Some(Action::SessionInfo));
    assert!(pair.alice.has_request_in_flight());
    let before = pair.log.len();

    pair.alice.remove_content(&keys[0], Reason::new(Condition::Cancel)).unwrap();
    pair.alice.terminate(Reason::with_text(Condition::Success, "done"));
    assert_eq!(pair.alice.state(), SessionState::Finishing);
    pair.flush();
    assert_eq!(pair.log.len(), before);

    pair.run();
    let after: Vec<Action> = pair.log[before..]
        .iter()
        .filter(|(side, _)| *side == Side::Alice)
        .map(|(_, r)| r.action)
        .collect();
    assert_eq!(after, vec![Action::SessionTerminate]);

    assert!(pair.alice.is_finished());
    assert!(pair.alice.contents().all(|c| c.state() == ApplicationState::Finished));
    assert!(pair.bob.is_finished());
    assert_eq!(
        pair.bob.termination_reason(),
        Some(&Reason::with_text(Condition::Success, "done"))
    );
}

#[test]
fn test_one_action_kind_per_request() {
    let ctx = context_with(&[ECHO_NS], true, SessionConfig::default());
    let mut pair = Pair::new(&ctx);
    let a = pair.offer_meta(FileMeta::new("a", 3));
    pair.alice.initiate().unwrap();
    pair.run();
    pair.bob.accept().unwrap();
    pair.flush();

    // session-accept starts "a", whose transport then has a transport-info ready
    assert!(pair.deliver(Side::Alice));
    let b = pair.offer_meta(FileMeta::new("b", 3));

    let first = pair.alice.poll_transmit().unwrap();
    assert_eq!(first.request.action, Action::ContentAdd);
    let keys: Vec<ContentKey> = first.request.contents.iter().map(|c| c.key()).collect();
    assert_eq!(keys, vec![b.clone()]);
    assert!(pair.alice.poll_transmit().is_none());

    // queued behind alice's ack of the session-accept
    pair.forward(Side::Alice, first);
    assert!(pair.deliver(Side::Bob));
    assert!(pair.deliver(Side::Bob));
    assert!(pair.deliver(Side::Alice));

    let second = pair.alice.poll_transmit().unwrap();
    assert_eq!(second.request.action, Action::TransportInfo);
    let keys: Vec<ContentKey> = second.request.contents.iter().map(|c| c.key()).collect();
    assert_eq!(keys, vec![a]);
}

#[test]
fn test_unsupported_content_rejected_valid_one_kept() {
    let (mut pair, _) = Pair::establish(&context(), &["ft"]);
    let unknown = peer_content(
        "x",
        DescriptionElement::new("urn:test:apps:unknown", json!({})),
        ibb_offer("x1"),
    );
    let valid = peer_content(
        "y",
        FileTransfer::offer(FileMeta::new("y.bin", 10)).to_element(),
        ibb_offer("y1"),
    );
    let request = JingleRequest::new(Action::ContentAdd, SID).with_contents(vec![unknown, valid]);
    pair.bob.handle_request(&request).unwrap();

    assert!(pair.bob.content("x", Origin::Initiator).is_none());
    assert_eq!(
        pair.bob.content("y", Origin::Initiator).map(|c| c.state()),
        Some(ApplicationState::Pending)
    );

    let reject = pair.bob.poll_transmit().unwrap().request;
    assert_eq!(reject.action, Action::ContentReject);
    assert_eq!(reject.contents[0].key(), ContentKey::new("x", Origin::Initiator));
    assert_eq!(reject.reason.map(|r| r.condition), Some(Condition::UnsupportedApplications));
    assert!(pair
        .events(Side::Bob)
        .contains(&SessionEvent::NewContentReceived(vec![ContentKey::new("y", Origin::Initiator)])));
}

#[test]
fn test_duplicate_offer_keeps_preferred_transport() {
    let (mut pair, _) = Pair::establish(&context(), &["ft"]);
    let description = FileTransfer::offer(FileMeta::new("z.bin", 1)).to_element();
    let echo = peer_content("z", description.clone(), TransportElement::new(ECHO_NS, json!({})));
    let ibb = peer_content("z", description, ibb_offer("z1"));
    let request = JingleRequest::new(Action::ContentAdd, SID).with_contents(vec![echo, ibb]);
    pair.bob.handle_request(&request).unwrap();

    let z = pair.bob.content("z", Origin::Initiator).unwrap();
    assert_eq!(z.transport().map(|t| t.namespace()), Some(IBB_NS));
    assert!(pair.bob.poll_transmit().is_none());
}

#[test]
fn test_session_accept_is_all_or_nothing() {
    let mut pair = Pair::new(&context());
    let a = pair.offer_file("a", b"aaa");
    let b = pair.offer_file("b", b"bbb");
    pair.alice.initiate().unwrap();
    pair.run();
    pair.bob.accept().unwrap();
    pair.flush();

    let Some(Envelope::Request { id, request }) = pair.intercept(Side::Alice) else {
        panic!("expected session-accept");
    };
    assert_eq!(request.action, Action::SessionAccept);
    assert_eq!(request.contents.iter().map(|c| c.key()).collect::<Vec<_>>(), vec![a.clone(), b.clone()]);

    // second content fails while applying: answer raises the block size
    let mut bad = request.clone();
    bad.contents[1].transport.as_mut().unwrap().payload["block-size"] = json!(1_000_000);
    let err = pair.alice.handle_request(&bad).unwrap_err();
    assert_eq!(err.condition, ErrorCondition::BadRequest);
    for key in [&a, &b] {
        assert_eq!(pair.alice.content_by_key(key).map(|c| c.state()), Some(ApplicationState::Pending));
    }
    assert_eq!(pair.alice.state(), SessionState::Pending);

    // unknown content fails validation before anything is applied
    let mut unknown = request.clone();
    unknown.contents.push(
        ContentElement::new(&ContentKey::new("nope", Origin::Initiator))
            .with_description(FileTransfer::offer(FileMeta::new("nope", 1)).to_element())
            .with_transport(ibb_offer("n")),
    );
    assert_eq!(
        pair.alice.handle_request(&unknown).unwrap_err().condition,
        ErrorCondition::ItemNotFound
    );
    assert_eq!(pair.alice.content_by_key(&a).map(|c| c.state()), Some(ApplicationState::Pending));

    pair.receive(Side::Alice, Envelope::Request { id, request });
    assert_eq!(pair.alice.state(), SessionState::Active);
    for key in [&a, &b] {
        assert!(pair.alice.content_by_key(key).unwrap().state() >= ApplicationState::Accepted);
    }
    pair.run();
    assert!(pair.errors.is_empty());
}

#[test]
fn test_refused_session_accept_leaves_transports_untouched() {
    let mut pair = Pair::new(&context());
    let a = pair.offer_file("a", b"aaa");
    let b = pair.offer_file("b", b"bbb");
    pair.alice.initiate().unwrap();
    pair.run();
    pair.bob.accept().unwrap();
    pair.flush();

    let Some(Envelope::Request { id, request }) = pair.intercept(Side::Alice) else {
        panic!("expected session-accept");
    };

    // first answer alone would be fine, the second raises the block size
    let mut bad = request.clone();
    bad.contents[0].transport.as_mut().unwrap().payload["block-size"] = json!(16);
    bad.contents[1].transport.as_mut().unwrap().payload["block-size"] = json!(1_000_000);
    let err = pair.alice.handle_request(&bad).unwrap_err();
    assert_eq!(err.condition, ErrorCondition::BadRequest);

    // the same content answered twice is refused as a whole
    let mut twice = request.clone();
    twice.contents[1] = twice.contents[0].clone();
    assert_eq!(
        pair.alice.handle_request(&twice).unwrap_err().condition,
        ErrorCondition::BadRequest
    );
    assert_eq!(pair.alice.content_by_key(&a).map(|c| c.state()), Some(ApplicationState::Pending));

    // the genuine accept still applies and keeps the offered block size
    pair.receive(Side::Alice, Envelope::Request { id, request });
    assert!(pair.errors.is_empty());
    assert_eq!(pair.alice.state(), SessionState::Active);
    pair.run();
    for key in [&a, &b] {
        let content = pair.alice.content_by_key(key).unwrap();
        assert_eq!(content.state(), ApplicationState::Active);
        assert_eq!(content.block_size(), Some(4096));
    }
}

#[test]
fn test_identical_content_accept_is_idempotent() {
    let (mut pair, _) = Pair::establish(&context(), &["ft"]);
    let late = pair.offer_file("late", b"late");
    pair.run();
    assert_eq!(
        pair.bob.content_by_key(&late).map(|c| c.state()),
        Some(ApplicationState::Pending)
    );

    pair.bob.accept_content(&late).unwrap();
    pair.flush();
    let Some(Envelope::Request { id, request }) = pair.intercept(Side::Alice) else {
        panic!("expected content-accept");
    };
    assert_eq!(request.action, Action::ContentAccept);

    pair.alice.handle_request(&request).unwrap();
    pair.alice.handle_request(&request).unwrap();

    let mut changed = request.clone();
    changed.contents[0].senders = Some(Origin::Both);
    assert_eq!(
        pair.alice.handle_request(&changed).unwrap_err().condition,
        ErrorCondition::UnexpectedRequest
    );

    pair.receive(Side::Alice, Envelope::Request { id, request });
    pair.run();
    assert_eq!(pair.alice.content_by_key(&late).map(|c| c.state()), Some(ApplicationState::Active));
}

#[test]
fn test_termination_is_absorbing() {
    let (mut pair, keys) = Pair::establish(&context(), &["ft"]);
    pair.bob.terminate(Reason::new(Condition::Decline));
    pair.run();
    let sent = pair.log.len();

    for side in [Side::Alice, Side::Bob] {
        let session = pair.session(side);
        assert!(session.is_finished());
        assert!(session.contents().all(|c| c.state() == ApplicationState::Finished));
        assert!(session.contents().all(|c| c.transport().is_none()));
    }
    assert_eq!(pair.alice.termination_reason(), Some(&Reason::new(Condition::Decline)));

    let info = JingleRequest::new(Action::TransportInfo, SID).with_contents(vec![ContentElement::new(&keys[0])]);
    assert_eq!(
        pair.alice.handle_request(&info).unwrap_err().condition,
        ErrorCondition::UnknownSession
    );
    let extra = pair
        .alice
        .new_content("extra", Origin::Initiator, Box::new(FileTransfer::offer(FileMeta::new("e", 1))))
        .unwrap();
    assert!(matches!(pair.alice.add_content(extra), Err(JingleError::InvalidState(_))));
    pair.alice.terminate(Reason::new(Condition::Success));
    assert!(pair.alice.send_ping().is_err());

    pair.run();
    assert_eq!(pair.log.len(), sent);
    let terminated = pair
        .events(Side::Alice)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Terminated(_)))
        .count();
    assert_eq!(terminated, 1);
}

#[test]
fn test_transport_replace_tie_break() {
    let (mut pair, keys) = Pair::establish(&context(), &["ft"]);
    let key = &keys[0];
    for side in [Side::Alice, Side::Bob] {
        let app = pair.session(side).content_mut(key).unwrap();
        app.transport_mut()
            .unwrap()
            .stop(Some(Reason::new(Condition::ConnectivityError)));
        app.notify_updated();
    }

    // both replacements are on the wire before either arrives
    let before = pair.log.len();
    pair.flush();
    let crossing: Vec<(Side, Action)> = pair.log[before..].iter().map(|(s, r)| (*s, r.action)).collect();
    assert_eq!(
        crossing,
        vec![(Side::Alice, Action::TransportReplace), (Side::Bob, Action::TransportReplace)]
    );

    pair.run();
    assert_eq!(pair.errors.len(), 1);
    assert_eq!(pair.errors[0].0, Side::Alice);
    assert_eq!(pair.errors[0].1.condition, ErrorCondition::TieBreak);

    for session in [&pair.alice, &pair.bob] {
        let app = session.content_by_key(key).unwrap();
        assert_eq!(app.state(), ApplicationState::Active);
        assert_eq!(app.pending_transport_replace(), PendingTransportReplace::None);
        assert_eq!(app.transport().map(|t| t.namespace()), Some(ECHO_NS));
        // the initiator's proposal won
        assert_eq!(app.transport().map(|t| t.creator()), Some(Origin::Initiator));
    }
    assert!(!pair.alice.is_finished() && !pair.bob.is_finished());
}

#[test]
fn test_refused_replacement_ends_content() {
    let alice_ctx = context();
    let bob_ctx = SessionContext::new(
        ApplicationRegistry::new()
            .with_factory(Arc::new(FileTransferFactory::new()))
            .unwrap(),
        TransportRegistry::new()
            .with_factory(Arc::new(IbbTransportFactory::new(IbbConfig::default())))
            .unwrap(),
        SessionConfig::default(),
    );
    let mut pair = Pair::with_contexts(&alice_ctx, &bob_ctx);
    let key = pair.offer_file("ft", b"ft");
    pair.alice.initiate().unwrap();
    pair.run();
    pair.bob.accept().unwrap();
    pair.run();

    let app = pair.alice.content_mut(&key).unwrap();
    app.transport_mut().unwrap().stop(Some(Reason::new(Condition::ConnectivityError)));
    app.notify_updated();
    pair.run();

    assert!(pair.actions(Side::Alice).contains(&Action::TransportReplace));
    assert!(pair.actions(Side::Bob).contains(&Action::TransportReject));
    assert!(pair.actions(Side::Alice).contains(&Action::ContentRemove));
    assert!(pair.alice.is_finished());
    assert!(pair.bob.is_finished());
}

#[test]
fn test_responder_refusing_offer_tears_session_down() {
    let mut pair = Pair::new(&context());
    let key = pair.offer_file("ft", b"ft");
    pair.alice.initiate().unwrap();
    pair.run();

    pair.bob.remove_content(&key, Reason::new(Condition::Decline)).unwrap();
    pair.bob.accept().unwrap();
    pair.run();

    assert_eq!(pair.actions(Side::Bob), vec![Action::SessionTerminate]);
    assert!(pair.alice.is_finished());
    assert_eq!(
        pair.alice.termination_reason().map(|r| r.condition),
        Some(Condition::GeneralError)
    );
}

#[test]
fn test_content_limit() {
    let limited = SessionConfig {
        max_contents: 1,
        ..SessionConfig::default()
    };
    let ctx = context_with(&[IBB_NS, ECHO_NS], false, limited);
    let (mut pair, _) = Pair::establish(&ctx, &["ft"]);

    let second = pair
        .alice
        .new_content("second", Origin::Initiator, Box::new(FileTransfer::offer(FileMeta::new("s", 1))))
        .unwrap();
    assert!(matches!(pair.alice.add_content(second), Err(JingleError::InvalidState(_))));

    let request = JingleRequest::new(Action::ContentAdd, SID).with_contents(vec![peer_content(
        "extra",
        FileTransfer::offer(FileMeta::new("extra", 1)).to_element(),
        ibb_offer("e1"),
    )]);
    pair.bob.handle_request(&request).unwrap();
    assert!(pair.bob.content("extra", Origin::Initiator).is_none());
    let reject = pair.bob.poll_transmit().unwrap().request;
    assert_eq!(reject.action, Action::ContentReject);
    assert_eq!(reject.reason.map(|r| r.condition), Some(Condition::Decline));
}

#[test]
fn test_session_info_ping_and_unknown_info() {
    let (mut pair, _) = Pair::establish(&context(), &["ft"]);
    pair.alice.send_ping().unwrap();
    pair.run();
    assert!(pair.errors.is_empty());

    let custom = JingleRequest::new(Action::SessionInfo, SID).with_info(json!({"ringing": true}));
    assert_eq!(
        pair.bob.handle_request(&custom).unwrap_err().condition,
        ErrorCondition::UnsupportedInfo
    );
}

#[derive(Debug, Clone)]
enum Op {
    Offer,
    Initiate,
    Accept,
    RemoveFirst,
    Ping(Side),
    Terminate(Side),
    Flush,
    Deliver(Side),
}

fn side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Alice), Just(Side::Bob)]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Offer),
        Just(Op::Initiate),
        Just(Op::Accept),
        Just(Op::RemoveFirst),
        side().prop_map(Op::Ping),
        side().prop_map(Op::Terminate),
        Just(Op::Flush),
        side().prop_map(Op::Deliver),
        side().prop_map(Op::Deliver),
    ]
}

proptest! {
    #[test]
    fn prop_single_request_in_flight_and_absorbing_termination(ops in prop::collection::vec(op(), 1..40)) {
        let mut pair = Pair::new(&context());
        let mut offered = 0usize;
        let mut finished_at: [Option<usize>; 2] = [None, None];

        for op in ops {
            match op {
                Op::Offer => {
                    let name = format!("c{offered}");
                    offered += 1;
                    if let Ok(app) = pair.alice.new_content(
                        name.as_str(),
                        Origin::Initiator,
                        Box::new(FileTransfer::offer(FileMeta::new(name.as_str(), 1))),
                    ) {
                        let _ = pair.alice.add_content(app);
                    }
                },
                Op::Initiate => {
                    let _ = pair.alice.initiate();
                },
                Op::Accept => {
                    let _ = pair.bob.accept();
                },
                Op::RemoveFirst => {
                    let first = pair.alice.contents().next().map(|c| c.key().clone());
                    if let Some(key) = first {
                        let _ = pair.alice.remove_content(&key, Reason::new(Condition::Cancel));
                    }
                },
                Op::Ping(side) => {
                    let _ = pair.session(side).send_ping();
                },
                Op::Terminate(side) => pair.session(side).terminate(Reason::new(Condition::Success)),
                Op::Flush => pair.flush(),
                Op::Deliver(side) => {
                    pair.deliver(side);
                },
            }
            prop_assert!(pair.max_outstanding <= 1);
            for side in [Side::Alice, Side::Bob] {
                if pair.session(side).is_finished() && finished_at[side as usize].is_none() {
                    pair.flush();
                    finished_at[side as usize] = Some(pair.log.len());
                }
            }
        }

        pair.run();
        prop_assert!(pair.max_outstanding <= 1);
        for side in [Side::Alice, Side::Bob] {
            if let Some(at) = finished_at[side as usize] {
                prop_assert!(pair.log[at..].iter().all(|(s, _)| *s != side));
            }
            let session = pair.session(side);
            if session.is_finished() {
                prop_assert!(session.contents().all(|c| c.state() == ApplicationState::Finished));
                prop_assert!(session.poll_transmit().is_none());
            }
        }
    }
}
