//! End-to-end engine scenarios against a recording transport.
//!
//! Each test spawns a real engine task, injects transport events the way
//! a collaborator would deliver them, and checks the view, the bus and
//! the frames the engine sent back.

mod common;

use common::{running_timer, session, session_with, Harness, LEARNER, SESSION, TEACHER};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

use tutor_sync::protocol::{PresenceStatus, SessionDescription};
use tutor_sync::{
    ChannelKind, ChatMessage, InboundFrame, NegotiationState, OnlineUser, OutboundFrame, Role, SessionEvent, Signal,
    SignalMessage, SyncError, TeachingClock, TransportEvent, WhiteboardScene,
};

/// Wait for the first bus event matching `pred`.
async fn next_matching(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("event never published")
}

fn is_ready(frame: &OutboundFrame) -> bool {
    matches!(frame, OutboundFrame::Signal { payload } if payload.signal == Signal::Ready)
}

#[tokio::test]
async fn test_join_announces_ready_with_role() {
    let h = Harness::spawn(LEARNER);
    let view = h.join(session()).await;
    assert!(view.is_connected);

    let frame = h.probe.wait_sent(is_ready).await;
    match frame {
        OutboundFrame::Signal { payload } => assert_eq!(payload.role, Some(Role::Callee)),
        other => panic!("unexpected frame {other:?}"),
    }
    // Camera starts off: only the microphone is attached.
    assert_eq!(h.peer.tracks().len(), 1);
}

#[tokio::test]
async fn test_timer_cycle_accumulates_teaching_time() {
    let h = Harness::spawn(LEARNER);
    let mut bus = h.handle.subscribe();
    h.join(session()).await;

    h.probe
        .frame(InboundFrame::TimerStarted {
            teacher_id: TEACHER,
            teacher_name: Some("Tara".into()),
            start_time: "2026-03-01T10:00:00Z".parse().unwrap(),
            timer_id: 31,
        })
        .await;
    let view = h.wait_view(|v| v.active_timer.is_some()).await;
    let clock = view.clock().unwrap();
    assert!(clock.is_locked_for(LEARNER));
    assert!(!clock.can_start(LEARNER));

    h.probe
        .frame(InboundFrame::TimerStopped {
            teacher_id: TEACHER,
            teacher_name: Some("Tara".into()),
            end_time: None,
            duration_seconds: 305,
            timer_id: 31,
            new_total_time: None,
        })
        .await;
    let view = h.wait_view(|v| v.active_timer.is_none()).await;
    let session = view.session.unwrap();
    assert_eq!(session.teaching_time(TEACHER), 905);
    assert_eq!(TeachingClock::format(session.teaching_time(TEACHER)), "15:05");

    let stopped = next_matching(&mut bus, |e| matches!(e, SessionEvent::TimerStopped { .. })).await;
    assert_eq!(
        stopped,
        SessionEvent::TimerStopped {
            teacher: TEACHER,
            duration_seconds: 305,
            total_seconds: 905
        }
    );
}

#[tokio::test]
async fn test_timer_stop_prefers_authoritative_total() {
    let h = Harness::spawn(TEACHER);
    h.join(session_with(Some(running_timer(TEACHER)), true)).await;

    h.probe
        .frame(InboundFrame::TimerStopped {
            teacher_id: TEACHER,
            teacher_name: None,
            end_time: None,
            duration_seconds: 305,
            timer_id: 31,
            new_total_time: Some(1000),
        })
        .await;
    let view = h.wait_view(|v| v.active_timer.is_none()).await;
    assert_eq!(view.session.unwrap().teaching_time(TEACHER), 1000);
}

#[tokio::test]
async fn test_credit_update_only_for_local_user() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;

    h.probe
        .frame(InboundFrame::CreditUpdate {
            user_id: TEACHER,
            new_balance: 50.0,
        })
        .await;
    h.probe
        .frame(InboundFrame::CreditUpdate {
            user_id: LEARNER,
            new_balance: 12.5,
        })
        .await;

    h.wait_view(|v| v.your_credits == Some(12.5)).await;
    assert_eq!(h.profile.credits(LEARNER), Some(12.5));
    assert_eq!(h.profile.credits(TEACHER), None);
}

#[tokio::test]
async fn test_stale_frames_are_dropped() {
    let h = Harness::spawn(LEARNER);
    let mut bus = h.handle.subscribe();
    h.join(session()).await;

    h.probe
        .push(TransportEvent::Frame {
            channel: ChannelKind::Session,
            session_id: Some(99),
            frame: InboundFrame::CreditBalance { credits: 99.0 },
        })
        .await;
    let mut other = session();
    other.id = 99;
    h.probe.frame(InboundFrame::SessionState { session: other }).await;
    h.probe
        .frame(InboundFrame::TimerStarted {
            teacher_id: 555,
            teacher_name: None,
            start_time: "2026-03-01T10:00:00Z".parse().unwrap(),
            timer_id: 1,
        })
        .await;
    h.probe.frame(InboundFrame::CreditBalance { credits: 3.0 }).await;

    let view = h.wait_view(|v| v.your_credits == Some(3.0)).await;
    assert_eq!(view.session.unwrap().id, SESSION);
    assert!(view.active_timer.is_none());

    while let Ok(event) = bus.try_recv() {
        assert_ne!(event, SessionEvent::CreditsChanged(99.0));
        assert!(!matches!(event, SessionEvent::TimerStarted(_)));
    }
}

#[tokio::test]
async fn test_start_timer_locked_by_other_participant() {
    let h = Harness::spawn(LEARNER);
    h.join(session_with(Some(running_timer(TEACHER)), true)).await;

    let err = h.handle.start_timer().await.unwrap_err();
    assert!(matches!(err, SyncError::Command(_)));
    let err = h.handle.stop_timer().await.unwrap_err();
    assert_eq!(err, SyncError::Command("Only the teacher can stop the timer".into()));

    assert!(h.handle.view().error.is_some());
    assert!(!h.probe.sent().iter().any(|f| matches!(f, OutboundFrame::TimerStart | OutboundFrame::TimerStop)));
}

#[tokio::test]
async fn test_start_timer_defers_to_collaborator() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;

    h.handle.start_timer().await.unwrap();
    assert!(h.probe.sent().contains(&OutboundFrame::TimerStart));
    assert_eq!(h.probe.refreshes(), 1);

    // Nothing changes locally until the collaborator confirms.
    let view = h.handle.view();
    assert!(view.active_timer.is_none());
    assert!(view.error.is_none());
}

#[tokio::test]
async fn test_session_end_settles_and_closes_media() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;
    h.probe.wait_sent(is_ready).await;

    h.probe
        .frame(InboundFrame::SessionEnded {
            ended_by: Some(TEACHER),
            credit_summary: None,
            your_credits: Some(8.0),
        })
        .await;
    let view = h.wait_view(|v| v.ended).await;
    assert_eq!(view.ended_by, Some(TEACHER));
    assert_eq!(view.your_credits, Some(8.0));
    assert_eq!(view.negotiation, NegotiationState::Closed);
    assert!(!view.session.unwrap().is_active);
    assert!(h.peer.is_closed());

    let err = h.handle.end_session().await.unwrap_err();
    assert_eq!(err, SyncError::Command("Session has already ended".into()));
}

#[tokio::test]
async fn test_chat_send_is_confirmed_by_echo() {
    let h = Harness::spawn(LEARNER);
    let mut bus = h.handle.subscribe();
    h.join(session()).await;

    assert_eq!(h.handle.send_message("   ").await.unwrap(), None);
    let local_id = h.handle.send_message("hello").await.unwrap().unwrap();
    assert!(h.probe.sent().contains(&OutboundFrame::ChatMessage {
        message: "hello".into()
    }));

    h.probe
        .push(TransportEvent::Frame {
            channel: ChannelKind::Chat,
            session_id: Some(SESSION),
            frame: InboundFrame::ChatMessage(ChatMessage {
                id: 1,
                sender: LEARNER,
                sender_name: "Leo".into(),
                message: "hello".into(),
                timestamp: "2026-03-01T10:00:05Z".parse().unwrap(),
            }),
        })
        .await;

    match next_matching(&mut bus, |e| matches!(e, SessionEvent::ChatConfirmed { .. })).await {
        SessionEvent::ChatConfirmed { local_id: confirmed, message } => {
            assert_eq!(confirmed, local_id);
            assert_eq!(message.id, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_send_failure_is_reported() {
    let h = Harness::spawn(LEARNER);
    let mut bus = h.handle.subscribe();
    h.join(session()).await;

    h.probe.set_failing(true);
    let err = h.handle.send_message("lost").await.unwrap_err();
    assert!(err.is_transient());
    let event = next_matching(&mut bus, |e| matches!(e, SessionEvent::ChatFailed { .. })).await;
    assert!(matches!(event, SessionEvent::ChatFailed { reason, .. } if reason.contains("not connected")));
}

#[tokio::test]
async fn test_whiteboard_burst_sends_leading_and_trailing_edge() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;

    for id in ["a", "b", "c"] {
        let scene = WhiteboardScene {
            elements: vec![json!({ "id": id })],
            ..Default::default()
        };
        h.handle.send_whiteboard(scene).await.unwrap();
    }

    let updates = || {
        h.probe
            .sent()
            .into_iter()
            .filter(|f| matches!(f, OutboundFrame::WhiteboardUpdate { .. }))
            .collect::<Vec<_>>()
    };
    h.probe
        .wait_sent(|f| matches!(f, OutboundFrame::WhiteboardUpdate { data } if data.elements[0]["id"] == "c"))
        .await;
    let sent = updates();
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        OutboundFrame::WhiteboardUpdate { data } => assert_eq!(data.elements[0]["id"], "a"),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_callee_answers_remote_offer() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;
    h.probe.wait_sent(is_ready).await;

    // Our own echo is ignored.
    let mut echo = SignalMessage::new(Signal::Ready, Role::Callee, 1);
    echo.sender_id = Some(LEARNER);
    h.probe.frame(InboundFrame::Signal { payload: echo }).await;

    let offer = SignalMessage::new(
        Signal::Offer {
            sdp: SessionDescription::offer("v=0 remote"),
        },
        Role::Caller,
        5,
    );
    h.probe.frame(InboundFrame::Signal { payload: offer }).await;

    h.probe
        .wait_sent(|f| matches!(f, OutboundFrame::Signal { payload } if matches!(payload.signal, Signal::Answer { .. })))
        .await;
    h.wait_view(|v| v.negotiation == NegotiationState::Connected).await;
    let readies = h.probe.sent().iter().filter(|f| is_ready(f)).count();
    assert_eq!(readies, 1);
}

#[tokio::test]
async fn test_reconnect_reannounces_ready() {
    let h = Harness::spawn(TEACHER);
    h.join(session()).await;
    h.probe.wait_sent(is_ready).await;

    h.probe.push(TransportEvent::Disconnected(ChannelKind::Session)).await;
    h.wait_view(|v| !v.is_connected).await;
    h.probe.push(TransportEvent::Connected(ChannelKind::Session)).await;
    h.wait_view(|v| v.is_connected).await;

    timeout(Duration::from_secs(2), async {
        while h.probe.sent().iter().filter(|f| is_ready(f)).count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ready was not re-announced");
}

#[tokio::test]
async fn test_presence_roster_and_updates() {
    let h = Harness::spawn(LEARNER);
    let mut bus = h.handle.subscribe();

    let presence = |frame| TransportEvent::Frame {
        channel: ChannelKind::Presence,
        session_id: None,
        frame,
    };
    h.probe
        .push(presence(InboundFrame::OnlineUsers {
            users: vec![OnlineUser::new(TEACHER, "Tara"), OnlineUser::new(LEARNER, "Leo")],
        }))
        .await;
    h.probe
        .push(presence(InboundFrame::PresenceUpdate {
            user: OnlineUser::new(TEACHER, "Tara"),
            status: PresenceStatus::Offline,
        }))
        .await;

    assert_eq!(
        next_matching(&mut bus, |e| matches!(e, SessionEvent::PresenceReplaced(_))).await,
        SessionEvent::PresenceReplaced(2)
    );
    assert_eq!(
        next_matching(&mut bus, |e| matches!(e, SessionEvent::PresenceChanged { .. })).await,
        SessionEvent::PresenceChanged {
            user: TEACHER,
            online: false
        }
    );
}

#[tokio::test]
async fn test_shutdown_disposes_engine() {
    let h = Harness::spawn(LEARNER);
    h.join(session()).await;
    h.probe.wait_sent(is_ready).await;

    h.handle.shutdown().await.unwrap();
    assert!(h.peer.is_closed());
    assert_eq!(h.handle.start_timer().await.unwrap_err(), SyncError::EngineStopped);
}
