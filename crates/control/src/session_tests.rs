// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use InternalStatus::*;

#[test]
fn happy_path_transitions_are_legal() {
    assert!(Creating.can_transition_to(Provisioning));
    assert!(Provisioning.can_transition_to(Ready));
    assert!(Ready.can_transition_to(Active));
    assert!(Active.can_transition_to(Ready));
    assert!(Ready.can_transition_to(Terminating));
    assert!(Active.can_transition_to(Terminating));
    assert!(Terminating.can_transition_to(Stopped));
}

#[test]
fn every_non_terminal_state_may_fail() {
    for src in [Creating, Provisioning, Ready, Active, Terminating] {
        assert!(src.can_transition_to(Failed), "{src} -> FAILED should be legal");
    }
}

#[test]
fn terminal_states_are_sinks() {
    for src in [Stopped, Failed] {
        for dst in [Creating, Provisioning, Ready, Active, Terminating, Stopped, Failed] {
            assert!(!src.can_transition_to(dst), "{src} -> {dst} should be rejected");
        }
    }
}

#[test]
fn skipping_states_is_illegal() {
    assert!(!Creating.can_transition_to(Ready));
    assert!(!Creating.can_transition_to(Active));
    assert!(!Provisioning.can_transition_to(Active));
    assert!(!Provisioning.can_transition_to(Stopped));
    assert!(!Ready.can_transition_to(Stopped));
    assert!(!Active.can_transition_to(Stopped));
}

#[test]
fn backwards_transitions_are_illegal() {
    assert!(!Provisioning.can_transition_to(Creating));
    assert!(!Ready.can_transition_to(Provisioning));
    assert!(!Terminating.can_transition_to(Ready));
    assert!(!Terminating.can_transition_to(Active));
}

#[test]
fn client_status_mapping() {
    assert_eq!(Creating.client_status(), Status::Running);
    assert_eq!(Provisioning.client_status(), Status::Running);
    assert_eq!(Ready.client_status(), Status::Running);
    assert_eq!(Active.client_status(), Status::Running);
    assert_eq!(Terminating.client_status(), Status::Completed);
    assert_eq!(Stopped.client_status(), Status::Completed);
    assert_eq!(Failed.client_status(), Status::Error);
}

#[test]
fn event_history_is_bounded() {
    let mut session = test_session();
    for i in 0..(EVENT_HISTORY_LIMIT + 10) {
        session.push_event(SessionEvent::Request {
            action: format!("action-{i}"),
            at: now_iso8601(),
        });
    }
    assert_eq!(session.event_history.len(), EVENT_HISTORY_LIMIT);
    // Oldest entries were dropped, newest kept.
    match &session.event_history[EVENT_HISTORY_LIMIT - 1] {
        SessionEvent::Request { action, .. } => {
            assert_eq!(action, &format!("action-{}", EVENT_HISTORY_LIMIT + 9));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn iso8601_epoch_zero() {
    assert_eq!(iso8601_from_epoch(0), "1970-01-01T00:00:00Z");
}

#[test]
fn iso8601_known_timestamp() {
    // 2026-08-01T00:00:00Z
    assert_eq!(iso8601_from_epoch(1_785_542_400), "2026-08-01T00:00:00Z");
}

#[test]
fn serde_screaming_snake_case() {
    let json = serde_json::to_string(&InternalStatus::Provisioning).unwrap();
    assert_eq!(json, "\"PROVISIONING\"");
    let json = serde_json::to_string(&Status::TimedOut).unwrap();
    assert_eq!(json, "\"TIMED_OUT\"");
}

#[test]
fn connect_info_hidden_until_ready() {
    let mut session = test_session();
    for status in [Creating, Provisioning, Terminating, Stopped, Failed] {
        session.internal_status = status;
        assert!(!session.connect_info_visible(), "{status} should hide connect info");
    }
    for status in [Ready, Active] {
        session.internal_status = status;
        assert!(session.connect_info_visible(), "{status} should expose connect info");
    }
}

proptest::proptest! {
    #[test]
    fn terminal_states_accept_no_transition(
        src in proptest::sample::select(ALL_STATUSES.to_vec()),
        dst in proptest::sample::select(ALL_STATUSES.to_vec()),
    ) {
        if src.is_terminal() {
            proptest::prop_assert!(!src.can_transition_to(dst));
        }
        if src.can_transition_to(dst) {
            proptest::prop_assert!(!src.is_terminal());
            proptest::prop_assert_ne!(src, dst);
        }
    }

    #[test]
    fn status_serde_round_trips(
        status in proptest::sample::select(ALL_STATUSES.to_vec()),
    ) {
        let json = serde_json::to_string(&status).unwrap();
        let back: InternalStatus = serde_json::from_str(&json).unwrap();
        proptest::prop_assert_eq!(status, back);
    }
}

const ALL_STATUSES: [InternalStatus; 7] =
    [Creating, Provisioning, Ready, Active, Terminating, Stopped, Failed];

pub(crate) fn test_session() -> Session {
    Session {
        session_id: "sess_test".into(),
        project_id: "p1".into(),
        api_key_id: "key_1".into(),
        status: Status::Running,
        internal_status: Creating,
        created_at: now_iso8601(),
        started_at: None,
        ready_at: None,
        updated_at: now_iso8601(),
        terminated_at: None,
        expires_at: epoch_secs() + 3600,
        task_id: None,
        public_address: None,
        region: "local".into(),
        connect_url: None,
        signing_key: None,
        keep_alive: false,
        context_id: None,
        user_metadata: serde_json::Map::new(),
        event_history: Vec::new(),
        retry_count: 0,
        failure_reason: None,
    }
}
