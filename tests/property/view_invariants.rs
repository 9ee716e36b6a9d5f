//! Property-based tests for the reconciliation view.
//!
//! Drives [`ChatView`] through arbitrary interleavings of optimistic
//! sends, out-of-order confirmations, send failures, realtime pushes,
//! and duplicate echoes, then checks the structural invariants:
//!
//! 1. The visible list is always a confirmed run followed by an
//!    outgoing run (pending entries trail).
//! 2. No server message id ever appears twice.
//! 3. Outgoing entries are exactly the sends not yet confirmed or
//!    taken back.

use std::collections::{BTreeSet, HashSet};

use proptest::prelude::*;

use marketchat_client::view::{ChatView, LocalId, ViewEntry};
use marketchat_proto::ids::{ChatId, MessageId, Timestamp, UserId};
use marketchat_proto::model::{Chat, Message, MessageDraft, UserProfile};

// --- Script model ---

/// One scripted action against the view.
///
/// Indices are taken modulo the relevant population at apply time, so any
/// generated script is applicable.
#[derive(Debug, Clone)]
enum Action {
    /// Queue an optimistic send with the given text.
    Send(String),
    /// Confirm the n-th oldest unresolved send.
    Confirm(usize),
    /// Fail the n-th oldest unresolved send.
    Fail(usize),
    /// A new incoming message pushed to the open chat.
    Push(String),
    /// Re-push the n-th already-merged message (a duplicate echo).
    DuplicatePush(usize),
    /// Activity in some other chat.
    BackgroundActivity,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        "[a-z ]{1,12}".prop_map(Action::Send),
        any::<usize>().prop_map(Action::Confirm),
        any::<usize>().prop_map(Action::Fail),
        "[a-z ]{1,12}".prop_map(Action::Push),
        any::<usize>().prop_map(Action::DuplicatePush),
        Just(Action::BackgroundActivity),
    ]
}

struct Fixture {
    view: ChatView,
    chat_id: ChatId,
    other_chat: ChatId,
    me: UserId,
    other: UserId,
}

fn fixture() -> Fixture {
    let me = UserProfile {
        id: UserId::new(),
        name: "ana".to_string(),
        avatar_url: None,
    };
    let other = UserProfile {
        id: UserId::new(),
        name: "bruno".to_string(),
        avatar_url: None,
    };
    let chat = Chat {
        id: ChatId::new(),
        participants: vec![me.clone(), other.clone()],
        messages: Vec::new(),
        last_message: None,
        updated_at: Timestamp::now(),
    };
    let mut view = ChatView::new(me.id);
    view.select(&chat);
    Fixture {
        view,
        chat_id: chat.id,
        other_chat: ChatId::new(),
        me: me.id,
        other: other.id,
    }
}

fn message(sender: UserId, text: &str) -> Message {
    Message {
        id: MessageId::new(),
        sender_id: sender,
        content: Some(text.to_string()),
        image: None,
        read_by: BTreeSet::from([sender]),
        timestamp: Timestamp::now(),
    }
}

/// Replay a script, tracking what the view should contain.
///
/// Returns (expected confirmed count, expected outgoing count, pushes to
/// the background chat).
fn replay(fx: &mut Fixture, script: &[Action]) -> (usize, usize, u64) {
    let mut unresolved: Vec<(LocalId, String)> = Vec::new();
    let mut merged: Vec<Message> = Vec::new();
    let mut background_pushes = 0u64;

    for action in script {
        match action {
            Action::Send(text) => {
                let local_id = fx
                    .view
                    .optimistic_send(MessageDraft::text(text.clone()))
                    .expect("chat is open");
                unresolved.push((local_id, text.clone()));
            }
            Action::Confirm(n) => {
                if unresolved.is_empty() {
                    continue;
                }
                let (local_id, text) = unresolved.remove(n % unresolved.len());
                let confirmed = message(fx.me, &text);
                assert!(fx.view.confirm(fx.chat_id, local_id, confirmed.clone()));
                merged.push(confirmed);
            }
            Action::Fail(n) => {
                if unresolved.is_empty() {
                    continue;
                }
                // Failing leaves the entry visible; taking it back removes it.
                let (local_id, _) = unresolved.remove(n % unresolved.len());
                fx.view.fail(fx.chat_id, local_id);
                assert!(fx.view.take_failed(fx.chat_id, local_id).is_some());
            }
            Action::Push(text) => {
                let incoming = message(fx.other, text);
                assert!(fx.view.apply_push(fx.chat_id, &incoming));
                merged.push(incoming);
            }
            Action::DuplicatePush(n) => {
                if merged.is_empty() {
                    continue;
                }
                let echo = merged[n % merged.len()].clone();
                assert!(
                    !fx.view.apply_push(fx.chat_id, &echo),
                    "duplicate echo must be dropped"
                );
            }
            Action::BackgroundActivity => {
                fx.view.apply_activity(fx.other_chat, "[image]", Timestamp::now());
                background_pushes += 1;
            }
        }
    }

    (merged.len(), unresolved.len(), background_pushes)
}

proptest! {
    /// Any interleaving keeps the confirmed-then-outgoing shape, unique
    /// message ids, and exact entry counts.
    #[test]
    fn interleavings_preserve_view_shape(script in prop::collection::vec(arb_action(), 0..40)) {
        let mut fx = fixture();
        let (confirmed, outgoing, _) = replay(&mut fx, &script);

        let visible = fx.view.visible();
        prop_assert_eq!(
            visible.iter().filter(|e| !e.is_outgoing()).count(),
            confirmed
        );
        prop_assert_eq!(visible.iter().filter(|e| e.is_outgoing()).count(), outgoing);

        // Confirmed run first, outgoing run last.
        let first_outgoing = visible
            .iter()
            .position(|e| e.is_outgoing())
            .unwrap_or(visible.len());
        for entry in &visible[..first_outgoing] {
            prop_assert!(!entry.is_outgoing());
        }
        for entry in &visible[first_outgoing..] {
            prop_assert!(entry.is_outgoing());
        }

        // No server id appears twice.
        let mut ids = HashSet::new();
        for entry in visible {
            if let ViewEntry::Confirmed(m) = entry {
                prop_assert!(ids.insert(m.id), "duplicate message id in view");
            }
        }
    }

    /// The open chat's unread badge stays zero; only background chats
    /// accumulate unread activity, one per push.
    #[test]
    fn unread_tracks_background_chats_only(script in prop::collection::vec(arb_action(), 0..40)) {
        let mut fx = fixture();
        let (_, _, background) = replay(&mut fx, &script);
        let chat_id = fx.chat_id;
        let other_chat = fx.other_chat;

        prop_assert_eq!(fx.view.unread_total(), background);
        let open_row = fx
            .view
            .conversations()
            .iter()
            .find(|c| c.chat_id == chat_id)
            .cloned();
        if let Some(row) = open_row {
            prop_assert_eq!(row.unread, 0);
        }
        if background > 0 {
            let row = fx
                .view
                .conversations()
                .iter()
                .find(|c| c.chat_id == other_chat)
                .cloned()
                .expect("background chat gets a row on first activity");
            prop_assert_eq!(row.unread, background);
        }
    }

    /// Confirmations may land in any order; the confirmed texts are a
    /// permutation of the sends that were confirmed.
    #[test]
    fn out_of_order_confirmations_lose_nothing(
        texts in prop::collection::vec("[a-z]{1,8}", 1..10),
        seed in any::<u64>(),
    ) {
        let mut fx = fixture();
        let mut pending: Vec<(LocalId, String)> = texts
            .iter()
            .map(|t| {
                let id = fx.view.optimistic_send(MessageDraft::text(t.clone())).unwrap();
                (id, t.clone())
            })
            .collect();

        // Confirm in a seed-scrambled order.
        let mut state = seed;
        while !pending.is_empty() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            #[allow(clippy::cast_possible_truncation)]
            let at = (state as usize) % pending.len();
            let (local_id, text) = pending.remove(at);
            fx.view.confirm(fx.chat_id, local_id, message(fx.me, &text));
        }

        let mut confirmed: Vec<String> = fx
            .view
            .visible()
            .iter()
            .filter_map(|e| match e {
                ViewEntry::Confirmed(m) => m.content.clone(),
                ViewEntry::Outgoing(_) => None,
            })
            .collect();
        let mut expected = texts.clone();
        confirmed.sort();
        expected.sort();
        prop_assert_eq!(confirmed, expected);
    }
}
