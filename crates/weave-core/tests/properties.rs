//! Property tests for model invariants

use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use weave_core::command::{Command, CommandOrigin, CommandState};
use weave_core::component::ComponentManager;
use weave_core::{AuthManager, AuthScope, Timestamp, UserInfo, UserRole};
use weave_harness::{FakeClock, FakeTaskRunner};

fn manager() -> (FakeClock, ComponentManager) {
    let clock = FakeClock::new(Timestamp::from_secs(1_500_000_000));
    let runner = FakeTaskRunner::new(clock.clone());
    let manager = ComponentManager::new(Rc::new(runner), Rc::new(clock.clone()));
    (clock, manager)
}

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

fn arb_trait_name() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9]{0,8}"
}

fn arb_role() -> impl Strategy<Value = UserRole> {
    prop_oneof![
        Just(UserRole::Viewer),
        Just(UserRole::User),
        Just(UserRole::Manager),
        Just(UserRole::Owner),
    ]
}

fn arb_scope() -> impl Strategy<Value = AuthScope> {
    prop_oneof![
        Just(AuthScope::None),
        Just(AuthScope::Viewer),
        Just(AuthScope::User),
        Just(AuthScope::Manager),
        Just(AuthScope::Owner),
    ]
}

/// A trait definition with state properties at random minimal roles.
fn arb_trait_def() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", arb_role(), 1..5).prop_map(|props| {
        let mut state = Map::new();
        for (name, role) in props {
            state.insert(
                name,
                json!({ "type": "integer", "minimalRole": role.as_str() }),
            );
        }
        json!({ "state": state })
    })
}

fn arb_traits() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(arb_trait_name(), arb_trait_def(), 1..4)
        .prop_map(|map| map.into_iter().collect())
}

// ----------------------------------------------------------------------------
// Trait Loading
// ----------------------------------------------------------------------------

proptest! {
    /// Loading the same dictionary twice is a no-op.
    #[test]
    fn trait_loading_is_idempotent(traits in arb_traits()) {
        let (_clock, manager) = manager();
        manager.load_traits(&Value::Object(traits.clone())).unwrap();
        let first = manager.traits();
        manager.load_traits(&Value::Object(traits)).unwrap();
        prop_assert_eq!(manager.traits(), first);
    }

    /// A conflicting redefinition fails and leaves traits untouched.
    #[test]
    fn trait_redefinition_is_rejected(traits in arb_traits()) {
        let (_clock, manager) = manager();
        manager.load_traits(&Value::Object(traits.clone())).unwrap();
        let before = manager.traits();

        let victim = traits.keys().next().unwrap().clone();
        let mut conflicting = Map::new();
        conflicting.insert(victim, json!({ "state": { "zz": { "type": "boolean" } } }));
        prop_assert!(manager.load_traits(&Value::Object(conflicting)).is_err());
        prop_assert_eq!(manager.traits(), before);
    }
}

// ----------------------------------------------------------------------------
// Role Filtering
// ----------------------------------------------------------------------------

proptest! {
    /// Every state property visible at role r has minimalRole <= r.
    #[test]
    fn filtered_state_respects_roles(traits in arb_traits(), role in arb_role()) {
        let (_clock, manager) = manager();
        manager.load_traits(&Value::Object(traits.clone())).unwrap();

        let declared: Vec<&str> = traits.keys().map(String::as_str).collect();
        manager.add_component("", "dev", &declared).unwrap();
        for (trait_name, def) in &traits {
            let mut props = Map::new();
            for prop in def["state"].as_object().unwrap().keys() {
                props.insert(prop.clone(), json!(1));
            }
            let mut state = Map::new();
            state.insert(trait_name.clone(), Value::Object(props));
            manager.set_state_properties("dev", state).unwrap();
        }

        let filtered = manager.get_components_for_user_role(role);
        if let Some(state) = filtered["dev"].get("state").and_then(Value::as_object) {
            for (trait_name, props) in state {
                for prop in props.as_object().unwrap().keys() {
                    let minimal = manager
                        .get_state_minimal_role(&format!("{trait_name}.{prop}"))
                        .unwrap();
                    prop_assert!(
                        minimal <= role,
                        "{}.{} at {} leaked to {}",
                        trait_name, prop, minimal, role
                    );
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Command State Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Op {
    Progress,
    Complete,
    SetError,
    Abort,
    Cancel,
    Pause,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            Just(Op::Progress),
            Just(Op::Complete),
            Just(Op::SetError),
            Just(Op::Abort),
            Just(Op::Cancel),
            Just(Op::Pause),
        ],
        0..12,
    )
}

proptest! {
    /// Only the documented transitions are accepted and terminal states
    /// absorb everything.
    #[test]
    fn state_machine_accepts_only_legal_transitions(ops in arb_ops()) {
        let command = Command::from_json(
            &json!({ "name": "power.on" }),
            CommandOrigin::Local,
        ).unwrap();

        for op in ops {
            let before = command.state();
            let result = match op {
                Op::Progress => command.set_progress(Map::new()),
                Op::Complete => command.complete(Map::new()),
                Op::SetError => command.set_error(weave_core::Error::invalid_state(
                    weave_core::error::domains::COMMANDS,
                    "injected",
                )),
                Op::Abort => command.abort(None),
                Op::Cancel => command.cancel(),
                Op::Pause => command.pause(),
            };
            let after = command.state();

            if before.is_terminal() {
                prop_assert!(result.is_err(), "{op:?} accepted in terminal {before:?}");
                prop_assert_eq!(after, before);
            } else {
                prop_assert!(result.is_ok(), "{op:?} rejected in {before:?}");
                prop_assert_ne!(after, CommandState::Queued);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Access Tokens
// ----------------------------------------------------------------------------

proptest! {
    /// Tokens round-trip under the minting secret and fail under others.
    #[test]
    fn access_tokens_round_trip(
        secret in prop::collection::vec(any::<u8>(), 32..48),
        other_secret in prop::collection::vec(any::<u8>(), 32..48),
        scope in arb_scope(),
        user_id in any::<u64>(),
        now_s in 1_000_000_000u64..2_000_000_000,
    ) {
        prop_assume!(secret != other_secret);
        let clock = FakeClock::new(Timestamp::from_secs(now_s));
        let auth = AuthManager::with_secret(secret, vec![], Rc::new(clock.clone()));
        let other = AuthManager::with_secret(other_secret, vec![], Rc::new(clock));

        let user = UserInfo::new(scope, user_id);
        let token = auth.create_access_token(&user);

        let (parsed, issued_at) = auth.parse_access_token(&token).unwrap();
        prop_assert_eq!(parsed, user);
        prop_assert_eq!(issued_at, Timestamp::from_secs(now_s));
        prop_assert!(other.parse_access_token(&token).is_none());
    }

    /// Same second, same identity: identical tokens. Any varying input
    /// changes the token.
    #[test]
    fn access_tokens_are_deterministic(
        secret in prop::collection::vec(any::<u8>(), 32..40),
        user_id in any::<u64>(),
        now_s in 1_000_000_000u64..2_000_000_000,
    ) {
        let clock = FakeClock::new(Timestamp::from_secs(now_s));
        let auth = AuthManager::with_secret(secret, vec![], Rc::new(clock.clone()));
        let user = UserInfo::new(AuthScope::User, user_id);

        prop_assert_eq!(auth.create_access_token(&user), auth.create_access_token(&user));

        clock.advance(Duration::from_secs(1));
        prop_assert_ne!(auth.create_access_token(&user), {
            clock.set(Timestamp::from_secs(now_s));
            auth.create_access_token(&user)
        });
    }
}

// ----------------------------------------------------------------------------
// State Change Journal
// ----------------------------------------------------------------------------

proptest! {
    /// N successful updates bump the id by exactly N, and the drained
    /// snapshot is sorted and resets the journal.
    #[test]
    fn update_id_counts_successful_updates(updates in 1usize..40) {
        let (clock, manager) = manager();
        manager
            .load_traits(&json!({ "power": { "state": { "level": { "type": "integer" } } } }))
            .unwrap();
        manager.add_component("", "a", &["power"]).unwrap();
        manager.add_component("", "b", &["power"]).unwrap();

        let base = manager.last_state_change_id();
        for i in 0..updates {
            let target = if i % 2 == 0 { "a" } else { "b" };
            manager
                .set_state_property(target, "power.level", json!(i))
                .unwrap();
            clock.advance(Duration::from_millis(7));
        }
        prop_assert_eq!(manager.last_state_change_id(), base + updates as u64);

        let snapshot = manager.get_and_clear_recorded_state_changes();
        prop_assert_eq!(snapshot.update_id, base + updates as u64);
        prop_assert_eq!(snapshot.state_changes.len(), updates);
        for pair in snapshot.state_changes.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        prop_assert!(manager
            .get_and_clear_recorded_state_changes()
            .state_changes
            .is_empty());
    }
}
