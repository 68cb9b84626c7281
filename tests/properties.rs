use std::sync::{Arc, Mutex};
use std::time::Duration;

use nbfsm::{
    CoalescedEvent, Event, ExecutionContext, FiniteStateMachine, Model, Process, TransitionTo,
};
use proptest::prelude::*;
use tokio::runtime::{Builder, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Light {
    Off,
    On,
    Broken,
}

#[derive(Debug)]
struct Tagged {
    id: usize,
    log: Arc<Mutex<Vec<usize>>>,
}

impl Event<Light> for Tagged {
    fn desired_state(&self, current: &Light, _ctx: &ExecutionContext<'_>) -> Option<Light> {
        self.log.lock().unwrap().push(self.id);
        match current {
            Light::Off => Some(Light::On),
            _ => Some(Light::Off),
        }
    }
}

fn light_model() -> Arc<Model<Light>> {
    Arc::new(
        Model::builder()
            .add("turn on", [Light::Off], Light::On)
            .add("turn off", [Light::On], Light::Off)
            .add("break", [Light::Off, Light::On], Light::Broken)
            .build()
            .unwrap(),
    )
}

fn paused_runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn light() -> impl Strategy<Value = Light> {
    prop_oneof![Just(Light::Off), Just(Light::On), Just(Light::Broken)]
}

/// Number of events in `targets` that match a transition, starting from `Off`.
fn expected_transitions(targets: &[Light]) -> u64 {
    let model = light_model();
    let mut current = Light::Off;
    let mut count = 0;
    for target in targets {
        if model.transition_for(&current, target).is_some() {
            current = *target;
            count += 1;
        }
    }
    count
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transition_count_matches_defined_transitions(targets in prop::collection::vec(light(), 0..40)) {
        let runtime = paused_runtime();
        let count = runtime.block_on(async {
            let fsm = FiniteStateMachine::builder(light_model(), Light::Off).build().unwrap();
            fsm.start().unwrap();
            for target in &targets {
                assert!(fsm.process(TransitionTo(*target)));
            }
            assert!(fsm.quiesce_then_stop(None).await.unwrap());
            fsm.transition_count()
        });

        prop_assert_eq!(count, expected_transitions(&targets));
    }

    #[test]
    fn exactly_one_coalesced_member_is_evaluated(
        delays in prop::collection::vec(1u64..5_000, 1..12),
        most_recent in any::<bool>(),
    ) {
        let policy = if most_recent { Process::MostRecent } else { Process::First };
        let log = Arc::new(Mutex::new(Vec::new()));

        let runtime = paused_runtime();
        runtime.block_on(async {
            let fsm = FiniteStateMachine::builder(light_model(), Light::Off).build().unwrap();
            fsm.start().unwrap();
            for (id, delay) in delays.iter().enumerate() {
                let event = CoalescedEvent::with_policy(Tagged { id, log: log.clone() }, policy);
                assert!(fsm.process_later(event, Duration::from_millis(*delay)));
            }
            assert!(fsm.quiesce_then_stop(None).await.unwrap());
        });

        let evaluated = log.lock().unwrap().clone();
        let expected = match policy {
            Process::First => 0,
            Process::MostRecent => delays.len() - 1,
        };
        prop_assert_eq!(evaluated, vec![expected]);
    }
}
