//! A motor that is switched off by the most recent of several delayed
//! requests.
//!
//! Run with `RUST_LOG=nbfsm_core=debug cargo run --example motor`.

use std::sync::Arc;
use std::time::Duration;

use nbfsm::{CoalescedEvent, FiniteStateMachine, Instruction, Model, Process, TransitionTo};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Motor {
    Stopped,
    Running,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model = Model::builder()
        .add("start", [Motor::Stopped], Motor::Running)
        .add("stop", [Motor::Running], Motor::Stopped)
        .on_enter(Motor::Running, |_, _, _, ctx| {
            println!("motor running after {} transitions", ctx.transition_count());
            Ok(Instruction::Nothing)
        })
        .build()?;

    let fsm = FiniteStateMachine::builder(Arc::new(model), Motor::Stopped)
        .name("motor")
        .build()?;
    fsm.add_listener(|from: Option<&Motor>, to: &Motor| println!("{from:?} -> {to:?}"));

    fsm.start()?;
    fsm.process(TransitionTo(Motor::Running));

    for millis in [300, 200, 100] {
        fsm.process_later(
            CoalescedEvent::with_policy(TransitionTo(Motor::Stopped), Process::MostRecent),
            Duration::from_millis(millis),
        );
    }

    let drained = fsm.quiesce_then_stop(Some(Duration::from_secs(1))).await?;
    println!("drained: {drained}, final state: {:?}, {fsm}", fsm.state());
    Ok(())
}
