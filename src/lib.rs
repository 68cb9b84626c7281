//! # nbfsm
//!
//! Non-blocking finite state machines on Tokio. Events are submitted without
//! blocking, transitions of one machine are strictly serialized, and delayed
//! events can be discarded when something else happened first or coalesced
//! with fresher ones.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use nbfsm::{ActionError, Event, ExecutionContext, FiniteStateMachine, Instruction, model};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! pub enum Door {
//!     Open,
//!     Closed,
//! }
//!
//! #[derive(Debug)]
//! pub struct Push;
//!
//! impl Event<Door> for Push {
//!     fn desired_state(&self, current: &Door, _ctx: &ExecutionContext<'_>) -> Option<Door> {
//!         Some(match current {
//!             Door::Open => Door::Closed,
//!             Door::Closed => Door::Open,
//!         })
//!     }
//! }
//!
//! pub struct DoorModel;
//!
//! #[model(state = Door)]
//! impl DoorModel {
//!     #[transition(from = Closed, to = Open)]
//!     fn open(
//!         _from: &Door,
//!         _to: &Door,
//!         _event: &dyn Event<Door>,
//!         _ctx: &ExecutionContext<'_>,
//!     ) -> Result<(), ActionError> {
//!         Ok(())
//!     }
//!
//!     #[transition(from = Open, to = Closed)]
//!     fn close(
//!         _from: &Door,
//!         _to: &Door,
//!         _event: &dyn Event<Door>,
//!         _ctx: &ExecutionContext<'_>,
//!     ) -> Result<(), ActionError> {
//!         Ok(())
//!     }
//!
//!     #[on_enter(state = Open)]
//!     fn opened(
//!         _from: Option<&Door>,
//!         _to: &Door,
//!         _event: &dyn Event<Door>,
//!         _ctx: &ExecutionContext<'_>,
//!     ) -> Result<Instruction<Door>, ActionError> {
//!         Ok(Instruction::Nothing)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fsm = FiniteStateMachine::builder(Arc::new(DoorModel::model()?), Door::Closed)
//!     .name("door")
//!     .build()?;
//!
//! fsm.start()?;
//! fsm.process(Push);
//! fsm.process(Push);
//! assert!(fsm.quiesce_then_stop(None).await?);
//! assert_eq!(fsm.state(), Some(Door::Closed));
//! assert_eq!(fsm.transition_count(), 2);
//! # Ok(())
//! # }
//! ```

#[doc(inline)]
pub use nbfsm_core::*;
#[doc(inline)]
pub use nbfsm_macros::*;
