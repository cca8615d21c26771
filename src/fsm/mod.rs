//! Schema-validated finite-state machines. Documents name their transition
//! as `"id": [from, to]`; each active state runs its action on a dedicated
//! worker and hands the result back through a [`Continuation`].

pub mod action;
pub mod context;
pub mod definition;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod model_action;
pub mod trail;

pub use action::{action_fn, Action, ActionCall, ActionRegistry};
pub use context::{ChildCache, Context, DefinitionRegistry, Hat, HatRegistry};
pub use definition::{Discriminator, FsmDefinition, StateDef, TransitionDef};
pub use delegate::{DelegateAction, DelegateConfig, TrailMode, DELEGATE_ACTION};
pub use engine::{AwaitOutcome, Continuation, FsmInstance, INTERRUPTED_STATE};
pub use error::FsmError;
pub use interrupt::{AlreadyInterrupted, CleanupToken, InterruptCell};
pub use model_action::{build_prompt, ModelAction, MODEL_ACTION};
pub use trail::{replay, Trail, TrailRecord};
