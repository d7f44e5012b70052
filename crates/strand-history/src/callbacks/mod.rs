//! Completion callbacks.
//!
//! Callbacks are registered when a run starts and fire when the run closes
//! without a successor. Delivery is asynchronous and retried with backoff;
//! every state change goes through the transaction engine.
//!
//! - [`validation`]: registration policy checked before a start request
//!   reaches the transaction engine
//! - [`client`]: the HTTP completion protocol
//! - [`operations`]: the update operations that move a callback through
//!   its state machine
//! - [`dispatcher`]: the bounded delivery worker pool

pub mod client;
pub mod dispatcher;
pub mod operations;
pub mod validation;

pub use client::{
    CompletionClient, CompletionRequest, CompletionState, DeliveryError, HandlerErrorType,
    HttpCompletionClient,
};
pub use dispatcher::{
    CallbackDispatcher, CallbackQueue, CallbackReceiver, DeliveryOutcome, DispatcherHandle,
};
pub use operations::{CallbackAttempt, CompleteCallbackAttempt, StartCallbackAttempt};
pub use validation::{AllowedAddress, CallbackPolicy};
