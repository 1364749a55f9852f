//! Event processing
//!
//! Single serialization point for all session mutations: every hardware
//! event, internal machine event, and dead-man release flows through
//! one [`EventProcessor`].

mod processor;

pub use processor::{
    EventProcessor, ProcessError, ProcessOutcome, SessionView, StateSnapshot,
};
