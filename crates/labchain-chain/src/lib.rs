//! Chain access for the labchain orchestrator.
//!
//! The orchestrator talks to the contract through three narrow traits:
//! [`ChainCaller`] issues state-changing calls, [`ChainReader`] answers
//! receipt and block queries, and [`EventSource`] hands out per-event
//! subscriptions. [`SimulatedChain`] implements all three in process.

pub mod error;
pub mod simulated;
pub mod traits;

pub use error::{ChainError, Result};
pub use simulated::{ChainCall, SimulatedChain, SimulatedConfig};
pub use traits::{
    BlockHeader, ChainCaller, ChainReader, EventSource, Receipt, ReceiptStatus, SubmittedTx,
    Subscription,
};
