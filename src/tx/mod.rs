//! Payments: addresses, amounts, requests and their submission

pub mod address;
pub mod amount;
pub mod orchestrator;
pub mod request;
pub mod uri;

pub use address::{resolve_recipient, Address, AddressBook, AddressKind};
pub use amount::{Amount, COIN};
pub use orchestrator::{BalanceSnapshot, OrchestratorConfig, PendingHandle, TransactionOrchestrator};
pub use request::{
    ChangePolicy, Fee, IntervalUnit, Recipient, RecurringSchedule, TransactionOutcome, TransactionRequest,
};
pub use uri::PaymentUri;
