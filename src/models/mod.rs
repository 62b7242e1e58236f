pub mod account;
pub mod credential;
pub mod flow;

pub use account::{Account, AccountStatus, LastError, UsageSnapshot};
pub use credential::{derive_credential_id, AuthKind, Credential};
pub use flow::{FlowRecord, FlowSink, FlowStatus, MemoryFlowSink};
