//! Secret backends and build-time secret resolution for Chengis.

pub mod local;
pub mod resolver;
pub mod vault;

pub use local::{LocalBackend, MasterKey, value_hash};
pub use resolver::{AccessAudit, DbAccessAudit, NullAccessAudit, SecretResolver};
pub use vault::VaultBackend;
