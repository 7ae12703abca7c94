mod credential;
mod secret;
mod usage;

pub use credential::{CredentialKey, CredentialKind, CredentialObject};
pub use secret::SecretValue;
pub use usage::CredentialUsageSpec;
