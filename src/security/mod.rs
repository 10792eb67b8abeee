pub mod crypto;
pub mod roles;
pub mod signature;

pub use crypto::{DecryptedPayload, MessageCrypto};
pub use roles::{Role, RoleSet};
pub use signature::{check_signature, compute_signature, MSG_SIGNATURE_FIELD, SIGNATURE_FIELD};
