pub mod crypto;
pub mod processor;
pub mod secure_keys;
pub mod transfer;
