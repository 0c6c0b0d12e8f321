pub mod terminal_credentials;

pub use terminal_credentials::{CredentialVerifier, HmacCredentialVerifier};
