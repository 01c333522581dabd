pub mod core;
pub mod exchanges;

pub use crate::core::{
    config::{CredentialProvider, Host, KiwoomConfig},
    errors::KiwoomError,
    types::*,
};
pub use crate::exchanges::kiwoom::{KiwoomSession, KiwoomSessionBuilder};
