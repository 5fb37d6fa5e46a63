pub mod cache;
pub mod client;

pub use cache::{TokenExchangeCache, TokenExchangeError};
pub use client::{DelegationTokenResponse, HttpTokenExchangeClient, TokenExchangeClient, TokenExchangeClientError};
