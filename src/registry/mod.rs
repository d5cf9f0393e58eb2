pub mod auth;
pub mod client;

pub use auth::{parse_bearer_challenge, BearerChallenge};
pub use client::{RawTag, RegistryClient, TagPage};
