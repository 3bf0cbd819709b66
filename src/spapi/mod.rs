pub mod ads;
pub mod auth;
pub mod client;
pub mod documents;
pub mod finances;
pub mod reports;
