//! Request/response model and the network capability the worker fetches through.

pub mod client;
pub mod types;

pub use client::{Fetcher, HttpClient};
pub use types::{Method, Request, Response};
