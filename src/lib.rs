#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod retry;
pub mod stream;
pub mod types;

pub use client::{Session, SessionBuilder};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
