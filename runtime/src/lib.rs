//! Scriptbox runtime: upload scripts, run them in throwaway containers and
//! read back their status and output.
//!
//! The execution core lives in [`executions`]; [`scripts`] and [`auth`] are
//! the collaborators it is wired to in [`server`].

pub mod auth;
pub mod error;
pub mod executions;
pub mod scripts;
pub mod server;
pub mod telemetry;

/// Identifier of an authenticated user.
pub type UserId = i64;
