//! # Rajto (Credential & Entitlement Lifecycle Engine)
//!
//! `rajto` is the shared backend core for account credentials, session
//! tokens, and metered subscription entitlements across a multi-tenant SaaS.
//!
//! ## Credentials
//!
//! Logins issue a short-lived signed bearer assertion plus a long-lived
//! opaque **refresh secret**. Secrets are single-use: each refresh rotates
//! the secret, and presenting an already-rotated secret is treated as a
//! theft signal that revokes the whole token family. Only SHA-256 digests of
//! secrets are ever persisted.
//!
//! Email verification and password reset use single-use, time-boxed tokens
//! delivered through the [`notify::NotificationSender`] collaborator, with a
//! fixed-window rate limit per address on issuance.
//!
//! ## Entitlements
//!
//! Verifying an email starts a 14-day trial on the mid tier with reduced
//! domain/SMS caps ("full features, capped quantities"). Trial expiry is
//! applied lazily at the start of every entitlement query; the quota engine
//! then composes the effective plan with this month's usage counters.
//!
//! ## Collaborators
//!
//! Workers are stateless: all cross-request coordination goes through the
//! [`store::Store`] adapter, whose operations are single atomic statements.
//! Every component receives its store, clock, and audit handles at
//! construction; [`Engine`] is the composition root.

pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod notify;
pub mod store;
pub mod subscription;
pub mod tokens;
pub mod usage;

pub use engine::Engine;
pub use error::Error;
