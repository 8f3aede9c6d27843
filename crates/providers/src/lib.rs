//! Provider plumbing for tidemark.
//!
//! Network backends are the harness's business; this crate only offers the
//! [`ProviderRouter`] that turns model ids into providers and an offline
//! [`ExtractiveProvider`] so the engine can run without any API key.

pub mod extractive;
pub mod router;

pub use extractive::ExtractiveProvider;
pub use router::ProviderRouter;
