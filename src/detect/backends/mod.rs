mod cascade;
mod mock;
#[cfg(feature = "backend-tract")]
mod tract;

pub use cascade::{CascadeBackend, CascadeParams};
pub use mock::MockBackend;
#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
