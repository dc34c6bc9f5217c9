mod fake_cache;
mod fake_driver;

pub use fake_cache::FakeCache;
pub use fake_driver::{ExecutedCall, FakeDriver};
