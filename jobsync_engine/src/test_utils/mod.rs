pub mod fake_source;
pub mod prepare_env;

pub use fake_source::FakeOrderSource;
