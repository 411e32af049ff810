pub mod guard;

pub use guard::ReadOnlyGuard;
