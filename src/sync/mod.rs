mod guard;

pub use guard::{internal_failure, Guard, GuardRef};
