pub mod env;
pub mod prompt;
