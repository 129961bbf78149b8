pub mod languageagent;

pub use languageagent::*;
