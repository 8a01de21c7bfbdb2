pub mod audit;
pub mod auth;
pub mod clock;
pub mod command;
pub mod config;
pub mod csv;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod points;
pub mod script;
pub mod store;
pub mod token;

pub use command::{Command, Outcome};
pub use engine::{Engine, EngineError, ErrorKind};
pub use points::Points;
