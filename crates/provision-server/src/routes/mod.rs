pub mod health;
pub mod provision;
pub mod runs;
