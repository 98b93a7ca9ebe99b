pub mod board;
pub mod vote;
