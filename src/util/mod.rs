pub mod filter;
pub mod random;
