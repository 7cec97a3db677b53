pub mod currency;
pub mod expense;
pub mod identity;
pub mod rule;
