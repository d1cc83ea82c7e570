pub mod cache;
pub mod directory;
pub mod protocol;

mod unit_tests;
