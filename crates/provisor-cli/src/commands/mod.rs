pub mod api;
pub mod servicetest;
