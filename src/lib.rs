pub mod app;
pub mod error;
pub mod handlers;
pub mod process;
pub mod recipes;
pub mod resolver;
pub mod stream;
pub mod switcher;
pub mod transforms;
pub mod upstream;
pub mod usage;
