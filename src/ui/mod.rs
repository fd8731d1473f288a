pub mod app;
pub mod frame;
