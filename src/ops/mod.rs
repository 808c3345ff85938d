pub mod composite;
pub mod painter;
