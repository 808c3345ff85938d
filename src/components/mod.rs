pub mod behavior;
pub mod commands;
pub mod dirty;
pub mod history;
pub mod jobs;
pub mod layers;
pub mod projection;
pub mod selection;
