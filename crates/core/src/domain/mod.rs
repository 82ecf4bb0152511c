pub mod assignment;
pub mod event;
pub mod experiment;
pub mod tenant;
